//! Core records and collaborator contracts for multi-account orchestration
//!
//! Accounts, pools and pool runtimes are plain serde records. Persistence and
//! secret storage sit behind the port traits in [`ports`], which use
//! `Pin<Box<dyn Future>>` return types so services can hold them as
//! `Arc<dyn AccountRepository>` and friends.

pub mod account;
pub mod clock;
pub mod error;
pub mod pool;
pub mod ports;
pub mod runtime;

pub use account::{
    Account, AccountClassification, AccountId, AccountMetadata, Auth, AuthMethod, LimitKind,
    LimitSnapshot, Limits, Subscription, Usage, compact_number,
};
pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result, SecretError, SecretResult};
pub use pool::{
    DEFAULT_OPENAI_POOL_ID, PROVIDER_OPENAI, Pool, PoolId, PoolStrategy, matches_provider,
    normalize_members, oauth_method_for,
};
pub use ports::{AccountRepository, BoxFuture, PoolRepository, PoolRuntimeRepository, SecretStore};
pub use runtime::{MemoryPacket, PoolRuntime, SessionLedger};
