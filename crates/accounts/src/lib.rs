//! Credential lifecycle and multi-account orchestration
//!
//! The services here sit on top of the port traits in `domain` and never
//! touch disk or the network directly:
//!
//! - [`CredentialLifecycle`] rotates and removes auth secrets as a saga
//!   across the secret store and the account repository, compensating on
//!   partial failure.
//! - [`TokenFreshness`] hands out live OAuth tokens, allowing at most one
//!   refresh in flight per secret reference.
//! - [`PoolService`] syncs pool membership and picks the eligible account
//!   with the lowest weekly usage, with an ordered failover list.
//! - [`SessionService`] keeps per-account provider sessions and the memory
//!   packet of a logical session in the pool runtime.
//! - [`UsageFetcher`] pulls usage and subscription data for many accounts
//!   at once, isolating failures per account.
//!
//! Flow for a caller that wants to use a pool:
//! 1. [`PoolService::pick_account`] selects the account
//! 2. [`SessionService::get_or_attach_account_session`] resolves its session
//! 3. [`TokenFreshness::ensure_fresh_tokens`] supplies a token when the
//!    remote provider is called

pub mod error;
pub mod fetch;
pub mod freshness;
pub mod lifecycle;
mod metrics;
pub mod pool;
pub mod records;
pub mod session;
pub mod usage;

#[cfg(test)]
mod test_support;

pub use error::{Error, Result};
pub use fetch::{BatchReport, FetchOutcome, UsageFetcher};
pub use freshness::{TokenFreshness, TokenRefresher, tokens_ref};
pub use lifecycle::CredentialLifecycle;
pub use pool::{Pick, PoolService};
pub use records::{AccountRecords, AccountStatus};
pub use session::{SessionService, provider_session_id, resolve_logical_session_id};
pub use usage::{UsageClient, UsageSnapshot, UsageSource, WindowUsage};
