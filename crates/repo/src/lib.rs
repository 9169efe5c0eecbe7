//! TOML-backed repositories for accounts, pools and pool runtimes
//!
//! Each repository owns one versioned TOML document. Access to a document is
//! guarded by a read-write lock shared by every repository opened on the same
//! absolute path in this process; writers load, modify and atomically
//! replace the file while holding the write side. Nothing coordinates
//! separate processes.

mod accounts;
mod document;
mod locks;
mod pools;
mod runtimes;

pub use accounts::TomlAccountRepository;
pub use document::CURRENT_VERSION;
pub use pools::TomlPoolRepository;
pub use runtimes::TomlPoolRuntimeRepository;
