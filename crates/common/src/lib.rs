//! Types shared by every `oa` crate: the redacting secret wrapper, the
//! configuration error, and owner-only atomic file writes.

mod error;
pub mod fs;
mod secret;

pub use error::{Error, Result};
pub use secret::{Secret, SecretString};
