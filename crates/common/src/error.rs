//! Configuration and filesystem errors surfaced before any service runs

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("home directory could not be determined; set {0} explicitly")]
    NoHome(&'static str),
}

pub type Result<T> = std::result::Result<T, Error>;
