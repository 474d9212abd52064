//! Common error types

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Policy error: {0}")]
    Policy(String),

    #[error("Monitor error: {0}")]
    Monitor(String),

    #[error("Insufficient privilege: {0}")]
    Privilege(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
