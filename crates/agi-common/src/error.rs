//! Error types shared by the AGI tools

use thiserror::Error;

/// Result type alias for AGI operations
pub type Result<T> = std::result::Result<T, AgiError>;

/// Errors that are not specific to a single pipeline stage
#[derive(Error, Debug)]
pub enum AgiError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Logging setup error: {0}")]
    Logging(String),
}
