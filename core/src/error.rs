//! Error types

use thiserror::Error;

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
///
/// The variants follow the three failure tiers of a run: transport and
/// protocol problems abort a whole run, script problems abort one task, and
/// expression problems only void a single check.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("Invalid script output: {0}")]
    Output(String),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Alert error: {0}")]
    Alert(String),

    #[error("State error: {0}")]
    State(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Scheduler error: {0}")]
    Scheduler(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(String),
}

// Convert anyhow::Error to our Error type
impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}
