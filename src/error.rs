use thiserror::Error;

/// Rover link error types
#[derive(Error, Debug)]
pub enum LinkError {
    #[error("Server url required")]
    MissingServer,

    #[error("Invalid server url: {0}")]
    InvalidServer(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Export error: {0}")]
    Export(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for fallible link helpers
pub type LinkResult<T> = Result<T, LinkError>;

impl From<serde_json::Error> for LinkError {
    fn from(err: serde_json::Error) -> Self {
        LinkError::Config(err.to_string())
    }
}

impl From<csv::Error> for LinkError {
    fn from(err: csv::Error) -> Self {
        LinkError::Export(err.to_string())
    }
}
