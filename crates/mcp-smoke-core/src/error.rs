use thiserror::Error;

/// Core error types for harness operations
#[derive(Error, Debug)]
pub enum SmokeError {
    #[error("Precondition not met: {0}")]
    Precondition(String),

    #[error("Failed to spawn service: {0}")]
    SpawnFailed(String),

    #[error("Process management error: {0}")]
    ProcessError(String),

    #[error("Transport error: {0}")]
    TransportError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Timeout occurred: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

impl SmokeError {
    /// Check if this error must abort the whole run rather than a single mode
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SmokeError::Precondition(_) | SmokeError::ConfigurationError(_)
        )
    }

    /// Check if this error came from talking to the service
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            SmokeError::TransportError(_) | SmokeError::Timeout(_) | SmokeError::Io(_)
        )
    }

    pub fn transport(message: impl Into<String>) -> Self {
        SmokeError::TransportError(message.into())
    }

    pub fn process(message: impl Into<String>) -> Self {
        SmokeError::ProcessError(message.into())
    }
}
