use derive_more::From;
use mcp_smoke_core::SmokeError;
use thiserror::Error;

/// Errors raised while talking to the service over a transport
#[derive(Error, Debug, From)]
pub enum ChannelError {
    #[error("HTTP request failed: {0}")]
    Http(reqwest::Error),

    #[error("pipe I/O failed: {0}")]
    Io(std::io::Error),

    #[error("unexpected HTTP status {0}")]
    Status(reqwest::StatusCode),

    #[error("timed out")]
    Timeout(tokio::time::error::Elapsed),

    #[error(transparent)]
    Harness(SmokeError),
}

impl ChannelError {
    pub fn is_timeout(&self) -> bool {
        match self {
            ChannelError::Timeout(_) => true,
            ChannelError::Http(e) => e.is_timeout(),
            ChannelError::Harness(SmokeError::Timeout(_)) => true,
            _ => false,
        }
    }
}
