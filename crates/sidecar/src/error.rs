use std::time::Duration;

use {thiserror::Error, zalo_accounts::AccountError};

#[derive(Debug, Error)]
pub enum SidecarError {
    #[error("sidecar connection failed: {0}")]
    Connect(String),

    #[error("sidecar disconnected")]
    Disconnected,

    #[error("sidecar did not answer within {0:?}")]
    Timeout(Duration),

    /// The sidecar answered the request with an error.
    #[error("sidecar rejected request: {0}")]
    Rejected(String),

    #[error("unexpected sidecar reply: {0}")]
    Protocol(String),
}

impl From<SidecarError> for AccountError {
    fn from(e: SidecarError) -> Self {
        AccountError::Platform(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SidecarError>;
