use {thiserror::Error, zalo_accounts::AccountError};

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid webhook url '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl From<WebhookError> for AccountError {
    fn from(e: WebhookError) -> Self {
        AccountError::Webhook(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WebhookError>;
