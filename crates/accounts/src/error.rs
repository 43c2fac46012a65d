//! Error types for account management.

use std::time::Duration;

use thiserror::Error;

/// Errors raised by the proxy pool, credential store, login orchestration and
/// event dispatch.
#[derive(Debug, Error)]
pub enum AccountError {
    /// A proxy string could not be parsed as a URL.
    #[error("invalid proxy url '{url}': {reason}")]
    InvalidProxy { url: String, reason: String },

    #[error("proxy already registered: {0}")]
    DuplicateProxy(String),

    /// The proxy still carries accounts and cannot be removed.
    #[error("proxy {url} is still assigned to {used} account(s)")]
    ProxyInUse { url: String, used: usize },

    #[error("proxy not found: {0}")]
    ProxyNotFound(String),

    #[error("proxy {0} is at capacity")]
    ProxyFull(String),

    /// Logging in with a stored cookie was rejected by the platform.
    #[error("session resume failed: {0}")]
    ResumeFailed(String),

    /// The interactive (QR) step was not completed in time.
    #[error("interactive login not completed within {0:?}")]
    ChallengeTimeout(Duration),

    #[error("login failed: {0}")]
    LoginFailed(String),

    /// The connection opened but the account identity could not be fetched.
    #[error("failed to fetch account profile: {0}")]
    ProfileFetchFailed(String),

    #[error("no stored credential for account {0}")]
    NoCredential(String),

    /// A relogin was attempted too soon after the previous one.
    #[error("relogin for {own_id} skipped, last attempt was {elapsed:?} ago")]
    CooldownActive { own_id: String, elapsed: Duration },

    #[error("account not found: {0}")]
    AccountNotFound(String),

    #[error("invalid account id: {0}")]
    InvalidAccountId(String),

    #[error("no account selected")]
    NoAccountSelected,

    /// An account action is missing a required field.
    #[error("invalid action: {0}")]
    InvalidAction(String),

    #[error("webhook delivery failed: {0}")]
    Webhook(String),

    /// Failure reported by the platform session implementation.
    #[error("platform error: {0}")]
    Platform(String),

    #[error("account manager is shut down")]
    ShutDown,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AccountError {
    pub fn invalid_proxy(url: impl Into<String>, reason: impl ToString) -> Self {
        Self::InvalidProxy {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, AccountError>;
