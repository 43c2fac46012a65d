//! Platform session capability.
//!
//! The wire protocol of the messaging platform is not modelled here. A
//! [`PlatformConnector`] opens connections and hands back an opaque
//! [`PlatformSession`] handle; everything else in the crate only talks to
//! these traits.

use std::sync::Arc;

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
    tokio::sync::{mpsc, oneshot},
    url::Url,
};

use crate::{
    actions::{AccountAction, ThreadType},
    credentials::CredentialRecord,
    error::Result,
};

/// Event kinds that can be forwarded to a webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    GroupEvent,
    Reaction,
}

impl EventKind {
    pub const ALL: [EventKind; 3] = [Self::Message, Self::GroupEvent, Self::Reaction];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Message => "message",
            Self::GroupEvent => "group_event",
            Self::Reaction => "reaction",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connection state reported by a live session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    Disconnected { reason: Option<String> },
}

/// Push event emitted by a live session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Message(serde_json::Value),
    GroupEvent(serde_json::Value),
    Reaction(serde_json::Value),
    ConnectionState(ConnectionState),
    /// Non-fatal error reported by the listener.
    Error(String),
}

impl SessionEvent {
    /// Webhook kind and payload, for forwardable events.
    pub fn forwardable(self) -> Option<(EventKind, serde_json::Value)> {
        match self {
            Self::Message(v) => Some((EventKind::Message, v)),
            Self::GroupEvent(v) => Some((EventKind::GroupEvent, v)),
            Self::Reaction(v) => Some((EventKind::Reaction, v)),
            Self::ConnectionState(_) | Self::Error(_) => None,
        }
    }
}

/// Event stream of one session, in platform order.
pub type SessionEvents = mpsc::UnboundedReceiver<SessionEvent>;

/// Account profile as returned by the platform.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountProfile {
    pub user_id: String,
    #[serde(default)]
    pub phone_number: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    /// Remaining profile fields, passed through untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Artifact a human must act on to finish an interactive login.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginChallenge {
    /// Base64-encoded PNG of the QR code.
    pub image_base64: String,
}

impl LoginChallenge {
    pub fn new(image_base64: impl Into<String>) -> Self {
        Self {
            image_base64: image_base64.into(),
        }
    }

    /// The image as a `data:` URL ready for an `<img>` tag.
    pub fn data_url(&self) -> String {
        format!("data:image/png;base64,{}", self.image_base64)
    }
}

/// A live, authenticated connection to the platform.
#[async_trait]
pub trait PlatformSession: Send + Sync {
    async fn fetch_profile(&self) -> Result<AccountProfile>;

    /// Current login material, suitable for a later resume.
    async fn credential(&self) -> Result<CredentialRecord>;

    /// Start the event listener and return its stream. Only the first call
    /// succeeds.
    fn start_listener(&self) -> Result<SessionEvents>;

    /// Terminate the connection. The event stream ends afterwards.
    async fn close(&self);

    /// Run an account action and return the platform's reply.
    async fn perform(&self, action: &AccountAction) -> Result<serde_json::Value>;

    async fn send_message(
        &self,
        thread_id: &str,
        thread_type: ThreadType,
        text: &str,
    ) -> Result<serde_json::Value> {
        self.perform(&AccountAction::SendMessage {
            thread_id: thread_id.to_string(),
            thread_type,
            text: text.to_string(),
        })
        .await
    }

    /// Look a user up by phone number.
    async fn find_user(&self, phone: &str) -> Result<serde_json::Value> {
        self.perform(&AccountAction::FindUser {
            phone: phone.to_string(),
        })
        .await
    }

    async fn get_user_info(&self, user_id: &str) -> Result<serde_json::Value> {
        self.perform(&AccountAction::GetUserInfo {
            user_id: user_id.to_string(),
        })
        .await
    }
}

/// Shared handle to a live session.
pub type SessionHandle = Arc<dyn PlatformSession>;

/// Opens platform connections.
#[async_trait]
pub trait PlatformConnector: Send + Sync {
    /// Log in with stored credential material.
    async fn resume(&self, proxy: Option<&Url>, credential: &CredentialRecord)
    -> Result<SessionHandle>;

    /// Log in interactively. The challenge is sent on `challenge` before the
    /// call completes; the call resolves once the platform confirms the
    /// handshake.
    async fn login_interactive(
        &self,
        proxy: Option<&Url>,
        challenge: oneshot::Sender<LoginChallenge>,
    ) -> Result<SessionHandle>;
}
