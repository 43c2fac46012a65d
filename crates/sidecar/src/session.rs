//! A platform session living inside the sidecar.

use std::sync::{
    Mutex, PoisonError,
    atomic::{AtomicBool, Ordering},
};

use {
    async_trait::async_trait,
    tracing::debug,
    zalo_accounts::{
        AccountAction, AccountError, AccountProfile, CredentialRecord, PlatformSession,
        SessionEvents,
    },
};

use crate::{error::SidecarError, sidecar::SidecarHandle, types::GatewayMessage};

pub struct SidecarSession {
    session_id: String,
    handle: SidecarHandle,
    events: Mutex<Option<SessionEvents>>,
    closed: AtomicBool,
}

impl SidecarSession {
    pub(crate) fn new(session_id: String, handle: SidecarHandle, events: SessionEvents) -> Self {
        Self {
            session_id,
            handle,
            events: Mutex::new(Some(events)),
            closed: AtomicBool::new(false),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    async fn request_data(
        &self,
        build: impl FnOnce(String, String) -> GatewayMessage,
    ) -> zalo_accounts::Result<serde_json::Value> {
        let session_id = self.session_id.clone();
        self.handle
            .request(|request_id| build(request_id, session_id))
            .await?
            .ok_or_else(|| SidecarError::Protocol("reply without data".into()).into())
    }
}

/// Account info replies wrap the profile as `{ "profile": {...} }`.
fn profile_from_reply(data: serde_json::Value) -> zalo_accounts::Result<AccountProfile> {
    let profile = match data {
        serde_json::Value::Object(mut map) if map.contains_key("profile") => {
            map.remove("profile").unwrap_or_default()
        },
        other => other,
    };
    Ok(serde_json::from_value(profile)?)
}

#[async_trait]
impl PlatformSession for SidecarSession {
    async fn fetch_profile(&self) -> zalo_accounts::Result<AccountProfile> {
        let data = self
            .request_data(|request_id, session_id| GatewayMessage::FetchAccountInfo {
                request_id,
                session_id,
            })
            .await?;
        profile_from_reply(data)
    }

    async fn credential(&self) -> zalo_accounts::Result<CredentialRecord> {
        let data = self
            .request_data(|request_id, session_id| GatewayMessage::GetContext {
                request_id,
                session_id,
            })
            .await?;
        Ok(serde_json::from_value(data)?)
    }

    fn start_listener(&self) -> zalo_accounts::Result<SessionEvents> {
        let events = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or_else(|| AccountError::Platform("listener already started".into()))?;
        self.handle.try_send(GatewayMessage::StartListener {
            session_id: self.session_id.clone(),
        })?;
        Ok(events)
    }

    async fn perform(&self, action: &AccountAction) -> zalo_accounts::Result<serde_json::Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AccountError::Platform("session closed".into()));
        }
        let session_id = self.session_id.clone();
        let action = action.clone();
        let data = self
            .handle
            .request(|request_id| GatewayMessage::Action {
                request_id,
                session_id,
                action,
            })
            .await?;
        Ok(data.unwrap_or(serde_json::Value::Null))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.handle.close_session(&self.session_id);
        if let Err(e) = self
            .handle
            .send(GatewayMessage::Stop {
                session_id: self.session_id.clone(),
            })
            .await
        {
            debug!(session_id = %self.session_id, error = %e, "stop not delivered");
        }
    }
}
