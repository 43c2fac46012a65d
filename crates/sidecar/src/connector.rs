//! [`PlatformConnector`] backed by the sidecar.

use std::{sync::Arc, time::Duration};

use {
    async_trait::async_trait,
    tokio::sync::{RwLock, oneshot},
    tracing::{debug, info, warn},
    url::Url,
    uuid::Uuid,
    zalo_accounts::{
        AccountError, CredentialRecord, LoginChallenge, PlatformConnector, SessionHandle,
    },
};

use crate::{
    error::SidecarError,
    session::SidecarSession,
    sidecar::{DEFAULT_REQUEST_TIMEOUT, DEFAULT_SIDECAR_URL, SidecarHandle, connect_with_retry},
    types::GatewayMessage,
};

/// Connection settings for the sidecar.
#[derive(Debug, Clone)]
pub struct SidecarConfig {
    pub url: String,
    pub request_timeout: Duration,
    /// Upper bound on a QR login, scan included.
    pub login_timeout: Duration,
    pub connect_retries: u32,
}

impl Default for SidecarConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_SIDECAR_URL.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            login_timeout: Duration::from_secs(120),
            connect_retries: 5,
        }
    }
}

/// Opens platform sessions through the sidecar, connecting lazily.
pub struct SidecarConnector {
    config: SidecarConfig,
    sidecar: RwLock<Option<SidecarHandle>>,
}

impl SidecarConnector {
    pub fn new(config: SidecarConfig) -> Self {
        Self {
            config,
            sidecar: RwLock::new(None),
        }
    }

    /// Connect to the sidecar process, reusing a live connection.
    async fn ensure_sidecar_connected(&self) -> Result<SidecarHandle, SidecarError> {
        if let Some(handle) = self.sidecar.read().await.as_ref()
            && handle.is_connected()
        {
            return Ok(handle.clone());
        }

        let mut sidecar = self.sidecar.write().await;
        if let Some(handle) = sidecar.as_ref()
            && handle.is_connected()
        {
            return Ok(handle.clone());
        }

        let (handle, _disconnect_rx) = connect_with_retry(
            &self.config.url,
            self.config.request_timeout,
            self.config.connect_retries.max(1),
        )
        .await
        .map_err(|e| SidecarError::Connect(format!("{e:#}")))?;
        *sidecar = Some(handle.clone());
        Ok(handle)
    }

    async fn stop(handle: &SidecarHandle, session_id: &str) {
        handle.close_session(session_id);
        let _ = handle
            .send(GatewayMessage::Stop {
                session_id: session_id.to_string(),
            })
            .await;
    }
}

#[async_trait]
impl PlatformConnector for SidecarConnector {
    async fn resume(
        &self,
        proxy: Option<&Url>,
        credential: &CredentialRecord,
    ) -> zalo_accounts::Result<SessionHandle> {
        let handle = self.ensure_sidecar_connected().await?;
        let session_id = Uuid::new_v4().to_string();
        let events = handle.open_session(&session_id);

        let result = handle
            .request_within(
                |request_id| GatewayMessage::LoginCookie {
                    request_id,
                    session_id: session_id.clone(),
                    proxy: proxy.map(Url::to_string),
                    imei: credential.device_id.clone(),
                    cookie: credential.cookie.clone(),
                    user_agent: credential.user_agent.clone(),
                },
                self.config.login_timeout,
            )
            .await;

        match result {
            Ok(_) => {
                debug!(session_id, "cookie login accepted");
                Ok(Arc::new(SidecarSession::new(session_id, handle, events)))
            },
            Err(e) => {
                Self::stop(&handle, &session_id).await;
                Err(match e {
                    SidecarError::Rejected(reason) => AccountError::ResumeFailed(reason),
                    other => other.into(),
                })
            },
        }
    }

    async fn login_interactive(
        &self,
        proxy: Option<&Url>,
        challenge: oneshot::Sender<LoginChallenge>,
    ) -> zalo_accounts::Result<SessionHandle> {
        let handle = self.ensure_sidecar_connected().await?;
        let session_id = Uuid::new_v4().to_string();
        let events = handle.open_session(&session_id);
        let mut qr_rx = handle.expect_qr(&session_id);
        let mut challenge = Some(challenge);

        let login_timeout = self.config.login_timeout;
        let result = {
            let request = handle.request_within(
                |request_id| GatewayMessage::LoginQr {
                    request_id,
                    session_id: session_id.clone(),
                    proxy: proxy.map(Url::to_string),
                },
                login_timeout,
            );
            tokio::pin!(request);

            loop {
                tokio::select! {
                    biased;
                    image = &mut qr_rx, if challenge.is_some() => {
                        let tx = challenge.take();
                        if let (Ok(image), Some(tx)) = (image, tx) {
                            info!(session_id, "QR code ready, waiting for scan");
                            let _ = tx.send(LoginChallenge::new(image));
                        }
                    },
                    result = &mut request => break result,
                }
            }
        };

        match result {
            Ok(_) => Ok(Arc::new(SidecarSession::new(session_id, handle, events))),
            Err(e) => {
                warn!(session_id, error = %e, "QR login failed");
                Self::stop(&handle, &session_id).await;
                Err(match e {
                    SidecarError::Timeout(_) => AccountError::ChallengeTimeout(login_timeout),
                    SidecarError::Rejected(reason) => AccountError::LoginFailed(reason),
                    other => other.into(),
                })
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {
        super::*,
        crate::sidecar::fake::fake_sidecar,
        serde_json::json,
        zalo_accounts::{ConnectionState, PlatformSession, SessionEvent, ThreadType},
    };

    fn config(url: String) -> SidecarConfig {
        SidecarConfig {
            url,
            request_timeout: Duration::from_secs(5),
            login_timeout: Duration::from_secs(5),
            connect_retries: 1,
        }
    }

    fn credential() -> CredentialRecord {
        CredentialRecord {
            device_id: "imei-1".into(),
            cookie: json!([{"key": "zpw_sek", "value": "abc"}]),
            user_agent: "ua".into(),
        }
    }

    fn ok(msg: &serde_json::Value, data: serde_json::Value) -> serde_json::Value {
        json!({"type": "response", "requestId": msg["requestId"], "ok": true, "data": data})
    }

    #[tokio::test]
    async fn cookie_login_opens_usable_session() {
        let url = fake_sidecar(|msg| {
            let sid = msg["sessionId"].clone();
            Some(match msg["type"].as_str().unwrap() {
                "login_cookie" => {
                    assert_eq!(msg["imei"], "imei-1");
                    assert_eq!(msg["proxy"], "http://p1:8080/");
                    vec![ok(&msg, json!(null))]
                },
                "fetch_account_info" => vec![ok(
                    &msg,
                    json!({"profile": {"userId": "42", "phoneNumber": "849"}}),
                )],
                "get_context" => vec![ok(
                    &msg,
                    json!({"imei": "imei-1", "cookie": [], "userAgent": "ua"}),
                )],
                "start_listener" => vec![json!({"type": "connected", "sessionId": sid})],
                _ => Vec::new(),
            })
        })
        .await;
        let connector = SidecarConnector::new(config(url));
        let proxy = Url::parse("http://p1:8080").unwrap();

        let session = connector.resume(Some(&proxy), &credential()).await.unwrap();
        assert_eq!(session.fetch_profile().await.unwrap().user_id, "42");
        assert_eq!(session.credential().await.unwrap().device_id, "imei-1");

        let mut events = session.start_listener().unwrap();
        assert_eq!(
            events.recv().await,
            Some(SessionEvent::ConnectionState(ConnectionState::Connected))
        );
        assert!(session.start_listener().is_err());

        session.close().await;
        assert!(events.recv().await.is_none());
    }

    #[tokio::test]
    async fn account_actions_round_trip_through_sidecar() {
        let url = fake_sidecar(|msg| {
            Some(match msg["type"].as_str().unwrap() {
                "login_cookie" => vec![ok(&msg, json!(null))],
                "action" => {
                    let action = &msg["action"];
                    match action["kind"].as_str().unwrap() {
                        "send_message" => {
                            assert_eq!(action["threadId"], "t1");
                            assert_eq!(action["threadType"], "user");
                            assert_eq!(action["text"], "hi");
                            vec![ok(&msg, json!({"msgId": 77}))]
                        },
                        "find_user" => {
                            vec![ok(&msg, json!({"uid": "u9", "phone": action["phone"]}))]
                        },
                        "get_user_info" => vec![json!({
                            "type": "response",
                            "requestId": msg["requestId"],
                            "ok": false,
                            "error": "user not found"
                        })],
                        _ => vec![ok(&msg, json!(null))],
                    }
                },
                _ => Vec::new(),
            })
        })
        .await;
        let connector = SidecarConnector::new(config(url));
        let session = connector.resume(None, &credential()).await.unwrap();

        let sent = session.send_message("t1", ThreadType::User, "hi").await.unwrap();
        assert_eq!(sent["msgId"], 77);

        let found = session.find_user("0901234567").await.unwrap();
        assert_eq!(found["uid"], "u9");
        assert_eq!(found["phone"], "0901234567");

        let err = session.get_user_info("u404").await.unwrap_err();
        assert!(matches!(err, AccountError::Platform(ref m) if m.contains("user not found")));

        let groups = session
            .perform(&zalo_accounts::AccountAction::ListGroups)
            .await
            .unwrap();
        assert!(groups.is_null());

        session.close().await;
        assert!(session.find_user("0901234567").await.is_err());
    }

    #[tokio::test]
    async fn rejected_cookie_is_resume_failure() {
        let url = fake_sidecar(|msg| {
            Some(vec![json!({
                "type": "response",
                "requestId": msg["requestId"],
                "ok": false,
                "error": "invalid cookie"
            })])
        })
        .await;
        let connector = SidecarConnector::new(config(url));
        let err = connector.resume(None, &credential()).await.err().unwrap();
        assert!(matches!(err, AccountError::ResumeFailed(ref m) if m == "invalid cookie"));
    }

    #[tokio::test]
    async fn qr_login_delivers_challenge_before_completing() {
        let url = fake_sidecar(|msg| {
            if msg["type"] != "login_qr" {
                return Some(Vec::new());
            }
            assert!(msg.get("proxy").is_none());
            Some(vec![
                json!({"type": "qr", "sessionId": msg["sessionId"], "image": "iVBORw0"}),
                ok(&msg, json!(null)),
            ])
        })
        .await;
        let connector = SidecarConnector::new(config(url));
        let (tx, mut rx) = oneshot::channel();

        connector.login_interactive(None, tx).await.unwrap();
        assert_eq!(rx.try_recv().unwrap().image_base64, "iVBORw0");
    }

    #[tokio::test]
    async fn unscanned_qr_times_out() {
        let url = fake_sidecar(|msg| {
            if msg["type"] != "login_qr" {
                return Some(Vec::new());
            }
            Some(vec![json!({"type": "qr", "sessionId": msg["sessionId"], "image": "x"})])
        })
        .await;
        let mut cfg = config(url);
        cfg.login_timeout = Duration::from_millis(100);
        let connector = SidecarConnector::new(cfg);
        let (tx, rx) = oneshot::channel();

        let err = connector.login_interactive(None, tx).await.err().unwrap();
        assert!(matches!(err, AccountError::ChallengeTimeout(_)));
        assert_eq!(rx.await.unwrap().image_base64, "x");
    }

    #[tokio::test]
    async fn unreachable_sidecar_is_platform_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let connector = SidecarConnector::new(config(format!("ws://{addr}")));
        let err = connector.resume(None, &credential()).await.err().unwrap();
        assert!(matches!(err, AccountError::Platform(_)));
    }
}
