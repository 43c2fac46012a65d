//! Scripted platform and webhook fakes shared by the crate's tests.

use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
};

use {
    async_trait::async_trait,
    serde_json::{Value, json},
    tokio::sync::{Notify, mpsc, oneshot},
    url::Url,
};

use crate::{
    actions::AccountAction,
    credentials::CredentialRecord,
    dispatch::{WebhookResolver, WebhookSink},
    error::{AccountError, Result},
    session::{
        AccountProfile, EventKind, LoginChallenge, PlatformConnector, PlatformSession,
        SessionEvent, SessionEvents, SessionHandle,
    },
};

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn phone_for(own_id: &str) -> String {
    format!("8490{own_id}")
}

/// The credential a fake session for `own_id` reports.
pub(crate) fn credential_for(own_id: &str) -> CredentialRecord {
    CredentialRecord {
        device_id: format!("device-{own_id}"),
        cookie: json!({ "session": own_id }),
        user_agent: "fake-agent".into(),
    }
}

pub(crate) struct FakeSession {
    own_id: String,
    fail_profile: AtomicBool,
    closed: AtomicBool,
    tx: Mutex<Option<mpsc::UnboundedSender<SessionEvent>>>,
    rx: Mutex<Option<SessionEvents>>,
    performed: Mutex<Vec<AccountAction>>,
}

impl FakeSession {
    pub(crate) fn new(own_id: &str) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            own_id: own_id.to_string(),
            fail_profile: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(Some(rx)),
            performed: Mutex::new(Vec::new()),
        })
    }

    /// Emit an event as the platform would. Returns `false` once closed.
    pub(crate) fn push(&self, event: SessionEvent) -> bool {
        lock(&self.tx)
            .as_ref()
            .is_some_and(|tx| tx.send(event).is_ok())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn performed(&self) -> Vec<AccountAction> {
        lock(&self.performed).clone()
    }
}

#[async_trait]
impl PlatformSession for FakeSession {
    async fn fetch_profile(&self) -> Result<AccountProfile> {
        if self.fail_profile.load(Ordering::SeqCst) {
            return Err(AccountError::Platform("profile unavailable".into()));
        }
        let mut extra = serde_json::Map::new();
        extra.insert("avatar".into(), Value::String(format!("https://cdn/{}", self.own_id)));
        Ok(AccountProfile {
            user_id: self.own_id.clone(),
            phone_number: Some(phone_for(&self.own_id)),
            display_name: Some(format!("Shop {}", self.own_id)),
            extra,
        })
    }

    async fn credential(&self) -> Result<CredentialRecord> {
        Ok(credential_for(&self.own_id))
    }

    fn start_listener(&self) -> Result<SessionEvents> {
        lock(&self.rx)
            .take()
            .ok_or_else(|| AccountError::Platform("listener already started".into()))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.tx).take();
    }

    /// Echoes the action back, tagged with the account id.
    async fn perform(&self, action: &AccountAction) -> Result<Value> {
        if self.is_closed() {
            return Err(AccountError::Platform("session closed".into()));
        }
        lock(&self.performed).push(action.clone());
        Ok(json!({ "ownId": self.own_id, "request": action }))
    }
}

/// Connector that accepts the cookies produced by [`credential_for`].
pub(crate) struct FakeConnector {
    default_identity: String,
    identities: Mutex<VecDeque<String>>,
    reject_all: AtomicBool,
    rejected: Mutex<HashSet<String>>,
    fail_profile: AtomicBool,
    hold_scan: AtomicBool,
    scan: Notify,
    resume_calls: AtomicUsize,
    interactive_calls: AtomicUsize,
    proxies: Mutex<Vec<Option<String>>>,
    sessions: Mutex<Vec<Arc<FakeSession>>>,
}

impl FakeConnector {
    pub(crate) fn new(default_identity: &str) -> Self {
        Self {
            default_identity: default_identity.to_string(),
            identities: Mutex::new(VecDeque::new()),
            reject_all: AtomicBool::new(false),
            rejected: Mutex::new(HashSet::new()),
            fail_profile: AtomicBool::new(false),
            hold_scan: AtomicBool::new(false),
            scan: Notify::new(),
            resume_calls: AtomicUsize::new(0),
            interactive_calls: AtomicUsize::new(0),
            proxies: Mutex::new(Vec::new()),
            sessions: Mutex::new(Vec::new()),
        }
    }

    /// Identity the next interactive login scans in as.
    pub(crate) fn queue_identity(&self, own_id: &str) {
        lock(&self.identities).push_back(own_id.to_string());
    }

    pub(crate) fn reject_cookies(&self) {
        self.reject_all.store(true, Ordering::SeqCst);
    }

    pub(crate) fn reject_cookie_for(&self, own_id: &str) {
        lock(&self.rejected).insert(own_id.to_string());
    }

    pub(crate) fn fail_profile(&self) {
        self.fail_profile.store(true, Ordering::SeqCst);
    }

    /// Interactive logins wait for [`Self::scan`] after sending the challenge.
    pub(crate) fn hold_scan(&self) {
        self.hold_scan.store(true, Ordering::SeqCst);
    }

    pub(crate) fn scan(&self) {
        self.scan.notify_one();
    }

    pub(crate) fn resume_calls(&self) -> usize {
        self.resume_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn interactive_calls(&self) -> usize {
        self.interactive_calls.load(Ordering::SeqCst)
    }

    pub(crate) fn proxies_seen(&self) -> Vec<Option<String>> {
        lock(&self.proxies).clone()
    }

    pub(crate) fn last_session(&self) -> Option<Arc<FakeSession>> {
        lock(&self.sessions).last().cloned()
    }

    pub(crate) fn session_count(&self) -> usize {
        lock(&self.sessions).len()
    }

    fn open(&self, own_id: &str) -> SessionHandle {
        let session = FakeSession::new(own_id);
        if self.fail_profile.load(Ordering::SeqCst) {
            session.fail_profile.store(true, Ordering::SeqCst);
        }
        lock(&self.sessions).push(Arc::clone(&session));
        session
    }

    fn record_proxy(&self, proxy: Option<&Url>) {
        lock(&self.proxies).push(proxy.map(Url::to_string));
    }
}

#[async_trait]
impl PlatformConnector for FakeConnector {
    async fn resume(
        &self,
        proxy: Option<&Url>,
        credential: &CredentialRecord,
    ) -> Result<SessionHandle> {
        self.resume_calls.fetch_add(1, Ordering::SeqCst);
        self.record_proxy(proxy);
        let own_id = credential.cookie["session"]
            .as_str()
            .unwrap_or(&self.default_identity)
            .to_string();
        if self.reject_all.load(Ordering::SeqCst) || lock(&self.rejected).contains(&own_id) {
            return Err(AccountError::ResumeFailed("cookie expired".into()));
        }
        Ok(self.open(&own_id))
    }

    async fn login_interactive(
        &self,
        proxy: Option<&Url>,
        challenge: oneshot::Sender<LoginChallenge>,
    ) -> Result<SessionHandle> {
        self.interactive_calls.fetch_add(1, Ordering::SeqCst);
        self.record_proxy(proxy);
        let _ = challenge.send(LoginChallenge::new("qr-image"));
        if self.hold_scan.load(Ordering::SeqCst) {
            self.scan.notified().await;
        }
        let own_id = lock(&self.identities)
            .pop_front()
            .unwrap_or_else(|| self.default_identity.clone());
        Ok(self.open(&own_id))
    }
}

/// Sink that records deliveries on a channel.
pub(crate) struct RecordingSink {
    deliveries: mpsc::UnboundedSender<(String, Value)>,
    fail_next: AtomicBool,
}

impl RecordingSink {
    pub(crate) fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<(String, Value)>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                deliveries: tx,
                fail_next: AtomicBool::new(false),
            }),
            rx,
        )
    }

    pub(crate) fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl WebhookSink for RecordingSink {
    async fn deliver(&self, url: &str, body: &Value) -> Result<()> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(AccountError::Webhook(format!("{url} returned 500")));
        }
        let _ = self.deliveries.send((url.to_string(), body.clone()));
        Ok(())
    }
}

/// Same URL for every account.
#[derive(Default)]
pub(crate) struct StaticResolver {
    urls: HashMap<EventKind, String>,
}

impl StaticResolver {
    pub(crate) fn with(mut self, kind: EventKind, url: &str) -> Self {
        self.urls.insert(kind, url.to_string());
        self
    }
}

impl WebhookResolver for StaticResolver {
    fn webhook_url(&self, kind: EventKind, _own_id: &str) -> Option<String> {
        self.urls.get(&kind).cloned()
    }
}
