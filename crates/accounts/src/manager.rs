//! The account connection manager: one value owning the proxy pool,
//! credential store, registry, relogin tracker and event dispatcher.

use std::{sync::Arc, time::Duration};

use {
    serde::Serialize,
    tokio::sync::{broadcast, oneshot},
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, instrument, warn},
};

use crate::{
    credentials::{CredentialRecord, CredentialStore},
    dispatch::{EventDispatcher, ListenerExit, SessionListener, WebhookResolver, WebhookSink},
    error::{AccountError, Result},
    factory::{OpenRequest, OpenedSession, SessionFactory},
    proxy::{ProxyEntry, ProxyPool},
    reconnect::{RELOGIN_COOLDOWN, ReloginTracker, log_relogin_failure},
    registry::{AccountRegistry, AccountSession, AccountStatus, AccountSummary, StatusChange},
    session::{AccountProfile, LoginChallenge, PlatformConnector},
};

/// Default bound on a login, QR scan included.
pub const DEFAULT_CHALLENGE_TIMEOUT: Duration = Duration::from_secs(180);

/// Tunables of [`AccountManager`].
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub relogin_cooldown: Duration,
    pub challenge_timeout: Duration,
}

impl Default for ManagerOptions {
    fn default() -> Self {
        Self {
            relogin_cooldown: RELOGIN_COOLDOWN,
            challenge_timeout: DEFAULT_CHALLENGE_TIMEOUT,
        }
    }
}

/// Collaborators the manager is built from.
pub struct ManagerParts {
    pub connector: Arc<dyn PlatformConnector>,
    pub pool: Arc<ProxyPool>,
    pub credentials: Arc<dyn CredentialStore>,
    pub resolver: Arc<dyn WebhookResolver>,
    pub sink: Arc<dyn WebhookSink>,
}

struct Inner {
    pool: Arc<ProxyPool>,
    credentials: Arc<dyn CredentialStore>,
    factory: SessionFactory,
    registry: Arc<AccountRegistry>,
    relogin: ReloginTracker,
    dispatcher: Arc<EventDispatcher>,
    options: ManagerOptions,
    cancel: CancellationToken,
}

/// Cheaply cloneable handle to the account connection manager.
#[derive(Clone)]
pub struct AccountManager {
    inner: Arc<Inner>,
}

/// What a login caller observes next.
#[derive(Debug, Clone, PartialEq)]
pub enum LoginProgress {
    /// A QR code must be scanned. The login continues in the background.
    Challenge(LoginChallenge),
    Completed(AccountSummary),
}

/// Live profile of a registered account.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountDetail {
    #[serde(flatten)]
    pub summary: AccountSummary,
    pub profile: AccountProfile,
}

/// Outcome of restoring persisted accounts at startup.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub restored: Vec<String>,
    /// Stored cookie rejected; a QR challenge is pending.
    pub challenged: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Handle on a login running in the background.
///
/// Dropping the ticket abandons the wait only; the login still completes and
/// registers the account.
pub struct LoginTicket {
    challenge: Option<oneshot::Receiver<LoginChallenge>>,
    outcome: Option<oneshot::Receiver<Result<AccountSummary>>>,
    connected: Option<oneshot::Receiver<()>>,
    finished: Option<std::result::Result<AccountSummary, String>>,
}

enum Step {
    Challenge(std::result::Result<LoginChallenge, oneshot::error::RecvError>),
    Outcome(std::result::Result<Result<AccountSummary>, oneshot::error::RecvError>),
}

impl LoginTicket {
    fn failed(error: AccountError) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(Err(error));
        Self {
            challenge: None,
            outcome: Some(rx),
            connected: None,
            finished: None,
        }
    }

    /// Wait for the challenge or the final outcome, whichever comes first.
    /// After the challenge has been returned, waits for the outcome.
    ///
    /// Receivers stay in place until they resolve, so a call cut short by a
    /// timeout can be retried.
    pub async fn progress(&mut self) -> Result<LoginProgress> {
        if let Some(challenge_rx) = self.challenge.as_mut()
            && let Some(outcome_rx) = self.outcome.as_mut()
        {
            let step = tokio::select! {
                biased;
                challenge = challenge_rx => Step::Challenge(challenge),
                outcome = outcome_rx => Step::Outcome(outcome),
            };
            self.challenge = None;
            match step {
                Step::Challenge(Ok(challenge)) => return Ok(LoginProgress::Challenge(challenge)),
                // No challenge will come; the outcome decides.
                Step::Challenge(Err(_)) => {},
                Step::Outcome(outcome) => {
                    self.outcome = None;
                    return self.finish(outcome).map(LoginProgress::Completed);
                },
            }
        }
        self.outcome().await.map(LoginProgress::Completed)
    }

    /// Wait for the final outcome, skipping any challenge.
    pub async fn outcome(&mut self) -> Result<AccountSummary> {
        self.challenge = None;
        if let Some(rx) = self.outcome.as_mut() {
            let outcome = rx.await;
            self.outcome = None;
            return self.finish(outcome);
        }
        match &self.finished {
            Some(Ok(summary)) => Ok(summary.clone()),
            Some(Err(message)) => Err(AccountError::LoginFailed(message.clone())),
            None => Err(AccountError::LoginFailed("login outcome unavailable".into())),
        }
    }

    /// Like [`Self::outcome`], bounded by `timeout`.
    pub async fn wait(&mut self, timeout: Duration) -> Result<AccountSummary> {
        tokio::time::timeout(timeout, self.outcome())
            .await
            .map_err(|_| AccountError::ChallengeTimeout(timeout))?
    }

    /// Wait until the session reports `Connected`. Returns `false` on
    /// timeout or if the login failed.
    pub async fn wait_connected(&mut self, timeout: Duration) -> bool {
        let Some(rx) = self.connected.as_mut() else {
            return false;
        };
        matches!(tokio::time::timeout(timeout, rx).await, Ok(Ok(())))
    }

    fn finish(
        &mut self,
        outcome: std::result::Result<Result<AccountSummary>, oneshot::error::RecvError>,
    ) -> Result<AccountSummary> {
        let result = match outcome {
            Ok(result) => result,
            Err(_) => Err(AccountError::LoginFailed(
                "login task ended without a result".into(),
            )),
        };
        self.finished = Some(match &result {
            Ok(summary) => Ok(summary.clone()),
            Err(e) => Err(e.to_string()),
        });
        result
    }
}

impl std::fmt::Debug for LoginTicket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoginTicket")
            .field("challenge_pending", &self.challenge.is_some())
            .field("finished", &self.finished.is_some())
            .finish()
    }
}

impl AccountManager {
    pub fn new(parts: ManagerParts, options: ManagerOptions) -> Self {
        let ManagerParts {
            connector,
            pool,
            credentials,
            resolver,
            sink,
        } = parts;
        let factory = SessionFactory::new(connector, Arc::clone(&pool), Arc::clone(&credentials));
        Self {
            inner: Arc::new(Inner {
                pool,
                credentials,
                factory,
                registry: Arc::new(AccountRegistry::new()),
                relogin: ReloginTracker::new(options.relogin_cooldown),
                dispatcher: Arc::new(EventDispatcher::new(resolver, sink)),
                options,
                cancel: CancellationToken::new(),
            }),
        }
    }

    pub fn pool(&self) -> &Arc<ProxyPool> {
        &self.inner.pool
    }

    pub fn registry(&self) -> &Arc<AccountRegistry> {
        &self.inner.registry
    }

    pub fn credentials(&self) -> &Arc<dyn CredentialStore> {
        &self.inner.credentials
    }

    pub(crate) fn relogin(&self) -> &ReloginTracker {
        &self.inner.relogin
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Start a login in the background.
    ///
    /// With `credential`, the stored cookie is tried first; a rejected
    /// cookie falls back to a QR challenge reported through the ticket.
    pub fn login_account(
        &self,
        proxy: Option<String>,
        credential: Option<CredentialRecord>,
    ) -> LoginTicket {
        if self.is_shut_down() {
            return LoginTicket::failed(AccountError::ShutDown);
        }
        let (challenge_tx, challenge_rx) = oneshot::channel();
        let (outcome_tx, outcome_rx) = oneshot::channel();
        let (connected_tx, connected_rx) = oneshot::channel();

        let manager = self.clone();
        let request = OpenRequest { proxy, credential };
        tokio::spawn(async move {
            let result = manager.run_login(request, challenge_tx, connected_tx).await;
            if let Err(e) = &result {
                warn!(error = %e, "login failed");
            }
            let _ = outcome_tx.send(result);
        });

        LoginTicket {
            challenge: Some(challenge_rx),
            outcome: Some(outcome_rx),
            connected: Some(connected_rx),
            finished: None,
        }
    }

    #[instrument(skip_all, fields(proxy = request.proxy.as_deref().unwrap_or("auto")))]
    async fn run_login(
        &self,
        request: OpenRequest,
        challenge: oneshot::Sender<LoginChallenge>,
        connected: oneshot::Sender<()>,
    ) -> Result<AccountSummary> {
        let opened = self.open_bounded(request, challenge).await?;
        self.install(opened, Some(connected)).await
    }

    /// Open a session, bounded by the challenge timeout and cancelled on
    /// shutdown.
    pub(crate) async fn open_bounded(
        &self,
        request: OpenRequest,
        challenge: oneshot::Sender<LoginChallenge>,
    ) -> Result<OpenedSession> {
        let timeout = self.inner.options.challenge_timeout;
        tokio::select! {
            _ = self.inner.cancel.cancelled() => Err(AccountError::ShutDown),
            opened = tokio::time::timeout(timeout, self.inner.factory.open(request, challenge)) => {
                opened.map_err(|_| AccountError::ChallengeTimeout(timeout))?
            },
        }
    }

    /// Register an opened session and start forwarding its events.
    pub(crate) async fn install(
        &self,
        opened: OpenedSession,
        connected: Option<oneshot::Sender<()>>,
    ) -> Result<AccountSummary> {
        let OpenedSession {
            own_id,
            profile,
            handle,
            mut proxy,
            ..
        } = opened;

        let events = match handle.start_listener() {
            Ok(events) => events,
            Err(e) => {
                handle.close().await;
                if let Some(p) = proxy.as_ref().filter(|p| p.pooled) {
                    self.inner.pool.release(&p.url, &own_id);
                }
                return Err(e);
            },
        };
        if self.is_shut_down() {
            handle.close().await;
            return Err(AccountError::ShutDown);
        }

        let registry = &self.inner.registry;
        let old_proxy = registry.get(&own_id).and_then(|s| s.proxy);
        if let Some(old) = old_proxy.filter(|p| p.pooled) {
            let same = proxy.as_ref().is_some_and(|p| p.url == old.url);
            if same {
                // The pool assignment of the previous session carries over.
                if let Some(p) = proxy.as_mut() {
                    p.pooled = true;
                }
            } else {
                self.inner.pool.release(&old.url, &own_id);
            }
        }

        let (generation, previous) = registry.upsert(AccountSession {
            own_id: own_id.clone(),
            phone_number: profile.phone_number.clone(),
            display_name: profile.display_name.clone(),
            proxy,
            handle,
            status: AccountStatus::Online,
            generation: 0,
        });
        // Upsert first so the old listener sees itself superseded.
        if let Some(previous) = previous {
            previous.handle.close().await;
        }

        let listener = SessionListener {
            own_id: own_id.clone(),
            generation,
            events,
            registry: Arc::clone(registry),
            dispatcher: Arc::clone(&self.inner.dispatcher),
            cancel: self.inner.cancel.child_token(),
            connected,
        };
        let manager = self.clone();
        let listener_id = own_id.clone();
        tokio::spawn(async move {
            if listener.run().await == ListenerExit::Disconnected {
                tokio::spawn(async move {
                    if let Err(e) = manager.handle_disconnect(&listener_id).await {
                        log_relogin_failure(&listener_id, &e);
                    }
                });
            }
        });

        registry
            .get(&own_id)
            .map(|s| s.summary())
            .ok_or(AccountError::AccountNotFound(own_id))
    }

    /// All registered accounts, sorted by id.
    pub fn list_accounts(&self) -> Vec<AccountSummary> {
        self.inner.registry.summaries()
    }

    pub fn find_by_phone(&self, phone: &str) -> Option<AccountSummary> {
        self.inner.registry.find_by_phone(phone).map(|s| s.summary())
    }

    pub fn status(&self, own_id: &str) -> Option<AccountStatus> {
        self.inner.registry.status(own_id)
    }

    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusChange> {
        self.inner.registry.subscribe()
    }

    /// Summary plus a live profile fetched through the session.
    pub async fn account_detail(&self, own_id: &str) -> Result<AccountDetail> {
        let session = self
            .inner
            .registry
            .get(own_id)
            .ok_or_else(|| AccountError::AccountNotFound(own_id.to_string()))?;
        let profile = session
            .handle
            .fetch_profile()
            .await
            .map_err(|e| AccountError::ProfileFetchFailed(e.to_string()))?;
        Ok(AccountDetail {
            summary: session.summary(),
            profile,
        })
    }

    /// Remove an account, close its session and free its pool proxy. With
    /// `forget_credential`, the stored cookie is deleted too so the account
    /// is not restored on the next start.
    #[instrument(skip(self))]
    pub async fn logout_account(
        &self,
        own_id: &str,
        forget_credential: bool,
    ) -> Result<AccountSummary> {
        let session = self
            .inner
            .registry
            .remove(own_id)
            .ok_or_else(|| AccountError::AccountNotFound(own_id.to_string()))?;
        let summary = session.summary();
        session.handle.close().await;
        if let Some(p) = session.proxy.as_ref().filter(|p| p.pooled) {
            self.inner.pool.release(&p.url, own_id);
        }
        self.inner.relogin.clear(own_id);
        if forget_credential {
            self.inner.credentials.remove(own_id).await?;
        }
        info!(own_id, "account logged out");
        Ok(summary)
    }

    /// Resume every account with a stored credential, one at a time.
    pub async fn restore_saved_accounts(&self) -> Result<RestoreReport> {
        let ids = self.inner.credentials.list_known_accounts().await?;
        info!(count = ids.len(), "restoring saved accounts");
        let mut report = RestoreReport::default();

        for own_id in ids {
            if self.inner.registry.get(&own_id).is_some() {
                debug!(own_id, "account already registered, skipping restore");
                continue;
            }
            let credential = match self.inner.credentials.read(&own_id).await {
                Ok(credential) => credential,
                Err(e) => {
                    warn!(own_id, error = %e, "unreadable stored credential");
                    report.failed.push((own_id, e.to_string()));
                    continue;
                },
            };
            let mut ticket = self.login_account(None, Some(credential));
            match ticket.progress().await {
                Ok(LoginProgress::Completed(summary)) => {
                    info!(own_id = %summary.own_id, "account restored");
                    report.restored.push(summary.own_id);
                },
                Ok(LoginProgress::Challenge(_)) => {
                    warn!(own_id, "stored cookie rejected, QR scan required to restore");
                    report.challenged.push(own_id);
                },
                Err(e) => {
                    warn!(own_id, error = %e, "failed to restore account");
                    report.failed.push((own_id, e.to_string()));
                },
            }
        }
        Ok(report)
    }

    pub fn list_proxies(&self) -> Vec<ProxyEntry> {
        self.inner.pool.list_proxies()
    }

    pub fn add_proxy(&self, url: &str) -> Result<ProxyEntry> {
        self.inner.pool.add_proxy(url)
    }

    pub fn remove_proxy(&self, url: &str) -> Result<ProxyEntry> {
        self.inner.pool.remove_proxy(url)
    }

    /// Stop all listeners and logins, then close every session.
    pub async fn shutdown(&self) {
        if self.inner.cancel.is_cancelled() {
            return;
        }
        self.inner.cancel.cancel();
        let sessions = self.inner.registry.drain();
        info!(count = sessions.len(), "shutting down account manager");
        for session in sessions {
            session.handle.close().await;
            if let Some(p) = session.proxy.as_ref().filter(|p| p.pooled) {
                self.inner.pool.release(&p.url, &session.own_id);
            }
        }
    }
}
