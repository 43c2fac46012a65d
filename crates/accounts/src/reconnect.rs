//! Relogin of disconnected accounts, rate limited per account.

use std::{
    collections::HashMap,
    sync::{Mutex, PoisonError},
    time::{Duration, Instant},
};

use {
    futures::future::{BoxFuture, FutureExt},
    tokio::sync::oneshot,
    tracing::{info, instrument, warn},
};

use crate::{
    error::{AccountError, Result},
    factory::OpenRequest,
    manager::AccountManager,
    registry::{AccountStatus, AccountSummary},
    session::LoginChallenge,
};

/// Minimum time between two relogin attempts for the same account.
pub const RELOGIN_COOLDOWN: Duration = Duration::from_secs(5 * 60);

/// Last relogin attempt per account. Reset on restart.
#[derive(Debug)]
pub struct ReloginTracker {
    cooldown: Duration,
    attempts: Mutex<HashMap<String, Instant>>,
}

impl Default for ReloginTracker {
    fn default() -> Self {
        Self::new(RELOGIN_COOLDOWN)
    }
}

impl ReloginTracker {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    pub fn cooldown(&self) -> Duration {
        self.cooldown
    }

    /// Record an attempt for `own_id` now, unless one happened within the
    /// cooldown.
    pub fn try_begin(&self, own_id: &str) -> Result<()> {
        self.try_begin_at(own_id, Instant::now())
    }

    pub fn try_begin_at(&self, own_id: &str, now: Instant) -> Result<()> {
        let mut attempts = self.attempts.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(last) = attempts.get(own_id) {
            let elapsed = now.saturating_duration_since(*last);
            if elapsed < self.cooldown {
                return Err(AccountError::CooldownActive {
                    own_id: own_id.to_string(),
                    elapsed,
                });
            }
        }
        attempts.insert(own_id.to_string(), now);
        Ok(())
    }

    pub fn last_attempt(&self, own_id: &str) -> Option<Instant> {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(own_id)
            .copied()
    }

    pub fn clear(&self, own_id: &str) {
        self.attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(own_id);
    }
}

impl AccountManager {
    /// React to the loss of the registered session for `own_id`.
    ///
    /// Marks the account disconnected and, when a stored credential exists
    /// and the cooldown allows it, logs in again through the account's proxy.
    pub fn handle_disconnect<'a>(&'a self, own_id: &'a str) -> BoxFuture<'a, Result<AccountSummary>> {
        // Boxed: installing the new session spawns a listener that calls
        // back into this function.
        self.reconnect_account(own_id).boxed()
    }

    #[instrument(skip(self))]
    async fn reconnect_account(&self, own_id: &str) -> Result<AccountSummary> {
        if self.is_shut_down() {
            return Err(AccountError::ShutDown);
        }
        let registry = self.registry();
        let session = registry
            .get(own_id)
            .ok_or_else(|| AccountError::AccountNotFound(own_id.to_string()))?;
        // An attempt already in flight owns the status.
        if !matches!(
            session.status,
            AccountStatus::ReconnectScheduled | AccountStatus::Connecting
        ) {
            registry.set_status(own_id, AccountStatus::Disconnected);
        }

        if !self.credentials().has(own_id).await? {
            return Err(AccountError::NoCredential(own_id.to_string()));
        }
        self.relogin().try_begin(own_id)?;
        registry.set_status(own_id, AccountStatus::ReconnectScheduled);

        match self.relogin_once(own_id, session.proxy.map(|p| p.url)).await {
            Ok(summary) => {
                info!(own_id, status = %summary.status, "relogin succeeded");
                Ok(summary)
            },
            Err(e) => {
                registry.set_status(own_id, AccountStatus::Disconnected);
                Err(e)
            },
        }
    }

    async fn relogin_once(&self, own_id: &str, proxy: Option<String>) -> Result<AccountSummary> {
        let credential = self.credentials().read(own_id).await?;
        self.registry().set_status(own_id, AccountStatus::Connecting);

        let (challenge_tx, challenge_rx) = oneshot::channel::<LoginChallenge>();
        let watched = own_id.to_string();
        tokio::spawn(async move {
            if let Ok(challenge) = challenge_rx.await {
                warn!(
                    own_id = %watched,
                    qr_bytes = challenge.image_base64.len(),
                    "stored cookie rejected during relogin, QR scan required"
                );
            }
        });

        let request = OpenRequest {
            proxy,
            credential: Some(credential),
        };
        let opened = self.open_bounded(request, challenge_tx).await?;
        let opened_id = opened.own_id.clone();
        let summary = self.install(opened, None).await?;
        if opened_id != own_id {
            warn!(own_id, scanned = %opened_id, "relogin produced a different account");
            self.registry().set_status(own_id, AccountStatus::Disconnected);
        }
        Ok(summary)
    }
}

/// Log a failed background relogin at a level matching its cause.
pub(crate) fn log_relogin_failure(own_id: &str, error: &AccountError) {
    match error {
        AccountError::NoCredential(_) => {
            info!(own_id, "no stored credential, not reconnecting");
        },
        AccountError::CooldownActive { elapsed, .. } => {
            info!(own_id, elapsed_secs = elapsed.as_secs(), "relogin cooldown active, skipping");
        },
        AccountError::ShutDown | AccountError::AccountNotFound(_) => {},
        other => warn!(own_id, error = %other, "relogin failed"),
    }
}
