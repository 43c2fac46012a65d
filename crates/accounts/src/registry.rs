//! Live sessions keyed by platform account id.

use std::{
    collections::HashMap,
    sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
};

use {
    serde::Serialize,
    tokio::sync::broadcast,
    tracing::{debug, info},
};

use crate::{factory::AssignedProxy, session::SessionHandle};

const STATUS_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle status of a registered account.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Connecting,
    Online,
    Disconnected,
    ReconnectScheduled,
}

impl AccountStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Online => "online",
            Self::Disconnected => "disconnected",
            Self::ReconnectScheduled => "reconnect_scheduled",
        }
    }
}

impl std::fmt::Display for AccountStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A registered account and its live handle.
#[derive(Clone)]
pub struct AccountSession {
    pub own_id: String,
    pub phone_number: Option<String>,
    pub display_name: Option<String>,
    pub proxy: Option<AssignedProxy>,
    pub handle: SessionHandle,
    pub status: AccountStatus,
    /// Assigned by [`AccountRegistry::upsert`].
    pub generation: u64,
}

impl AccountSession {
    /// `"<phone> (<ownId>)"`, or the bare id when the phone is unknown.
    pub fn label(&self) -> String {
        match self.phone_number.as_deref().filter(|p| !p.is_empty()) {
            Some(phone) => format!("{phone} ({})", self.own_id),
            None => self.own_id.clone(),
        }
    }

    pub fn summary(&self) -> AccountSummary {
        AccountSummary {
            own_id: self.own_id.clone(),
            phone_number: self.phone_number.clone(),
            display_name: self.label(),
            profile_name: self.display_name.clone(),
            proxy: self.proxy.as_ref().map(|p| p.url.clone()),
            proxy_pooled: self.proxy.as_ref().is_some_and(|p| p.pooled),
            status: self.status,
            is_online: self.status == AccountStatus::Online,
        }
    }
}

impl std::fmt::Debug for AccountSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AccountSession")
            .field("own_id", &self.own_id)
            .field("phone_number", &self.phone_number)
            .field("proxy", &self.proxy)
            .field("status", &self.status)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Serializable view of an account for listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountSummary {
    pub own_id: String,
    pub phone_number: Option<String>,
    pub display_name: String,
    pub profile_name: Option<String>,
    pub proxy: Option<String>,
    pub proxy_pooled: bool,
    pub status: AccountStatus,
    pub is_online: bool,
}

/// A status transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub own_id: String,
    pub from: AccountStatus,
    pub to: AccountStatus,
}

/// In-memory account registry.
pub struct AccountRegistry {
    sessions: RwLock<HashMap<String, AccountSession>>,
    next_generation: std::sync::atomic::AtomicU64,
    status_tx: broadcast::Sender<StatusChange>,
}

impl Default for AccountRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl AccountRegistry {
    pub fn new() -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_CHANNEL_CAPACITY);
        Self {
            sessions: RwLock::new(HashMap::new()),
            next_generation: std::sync::atomic::AtomicU64::new(1),
            status_tx,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, AccountSession>> {
        self.sessions.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, AccountSession>> {
        self.sessions.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert or replace the session for `session.own_id`.
    ///
    /// Returns the generation assigned to the new session and the session it
    /// replaced. The caller owns closing the previous handle.
    pub fn upsert(&self, mut session: AccountSession) -> (u64, Option<AccountSession>) {
        let generation = self
            .next_generation
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        session.generation = generation;
        let own_id = session.own_id.clone();
        let to = session.status;

        let previous = self.write().insert(own_id.clone(), session);
        let from = previous.as_ref().map(|p| p.status);
        match &previous {
            Some(_) => info!(own_id, generation, "account session replaced"),
            None => info!(own_id, generation, "account registered"),
        }
        if let Some(from) = from
            && from != to
        {
            self.notify(&own_id, from, to);
        }
        (generation, previous)
    }

    pub fn get(&self, own_id: &str) -> Option<AccountSession> {
        self.read().get(own_id).cloned()
    }

    /// All sessions, sorted by account id.
    pub fn list(&self) -> Vec<AccountSession> {
        let mut sessions: Vec<AccountSession> = self.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.own_id.cmp(&b.own_id));
        sessions
    }

    pub fn summaries(&self) -> Vec<AccountSummary> {
        self.list().iter().map(AccountSession::summary).collect()
    }

    pub fn find_by_phone(&self, phone: &str) -> Option<AccountSession> {
        self.read()
            .values()
            .find(|s| s.phone_number.as_deref() == Some(phone))
            .cloned()
    }

    pub fn remove(&self, own_id: &str) -> Option<AccountSession> {
        let removed = self.write().remove(own_id);
        if removed.is_some() {
            info!(own_id, "account removed");
        }
        removed
    }

    /// Set the status of `own_id`. Returns the previous status, or `None` if
    /// the account is not registered.
    pub fn set_status(&self, own_id: &str, to: AccountStatus) -> Option<AccountStatus> {
        let from = {
            let mut sessions = self.write();
            let session = sessions.get_mut(own_id)?;
            std::mem::replace(&mut session.status, to)
        };
        if from != to {
            self.notify(own_id, from, to);
        }
        Some(from)
    }

    /// Like [`Self::set_status`], but only applies while `generation` is the
    /// registered one.
    pub fn set_status_if_current(
        &self,
        own_id: &str,
        generation: u64,
        to: AccountStatus,
    ) -> bool {
        let from = {
            let mut sessions = self.write();
            match sessions.get_mut(own_id) {
                Some(session) if session.generation == generation => {
                    std::mem::replace(&mut session.status, to)
                },
                _ => return false,
            }
        };
        if from != to {
            self.notify(own_id, from, to);
        }
        true
    }

    pub fn status(&self, own_id: &str) -> Option<AccountStatus> {
        self.read().get(own_id).map(|s| s.status)
    }

    /// Whether `generation` is still the registered session for `own_id`.
    pub fn is_current(&self, own_id: &str, generation: u64) -> bool {
        self.read()
            .get(own_id)
            .is_some_and(|s| s.generation == generation)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusChange> {
        self.status_tx.subscribe()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Remove and return every session.
    pub fn drain(&self) -> Vec<AccountSession> {
        let mut sessions = self.write();
        sessions.drain().map(|(_, s)| s).collect()
    }

    fn notify(&self, own_id: &str, from: AccountStatus, to: AccountStatus) {
        debug!(own_id, %from, %to, "account status changed");
        // No receivers is fine.
        let _ = self.status_tx.send(StatusChange {
            own_id: own_id.to_string(),
            from,
            to,
        });
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, crate::testing::FakeSession, std::sync::Arc};

    fn session(own_id: &str, phone: &str) -> (AccountSession, Arc<FakeSession>) {
        let fake = FakeSession::new(own_id);
        let handle: SessionHandle = Arc::clone(&fake) as SessionHandle;
        (
            AccountSession {
                own_id: own_id.into(),
                phone_number: Some(phone.into()),
                display_name: None,
                proxy: None,
                handle,
                status: AccountStatus::Online,
                generation: 0,
            },
            fake,
        )
    }

    #[test]
    fn only_latest_handle_is_reachable() {
        let registry = AccountRegistry::new();
        let mut fakes = Vec::new();
        let mut last_generation = 0;
        for _ in 0..5 {
            let (s, fake) = session("u1", "849");
            let (generation, _) = registry.upsert(s);
            assert!(generation > last_generation);
            last_generation = generation;
            fakes.push(fake);
        }

        assert_eq!(registry.len(), 1);
        let current = registry.get("u1").unwrap();
        let latest: SessionHandle = Arc::clone(fakes.last().unwrap()) as SessionHandle;
        assert!(Arc::ptr_eq(&current.handle, &latest));
        assert!(registry.is_current("u1", last_generation));
        assert!(!registry.is_current("u1", last_generation - 1));
    }

    #[test]
    fn upsert_returns_replaced_session() {
        let registry = AccountRegistry::new();
        let (first, _) = session("u1", "849");
        let (g1, prev) = registry.upsert(first);
        assert!(prev.is_none());
        let (second, _) = session("u1", "849");
        let (_, prev) = registry.upsert(second);
        assert_eq!(prev.unwrap().generation, g1);
    }

    #[test]
    fn list_is_sorted_and_phone_lookup_works() {
        let registry = AccountRegistry::new();
        registry.upsert(session("b", "222").0);
        registry.upsert(session("a", "111").0);

        let ids: Vec<String> = registry.list().into_iter().map(|s| s.own_id).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(registry.find_by_phone("222").unwrap().own_id, "b");
        assert!(registry.find_by_phone("999").is_none());
    }

    #[test]
    fn status_changes_are_broadcast() {
        let registry = AccountRegistry::new();
        let mut rx = registry.subscribe();
        registry.upsert(session("u1", "849").0);

        registry.set_status("u1", AccountStatus::Disconnected);
        registry.set_status("u1", AccountStatus::Disconnected);
        registry.set_status("u1", AccountStatus::Online);

        let first = rx.try_recv().unwrap();
        assert_eq!(
            (first.from, first.to),
            (AccountStatus::Online, AccountStatus::Disconnected)
        );
        let second = rx.try_recv().unwrap();
        assert_eq!(second.to, AccountStatus::Online);
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn stale_generation_cannot_change_status() {
        let registry = AccountRegistry::new();
        let (g1, _) = registry.upsert(session("u1", "849").0);
        registry.upsert(session("u1", "849").0);
        assert!(!registry.set_status_if_current("u1", g1, AccountStatus::Disconnected));
        assert_eq!(registry.status("u1"), Some(AccountStatus::Online));
    }

    #[test]
    fn set_status_on_unknown_account_is_none() {
        let registry = AccountRegistry::new();
        assert!(registry.set_status("ghost", AccountStatus::Online).is_none());
    }

    #[test]
    fn summary_formats_label() {
        let (s, _) = session("42", "84900000000");
        let summary = s.summary();
        assert_eq!(summary.display_name, "84900000000 (42)");
        assert!(summary.is_online);

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["ownId"], "42");
        assert_eq!(json["status"], "online");
        assert_eq!(json["isOnline"], true);
    }
}
