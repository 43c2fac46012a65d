//! Outbound proxy pool with per-proxy account capacity.
//!
//! All bookkeeping sits behind one mutex. Logins are rare compared to message
//! traffic, so a coarse lock is enough; it is never held across an `.await`.

use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use {
    serde::Serialize,
    tracing::{debug, info, warn},
    url::Url,
};

use crate::error::{AccountError, Result};

/// Maximum number of accounts sharing one proxy unless configured otherwise.
pub const DEFAULT_PROXY_CAPACITY: usize = 3;

/// A proxy endpoint and the accounts currently routed through it.
///
/// `used_count` always equals `assigned_accounts.len()` and never exceeds
/// `capacity`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyEntry {
    pub url: String,
    pub used_count: usize,
    pub capacity: usize,
    pub assigned_accounts: BTreeSet<String>,
}

impl ProxyEntry {
    fn new(url: String, capacity: usize) -> Self {
        Self {
            url,
            used_count: 0,
            capacity,
            assigned_accounts: BTreeSet::new(),
        }
    }

    pub fn has_capacity(&self) -> bool {
        self.used_count < self.capacity
    }
}

struct Slot {
    entry: ProxyEntry,
    /// Logins in flight holding a lease on this proxy.
    reserved: usize,
}

impl Slot {
    fn can_reserve(&self) -> bool {
        self.entry.used_count + self.reserved < self.entry.capacity
    }
}

/// Check that `raw` is a well-formed proxy URL.
pub fn parse_proxy_url(raw: &str) -> Result<Url> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(AccountError::invalid_proxy(raw, "empty"));
    }
    let url = Url::parse(trimmed).map_err(|e| AccountError::invalid_proxy(raw, e))?;
    if !url.has_host() {
        return Err(AccountError::invalid_proxy(raw, "missing host"));
    }
    Ok(url)
}

/// JSON file holding the proxy list as an array of URL strings.
#[derive(Debug, Clone)]
pub struct ProxyListFile {
    path: PathBuf,
}

impl ProxyListFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the list. A missing or unreadable file is replaced with `[]`.
    pub fn load(&self) -> Result<Vec<String>> {
        let parsed = fs::read_to_string(&self.path)
            .map_err(AccountError::from)
            .and_then(|raw| serde_json::from_str::<Vec<String>>(&raw).map_err(Into::into));
        match parsed {
            Ok(urls) => {
                debug!(path = %self.path.display(), count = urls.len(), "loaded proxy list");
                Ok(urls)
            },
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "proxy list unreadable, starting empty");
                self.save(&[])?;
                Ok(Vec::new())
            },
        }
    }

    pub fn save(&self, urls: &[String]) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(urls)?;
        fs::write(&self.path, json)?;
        Ok(())
    }
}

/// Pool of outbound proxies shared by all accounts.
pub struct ProxyPool {
    slots: Mutex<Vec<Slot>>,
    capacity: usize,
    list_file: Option<ProxyListFile>,
}

impl ProxyPool {
    /// Create an empty, in-memory pool.
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Mutex::new(Vec::new()),
            capacity: capacity.max(1),
            list_file: None,
        }
    }

    /// Create a pool backed by a proxy list file. Entries that are not valid
    /// URLs or are duplicated are skipped.
    pub fn load(list_file: ProxyListFile, capacity: usize) -> Result<Self> {
        let capacity = capacity.max(1);
        let mut slots: Vec<Slot> = Vec::new();
        for raw in list_file.load()? {
            let raw = raw.trim().to_string();
            if let Err(e) = parse_proxy_url(&raw) {
                warn!(error = %e, "skipping proxy from list");
                continue;
            }
            if slots.iter().any(|s| s.entry.url == raw) {
                continue;
            }
            slots.push(Slot {
                entry: ProxyEntry::new(raw, capacity),
                reserved: 0,
            });
        }
        info!(count = slots.len(), capacity, "proxy pool loaded");
        Ok(Self {
            slots: Mutex::new(slots),
            capacity,
            list_file: Some(list_file),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Slot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, slots: &[Slot]) {
        let Some(file) = &self.list_file else {
            return;
        };
        let urls: Vec<String> = slots.iter().map(|s| s.entry.url.clone()).collect();
        if let Err(e) = file.save(&urls) {
            warn!(path = %file.path().display(), error = %e, "failed to save proxy list");
        }
    }

    /// All proxies in insertion order.
    pub fn list_proxies(&self) -> Vec<ProxyEntry> {
        self.slots().iter().map(|s| s.entry.clone()).collect()
    }

    pub fn get(&self, url: &str) -> Option<ProxyEntry> {
        self.slots()
            .iter()
            .find(|s| s.entry.url == url)
            .map(|s| s.entry.clone())
    }

    pub fn add_proxy(&self, url: &str) -> Result<ProxyEntry> {
        parse_proxy_url(url)?;
        let url = url.trim().to_string();
        let mut slots = self.slots();
        if slots.iter().any(|s| s.entry.url == url) {
            return Err(AccountError::DuplicateProxy(url));
        }
        let entry = ProxyEntry::new(url, self.capacity);
        slots.push(Slot {
            entry: entry.clone(),
            reserved: 0,
        });
        self.persist(&slots);
        info!(proxy = %entry.url, "proxy added");
        Ok(entry)
    }

    /// Remove a proxy. Refused while any account is assigned to it or a login
    /// holds a lease on it.
    pub fn remove_proxy(&self, url: &str) -> Result<ProxyEntry> {
        let mut slots = self.slots();
        let index = slots
            .iter()
            .position(|s| s.entry.url == url)
            .ok_or_else(|| AccountError::ProxyNotFound(url.to_string()))?;
        let slot = &slots[index];
        let used = slot.entry.used_count + slot.reserved;
        if used > 0 {
            return Err(AccountError::ProxyInUse {
                url: url.to_string(),
                used,
            });
        }
        let removed = slots.remove(index).entry;
        self.persist(&slots);
        info!(proxy = %removed.url, "proxy removed");
        Ok(removed)
    }

    /// Record a caller-supplied proxy so later logins can reuse it. No
    /// capacity is accounted for it. Returns `true` if it was new.
    pub fn ensure_listed(&self, url: &str) -> bool {
        let url = url.trim();
        let mut slots = self.slots();
        if slots.iter().any(|s| s.entry.url == url) {
            debug!(proxy = url, "custom proxy already listed");
            return false;
        }
        slots.push(Slot {
            entry: ProxyEntry::new(url.to_string(), self.capacity),
            reserved: 0,
        });
        self.persist(&slots);
        info!(proxy = url, "custom proxy added to pool");
        true
    }

    /// First proxy, in insertion order, with spare capacity.
    pub fn select_available_proxy(&self) -> Option<ProxyEntry> {
        self.slots()
            .iter()
            .find(|s| s.entry.has_capacity())
            .map(|s| s.entry.clone())
    }

    /// Atomically pick a proxy for a login in flight. In-flight leases count
    /// against capacity, so concurrent logins cannot oversubscribe a proxy.
    pub fn reserve(self: &Arc<Self>) -> Option<ProxyLease> {
        let mut slots = self.slots();
        let slot = slots.iter_mut().find(|s| s.can_reserve())?;
        slot.reserved += 1;
        debug!(proxy = %slot.entry.url, "proxy reserved");
        Some(ProxyLease {
            pool: Arc::clone(self),
            url: slot.entry.url.clone(),
            committed: false,
        })
    }

    /// Assign `own_id` to a proxy. Assigning an account that is already
    /// assigned is a no-op.
    pub fn assign(&self, url: &str, own_id: &str) -> Result<ProxyEntry> {
        let mut slots = self.slots();
        let slot = slots
            .iter_mut()
            .find(|s| s.entry.url == url)
            .ok_or_else(|| AccountError::ProxyNotFound(url.to_string()))?;
        if !slot.entry.assigned_accounts.contains(own_id) {
            if !slot.can_reserve() {
                return Err(AccountError::ProxyFull(url.to_string()));
            }
            Self::insert_account(&mut slot.entry, own_id);
        }
        Ok(slot.entry.clone())
    }

    /// Release `own_id` from a proxy. Releasing an account that is not
    /// assigned, or a proxy that no longer exists, is a no-op.
    pub fn release(&self, url: &str, own_id: &str) -> bool {
        let mut slots = self.slots();
        let Some(slot) = slots.iter_mut().find(|s| s.entry.url == url) else {
            return false;
        };
        let removed = slot.entry.assigned_accounts.remove(own_id);
        slot.entry.used_count = slot.entry.assigned_accounts.len();
        if removed {
            debug!(proxy = url, own_id, used = slot.entry.used_count, "proxy released");
        }
        removed
    }

    /// The pool proxy an account is assigned to, if any.
    pub fn assignment_of(&self, own_id: &str) -> Option<String> {
        self.slots()
            .iter()
            .find(|s| s.entry.assigned_accounts.contains(own_id))
            .map(|s| s.entry.url.clone())
    }

    fn insert_account(entry: &mut ProxyEntry, own_id: &str) {
        entry.assigned_accounts.insert(own_id.to_string());
        entry.used_count = entry.assigned_accounts.len();
        debug!(proxy = %entry.url, own_id, used = entry.used_count, "proxy assigned");
    }
}

/// A reservation on a pool proxy held while a login is in flight.
///
/// Dropping an uncommitted lease gives the slot back.
pub struct ProxyLease {
    pool: Arc<ProxyPool>,
    url: String,
    committed: bool,
}

impl ProxyLease {
    pub fn url(&self) -> &str {
        &self.url
    }

    /// Turn the reservation into an assignment for `own_id`.
    pub fn commit(mut self, own_id: &str) -> Result<ProxyEntry> {
        let mut slots = self.pool.slots();
        let slot = slots
            .iter_mut()
            .find(|s| s.entry.url == self.url)
            .ok_or_else(|| AccountError::ProxyNotFound(self.url.clone()))?;
        slot.reserved = slot.reserved.saturating_sub(1);
        self.committed = true;
        if !slot.entry.assigned_accounts.contains(own_id) {
            ProxyPool::insert_account(&mut slot.entry, own_id);
        }
        Ok(slot.entry.clone())
    }
}

impl Drop for ProxyLease {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut slots = self.pool.slots();
        if let Some(slot) = slots.iter_mut().find(|s| s.entry.url == self.url) {
            slot.reserved = slot.reserved.saturating_sub(1);
            debug!(proxy = %self.url, "proxy reservation dropped");
        }
    }
}

impl std::fmt::Debug for ProxyLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyLease")
            .field("url", &self.url)
            .field("committed", &self.committed)
            .finish()
    }
}
