//! Webhook destinations per event kind, with per-account overrides.
//!
//! Persisted as `webhookConfig.json`:
//!
//! ```json
//! {
//!   "default": { "messageWebhookUrl": "", "groupEventWebhookUrl": "", "reactionWebhookUrl": "" },
//!   "accounts": { "<ownId>": { "messageWebhookUrl": "https://..." } }
//! }
//! ```

use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
    sync::{PoisonError, RwLock},
};

use {
    serde::{Deserialize, Serialize},
    tracing::{debug, info, warn},
    zalo_accounts::{EventKind, WebhookResolver},
};

use crate::error::{Result, WebhookError};

/// One URL per event kind. Empty means unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookUrls {
    #[serde(default)]
    pub message_webhook_url: String,
    #[serde(default)]
    pub group_event_webhook_url: String,
    #[serde(default)]
    pub reaction_webhook_url: String,
}

impl WebhookUrls {
    pub fn get(&self, kind: EventKind) -> &str {
        match kind {
            EventKind::Message => self.message_webhook_url.as_str(),
            EventKind::GroupEvent => self.group_event_webhook_url.as_str(),
            EventKind::Reaction => self.reaction_webhook_url.as_str(),
        }
    }

    pub fn set(&mut self, kind: EventKind, url: impl Into<String>) {
        let slot = match kind {
            EventKind::Message => &mut self.message_webhook_url,
            EventKind::GroupEvent => &mut self.group_event_webhook_url,
            EventKind::Reaction => &mut self.reaction_webhook_url,
        };
        *slot = url.into();
    }

    pub fn is_empty(&self) -> bool {
        EventKind::ALL.iter().all(|k| self.get(*k).is_empty())
    }
}

/// Full webhook configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WebhookConfig {
    pub default: WebhookUrls,
    pub accounts: BTreeMap<String, WebhookUrls>,
}

/// On-disk shape; either section may be missing.
#[derive(Deserialize)]
struct RawConfig {
    default: Option<WebhookUrls>,
    accounts: Option<BTreeMap<String, WebhookUrls>>,
}

fn validate_url(url: &str) -> Result<()> {
    if url.is_empty() {
        return Ok(());
    }
    let parsed = url::Url::parse(url).map_err(|e| WebhookError::InvalidUrl {
        url: url.to_string(),
        reason: e.to_string(),
    })?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(WebhookError::InvalidUrl {
            url: url.to_string(),
            reason: format!("unsupported scheme {}", parsed.scheme()),
        });
    }
    Ok(())
}

/// File-backed webhook configuration.
pub struct WebhookConfigStore {
    path: Option<PathBuf>,
    config: RwLock<WebhookConfig>,
}

impl WebhookConfigStore {
    /// Configuration that is never written to disk.
    pub fn in_memory(defaults: WebhookUrls) -> Self {
        Self {
            path: None,
            config: RwLock::new(WebhookConfig {
                default: defaults,
                accounts: BTreeMap::new(),
            }),
        }
    }

    /// Load from `path`. A missing, empty or unparseable file is replaced by
    /// one holding `defaults`; missing sections are filled in.
    pub fn load(path: impl Into<PathBuf>, defaults: WebhookUrls) -> Self {
        let path = path.into();
        let (config, repaired) = match fs::read_to_string(&path) {
            Ok(raw) if raw.trim().is_empty() => {
                warn!(path = %path.display(), "webhook config is empty, using defaults");
                (Self::fresh(defaults), true)
            },
            Ok(raw) => match serde_json::from_str::<RawConfig>(&raw) {
                Ok(parsed) => {
                    let repaired = parsed.default.is_none() || parsed.accounts.is_none();
                    if repaired {
                        warn!(path = %path.display(), "webhook config incomplete, filling in sections");
                    }
                    (
                        WebhookConfig {
                            default: parsed.default.unwrap_or(defaults),
                            accounts: parsed.accounts.unwrap_or_default(),
                        },
                        repaired,
                    )
                },
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "invalid webhook config, using defaults");
                    (Self::fresh(defaults), true)
                },
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "no webhook config, creating one");
                (Self::fresh(defaults), true)
            },
            Err(e) => {
                warn!(path = %path.display(), error = %e, "cannot read webhook config, using defaults");
                (Self::fresh(defaults), true)
            },
        };

        let store = Self {
            path: Some(path),
            config: RwLock::new(config),
        };
        if repaired && let Err(e) = store.save(&store.snapshot()) {
            warn!(error = %e, "failed to save webhook config");
        }
        store
    }

    fn fresh(defaults: WebhookUrls) -> WebhookConfig {
        WebhookConfig {
            default: defaults,
            accounts: BTreeMap::new(),
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Per-account URL for `kind`, else the default. Empty when unset.
    pub fn get_webhook_url(&self, kind: EventKind, own_id: &str) -> String {
        let config = self.config.read().unwrap_or_else(PoisonError::into_inner);
        config
            .accounts
            .get(own_id)
            .map(|urls| urls.get(kind))
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| config.default.get(kind))
            .to_string()
    }

    /// Set the URL for `kind` on one account and persist. An empty `url`
    /// clears the override.
    pub fn set_webhook_url(&self, own_id: &str, kind: EventKind, url: &str) -> Result<()> {
        let url = url.trim();
        validate_url(url)?;
        let snapshot = {
            let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
            config
                .accounts
                .entry(own_id.to_string())
                .or_default()
                .set(kind, url);
            config.clone()
        };
        info!(own_id, %kind, url, "webhook url set");
        self.save(&snapshot)
    }

    /// Set the process-wide default for `kind` and persist.
    pub fn set_default_url(&self, kind: EventKind, url: &str) -> Result<()> {
        let url = url.trim();
        validate_url(url)?;
        let snapshot = {
            let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
            config.default.set(kind, url);
            config.clone()
        };
        info!(%kind, url, "default webhook url set");
        self.save(&snapshot)
    }

    /// Drop every override of an account. Returns `true` if it had any.
    pub fn remove_account(&self, own_id: &str) -> Result<bool> {
        let snapshot = {
            let mut config = self.config.write().unwrap_or_else(PoisonError::into_inner);
            if config.accounts.remove(own_id).is_none() {
                return Ok(false);
            }
            config.clone()
        };
        info!(own_id, "webhook overrides removed");
        self.save(&snapshot)?;
        Ok(true)
    }

    pub fn snapshot(&self) -> WebhookConfig {
        self.config
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn save(&self, config: &WebhookConfig) -> Result<()> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, serde_json::to_string_pretty(config)?)?;
        debug!(path = %path.display(), "webhook config saved");
        Ok(())
    }
}

impl WebhookResolver for WebhookConfigStore {
    fn webhook_url(&self, kind: EventKind, own_id: &str) -> Option<String> {
        Some(self.get_webhook_url(kind, own_id)).filter(|url| !url.is_empty())
    }
}
