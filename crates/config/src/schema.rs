//! Shape of `zalo-relay.toml`.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use serde::{Deserialize, Serialize};

/// Root of the relay configuration. Every section is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// Base directory for relative paths below. Defaults to `./data`.
    pub data_dir: Option<PathBuf>,
    pub proxies: ProxiesConfig,
    pub credentials: CredentialsConfig,
    pub relogin: ReloginConfig,
    pub login: LoginConfig,
    pub sidecar: SidecarSection,
    pub webhooks: WebhooksConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxiesConfig {
    pub file: PathBuf,
    /// Accounts allowed per proxy.
    pub capacity: usize,
}

impl Default for ProxiesConfig {
    fn default() -> Self {
        Self {
            file: PathBuf::from("proxies.json"),
            capacity: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CredentialsConfig {
    pub dir: PathBuf,
}

impl Default for CredentialsConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("cookies"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReloginConfig {
    pub cooldown_secs: u64,
}

impl Default for ReloginConfig {
    fn default() -> Self {
        Self { cooldown_secs: 300 }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoginConfig {
    pub challenge_timeout_secs: u64,
}

impl Default for LoginConfig {
    fn default() -> Self {
        Self {
            challenge_timeout_secs: 180,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SidecarSection {
    pub url: String,
    pub request_timeout_secs: u64,
    pub login_timeout_secs: u64,
    pub connect_retries: u32,
}

impl Default for SidecarSection {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:9877".into(),
            request_timeout_secs: 30,
            login_timeout_secs: 120,
            connect_retries: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhooksConfig {
    pub config_file: PathBuf,
    pub delivery_timeout_secs: u64,
    /// Process-wide defaults, used when the webhook config file has none.
    pub message_url: String,
    pub group_event_url: String,
    pub reaction_url: String,
}

impl Default for WebhooksConfig {
    fn default() -> Self {
        Self {
            config_file: PathBuf::from("webhookConfig.json"),
            delivery_timeout_secs: 10,
            message_url: String::new(),
            group_event_url: String::new(),
            reaction_url: String::new(),
        }
    }
}

impl RelayConfig {
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir
            .clone()
            .unwrap_or_else(|| PathBuf::from("data"))
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.data_dir().join(path)
        }
    }

    pub fn proxy_file(&self) -> PathBuf {
        self.resolve(&self.proxies.file)
    }

    pub fn credentials_dir(&self) -> PathBuf {
        self.resolve(&self.credentials.dir)
    }

    pub fn webhook_config_file(&self) -> PathBuf {
        self.resolve(&self.webhooks.config_file)
    }

    pub fn relogin_cooldown(&self) -> Duration {
        Duration::from_secs(self.relogin.cooldown_secs)
    }

    pub fn challenge_timeout(&self) -> Duration {
        Duration::from_secs(self.login.challenge_timeout_secs)
    }

    pub fn sidecar_request_timeout(&self) -> Duration {
        Duration::from_secs(self.sidecar.request_timeout_secs)
    }

    pub fn sidecar_login_timeout(&self) -> Duration {
        Duration::from_secs(self.sidecar.login_timeout_secs)
    }

    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.webhooks.delivery_timeout_secs)
    }
}
