//! Locating, parsing and overriding the relay configuration.

use std::path::{Path, PathBuf};

use {
    anyhow::{Context, Result},
    tracing::{debug, info},
};

use crate::schema::RelayConfig;

pub const APP_NAME: &str = "zalo-relay";
pub const CONFIG_FILE_NAME: &str = "zalo-relay.toml";

/// Platform config directory, e.g. `~/.config/zalo-relay` on Linux.
pub fn config_dir() -> Option<PathBuf> {
    directories::ProjectDirs::from("", "", APP_NAME).map(|dirs| dirs.config_dir().to_path_buf())
}

/// First existing config file: `./zalo-relay.toml`, then the platform dir.
pub fn find_config_file() -> Option<PathBuf> {
    let local = PathBuf::from(CONFIG_FILE_NAME);
    if local.is_file() {
        return Some(local);
    }
    config_dir()
        .map(|dir| dir.join(CONFIG_FILE_NAME))
        .filter(|path| path.is_file())
}

/// Parse a config file. Missing sections take their defaults.
pub fn load_config_file(path: &Path) -> Result<RelayConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config: {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("Failed to parse config: {}", path.display()))
}

/// Load the effective configuration.
///
/// An explicit `path` must exist. Without one the usual locations are
/// searched, and plain defaults apply when nothing is found. Environment
/// overrides are applied last.
pub fn load_config(path: Option<&Path>) -> Result<RelayConfig> {
    let mut config = match path {
        Some(path) => load_config_file(path)?,
        None => match find_config_file() {
            Some(found) => load_config_file(&found)?,
            None => {
                debug!("no config file found, using defaults");
                RelayConfig::default()
            },
        },
    };
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    info!(data_dir = %config.data_dir().display(), sidecar = %config.sidecar.url, "config loaded");
    Ok(config)
}

/// Apply `MESSAGE_WEBHOOK_URL`, `GROUP_EVENT_WEBHOOK_URL`,
/// `REACTION_WEBHOOK_URL`, `ZALO_RELAY_DATA_DIR` and `ZALO_SIDECAR_URL`.
/// Empty values are ignored.
pub fn apply_env_overrides(config: &mut RelayConfig, lookup: impl Fn(&str) -> Option<String>) {
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(url) = get("MESSAGE_WEBHOOK_URL") {
        config.webhooks.message_url = url;
    }
    if let Some(url) = get("GROUP_EVENT_WEBHOOK_URL") {
        config.webhooks.group_event_url = url;
    }
    if let Some(url) = get("REACTION_WEBHOOK_URL") {
        config.webhooks.reaction_url = url;
    }
    if let Some(dir) = get("ZALO_RELAY_DATA_DIR") {
        config.data_dir = Some(PathBuf::from(dir));
    }
    if let Some(url) = get("ZALO_SIDECAR_URL") {
        config.sidecar.url = url;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use {super::*, std::collections::HashMap};

    #[test]
    fn explicit_file_is_parsed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(
            &path,
            "data_dir = \"/srv/relay\"\n[relogin]\ncooldown_secs = 60\n",
        )
        .unwrap();

        let config = load_config_file(&path).unwrap();
        assert_eq!(config.data_dir(), PathBuf::from("/srv/relay"));
        assert_eq!(config.relogin.cooldown_secs, 60);
        assert_eq!(config.login.challenge_timeout_secs, 180);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_config(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(format!("{err:#}").contains("Failed to read config"));
    }

    #[test]
    fn malformed_file_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[proxies\ncapacity = ").unwrap();
        let err = load_config_file(&path).unwrap_err();
        assert!(err.to_string().contains("bad.toml"));
    }

    #[test]
    fn env_overrides_replace_file_values() {
        let env: HashMap<&str, &str> = HashMap::from([
            ("MESSAGE_WEBHOOK_URL", "https://hooks.example/msg"),
            ("REACTION_WEBHOOK_URL", "  "),
            ("ZALO_RELAY_DATA_DIR", "/tmp/relay"),
            ("ZALO_SIDECAR_URL", "ws://sidecar:9877"),
        ]);
        let mut config = RelayConfig::default();
        config.webhooks.reaction_url = "https://hooks.example/react".into();

        apply_env_overrides(&mut config, |k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.webhooks.message_url, "https://hooks.example/msg");
        assert_eq!(config.webhooks.group_event_url, "");
        assert_eq!(config.webhooks.reaction_url, "https://hooks.example/react");
        assert_eq!(config.data_dir(), PathBuf::from("/tmp/relay"));
        assert_eq!(config.sidecar.url, "ws://sidecar:9877");
    }
}
