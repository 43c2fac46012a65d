//! Wiring the account manager from a [`RelayConfig`].

use std::{path::Path, sync::Arc};

use {
    anyhow::{Context, Result},
    base64::Engine,
    tracing::info,
    zalo_accounts::{
        AccountManager, CredentialStore, FileCredentialStore, LoginChallenge, ManagerOptions,
        ManagerParts, ProxyListFile, ProxyPool, RestoreReport,
    },
    zalo_config::RelayConfig,
    zalo_sidecar::{SidecarConfig, SidecarConnector},
    zalo_webhooks::{HttpWebhookSink, WebhookConfigStore, WebhookUrls},
};

pub fn open_proxy_pool(config: &RelayConfig) -> Result<Arc<ProxyPool>> {
    let file = ProxyListFile::new(config.proxy_file());
    let pool = ProxyPool::load(file, config.proxies.capacity)
        .with_context(|| format!("Failed to load proxy list: {}", config.proxy_file().display()))?;
    Ok(Arc::new(pool))
}

pub fn webhook_defaults(config: &RelayConfig) -> WebhookUrls {
    WebhookUrls {
        message_webhook_url: config.webhooks.message_url.clone(),
        group_event_webhook_url: config.webhooks.group_event_url.clone(),
        reaction_webhook_url: config.webhooks.reaction_url.clone(),
    }
}

pub fn build_manager(config: &RelayConfig) -> Result<AccountManager> {
    let connector = SidecarConnector::new(SidecarConfig {
        url: config.sidecar.url.clone(),
        request_timeout: config.sidecar_request_timeout(),
        login_timeout: config.sidecar_login_timeout(),
        connect_retries: config.sidecar.connect_retries,
    });
    let webhooks = WebhookConfigStore::load(config.webhook_config_file(), webhook_defaults(config));
    let sink = HttpWebhookSink::new(config.delivery_timeout())
        .context("Failed to build webhook HTTP client")?;

    let parts = ManagerParts {
        connector: Arc::new(connector),
        pool: open_proxy_pool(config)?,
        credentials: Arc::new(FileCredentialStore::new(config.credentials_dir())),
        resolver: Arc::new(webhooks),
        sink: Arc::new(sink),
    };
    let options = ManagerOptions {
        relogin_cooldown: config.relogin_cooldown(),
        challenge_timeout: config.challenge_timeout(),
    };
    info!(
        credentials = %config.credentials_dir().display(),
        proxies = %config.proxy_file().display(),
        "account manager ready"
    );
    Ok(AccountManager::new(parts, options))
}

/// Resume every saved account and log the tally.
pub async fn restore(manager: &AccountManager) -> Result<RestoreReport> {
    let report = manager
        .restore_saved_accounts()
        .await
        .context("Failed to restore saved accounts")?;
    info!(
        restored = report.restored.len(),
        challenged = report.challenged.len(),
        failed = report.failed.len(),
        "restore finished"
    );
    Ok(report)
}

/// Account ids with a persisted credential.
pub async fn known_accounts(config: &RelayConfig) -> Result<Vec<String>> {
    let store = FileCredentialStore::new(config.credentials_dir());
    let mut ids = store
        .list_known_accounts()
        .await
        .with_context(|| format!("Failed to list credentials in {}", store.dir().display()))?;
    ids.sort();
    Ok(ids)
}

/// Decode the QR image and write it as a PNG file.
pub fn write_qr(path: &Path, challenge: &LoginChallenge) -> Result<()> {
    let png = base64::engine::general_purpose::STANDARD
        .decode(challenge.image_base64.trim())
        .context("QR image is not valid base64")?;
    std::fs::write(path, png).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}
