//! Best-effort JSON POST delivery.

use std::time::Duration;

use {
    async_trait::async_trait,
    serde_json::Value,
    tracing::{debug, warn},
    zalo_accounts::{AccountError, WebhookSink},
};

use crate::error::Result;

/// Default per-request timeout for webhook delivery.
pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Posts event payloads with a shared HTTP client.
#[derive(Debug, Clone)]
pub struct HttpWebhookSink {
    client: reqwest::Client,
}

impl HttpWebhookSink {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("zalo-relay/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl WebhookSink for HttpWebhookSink {
    async fn deliver(&self, url: &str, body: &Value) -> zalo_accounts::Result<()> {
        let response = self
            .client
            .post(url)
            .json(body)
            .send()
            .await
            .map_err(|e| AccountError::Webhook(format!("{url}: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(url, %status, "webhook endpoint error: {text}");
            return Err(AccountError::Webhook(format!("{url} returned {status}")));
        }

        debug!(url, %status, "webhook delivered");
        Ok(())
    }
}
