//! Webhook side of the Zalo relay: where each account's events go, and how
//! they get there.

pub mod error;
pub mod sink;
pub mod store;

pub use {
    error::WebhookError,
    sink::{DEFAULT_DELIVERY_TIMEOUT, HttpWebhookSink},
    store::{WebhookConfig, WebhookConfigStore, WebhookUrls},
};
