//! Forwarding of session events to webhook sinks.

use std::sync::Arc;

use {
    async_trait::async_trait,
    serde_json::{Map, Value},
    tokio::sync::oneshot,
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, warn},
};

use crate::{
    error::Result,
    registry::{AccountRegistry, AccountStatus},
    session::{ConnectionState, EventKind, SessionEvent, SessionEvents},
};

/// Field added to every forwarded payload.
pub const ACCOUNT_ID_FIELD: &str = "_accountId";

/// Resolves the webhook destination for an event kind and account.
pub trait WebhookResolver: Send + Sync {
    /// Per-account URL, else the process-wide default. `None` when neither
    /// is configured.
    fn webhook_url(&self, kind: EventKind, own_id: &str) -> Option<String>;
}

/// Delivers a JSON body to a webhook URL.
#[async_trait]
pub trait WebhookSink: Send + Sync {
    async fn deliver(&self, url: &str, body: &Value) -> Result<()>;
}

/// Add `_accountId` to a payload. Non-object payloads are wrapped under
/// `data`.
pub fn tag_payload(payload: Value, own_id: &str) -> Value {
    let mut object = match payload {
        Value::Object(map) => map,
        other => {
            let mut map = Map::new();
            map.insert("data".into(), other);
            map
        },
    };
    object.insert(ACCOUNT_ID_FIELD.into(), Value::String(own_id.to_string()));
    Value::Object(object)
}

/// Routes events to their webhook, one spawned delivery per event.
pub struct EventDispatcher {
    resolver: Arc<dyn WebhookResolver>,
    sink: Arc<dyn WebhookSink>,
}

impl EventDispatcher {
    pub fn new(resolver: Arc<dyn WebhookResolver>, sink: Arc<dyn WebhookSink>) -> Self {
        Self { resolver, sink }
    }

    /// Forward one event. Returns `false` if no webhook is configured for it.
    pub fn dispatch(&self, kind: EventKind, own_id: &str, payload: Value) -> bool {
        let Some(url) = self
            .resolver
            .webhook_url(kind, own_id)
            .filter(|u| !u.trim().is_empty())
        else {
            debug!(own_id, %kind, "no webhook configured, dropping event");
            return false;
        };

        let body = tag_payload(payload, own_id);
        let sink = Arc::clone(&self.sink);
        let own_id = own_id.to_string();
        tokio::spawn(async move {
            match sink.deliver(&url, &body).await {
                Ok(()) => debug!(own_id, %kind, url, "event forwarded"),
                Err(e) => warn!(own_id, %kind, url, error = %e, "webhook delivery failed"),
            }
        });
        true
    }
}

/// Why a session listener stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerExit {
    /// The session dropped while it was the registered one.
    Disconnected,
    /// A newer session replaced this one.
    Superseded,
    Cancelled,
}

/// Consumes the event stream of one session.
pub struct SessionListener {
    pub own_id: String,
    pub generation: u64,
    pub events: SessionEvents,
    pub registry: Arc<AccountRegistry>,
    pub dispatcher: Arc<EventDispatcher>,
    pub cancel: CancellationToken,
    /// Fired on the first `Connected` state.
    pub connected: Option<oneshot::Sender<()>>,
}

impl SessionListener {
    pub async fn run(mut self) -> ListenerExit {
        debug!(own_id = %self.own_id, generation = self.generation, "session listener started");
        loop {
            let event = tokio::select! {
                _ = self.cancel.cancelled() => return ListenerExit::Cancelled,
                event = self.events.recv() => event,
            };

            let Some(event) = event else {
                return self.on_disconnect(Some("event stream ended".into()));
            };

            match event {
                SessionEvent::ConnectionState(ConnectionState::Connected) => {
                    if self.registry.set_status_if_current(
                        &self.own_id,
                        self.generation,
                        AccountStatus::Online,
                    ) {
                        info!(own_id = %self.own_id, "session connected");
                    }
                    if let Some(tx) = self.connected.take() {
                        let _ = tx.send(());
                    }
                },
                SessionEvent::ConnectionState(ConnectionState::Disconnected { reason }) => {
                    return self.on_disconnect(reason);
                },
                SessionEvent::Error(message) => {
                    warn!(own_id = %self.own_id, error = %message, "session reported an error");
                },
                other => {
                    if let Some((kind, payload)) = other.forwardable() {
                        self.dispatcher.dispatch(kind, &self.own_id, payload);
                    }
                },
            }
        }
    }

    fn on_disconnect(&self, reason: Option<String>) -> ListenerExit {
        if !self.registry.is_current(&self.own_id, self.generation) {
            debug!(own_id = %self.own_id, generation = self.generation, "replaced session closed");
            return ListenerExit::Superseded;
        }
        if self.cancel.is_cancelled() {
            return ListenerExit::Cancelled;
        }
        warn!(
            own_id = %self.own_id,
            reason = reason.as_deref().unwrap_or("unknown"),
            "session disconnected"
        );
        ListenerExit::Disconnected
    }
}
