//! WebSocket communication with the zca-js sidecar.
//!
//! One WebSocket carries every account. Requests are matched to replies by
//! `requestId`; push traffic is routed to sessions by `sessionId`.

use std::{
    collections::HashMap,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use {
    anyhow::Context,
    futures::{SinkExt, StreamExt},
    serde_json::Value,
    tokio::sync::{mpsc, oneshot},
    tokio_tungstenite::{connect_async, tungstenite::Message},
    tracing::{debug, error, info, warn},
    uuid::Uuid,
    zalo_accounts::{ConnectionState, SessionEvent},
};

use crate::{
    error::{Result, SidecarError},
    types::{GatewayMessage, SidecarMessage},
};

/// Default sidecar WebSocket endpoint.
pub const DEFAULT_SIDECAR_URL: &str = "ws://127.0.0.1:9877";

/// Default time to wait for a request reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

type Reply = std::result::Result<Option<Value>, String>;

struct SessionRoute {
    events: mpsc::UnboundedSender<SessionEvent>,
    qr: Option<oneshot::Sender<String>>,
}

#[derive(Default)]
struct Routes {
    pending: HashMap<String, oneshot::Sender<Reply>>,
    sessions: HashMap<String, SessionRoute>,
}

/// Handle for communicating with the sidecar.
#[derive(Clone)]
pub struct SidecarHandle {
    /// Sender for outgoing messages to the sidecar.
    tx: mpsc::Sender<GatewayMessage>,
    routes: Arc<Mutex<Routes>>,
    connected: Arc<AtomicBool>,
    request_timeout: Duration,
}

impl SidecarHandle {
    fn routes(&self) -> MutexGuard<'_, Routes> {
        self.routes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send a message to the sidecar.
    pub async fn send(&self, msg: GatewayMessage) -> Result<()> {
        self.tx
            .send(msg)
            .await
            .map_err(|_| SidecarError::Disconnected)
    }

    /// Send without waiting for queue space.
    pub fn try_send(&self, msg: GatewayMessage) -> Result<()> {
        self.tx.try_send(msg).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                SidecarError::Protocol("outgoing queue full".into())
            },
            mpsc::error::TrySendError::Closed(_) => SidecarError::Disconnected,
        })
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Register a session and return its event stream. Events arriving
    /// before the caller starts reading are buffered.
    pub fn open_session(&self, session_id: &str) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (events, rx) = mpsc::unbounded_channel();
        self.routes().sessions.insert(session_id.to_string(), SessionRoute {
            events,
            qr: None,
        });
        rx
    }

    /// Receive the next QR code emitted for `session_id`.
    pub fn expect_qr(&self, session_id: &str) -> oneshot::Receiver<String> {
        let (tx, rx) = oneshot::channel();
        if let Some(route) = self.routes().sessions.get_mut(session_id) {
            route.qr = Some(tx);
        }
        rx
    }

    /// Forget a session. Its event stream ends.
    pub fn close_session(&self, session_id: &str) -> bool {
        self.routes().sessions.remove(session_id).is_some()
    }

    /// Send a request and wait for its reply.
    pub async fn request(
        &self,
        build: impl FnOnce(String) -> GatewayMessage,
    ) -> Result<Option<Value>> {
        self.request_within(build, self.request_timeout).await
    }

    /// Like [`Self::request`] with an explicit timeout.
    pub async fn request_within(
        &self,
        build: impl FnOnce(String) -> GatewayMessage,
        timeout: Duration,
    ) -> Result<Option<Value>> {
        let request_id = Uuid::new_v4().to_string();
        let (tx, rx) = oneshot::channel();
        self.routes().pending.insert(request_id.clone(), tx);

        if let Err(e) = self.send(build(request_id.clone())).await {
            self.routes().pending.remove(&request_id);
            return Err(e);
        }

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(Ok(data))) => Ok(data),
            Ok(Ok(Err(message))) => Err(SidecarError::Rejected(message)),
            Ok(Err(_)) => Err(SidecarError::Disconnected),
            Err(_) => {
                self.routes().pending.remove(&request_id);
                Err(SidecarError::Timeout(timeout))
            },
        }
    }
}

fn route_message(routes: &Mutex<Routes>, msg: SidecarMessage) {
    let mut routes = routes.lock().unwrap_or_else(PoisonError::into_inner);
    match msg {
        SidecarMessage::Qr { session_id, image } => {
            match routes
                .sessions
                .get_mut(&session_id)
                .and_then(|r| r.qr.take())
            {
                Some(tx) => {
                    debug!(session_id, "received QR code from sidecar");
                    let _ = tx.send(image);
                },
                None => warn!(session_id, "QR code for a session nobody waits on"),
            }
        },
        SidecarMessage::Response {
            request_id,
            ok,
            data,
            error,
        } => {
            let Some(tx) = routes.pending.remove(&request_id) else {
                debug!(request_id, "reply to an abandoned request");
                return;
            };
            let reply = if ok {
                Ok(data)
            } else {
                Err(error.unwrap_or_else(|| "unknown error".into()))
            };
            let _ = tx.send(reply);
        },
        SidecarMessage::Event {
            session_id,
            kind,
            data,
        } => {
            let event = match kind.as_str() {
                "message" => SessionEvent::Message(data),
                "group_event" => SessionEvent::GroupEvent(data),
                "reaction" => SessionEvent::Reaction(data),
                other => {
                    debug!(session_id, kind = other, "ignoring sidecar event");
                    return;
                },
            };
            if let Some(route) = routes.sessions.get(&session_id) {
                let _ = route.events.send(event);
            }
        },
        SidecarMessage::Connected { session_id } => {
            if let Some(route) = routes.sessions.get(&session_id) {
                let _ = route
                    .events
                    .send(SessionEvent::ConnectionState(ConnectionState::Connected));
            }
        },
        SidecarMessage::Closed {
            session_id,
            code,
            reason,
        } => {
            if let Some(route) = routes.sessions.remove(&session_id) {
                let reason = reason.or_else(|| code.map(|c| format!("closed with code {c}")));
                info!(session_id, reason = reason.as_deref().unwrap_or(""), "sidecar session closed");
                let _ = route.events.send(SessionEvent::ConnectionState(
                    ConnectionState::Disconnected { reason },
                ));
            }
        },
        SidecarMessage::Error {
            session_id: Some(session_id),
            error,
        } => {
            if let Some(route) = routes.sessions.get(&session_id) {
                let _ = route.events.send(SessionEvent::Error(error));
            }
        },
        SidecarMessage::Error {
            session_id: None,
            error,
        } => warn!(error, "sidecar reported an error"),
    }
}

/// Fail outstanding requests and disconnect every session.
fn drop_all_routes(routes: &Mutex<Routes>) {
    let mut routes = routes.lock().unwrap_or_else(PoisonError::into_inner);
    routes.pending.clear();
    for (_, route) in routes.sessions.drain() {
        let _ = route.events.send(SessionEvent::ConnectionState(
            ConnectionState::Disconnected {
                reason: Some("sidecar disconnected".into()),
            },
        ));
    }
}

/// Connect to the sidecar and spawn reader/writer tasks.
pub async fn connect_to_sidecar(
    url: &str,
    request_timeout: Duration,
) -> anyhow::Result<(SidecarHandle, oneshot::Receiver<()>)> {
    info!(url, "connecting to zca-js sidecar");

    let (ws_stream, _) = connect_async(url)
        .await
        .context("failed to connect to sidecar")?;

    info!("connected to zca-js sidecar");

    let (mut write, mut read) = ws_stream.split();

    // Channel for outgoing messages.
    let (tx, mut rx) = mpsc::channel::<GatewayMessage>(64);

    // Channel for disconnect notification.
    let (disconnect_tx, disconnect_rx) = oneshot::channel();

    let routes = Arc::new(Mutex::new(Routes::default()));
    let connected = Arc::new(AtomicBool::new(true));
    let reader_routes = Arc::clone(&routes);
    let reader_connected = Arc::clone(&connected);
    let writer_connected = Arc::clone(&connected);

    tokio::spawn(async move {
        while let Some(msg_result) = read.next().await {
            match msg_result {
                Ok(Message::Text(text)) => match serde_json::from_str::<SidecarMessage>(&text) {
                    Ok(msg) => route_message(&reader_routes, msg),
                    Err(e) => {
                        warn!(error = %e, text = %text, "failed to parse sidecar message");
                    },
                },
                Ok(Message::Close(_)) => {
                    info!("sidecar connection closed");
                    break;
                },
                Ok(_) => {},
                Err(e) => {
                    error!(error = %e, "WebSocket read error");
                    break;
                },
            }
        }

        reader_connected.store(false, Ordering::SeqCst);
        drop_all_routes(&reader_routes);
        let _ = disconnect_tx.send(());
    });

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(json) => {
                    if let Err(e) = write.send(Message::Text(json.into())).await {
                        error!(error = %e, "failed to send message to sidecar");
                        break;
                    }
                    debug!(request_id = msg.request_id().unwrap_or(""), "sent message to sidecar");
                },
                Err(e) => {
                    error!(error = %e, "failed to serialize message");
                },
            }
        }

        writer_connected.store(false, Ordering::SeqCst);
    });

    Ok((
        SidecarHandle {
            tx,
            routes,
            connected,
            request_timeout,
        },
        disconnect_rx,
    ))
}

/// Try to connect to the sidecar with retries.
pub async fn connect_with_retry(
    url: &str,
    request_timeout: Duration,
    max_retries: u32,
) -> anyhow::Result<(SidecarHandle, oneshot::Receiver<()>)> {
    let mut attempt = 0;
    loop {
        match connect_to_sidecar(url, request_timeout).await {
            Ok(result) => return Ok(result),
            Err(e) => {
                attempt += 1;
                if attempt >= max_retries {
                    return Err(e);
                }
                warn!(
                    attempt,
                    max_retries,
                    error = %e,
                    "failed to connect to sidecar, retrying..."
                );
                tokio::time::sleep(Duration::from_secs(2)).await;
            },
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-process WebSocket server standing in for the sidecar.

    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use {
        futures::{SinkExt, StreamExt},
        serde_json::Value,
        tokio::net::TcpListener,
        tokio_tungstenite::tungstenite::Message,
    };

    /// Reply to each incoming message with the handler's output. `None`
    /// drops the connection.
    pub(crate) async fn fake_sidecar<F>(handler: F) -> String
    where
        F: Fn(Value) -> Option<Vec<Value>> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            while let Some(Ok(msg)) = ws.next().await {
                let Message::Text(text) = msg else {
                    continue;
                };
                let value: Value = serde_json::from_str(&text).unwrap();
                let Some(replies) = handler(value) else {
                    break;
                };
                for reply in replies {
                    ws.send(Message::Text(reply.to_string().into())).await.unwrap();
                }
            }
        });
        format!("ws://{addr}")
    }
}
