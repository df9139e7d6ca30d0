//! Transport channel lifecycle: connect, authenticate, detect failure,
//! reconnect.
//!
//! The transport is abstracted as a bidirectional, ordered, message-framed
//! channel behind the [`Connector`] trait; [`WsConnector`] is the
//! production WebSocket implementation. In-order delivery holds only
//! while a single connection lives — nothing is guaranteed across
//! reconnects, which is exactly why the sequencer's backfill protocol
//! exists.
//!
//! State machine: `Disconnected → Connecting → Connected →
//! ReconnectPending → Disconnected → …`. Callers that need the
//! connection park a oneshot in a waiter queue and are resolved in FIFO
//! order once `Connected` is reached. On reconnect, a registered room
//! handshake and any unacknowledged transactions are re-sent *before*
//! waiters resolve, so no caller ever observes connected-but-not-rejoined.
//!
//! Reconnection uses a fixed delay, not exponential backoff: predictable
//! recovery latency for a single-server room topology.

use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::CollabError;

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    ReconnectPending,
}

/// One live transport connection: a sender for outbound frames and a
/// receiver for inbound frames. The receiver closing signals disconnect.
pub struct TransportChannel {
    pub outgoing: mpsc::Sender<Vec<u8>>,
    pub incoming: mpsc::Receiver<Vec<u8>>,
}

/// Dials one transport connection. Called once per (re)connection attempt.
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        token: Option<String>,
    ) -> BoxFuture<'_, Result<TransportChannel, CollabError>>;
}

/// Supplies an authentication credential ahead of a connection attempt.
/// Absent for anonymous sessions.
pub trait TokenProvider: Send + Sync {
    fn fetch_token(&self) -> BoxFuture<'_, Result<String, CollabError>>;
}

/// Items surfaced to the client's single-threaded processing loop.
#[derive(Debug)]
pub enum Inbound {
    /// A raw frame from the transport, in arrival order.
    Frame(Vec<u8>),
    /// Connection established; rejoin and replay already sent.
    Connected { reconnected: bool },
    /// Transport lost; a reconnect is scheduled.
    Disconnected,
}

struct Inner {
    connector: Arc<dyn Connector>,
    token_provider: Option<Arc<dyn TokenProvider>>,
    jwt: RwLock<Option<String>>,
    state: RwLock<ConnectionState>,
    outgoing: RwLock<Option<mpsc::Sender<Vec<u8>>>>,
    /// Callers awaiting readiness, resolved FIFO on connect.
    waiters: Mutex<Vec<oneshot::Sender<()>>>,
    /// Encoded join handshake to re-issue transparently on reconnect.
    rejoin: RwLock<Option<Vec<u8>>>,
    /// Encoded unacknowledged transactions, replayed after rejoin.
    replay: Mutex<Vec<(Uuid, Vec<u8>)>>,
    inbound_tx: mpsc::Sender<Inbound>,
    reconnect_delay: Duration,
}

/// Owns the transport lifecycle. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        token_provider: Option<Arc<dyn TokenProvider>>,
        reconnect_delay: Duration,
    ) -> (Self, mpsc::Receiver<Inbound>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let manager = Self {
            inner: Arc::new(Inner {
                connector,
                token_provider,
                jwt: RwLock::new(None),
                state: RwLock::new(ConnectionState::Disconnected),
                outgoing: RwLock::new(None),
                waiters: Mutex::new(Vec::new()),
                rejoin: RwLock::new(None),
                replay: Mutex::new(Vec::new()),
                inbound_tx,
                reconnect_delay,
            }),
        };
        (manager, inbound_rx)
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

    pub async fn is_connected(&self) -> bool {
        self.state().await == ConnectionState::Connected
    }

    /// Suspend until the connection is up (and any rejoin has been sent).
    /// Initiates a connection attempt when fully disconnected. Connection
    /// failures are not surfaced here — they feed the reconnect loop and
    /// this future resolves once a later attempt succeeds.
    pub async fn ensure_connected(&self) {
        if self.is_connected().await {
            return;
        }
        let rx = {
            let (tx, rx) = oneshot::channel();
            self.inner.waiters.lock().await.push(tx);
            rx
        };
        // The connection may have come up between the state check and the
        // waiter registration; don't wait on a drain that already ran.
        if self.is_connected().await {
            return;
        }
        if self.try_begin_connecting().await {
            let manager = self.clone();
            tokio::spawn(async move { manager.establish(false).await });
        }
        // A dropped sender only happens on shutdown; treat it as resolved.
        let _ = rx.await;
    }

    /// Send one encoded frame. Errors while disconnected; silent-degrade
    /// policies live with the caller.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), CollabError> {
        let guard = self.inner.outgoing.read().await;
        match guard.as_ref() {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| CollabError::TransportClosed),
            None => Err(CollabError::NotConnected),
        }
    }

    /// Register (or clear) the join handshake re-issued on reconnect.
    pub async fn set_rejoin(&self, frame: Option<Vec<u8>>) {
        *self.inner.rejoin.write().await = frame;
    }

    /// Queue an encoded transaction for replay after reconnect.
    pub async fn push_replay(&self, id: Uuid, frame: Vec<u8>) {
        self.inner.replay.lock().await.push((id, frame));
    }

    /// Drop replay entries that have been acknowledged.
    pub async fn retain_replay(&self, unacked: &[Uuid]) {
        self.inner
            .replay
            .lock()
            .await
            .retain(|(id, _)| unacked.contains(id));
    }

    pub async fn clear_replay(&self) {
        self.inner.replay.lock().await.clear();
    }

    pub async fn replay_len(&self) -> usize {
        self.inner.replay.lock().await.len()
    }

    /// Force a credential refresh before the next attempt.
    pub async fn invalidate_token(&self) {
        *self.inner.jwt.write().await = None;
    }

    async fn try_begin_connecting(&self) -> bool {
        let mut state = self.inner.state.write().await;
        if *state == ConnectionState::Disconnected {
            *state = ConnectionState::Connecting;
            true
        } else {
            false
        }
    }

    /// Refresh the credential at most once per attempt: a cached token is
    /// reused, a refresh failure falls through to an un-refreshed attempt
    /// and lets the server be the authority on rejecting it.
    async fn attempt_token(&self) -> Option<String> {
        let provider = self.inner.token_provider.as_ref()?;
        {
            let jwt = self.inner.jwt.read().await;
            if let Some(token) = jwt.as_ref() {
                return Some(token.clone());
            }
        }
        match provider.fetch_token().await {
            Ok(token) => {
                *self.inner.jwt.write().await = Some(token.clone());
                Some(token)
            }
            Err(e) => {
                log::warn!("token refresh failed, connecting without it: {e}");
                None
            }
        }
    }

    fn establish(&self, reconnected: bool) -> BoxFuture<'_, ()> {
        Box::pin(async move {
            let token = self.attempt_token().await;
            let channel = match self.inner.connector.connect(token).await {
                Ok(channel) => channel,
                Err(e) => {
                    log::warn!(
                        "connect failed: {e}; retrying in {:?}",
                        self.inner.reconnect_delay
                    );
                    self.schedule_reconnect().await;
                    return;
                }
            };

            let TransportChannel {
                outgoing,
                mut incoming,
            } = channel;
            *self.inner.outgoing.write().await = Some(outgoing.clone());

            // Transparent rejoin: the previous room's handshake and any
            // unacknowledged transactions go out before anyone observes
            // `Connected`.
            if let Some(frame) = self.inner.rejoin.read().await.clone() {
                if outgoing.send(frame).await.is_err() {
                    log::warn!("transport dropped during rejoin");
                } else {
                    let replay = self.inner.replay.lock().await;
                    for (id, frame) in replay.iter() {
                        log::debug!("replaying unacknowledged transaction {id}");
                        if outgoing.send(frame.clone()).await.is_err() {
                            break;
                        }
                    }
                }
            }

            *self.inner.state.write().await = ConnectionState::Connected;
            log::info!("transport connected (reconnect: {reconnected})");

            let waiters: Vec<oneshot::Sender<()>> =
                std::mem::take(&mut *self.inner.waiters.lock().await);
            for waiter in waiters {
                let _ = waiter.send(());
            }

            let _ = self
                .inner
                .inbound_tx
                .send(Inbound::Connected { reconnected })
                .await;

            // Pump inbound frames until the transport closes.
            let manager = self.clone();
            tokio::spawn(async move {
                while let Some(frame) = incoming.recv().await {
                    if manager
                        .inner
                        .inbound_tx
                        .send(Inbound::Frame(frame))
                        .await
                        .is_err()
                    {
                        return; // client gone; stop without reconnecting
                    }
                }
                manager.schedule_reconnect().await;
            });
        })
    }

    /// Enter `ReconnectPending` and schedule one attempt after the fixed
    /// delay. Re-entrant close/error signals while already pending are
    /// ignored.
    async fn schedule_reconnect(&self) {
        {
            let mut state = self.inner.state.write().await;
            if *state == ConnectionState::ReconnectPending {
                return;
            }
            *state = ConnectionState::ReconnectPending;
        }
        *self.inner.outgoing.write().await = None;
        let _ = self.inner.inbound_tx.send(Inbound::Disconnected).await;
        log::info!(
            "transport lost, reconnecting in {:?}",
            self.inner.reconnect_delay
        );

        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(manager.inner.reconnect_delay).await;
            {
                let mut state = manager.inner.state.write().await;
                if *state != ConnectionState::ReconnectPending {
                    return;
                }
                *state = ConnectionState::Disconnected;
            }
            if manager.try_begin_connecting().await {
                manager.establish(true).await;
            }
        });
    }
}

// ───────────────────────────────────────────────────────────────────
// WebSocket connector
// ───────────────────────────────────────────────────────────────────

/// Production [`Connector`] over tokio-tungstenite. The socket splits
/// into a writer task fed by the outgoing channel and a reader task
/// feeding the incoming channel; either side failing closes the channel
/// pair and the manager sees a disconnect.
pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

impl Connector for WsConnector {
    fn connect(
        &self,
        token: Option<String>,
    ) -> BoxFuture<'_, Result<TransportChannel, CollabError>> {
        Box::pin(async move {
            let mut request = self
                .url
                .as_str()
                .into_client_request()
                .map_err(|e| CollabError::Connect(e.to_string()))?;
            if let Some(token) = token {
                let cookie = HeaderValue::from_str(&format!("jwt={token}"))
                    .map_err(|e| CollabError::Connect(e.to_string()))?;
                request.headers_mut().insert(COOKIE, cookie);
            }

            let (ws, _) = connect_async(request)
                .await
                .map_err(|e| CollabError::Connect(e.to_string()))?;
            let (mut writer, mut reader) = ws.split();

            let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
            let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(256);

            tokio::spawn(async move {
                while let Some(frame) = out_rx.recv().await {
                    if writer.send(Message::Binary(frame.into())).await.is_err() {
                        break;
                    }
                }
            });

            tokio::spawn(async move {
                while let Some(msg) = reader.next().await {
                    match msg {
                        Ok(Message::Binary(data)) => {
                            let frame: Vec<u8> = data.into();
                            if in_tx.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Ok(Message::Close(_)) | Err(_) => break,
                        _ => {}
                    }
                }
            });

            Ok(TransportChannel {
                outgoing: out_tx,
                incoming: in_rx,
            })
        })
    }
}
