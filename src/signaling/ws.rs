// WebSocket signaling channel
//
// Carries router requests, acknowledgements and broadcasts as JSON text
// frames over one WebSocket. A driver task owns the socket, reconnects with a
// fixed delay up to a bounded number of attempts, and fails every pending
// acknowledgement when the socket drops.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use url::Url;

use super::{wait_connected, ChannelState, EventBus, SignalingChannel, Subscription, SubscriptionId};
use crate::{PeerId, Result, SfuError};

/// Reconnection settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReconnectPolicy {
    /// Consecutive failed attempts before giving up
    pub max_attempts: u32,
    /// Pause between attempts, in milliseconds
    pub delay_ms: u64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            delay_ms: 500,
        }
    }
}

impl ReconnectPolicy {
    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

/// One JSON text frame on the socket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum Frame {
    /// Server greeting carrying the assigned peer identifier
    Welcome { peer_id: PeerId },
    /// Client request expecting an ack with the same id
    Request { id: u64, event: String, payload: Value },
    /// Server acknowledgement
    Ack { id: u64, payload: Value },
    /// Server broadcast
    Event { event: String, payload: Value },
}

type PendingAck = oneshot::Sender<Result<Value>>;

struct Shared {
    url: Url,
    policy: ReconnectPolicy,
    state: watch::Sender<ChannelState>,
    bus: EventBus,
    pending: Mutex<HashMap<u64, PendingAck>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
    next_request: AtomicU64,
}

impl Shared {
    fn fail_pending(&self, reason: &str) {
        let pending: Vec<_> = self.pending.lock().drain().collect();
        if !pending.is_empty() {
            debug!(count = pending.len(), reason, "Failing pending acks");
        }
        for (_, ack) in pending {
            let _ = ack.send(Err(SfuError::Disconnected(reason.to_string())));
        }
    }

    fn handle_frame(&self, text: &str, welcomed: &mut bool) {
        let frame = match serde_json::from_str::<Frame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "Dropping malformed signaling frame");
                return;
            }
        };

        match frame {
            Frame::Welcome { peer_id } => {
                info!(%peer_id, url = %self.url, "Signaling connected");
                *welcomed = true;
                self.state.send_replace(ChannelState::Connected { peer_id });
            }
            Frame::Ack { id, payload } => match self.pending.lock().remove(&id) {
                Some(ack) => {
                    let _ = ack.send(Ok(payload));
                }
                None => debug!(id, "Ack for unknown or expired request"),
            },
            Frame::Event { event, payload } => {
                let delivered = self.bus.dispatch(&event, &payload);
                trace!(%event, delivered, "Broadcast received");
            }
            Frame::Request { event, .. } => debug!(%event, "Ignoring server-initiated request"),
        }
    }

    /// Run one socket until it closes. Returns whether the server greeted us.
    async fn run_connection(&self, token: &CancellationToken) -> std::result::Result<bool, String> {
        let (socket, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| format!("websocket connect failed: {}", e))?;
        let (mut write, mut read) = socket.split();

        let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
        *self.outbound.lock() = Some(tx);
        let mut welcomed = false;

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    let _ = write.send(Message::Close(None)).await;
                    break;
                }
                Some(message) = rx.recv() => {
                    if let Err(e) = write.send(message).await {
                        warn!(error = %e, "Signaling write failed");
                        break;
                    }
                }
                incoming = read.next() => match incoming {
                    Some(Ok(Message::Text(text))) => self.handle_frame(&text, &mut welcomed),
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => self.handle_frame(&text, &mut welcomed),
                        Err(_) => debug!("Dropping non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!(error = %e, "Signaling socket error");
                        break;
                    }
                },
            }
        }

        *self.outbound.lock() = None;
        Ok(welcomed)
    }

    async fn drive(self: Arc<Self>, token: CancellationToken) {
        let mut failures = 0;

        loop {
            self.state.send_replace(ChannelState::Connecting);
            match self.run_connection(&token).await {
                Ok(true) => failures = 0,
                Ok(false) => failures += 1,
                Err(e) => {
                    warn!(url = %self.url, error = %e, "Signaling connection attempt failed");
                    failures += 1;
                }
            }
            self.fail_pending("signaling socket closed");

            if token.is_cancelled() {
                self.state.send_replace(ChannelState::Disconnected);
                break;
            }
            if failures >= self.policy.max_attempts {
                warn!(url = %self.url, attempts = failures, "Giving up on signaling");
                self.state.send_replace(ChannelState::Failed);
                break;
            }

            self.state.send_replace(ChannelState::Connecting);
            tokio::select! {
                _ = token.cancelled() => {
                    self.state.send_replace(ChannelState::Disconnected);
                    break;
                }
                _ = tokio::time::sleep(self.policy.delay()) => {}
            }
            debug!(url = %self.url, attempt = failures + 1, "Reconnecting signaling");
        }
    }
}

struct Driver {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Signaling channel over a WebSocket
pub struct WsSignalingChannel {
    shared: Arc<Shared>,
    driver: Mutex<Option<Driver>>,
}

impl WsSignalingChannel {
    /// Create a channel for `url`; nothing happens until `connect`
    pub fn new(url: Url, policy: ReconnectPolicy) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                url,
                policy,
                state,
                bus: EventBus::default(),
                pending: Mutex::new(HashMap::new()),
                outbound: Mutex::new(None),
                next_request: AtomicU64::new(0),
            }),
            driver: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &Url {
        &self.shared.url
    }

    /// Number of requests still waiting for an ack
    pub fn pending_acks(&self) -> usize {
        self.shared.pending.lock().len()
    }
}

#[async_trait]
impl SignalingChannel for WsSignalingChannel {
    async fn connect(&self) -> Result<PeerId> {
        if let Some(peer_id) = self.shared.state.borrow().peer_id() {
            return Ok(peer_id.clone());
        }

        let state = self.shared.state.subscribe();
        {
            let mut driver = self.driver.lock();
            let running = driver.as_ref().is_some_and(|d| !d.handle.is_finished());
            if !running {
                let token = CancellationToken::new();
                let handle = tokio::spawn(Arc::clone(&self.shared).drive(token.clone()));
                *driver = Some(Driver { token, handle });
            }
        }

        wait_connected(state).await
    }

    async fn emit_with_ack(&self, event: &str, payload: Value, timeout: Duration) -> Result<Value> {
        let outbound = self.shared.outbound.lock().clone();
        let Some(outbound) = outbound.filter(|_| self.is_connected()) else {
            return Err(SfuError::Disconnected(format!("{} sent while disconnected", event)));
        };

        let id = self.shared.next_request.fetch_add(1, Ordering::SeqCst) + 1;
        let frame = Frame::Request {
            id,
            event: event.to_string(),
            payload,
        };
        let text = serde_json::to_string(&frame).map_err(|e| SfuError::protocol(event, e))?;

        let (ack_tx, ack_rx) = oneshot::channel();
        self.shared.pending.lock().insert(id, ack_tx);
        if outbound.send(Message::Text(text)).is_err() {
            self.shared.pending.lock().remove(&id);
            return Err(SfuError::Disconnected(format!("{} not sent: socket closed", event)));
        }

        match tokio::time::timeout(timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SfuError::Disconnected(format!("ack for {} abandoned", event))),
            Err(_) => {
                self.shared.pending.lock().remove(&id);
                Err(SfuError::Timeout {
                    event: event.to_string(),
                    after: timeout,
                })
            }
        }
    }

    fn on(&self, event: &str) -> Subscription {
        self.shared.bus.subscribe(event)
    }

    fn off(&self, subscription: SubscriptionId) {
        self.shared.bus.unsubscribe(subscription);
    }

    fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.shared.state.subscribe()
    }

    async fn disconnect(&self) {
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            driver.token.cancel();
            let _ = driver.handle.await;
        }
        self.shared.fail_pending("signaling disconnected");
        self.shared.state.send_replace(ChannelState::Disconnected);
    }
}

impl Drop for WsSignalingChannel {
    fn drop(&mut self) {
        if let Some(driver) = self.driver.lock().take() {
            driver.token.cancel();
        }
    }
}
