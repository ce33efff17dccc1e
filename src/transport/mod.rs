// Transport module for the session core
//
// This module owns the send and receive transports of a session. Each is
// created lazily on first need, at most once, and wired to the router through
// a per-transport signaler.

use std::{
    fmt,
    sync::{Arc, Weak},
};

use async_trait::async_trait;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::{
    media::{
        ConnectionState, MediaEngine, RecvTransport, SendTransport, Transport, TransportSignaler,
    },
    signaling::{
        protocol::{DtlsParameters, ProduceParams},
        RouterClient,
    },
    ProducerId, Result, SfuError, TransportId,
};

/// Transport direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Outbound media
    Send,
    /// Inbound media
    Recv,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Send => f.write_str("send"),
            Direction::Recv => f.write_str("recv"),
        }
    }
}

/// Lifecycle of one direction's transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Absent,
    Creating,
    Ready,
    Failed,
    Closed,
}

/// A ready transport that failed or closed underneath the session
#[derive(Debug, Clone)]
pub struct TransportFault {
    pub direction: Direction,
    pub transport_id: TransportId,
    pub state: ConnectionState,
    pub reason: String,
}

impl TransportFault {
    pub fn into_error(self) -> SfuError {
        SfuError::Transport {
            direction: self.direction,
            reason: self.reason,
        }
    }
}

type Creation<T> = Shared<BoxFuture<'static, Result<Arc<T>>>>;

enum Slot<T: ?Sized> {
    Absent,
    Creating(Creation<T>),
    Ready(Arc<T>),
    Failed(String),
    Closed,
}

impl<T: ?Sized> Slot<T> {
    fn state(&self) -> TransportState {
        match self {
            Slot::Absent => TransportState::Absent,
            Slot::Creating(_) => TransportState::Creating,
            Slot::Ready(_) => TransportState::Ready,
            Slot::Failed(_) => TransportState::Failed,
            Slot::Closed => TransportState::Closed,
        }
    }

    fn ready(&self) -> Option<Arc<T>> {
        match self {
            Slot::Ready(transport) => Some(Arc::clone(transport)),
            _ => None,
        }
    }
}

struct Inner {
    router: RouterClient,
    engine: Arc<dyn MediaEngine>,
    send: Mutex<Slot<dyn SendTransport>>,
    recv: Mutex<Slot<dyn RecvTransport>>,
    faults: mpsc::UnboundedSender<TransportFault>,
}

impl Inner {
    fn mark_failed(&self, direction: Direction, transport_id: &str, state: ConnectionState, reason: String) {
        let failed = match direction {
            Direction::Send => fail_slot(&self.send, transport_id, &reason).map(|t| t.close()),
            Direction::Recv => fail_slot(&self.recv, transport_id, &reason).map(|t| t.close()),
        };

        if failed.is_none() {
            debug!(%direction, transport_id, ?state, "Ignoring state change of inactive transport");
            return;
        }

        error!(room = %self.router.room(), %direction, transport_id, ?state, "Transport failed");
        let _ = self.faults.send(TransportFault {
            direction,
            transport_id: transport_id.to_string(),
            state,
            reason,
        });
    }
}

/// Move a ready transport with `transport_id` to failed, returning it
fn fail_slot<T: Transport + ?Sized>(slot: &Mutex<Slot<T>>, transport_id: &str, reason: &str) -> Option<Arc<T>> {
    let mut guard = slot.lock();
    match &*guard {
        Slot::Ready(transport) if transport.id() == transport_id => {
            let transport = Arc::clone(transport);
            *guard = Slot::Failed(reason.to_string());
            Some(transport)
        }
        _ => None,
    }
}

/// Single-flight creation of one direction's transport
async fn ensure<T, F>(slot: &Mutex<Slot<T>>, direction: Direction, create: F) -> Result<Arc<T>>
where
    T: Transport + ?Sized + 'static,
    F: FnOnce() -> BoxFuture<'static, Result<Arc<T>>>,
{
    let creation = {
        let mut guard = slot.lock();
        match &*guard {
            Slot::Ready(transport) => return Ok(Arc::clone(transport)),
            Slot::Creating(creation) => creation.clone(),
            Slot::Failed(reason) => {
                return Err(SfuError::Transport {
                    direction,
                    reason: reason.clone(),
                })
            }
            Slot::Closed => return Err(SfuError::SessionClosed),
            Slot::Absent => {
                debug!(%direction, "Creating transport");
                let creation = create().shared();
                *guard = Slot::Creating(creation.clone());
                creation
            }
        }
    };

    let result = creation.clone().await;

    let (outcome, discard) = {
        let mut guard = slot.lock();
        let ours = matches!(&*guard, Slot::Creating(current) if current.ptr_eq(&creation));
        match result {
            Ok(transport) => match &*guard {
                Slot::Creating(_) if ours => {
                    info!(%direction, transport_id = %transport.id(), "Transport ready");
                    *guard = Slot::Ready(Arc::clone(&transport));
                    (Ok(transport), None)
                }
                Slot::Ready(existing) => (Ok(Arc::clone(existing)), None),
                Slot::Creating(_) => (Ok(transport), None),
                Slot::Failed(reason) => (
                    Err(SfuError::Transport {
                        direction,
                        reason: reason.clone(),
                    }),
                    None,
                ),
                Slot::Absent | Slot::Closed => (Err(SfuError::SessionClosed), Some(transport)),
            },
            Err(e) => {
                if ours {
                    *guard = Slot::Absent;
                }
                (Err(e), None)
            }
        }
    };

    if let Some(transport) = discard {
        debug!(%direction, transport_id = %transport.id(), "Discarding transport created after close");
        transport.close();
    }

    outcome
}

/// Signaler wired to one engine transport
struct RouterSignaler {
    inner: Weak<Inner>,
    router: RouterClient,
    direction: Direction,
    transport_id: TransportId,
}

#[async_trait]
impl TransportSignaler for RouterSignaler {
    async fn connect(&self, dtls: DtlsParameters) -> Result<()> {
        self.router
            .connect_transport(&self.transport_id, &dtls)
            .await
            .map_err(|e| {
                warn!(direction = %self.direction, transport_id = %self.transport_id, error = %e, "Transport connect failed");
                let reason = format!("transport {} connect failed: {}", self.transport_id, e);
                // a transport the router refused to connect is dead for the session
                if let Some(inner) = self.inner.upgrade() {
                    inner.mark_failed(self.direction, &self.transport_id, ConnectionState::Failed, reason.clone());
                }
                SfuError::Transport {
                    direction: self.direction,
                    reason,
                }
            })
    }

    async fn produce(&self, params: ProduceParams) -> Result<ProducerId> {
        if self.direction != Direction::Send {
            return Err(SfuError::InvalidState(format!(
                "produce requested on {} transport {}",
                self.direction, self.transport_id
            )));
        }
        self.router.produce(&self.transport_id, &params).await
    }

    fn connection_state_changed(&self, state: ConnectionState) {
        debug!(direction = %self.direction, transport_id = %self.transport_id, ?state, "Transport state changed");
        if !matches!(state, ConnectionState::Failed | ConnectionState::Closed) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            let reason = format!("transport {} entered {:?} state", self.transport_id, state);
            inner.mark_failed(self.direction, &self.transport_id, state, reason);
        }
    }
}

/// Owner of a session's send and receive transports
pub struct TransportManager {
    inner: Arc<Inner>,
}

impl TransportManager {
    /// Create a new transport manager; faults of ready transports are
    /// reported on `faults`
    pub fn new(
        router: RouterClient,
        engine: Arc<dyn MediaEngine>,
        faults: mpsc::UnboundedSender<TransportFault>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                router,
                engine,
                send: Mutex::new(Slot::Absent),
                recv: Mutex::new(Slot::Absent),
                faults,
            }),
        }
    }

    /// Return the send transport, creating it on first use
    pub async fn ensure_send(&self) -> Result<Arc<dyn SendTransport>> {
        let inner = Arc::clone(&self.inner);
        ensure(&self.inner.send, Direction::Send, move || {
            async move {
                let params = inner.router.create_transport(Direction::Send).await?;
                let signaler = Self::signaler(&inner, Direction::Send, params.id.clone());
                inner.engine.create_send_transport(params, signaler).await
            }
            .boxed()
        })
        .await
    }

    /// Return the receive transport, creating it on first use
    pub async fn ensure_recv(&self) -> Result<Arc<dyn RecvTransport>> {
        let inner = Arc::clone(&self.inner);
        ensure(&self.inner.recv, Direction::Recv, move || {
            async move {
                let params = inner.router.create_transport(Direction::Recv).await?;
                let signaler = Self::signaler(&inner, Direction::Recv, params.id.clone());
                inner.engine.create_recv_transport(params, signaler).await
            }
            .boxed()
        })
        .await
    }

    fn signaler(inner: &Arc<Inner>, direction: Direction, transport_id: TransportId) -> Arc<dyn TransportSignaler> {
        Arc::new(RouterSignaler {
            inner: Arc::downgrade(inner),
            router: inner.router.clone(),
            direction,
            transport_id,
        })
    }

    /// Current state of one direction
    pub fn state(&self, direction: Direction) -> TransportState {
        match direction {
            Direction::Send => self.inner.send.lock().state(),
            Direction::Recv => self.inner.recv.lock().state(),
        }
    }

    /// The send transport, if ready
    pub fn send_transport(&self) -> Option<Arc<dyn SendTransport>> {
        self.inner.send.lock().ready()
    }

    /// The receive transport, if ready
    pub fn recv_transport(&self) -> Option<Arc<dyn RecvTransport>> {
        self.inner.recv.lock().ready()
    }

    /// Close both transports; later `ensure_*` calls fail with `SessionClosed`
    pub fn close_all(&self) {
        let send = std::mem::replace(&mut *self.inner.send.lock(), Slot::Closed);
        let recv = std::mem::replace(&mut *self.inner.recv.lock(), Slot::Closed);

        if let Some(transport) = send.ready() {
            info!(transport_id = %transport.id(), "Closing send transport");
            transport.close();
        }
        if let Some(transport) = recv.ready() {
            info!(transport_id = %transport.id(), "Closing recv transport");
            transport.close();
        }
    }
}
