// Signaling module for the session core
//
// This module defines the channel contract the core consumes (acknowledged
// requests plus named broadcasts), the typed router client on top of it and
// two channel adapters.

pub mod events;
pub mod memory;
pub mod protocol;
pub mod router;
pub mod ws;

use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, watch};

use crate::{PeerId, Result, SfuError};

pub use router::RouterClient;

/// Default time to wait for an acknowledgement
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(8);

/// Connection state of a signaling channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelState {
    /// Not connected and not trying
    Disconnected,
    /// Connection (or reconnection) in progress
    Connecting,
    /// Connected; the channel assigned this peer identifier
    Connected { peer_id: PeerId },
    /// Reconnection attempts exhausted
    Failed,
}

impl ChannelState {
    pub fn peer_id(&self) -> Option<&PeerId> {
        match self {
            ChannelState::Connected { peer_id } => Some(peer_id),
            _ => None,
        }
    }
}

/// Identifier of one broadcast subscription
pub type SubscriptionId = u64;

/// A subscription to one named broadcast event
///
/// Payloads arrive in transport order. Dropping the receiver or calling
/// [`SignalingChannel::off`] ends the subscription.
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub event: String,
    pub receiver: mpsc::UnboundedReceiver<Value>,
}

impl Subscription {
    /// Wait for the next payload
    pub async fn recv(&mut self) -> Option<Value> {
        self.receiver.recv().await
    }
}

/// Signaling channel contract
#[async_trait]
pub trait SignalingChannel: Send + Sync {
    /// Establish the connection and wait until it is observed as connected.
    /// Returns the peer identifier the channel was assigned.
    async fn connect(&self) -> Result<PeerId>;

    /// Send a request and wait for its acknowledgement
    async fn emit_with_ack(&self, event: &str, payload: Value, timeout: Duration) -> Result<Value>;

    /// Subscribe to a named broadcast event
    fn on(&self, event: &str) -> Subscription;

    /// Cancel a subscription
    fn off(&self, subscription: SubscriptionId);

    /// Watch connection state changes
    fn watch_state(&self) -> watch::Receiver<ChannelState>;

    /// Close the connection
    async fn disconnect(&self);

    /// Peer identifier assigned on the current connection
    fn local_peer_id(&self) -> Option<PeerId> {
        self.watch_state().borrow().peer_id().cloned()
    }

    /// Whether the channel is currently connected
    fn is_connected(&self) -> bool {
        matches!(*self.watch_state().borrow(), ChannelState::Connected { .. })
    }
}

/// Wait on a state watch until the channel is connected.
///
/// Fails with `Disconnected` if the channel gives up instead.
pub(crate) async fn wait_connected(mut state: watch::Receiver<ChannelState>) -> Result<PeerId> {
    let observed = state
        .wait_for(|s| matches!(s, ChannelState::Connected { .. } | ChannelState::Failed))
        .await
        .map_err(|_| SfuError::Disconnected("channel dropped".to_string()))?;
    match &*observed {
        ChannelState::Connected { peer_id } => Ok(peer_id.clone()),
        _ => Err(SfuError::Disconnected("reconnection attempts exhausted".to_string())),
    }
}

/// Interpret an acknowledgement payload.
///
/// An ack carrying a non-null `error` field, or `success: false`, is a
/// rejection by the router.
pub fn check_ack(event: &str, reply: Value) -> Result<Value> {
    let error = reply.get("error").filter(|e| !e.is_null());
    let failed = reply.get("success").and_then(Value::as_bool) == Some(false);

    if error.is_none() && !failed {
        return Ok(reply);
    }

    let message = match error {
        Some(Value::String(message)) => message.clone(),
        Some(Value::Object(obj)) => obj
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| Value::Object(obj.clone()).to_string()),
        Some(other) => other.to_string(),
        None => format!("{} failed", event),
    };

    Err(SfuError::AckError {
        event: event.to_string(),
        message,
        reply,
    })
}

/// Fan-out of broadcast payloads to subscribers, shared by channel adapters
#[derive(Default)]
pub(crate) struct EventBus {
    next_id: AtomicU64,
    subscribers: Mutex<HashMap<String, Vec<(SubscriptionId, mpsc::UnboundedSender<Value>)>>>,
}

impl EventBus {
    pub fn subscribe(&self, event: &str) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .entry(event.to_string())
            .or_default()
            .push((id, tx));
        Subscription {
            id,
            event: event.to_string(),
            receiver: rx,
        }
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        let mut subscribers = self.subscribers.lock();
        for list in subscribers.values_mut() {
            list.retain(|(sub_id, _)| *sub_id != id);
        }
        subscribers.retain(|_, list| !list.is_empty());
    }

    /// Deliver a payload to every live subscriber of `event`.
    /// Returns the number of subscribers reached.
    pub fn dispatch(&self, event: &str, payload: &Value) -> usize {
        let mut subscribers = self.subscribers.lock();
        let Some(list) = subscribers.get_mut(event) else {
            return 0;
        };
        list.retain(|(_, tx)| tx.send(payload.clone()).is_ok());
        let delivered = list.len();
        if list.is_empty() {
            subscribers.remove(event);
        }
        delivered
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.subscribers.lock().get(event).map_or(0, Vec::len)
    }
}
