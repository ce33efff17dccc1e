// In-process signaling channel
//
// Requests are handed to a router handler living in the same process, and
// broadcasts are injected directly. The loopback router answers every room
// request with deterministic identifiers and can be told to reject, fail,
// drop or delay individual events.

use std::{
    collections::{HashMap, HashSet},
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::watch;
use tracing::debug;

use super::{
    events,
    protocol::{NewProducer, PeerSummary},
    ChannelState, EventBus, SignalingChannel, Subscription, SubscriptionId,
};
use crate::{
    capabilities::{CodecCapability, RtpCapabilities},
    media::MediaKind,
    PeerId, ProducerId, Result, SfuError,
};

/// Server side of an in-process channel
#[async_trait]
pub trait RouterHandler: Send + Sync {
    /// Handle one request. `None` means the request is never acknowledged.
    async fn handle(&self, peer_id: &str, event: &str, payload: Value) -> Option<Value>;
}

/// Signaling channel connected to an in-process router
pub struct MemorySignalingChannel {
    handler: Arc<dyn RouterHandler>,
    peer_id: Mutex<PeerId>,
    state: watch::Sender<ChannelState>,
    bus: EventBus,
    connects: AtomicUsize,
}

impl MemorySignalingChannel {
    /// Create a disconnected channel that will be assigned `peer_id`
    pub fn new(peer_id: impl Into<PeerId>, handler: Arc<dyn RouterHandler>) -> Self {
        let (state, _) = watch::channel(ChannelState::Disconnected);
        Self {
            handler,
            peer_id: Mutex::new(peer_id.into()),
            state,
            bus: EventBus::default(),
            connects: AtomicUsize::new(0),
        }
    }

    /// Create a channel that is already connected
    pub fn connected(peer_id: impl Into<PeerId>, handler: Arc<dyn RouterHandler>) -> Self {
        let channel = Self::new(peer_id, handler);
        let peer_id = channel.peer_id.lock().clone();
        channel.state.send_replace(ChannelState::Connected { peer_id });
        channel
    }

    /// Inject a broadcast; returns how many subscribers received it
    pub fn broadcast(&self, event: &str, payload: Value) -> usize {
        self.bus.dispatch(event, &payload)
    }

    /// Simulate a lost connection
    pub fn drop_connection(&self) {
        debug!("Memory channel dropped");
        self.state.send_replace(ChannelState::Disconnected);
    }

    /// Simulate a reconnection that assigns a new peer identifier
    pub fn reconnect_as(&self, peer_id: impl Into<PeerId>) {
        let peer_id = peer_id.into();
        *self.peer_id.lock() = peer_id.clone();
        self.state.send_replace(ChannelState::Connected { peer_id });
    }

    /// Simulate reconnection attempts running out
    pub fn fail(&self) {
        self.state.send_replace(ChannelState::Failed);
    }

    /// Live subscribers of `event`
    pub fn subscriber_count(&self, event: &str) -> usize {
        self.bus.subscriber_count(event)
    }

    /// Number of `connect` calls that opened a connection
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SignalingChannel for MemorySignalingChannel {
    async fn connect(&self) -> Result<PeerId> {
        if let Some(peer_id) = self.state.borrow().peer_id() {
            return Ok(peer_id.clone());
        }

        let peer_id = self.peer_id.lock().clone();
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.state.send_replace(ChannelState::Connected {
            peer_id: peer_id.clone(),
        });
        Ok(peer_id)
    }

    async fn emit_with_ack(&self, event: &str, payload: Value, timeout: Duration) -> Result<Value> {
        let mut state = self.state.subscribe();
        let peer_id = state.borrow().peer_id().cloned();
        let Some(peer_id) = peer_id else {
            return Err(SfuError::Disconnected(format!("{} sent while disconnected", event)));
        };

        let reply = async {
            match self.handler.handle(&peer_id, event, payload).await {
                Some(reply) => reply,
                None => std::future::pending().await,
            }
        };
        let lost = async {
            let _ = state
                .wait_for(|s| !matches!(s, ChannelState::Connected { .. }))
                .await;
        };

        tokio::select! {
            reply = tokio::time::timeout(timeout, reply) => reply.map_err(|_| SfuError::Timeout {
                event: event.to_string(),
                after: timeout,
            }),
            _ = lost => Err(SfuError::Disconnected(format!("connection lost awaiting {}", event))),
        }
    }

    fn on(&self, event: &str) -> Subscription {
        self.bus.subscribe(event)
    }

    fn off(&self, subscription: SubscriptionId) {
        self.bus.unsubscribe(subscription);
    }

    fn watch_state(&self) -> watch::Receiver<ChannelState> {
        self.state.subscribe()
    }

    async fn disconnect(&self) {
        self.state.send_replace(ChannelState::Disconnected);
    }
}

#[derive(Default)]
struct LoopbackState {
    capabilities: RtpCapabilities,
    peers: Vec<PeerSummary>,
    producers: Vec<NewProducer>,
    known_producers: HashMap<ProducerId, MediaKind>,
    join_rejection: Option<Value>,
    failures: HashMap<String, String>,
    consume_failures: HashMap<ProducerId, String>,
    dropped: HashSet<String>,
    delays: HashMap<String, Duration>,
    requests: Vec<(String, Value)>,
}

/// Router that answers room requests in process
pub struct LoopbackRouter {
    state: Mutex<LoopbackState>,
    next_id: AtomicU64,
}

impl LoopbackRouter {
    /// A router advertising opus and VP8
    pub fn new() -> Self {
        let codec = |kind, mime_type: &str, clock_rate, channels, payload_type| CodecCapability {
            kind,
            mime_type: mime_type.to_string(),
            clock_rate,
            channels,
            preferred_payload_type: Some(payload_type),
            parameters: Default::default(),
        };
        Self::with_capabilities(RtpCapabilities {
            codecs: vec![
                codec(MediaKind::Audio, "audio/opus", 48_000, Some(2), 100),
                codec(MediaKind::Video, "video/VP8", 90_000, None, 101),
            ],
            header_extensions: Vec::new(),
        })
    }

    /// A router advertising `capabilities`
    pub fn with_capabilities(capabilities: RtpCapabilities) -> Self {
        Self {
            state: Mutex::new(LoopbackState {
                capabilities,
                ..Default::default()
            }),
            next_id: AtomicU64::new(0),
        }
    }

    /// List a peer in join replies
    pub fn add_peer(&self, peer: PeerSummary) {
        self.state.lock().peers.push(peer);
    }

    /// List a producer in join replies and make it consumable
    pub fn add_producer(&self, producer: NewProducer) {
        let mut state = self.state.lock();
        state
            .known_producers
            .insert(producer.producer_id.clone(), producer.kind);
        state.producers.push(producer);
    }

    /// Make a producer consumable without listing it on join
    pub fn register_producer(&self, producer_id: impl Into<ProducerId>, kind: MediaKind) {
        self.state.lock().known_producers.insert(producer_id.into(), kind);
    }

    /// Answer joins with `reply` until failures are cleared
    pub fn reject_join(&self, reply: Value) {
        self.state.lock().join_rejection = Some(reply);
    }

    /// Answer `event` with an error payload
    pub fn fail_event(&self, event: &str, message: &str) {
        self.state
            .lock()
            .failures
            .insert(event.to_string(), message.to_string());
    }

    /// Answer consume requests for one producer with an error payload
    pub fn fail_consume_for(&self, producer_id: &str, message: &str) {
        self.state
            .lock()
            .consume_failures
            .insert(producer_id.to_string(), message.to_string());
    }

    /// Never acknowledge `event`
    pub fn drop_acks(&self, event: &str) {
        self.state.lock().dropped.insert(event.to_string());
    }

    /// Wait `delay` before answering `event`
    pub fn delay(&self, event: &str, delay: Duration) {
        self.state.lock().delays.insert(event.to_string(), delay);
    }

    /// Forget every configured rejection, failure and dropped ack
    pub fn clear_failures(&self) {
        let mut state = self.state.lock();
        state.join_rejection = None;
        state.failures.clear();
        state.consume_failures.clear();
        state.dropped.clear();
    }

    /// Number of `event` requests received
    pub fn request_count(&self, event: &str) -> usize {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(name, _)| name == event)
            .count()
    }

    /// Payloads of every `event` request received
    pub fn requests(&self, event: &str) -> Vec<Value> {
        self.state
            .lock()
            .requests
            .iter()
            .filter(|(name, _)| name == event)
            .map(|(_, payload)| payload.clone())
            .collect()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn answer(&self, peer_id: &str, event: &str, payload: &Value) -> Value {
        let mut state = self.state.lock();
        match event {
            events::JOIN_ROOM => {
                if let Some(rejection) = &state.join_rejection {
                    return rejection.clone();
                }
                let peers: Vec<_> = state.peers.iter().filter(|p| p.peer_id != peer_id).collect();
                let producers: Vec<_> = state
                    .producers
                    .iter()
                    .filter(|p| p.peer_id != peer_id)
                    .collect();
                json!({
                    "success": true,
                    "peers": peers,
                    "routerRtpCapabilities": state.capabilities,
                    "producers": producers,
                })
            }
            events::CREATE_TRANSPORT => {
                let direction = payload["direction"].as_str().unwrap_or("send").to_string();
                let n = self.next_id();
                json!({
                    "params": {
                        "id": format!("{}-transport-{}", direction, n),
                        "iceParameters": {"usernameFragment": format!("ufrag{}", n), "password": "loopback"},
                        "iceCandidates": [],
                        "dtlsParameters": {"role": "auto", "fingerprints": []},
                    }
                })
            }
            events::PRODUCE => {
                let kind = match payload["kind"].as_str() {
                    Some("audio") => MediaKind::Audio,
                    _ => MediaKind::Video,
                };
                let producer_id = format!("producer-{}", self.next_id());
                state.known_producers.insert(producer_id.clone(), kind);
                json!({ "producerId": producer_id })
            }
            events::CLOSE_PRODUCER => {
                if let Some(producer_id) = payload["producerId"].as_str() {
                    state.known_producers.remove(producer_id);
                }
                json!({})
            }
            events::CONSUME => {
                let producer_id = payload["producerId"].as_str().unwrap_or_default();
                if let Some(message) = state.consume_failures.get(producer_id) {
                    return json!({ "error": message });
                }
                match state.known_producers.get(producer_id) {
                    Some(kind) => json!({
                        "params": {
                            "id": format!("consumer-{}", self.next_id()),
                            "producerId": producer_id,
                            "kind": kind,
                            "rtpParameters": {},
                        }
                    }),
                    None => json!({ "error": format!("producer {} not found", producer_id) }),
                }
            }
            events::SET_RTP_CAPABILITIES
            | events::CONNECT_TRANSPORT
            | events::RESUME_CONSUMER
            | events::LEAVE_ROOM => json!({ "success": true }),
            other => json!({ "error": format!("unknown event {}", other) }),
        }
    }
}

impl Default for LoopbackRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RouterHandler for LoopbackRouter {
    async fn handle(&self, peer_id: &str, event: &str, payload: Value) -> Option<Value> {
        let (delay, dropped, failure) = {
            let mut state = self.state.lock();
            state.requests.push((event.to_string(), payload.clone()));
            (
                state.delays.get(event).copied(),
                state.dropped.contains(event),
                state.failures.get(event).cloned(),
            )
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if dropped {
            debug!(event, "Loopback router dropping ack");
            return None;
        }
        if let Some(message) = failure {
            return Some(json!({ "error": message }));
        }

        Some(self.answer(peer_id, event, &payload))
    }
}

#[cfg(test)]
mod tests {
    use testresult::TestResult;

    use super::*;

    fn channel() -> (Arc<LoopbackRouter>, MemorySignalingChannel) {
        let router = Arc::new(LoopbackRouter::new());
        let channel = MemorySignalingChannel::new("peer-a", router.clone());
        (router, channel)
    }

    #[tokio::test]
    async fn test_emit_requires_connection() -> TestResult {
        let (_router, channel) = channel();
        let err = channel
            .emit_with_ack(events::LEAVE_ROOM, json!({}), Duration::from_secs(1))
            .await
            .err()
            .ok_or("expected failure")?;
        assert!(matches!(err, SfuError::Disconnected(_)));

        assert_eq!(channel.connect().await?, "peer-a");
        assert_eq!(channel.connect().await?, "peer-a");
        assert_eq!(channel.connect_count(), 1);
        channel
            .emit_with_ack(events::LEAVE_ROOM, json!({}), Duration::from_secs(1))
            .await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_dropped_ack_times_out() -> TestResult {
        let (router, channel) = channel();
        channel.connect().await?;
        router.drop_acks(events::CONSUME);

        let err = channel
            .emit_with_ack(events::CONSUME, json!({}), Duration::from_millis(20))
            .await
            .err()
            .ok_or("expected timeout")?;
        assert!(matches!(err, SfuError::Timeout { ref event, .. } if event == events::CONSUME));
        Ok(())
    }

    #[tokio::test]
    async fn test_pending_ack_fails_on_disconnect() -> TestResult {
        let router = Arc::new(LoopbackRouter::new());
        router.drop_acks(events::PRODUCE);
        let channel = Arc::new(MemorySignalingChannel::connected("peer-a", router));

        let pending = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move {
                channel
                    .emit_with_ack(events::PRODUCE, json!({}), Duration::from_secs(5))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        channel.drop_connection();

        assert!(matches!(pending.await?, Err(SfuError::Disconnected(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_consume_unknown_producer_is_rejected() -> TestResult {
        let (router, channel) = channel();
        channel.connect().await?;
        router.register_producer("prod-1", MediaKind::Audio);

        let reply = channel
            .emit_with_ack(events::CONSUME, json!({"producerId": "prod-1"}), Duration::from_secs(1))
            .await?;
        assert_eq!(reply["params"]["kind"], "audio");

        let reply = channel
            .emit_with_ack(events::CONSUME, json!({"producerId": "prod-2"}), Duration::from_secs(1))
            .await?;
        assert!(reply["error"].is_string());
        assert_eq!(router.request_count(events::CONSUME), 2);
        Ok(())
    }

    #[tokio::test]
    async fn test_broadcast_reaches_subscribers() {
        let (_router, channel) = channel();
        let mut sub = channel.on(events::PEER_LEFT);
        assert_eq!(channel.broadcast(events::PEER_LEFT, json!({"peerId": "peer-b"})), 1);
        assert_eq!(sub.recv().await, Some(json!({"peerId": "peer-b"})));

        channel.off(sub.id);
        assert_eq!(channel.subscriber_count(events::PEER_LEFT), 0);
    }
}
