// Fixtures shared by unit tests

use std::{sync::Arc, time::Duration};

use serde_json::Map;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::{
    capabilities::{CapabilityNegotiator, CodecCapability, RtpCapabilities},
    consumer::ConsumerRegistry,
    events::EventRecorder,
    media::{headless::HeadlessEngine, MediaEngine, MediaKind},
    producer::{ProducerRegistry, PublishPolicy},
    signaling::{
        memory::{LoopbackRouter, MemorySignalingChannel},
        protocol::{DeviceInfo, LocalIdentity, NewProducer, ProducerMeta},
        RouterClient, DEFAULT_ACK_TIMEOUT,
    },
    transport::{TransportFault, TransportManager},
};

pub fn opus() -> CodecCapability {
    CodecCapability {
        kind: MediaKind::Audio,
        mime_type: "audio/opus".to_string(),
        clock_rate: 48_000,
        channels: Some(2),
        preferred_payload_type: Some(100),
        parameters: Map::new(),
    }
}

pub fn vp8() -> CodecCapability {
    CodecCapability {
        kind: MediaKind::Video,
        mime_type: "video/VP8".to_string(),
        clock_rate: 90_000,
        channels: None,
        preferred_payload_type: Some(101),
        parameters: Map::new(),
    }
}

pub fn remote_producer(peer_id: &str, producer_id: &str, kind: MediaKind) -> NewProducer {
    NewProducer {
        peer_id: peer_id.to_string(),
        producer_id: producer_id.to_string(),
        kind,
        meta: ProducerMeta::default(),
    }
}

/// A connected in-process channel, its router and a headless engine
pub struct Fixture {
    pub channel: Arc<MemorySignalingChannel>,
    pub router: Arc<LoopbackRouter>,
    pub engine: Arc<HeadlessEngine>,
    pub client: RouterClient,
}

impl Fixture {
    pub const LOCAL_PEER: &'static str = "peer-local";

    pub fn new(room: &str) -> Self {
        Self::with_timeout(room, DEFAULT_ACK_TIMEOUT)
    }

    pub fn with_timeout(room: &str, ack_timeout: Duration) -> Self {
        let router = Arc::new(LoopbackRouter::new());
        let channel = Arc::new(MemorySignalingChannel::connected(Self::LOCAL_PEER, router.clone()));
        let client = RouterClient::new(channel.clone(), room, ack_timeout);
        Self {
            channel,
            router,
            engine: Arc::new(HeadlessEngine::new()),
            client,
        }
    }

    /// A fixture whose engine already loaded the router capabilities
    pub async fn loaded(room: &str) -> Self {
        Self::loaded_with_timeout(room, DEFAULT_ACK_TIMEOUT).await
    }

    pub async fn loaded_with_timeout(room: &str, ack_timeout: Duration) -> Self {
        let fixture = Self::with_timeout(room, ack_timeout);
        fixture
            .engine
            .load(&Self::router_capabilities())
            .await
            .expect("headless engine loads opus and VP8");
        fixture
    }

    pub fn router_capabilities() -> RtpCapabilities {
        RtpCapabilities {
            codecs: vec![opus(), vp8()],
            header_extensions: Vec::new(),
        }
    }

    pub fn identity(&self) -> LocalIdentity {
        LocalIdentity {
            user_id: "user-1".to_string(),
            user_name: Some("Ada".to_string()),
            user_email: None,
            device: DeviceInfo {
                os: "linux".to_string(),
                browser: "headless".to_string(),
                version: None,
                is_mobile: false,
            },
        }
    }

    pub fn negotiator(&self) -> CapabilityNegotiator {
        CapabilityNegotiator::new(self.client.clone(), self.engine.clone())
    }

    pub fn transports(&self) -> (TransportManager, mpsc::UnboundedReceiver<TransportFault>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (TransportManager::new(self.client.clone(), self.engine.clone(), tx), rx)
    }

    pub fn producers(&self) -> ProducerRegistry {
        let (transports, _faults) = self.transports();
        ProducerRegistry::new(
            self.client.clone(),
            Arc::new(transports),
            PublishPolicy::default(),
            CancellationToken::new(),
        )
    }

    /// A consumer registry that filters the local peer and has capabilities
    pub fn consumers(&self) -> (ConsumerRegistry, Arc<EventRecorder>) {
        let (transports, _faults) = self.transports();
        let recorder = Arc::new(EventRecorder::new());
        let consumers = ConsumerRegistry::new(
            self.client.clone(),
            Arc::new(transports),
            recorder.clone(),
            CancellationToken::new(),
        );
        consumers.set_local_peer_id(Some(Self::LOCAL_PEER.to_string()));
        consumers.set_capabilities(self.engine.loaded_capabilities());
        (consumers, recorder)
    }
}
