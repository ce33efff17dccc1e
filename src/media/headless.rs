// Headless media engine
//
// A media engine that performs the full negotiation dance (capability
// loading, transport connect, produce and consume round trips) without
// carrying any media. Used by the demo binary and in tests.

use std::sync::{
    atomic::{AtomicBool, AtomicUsize, Ordering},
    Arc,
};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Map};
use tokio::sync::OnceCell;
use tracing::debug;

use super::{
    ConnectionState, ConsumerHandle, LocalMediaSource, MediaConstraints, MediaEngine, MediaKind,
    MediaStream, MediaTrack, ProduceOptions, ProducerHandle, RecvTransport, SendTransport,
    Transport, TransportSignaler,
};
use crate::{
    capabilities::{CodecCapability, RtpCapabilities},
    signaling::protocol::{
        AppData, ConsumerParams, DtlsFingerprint, DtlsParameters, ProduceParams, RtpParameters,
        TransportParams,
    },
    transport::Direction,
    ConsumerId, ProducerId, Result, SfuError, TransportId,
};

/// Codecs the headless engine claims to handle
pub fn default_codecs() -> Vec<CodecCapability> {
    let codec = |kind, mime_type: &str, clock_rate, channels| CodecCapability {
        kind,
        mime_type: mime_type.to_string(),
        clock_rate,
        channels,
        preferred_payload_type: None,
        parameters: Map::new(),
    };

    vec![
        codec(MediaKind::Audio, "audio/opus", 48_000, Some(2)),
        codec(MediaKind::Video, "video/VP8", 90_000, None),
        codec(MediaKind::Video, "video/VP9", 90_000, None),
        codec(MediaKind::Video, "video/H264", 90_000, None),
    ]
}

/// Media engine without media
pub struct HeadlessEngine {
    codecs: Vec<CodecCapability>,
    loaded: Mutex<Option<RtpCapabilities>>,
    send_transport: Mutex<Option<Arc<HeadlessTransport>>>,
    recv_transport: Mutex<Option<Arc<HeadlessTransport>>>,
    transports_created: AtomicUsize,
}

impl HeadlessEngine {
    /// Create an engine supporting the default codecs
    pub fn new() -> Self {
        Self::with_codecs(default_codecs())
    }

    /// Create an engine supporting only `codecs`
    pub fn with_codecs(codecs: Vec<CodecCapability>) -> Self {
        Self {
            codecs,
            loaded: Mutex::new(None),
            send_transport: Mutex::new(None),
            recv_transport: Mutex::new(None),
            transports_created: AtomicUsize::new(0),
        }
    }

    /// Capabilities produced by the last successful load
    pub fn loaded_capabilities(&self) -> Option<RtpCapabilities> {
        self.loaded.lock().clone()
    }

    /// Most recently built send transport
    pub fn send_transport(&self) -> Option<Arc<HeadlessTransport>> {
        self.send_transport.lock().clone()
    }

    /// Most recently built receive transport
    pub fn recv_transport(&self) -> Option<Arc<HeadlessTransport>> {
        self.recv_transport.lock().clone()
    }

    /// Number of transports built so far
    pub fn transports_created(&self) -> usize {
        self.transports_created.load(Ordering::SeqCst)
    }

    fn build_transport(
        &self,
        direction: Direction,
        params: TransportParams,
        signaler: Arc<dyn TransportSignaler>,
    ) -> Result<Arc<HeadlessTransport>> {
        let capabilities = self
            .loaded_capabilities()
            .ok_or_else(|| SfuError::Engine("device not loaded".to_string()))?;

        let transport = Arc::new(HeadlessTransport {
            id: params.id,
            direction,
            capabilities,
            signaler,
            connected: OnceCell::new(),
            closed: AtomicBool::new(false),
            next_mid: AtomicUsize::new(0),
        });

        self.transports_created.fetch_add(1, Ordering::SeqCst);
        let slot = match direction {
            Direction::Send => &self.send_transport,
            Direction::Recv => &self.recv_transport,
        };
        *slot.lock() = Some(Arc::clone(&transport));
        debug!(%direction, transport_id = %transport.id, "Headless transport built");

        Ok(transport)
    }
}

impl Default for HeadlessEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaEngine for HeadlessEngine {
    async fn load(&self, router_capabilities: &RtpCapabilities) -> Result<RtpCapabilities> {
        let local = RtpCapabilities {
            codecs: self.codecs.clone(),
            header_extensions: Vec::new(),
        };
        let common = local.intersect(router_capabilities);
        if common.codecs.is_empty() {
            return Err(SfuError::Engine(
                "no codec in common with the router".to_string(),
            ));
        }

        *self.loaded.lock() = Some(common.clone());
        Ok(common)
    }

    async fn create_send_transport(
        &self,
        params: TransportParams,
        signaler: Arc<dyn TransportSignaler>,
    ) -> Result<Arc<dyn SendTransport>> {
        let transport = self.build_transport(Direction::Send, params, signaler)?;
        Ok(transport)
    }

    async fn create_recv_transport(
        &self,
        params: TransportParams,
        signaler: Arc<dyn TransportSignaler>,
    ) -> Result<Arc<dyn RecvTransport>> {
        let transport = self.build_transport(Direction::Recv, params, signaler)?;
        Ok(transport)
    }
}

/// Transport of the headless engine
pub struct HeadlessTransport {
    id: TransportId,
    direction: Direction,
    capabilities: RtpCapabilities,
    signaler: Arc<dyn TransportSignaler>,
    connected: OnceCell<()>,
    closed: AtomicBool,
    next_mid: AtomicUsize,
}

impl HeadlessTransport {
    /// Simulate a connection state change reported by the network stack
    pub fn report_state(&self, state: ConnectionState) {
        self.signaler.connection_state_changed(state);
    }

    /// Whether the DTLS handshake has been signaled
    pub fn is_connected(&self) -> bool {
        self.connected.initialized()
    }

    async fn ensure_connected(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SfuError::Engine(format!("transport {} is closed", self.id)));
        }

        self.connected
            .get_or_try_init(|| async {
                let dtls = DtlsParameters {
                    role: Some("auto".to_string()),
                    fingerprints: vec![DtlsFingerprint {
                        algorithm: "sha-256".to_string(),
                        value: format!("headless:{}", self.id),
                    }],
                };
                self.report_state(ConnectionState::Connecting);
                self.signaler.connect(dtls).await?;
                self.report_state(ConnectionState::Connected);
                Ok::<(), SfuError>(())
            })
            .await?;
        Ok(())
    }

    fn rtp_parameters(&self, kind: MediaKind, extra: serde_json::Value) -> RtpParameters {
        let codecs: Vec<_> = self
            .capabilities
            .codecs
            .iter()
            .filter(|codec| codec.kind == kind)
            .collect();
        let mid = self.next_mid.fetch_add(1, Ordering::SeqCst);
        RtpParameters(json!({
            "mid": mid.to_string(),
            "codecs": codecs,
            "encodings": extra,
        }))
    }
}

impl Transport for HeadlessTransport {
    fn id(&self) -> &TransportId {
        &self.id
    }

    fn direction(&self) -> Direction {
        self.direction
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SendTransport for HeadlessTransport {
    async fn produce(&self, options: ProduceOptions) -> Result<Arc<dyn ProducerHandle>> {
        let kind = options.track.kind();
        if !self.capabilities.supports(kind) {
            return Err(SfuError::Engine(format!("cannot produce {}", kind)));
        }
        self.ensure_connected().await?;

        let encodings = serde_json::to_value(&options.encodings)
            .map_err(|e| SfuError::Engine(e.to_string()))?;
        let params = ProduceParams {
            kind,
            rtp_parameters: self.rtp_parameters(kind, encodings),
            app_data: AppData {
                media_tag: options.tag.clone(),
            },
            encodings: options.encodings,
        };
        let id = self.signaler.produce(params).await?;

        if self.is_closed() {
            return Err(SfuError::Engine(format!("transport {} closed while producing", self.id)));
        }

        Ok(Arc::new(HeadlessProducer {
            id,
            kind,
            track: options.track,
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }))
    }
}

#[async_trait]
impl RecvTransport for HeadlessTransport {
    async fn consume(&self, params: ConsumerParams) -> Result<Arc<dyn ConsumerHandle>> {
        if !self.capabilities.supports(params.kind) {
            return Err(SfuError::Engine(format!("cannot consume {}", params.kind)));
        }
        self.ensure_connected().await?;

        let track = MediaTrack::new(
            format!("remote-{}", params.id),
            params.kind,
            format!("{} from producer {}", params.kind, params.producer_id),
        );

        Ok(Arc::new(HeadlessConsumer {
            id: params.id,
            producer_id: params.producer_id,
            kind: params.kind,
            track,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Producer of the headless engine
pub struct HeadlessProducer {
    id: ProducerId,
    kind: MediaKind,
    track: MediaTrack,
    paused: AtomicBool,
    closed: AtomicBool,
}

impl ProducerHandle for HeadlessProducer {
    fn id(&self) -> &ProducerId {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> &MediaTrack {
        &self.track
    }

    fn pause(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SfuError::Engine(format!("producer {} is closed", self.id)));
        }
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn resume(&self) -> Result<()> {
        if self.is_closed() {
            return Err(SfuError::Engine(format!("producer {} is closed", self.id)));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.track.stop();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Consumer of the headless engine
pub struct HeadlessConsumer {
    id: ConsumerId,
    producer_id: ProducerId,
    kind: MediaKind,
    track: MediaTrack,
    closed: AtomicBool,
}

impl ConsumerHandle for HeadlessConsumer {
    fn id(&self) -> &ConsumerId {
        &self.id
    }

    fn producer_id(&self) -> &ProducerId {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn track(&self) -> &MediaTrack {
        &self.track
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.track.stop();
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Capture source producing placeholder tracks
pub struct SyntheticMediaSource {
    deny: AtomicBool,
    acquisitions: AtomicUsize,
}

impl SyntheticMediaSource {
    /// A source that grants every request
    pub fn new() -> Self {
        Self {
            deny: AtomicBool::new(false),
            acquisitions: AtomicUsize::new(0),
        }
    }

    /// A source that refuses permission
    pub fn denying() -> Self {
        let source = Self::new();
        source.deny.store(true, Ordering::SeqCst);
        source
    }

    /// Number of successful acquisitions
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }
}

impl Default for SyntheticMediaSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalMediaSource for SyntheticMediaSource {
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream> {
        if self.deny.load(Ordering::SeqCst) {
            return Err(SfuError::MediaDenied("permission refused".to_string()));
        }

        let n = self.acquisitions.fetch_add(1, Ordering::SeqCst) + 1;
        let mut tracks = Vec::new();
        if let Some(video) = &constraints.video {
            tracks.push(MediaTrack::new(
                format!("local-video-{}", n),
                MediaKind::Video,
                format!("synthetic camera {}x{}@{}", video.width, video.height, video.frame_rate),
            ));
        }
        if constraints.audio {
            tracks.push(MediaTrack::new(
                format!("local-audio-{}", n),
                MediaKind::Audio,
                "synthetic microphone",
            ));
        }

        Ok(MediaStream::new(format!("local-{}", n), tracks))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_load_requires_common_codec() {
        let engine = HeadlessEngine::new();
        let router = RtpCapabilities {
            codecs: vec![CodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/AV1".to_string(),
                clock_rate: 90_000,
                channels: None,
                preferred_payload_type: Some(45),
                parameters: Map::new(),
            }],
            header_extensions: Vec::new(),
        };
        assert!(matches!(engine.load(&router).await, Err(SfuError::Engine(_))));
        assert!(engine.loaded_capabilities().is_none());
    }

    #[tokio::test]
    async fn test_synthetic_source_honours_constraints() {
        let source = SyntheticMediaSource::new();
        let stream = source
            .acquire(&MediaConstraints {
                audio: true,
                video: None,
            })
            .await
            .unwrap();
        assert_eq!(stream.tracks().len(), 1);
        assert!(stream.track(MediaKind::Audio).is_some());

        let denied = SyntheticMediaSource::denying();
        assert!(matches!(
            denied.acquire(&MediaConstraints::default()).await,
            Err(SfuError::MediaDenied(_))
        ));
    }

    #[test]
    fn test_closed_producer_rejects_pause() {
        let producer = HeadlessProducer {
            id: "p1".to_string(),
            kind: MediaKind::Audio,
            track: MediaTrack::new("t1", MediaKind::Audio, "mic"),
            paused: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        };
        producer.pause().unwrap();
        assert!(producer.is_paused());
        producer.close();
        assert!(producer.resume().is_err());
        assert!(producer.track().is_ended());
    }
}
