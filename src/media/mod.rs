// Media module for the session core
//
// This module defines media kinds, track and stream handles, and the seams
// to the local media engine and capture device. The engine builds transports,
// producers and consumers from router-issued parameters; the core only drives
// it.

pub mod headless;

use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::{
    capabilities::RtpCapabilities,
    signaling::protocol::{ConsumerParams, DtlsParameters, ProduceParams, TransportParams},
    simulcast::EncodingLayer,
    transport::Direction,
    ConsumerId, ProducerId, Result, TransportId,
};

/// Media track kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    /// Audio track
    Audio,
    /// Video track
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Application-level label of a published track
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MediaTag {
    /// Camera video
    Cam,
    /// Microphone audio
    Mic,
    /// Any other label
    Other(String),
}

impl MediaTag {
    /// Default tag for a track of `kind`
    pub fn for_kind(kind: MediaKind) -> Self {
        match kind {
            MediaKind::Audio => MediaTag::Mic,
            MediaKind::Video => MediaTag::Cam,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            MediaTag::Cam => "cam",
            MediaTag::Mic => "mic",
            MediaTag::Other(tag) => tag,
        }
    }
}

impl From<String> for MediaTag {
    fn from(tag: String) -> Self {
        match tag.as_str() {
            "cam" => MediaTag::Cam,
            "mic" => MediaTag::Mic,
            _ => MediaTag::Other(tag),
        }
    }
}

impl From<MediaTag> for String {
    fn from(tag: MediaTag) -> Self {
        tag.as_str().to_string()
    }
}

impl fmt::Display for MediaTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Handle to a media track owned by the engine or capture device
#[derive(Debug, Clone)]
pub struct MediaTrack {
    id: String,
    kind: MediaKind,
    label: String,
    ended: Arc<AtomicBool>,
}

impl MediaTrack {
    /// Create a new track handle
    pub fn new(id: impl Into<String>, kind: MediaKind, label: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind,
            label: label.into(),
            ended: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get the track kind
    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Stop the track; clones share the ended state
    pub fn stop(&self) {
        self.ended.store(true, Ordering::SeqCst);
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }
}

/// A group of tracks rendered together
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<MediaTrack>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, tracks: Vec<MediaTrack>) -> Self {
        Self {
            id: id.into(),
            tracks,
        }
    }

    /// Wrap one track in its own stream
    pub fn single(track: MediaTrack) -> Self {
        Self::new(format!("stream-{}", track.id()), vec![track])
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[MediaTrack] {
        &self.tracks
    }

    /// First track of `kind`, if any
    pub fn track(&self, kind: MediaKind) -> Option<&MediaTrack> {
        self.tracks.iter().find(|track| track.kind() == kind)
    }

    /// Stop every track in the stream
    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

/// Requested local capture
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: Option<VideoConstraints>,
}

/// Ideal video capture settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoConstraints {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: Some(VideoConstraints {
                width: 1280,
                height: 720,
                frame_rate: 30,
            }),
        }
    }
}

/// Capture device seam
#[async_trait]
pub trait LocalMediaSource: Send + Sync {
    /// Acquire local tracks; fails with `MediaDenied` when permission is refused
    async fn acquire(&self, constraints: &MediaConstraints) -> Result<MediaStream>;
}

/// Connection state reported by an engine transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Callbacks an engine transport raises toward the router.
///
/// The session wires one signaler per transport; the engine must not treat
/// the transport as connected, or a producer as created, until the matching
/// call returns.
#[async_trait]
pub trait TransportSignaler: Send + Sync {
    /// Forward local DTLS parameters; resolves once the router acknowledges
    async fn connect(&self, dtls: DtlsParameters) -> Result<()>;

    /// Obtain a producer identifier (send transports only)
    async fn produce(&self, params: ProduceParams) -> Result<ProducerId>;

    /// Report a connection state change
    fn connection_state_changed(&self, state: ConnectionState);
}

/// Common transport surface
pub trait Transport: Send + Sync {
    fn id(&self) -> &TransportId;

    fn direction(&self) -> Direction;

    /// Close the transport and everything carried on it; idempotent
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Options for publishing one track
#[derive(Debug, Clone)]
pub struct ProduceOptions {
    pub track: MediaTrack,
    pub tag: MediaTag,
    pub encodings: Vec<EncodingLayer>,
}

/// Outbound transport
#[async_trait]
pub trait SendTransport: Transport {
    /// Publish a track; round-trips through the signaler for an identifier
    async fn produce(&self, options: ProduceOptions) -> Result<Arc<dyn ProducerHandle>>;
}

/// Inbound transport
#[async_trait]
pub trait RecvTransport: Transport {
    /// Build a local consumer from router-issued parameters
    async fn consume(&self, params: ConsumerParams) -> Result<Arc<dyn ConsumerHandle>>;
}

/// Engine-side producer
pub trait ProducerHandle: Send + Sync {
    fn id(&self) -> &ProducerId;

    fn kind(&self) -> MediaKind;

    fn track(&self) -> &MediaTrack;

    fn pause(&self) -> Result<()>;

    fn resume(&self) -> Result<()>;

    fn is_paused(&self) -> bool;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Engine-side consumer
pub trait ConsumerHandle: Send + Sync {
    fn id(&self) -> &ConsumerId;

    fn producer_id(&self) -> &ProducerId;

    fn kind(&self) -> MediaKind;

    fn track(&self) -> &MediaTrack;

    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// Local media engine
#[async_trait]
pub trait MediaEngine: Send + Sync {
    /// Load router capabilities and return the local capability set
    async fn load(&self, router_capabilities: &RtpCapabilities) -> Result<RtpCapabilities>;

    /// Build a send transport from router parameters
    async fn create_send_transport(
        &self,
        params: TransportParams,
        signaler: Arc<dyn TransportSignaler>,
    ) -> Result<Arc<dyn SendTransport>>;

    /// Build a receive transport from router parameters
    async fn create_recv_transport(
        &self,
        params: TransportParams,
        signaler: Arc<dyn TransportSignaler>,
    ) -> Result<Arc<dyn RecvTransport>>;
}
