// Capability negotiation module
//
// This module performs the join handshake with the router and derives the
// local capability set used for producing and consuming.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::{
    media::{MediaEngine, MediaKind},
    signaling::{
        protocol::{JoinResponse, LocalIdentity, NewProducer, PeerSummary},
        RouterClient,
    },
    Result, SfuError,
};

/// Codec capability
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CodecCapability {
    /// Media kind
    pub kind: MediaKind,
    /// MIME type, e.g. `audio/opus`
    pub mime_type: String,
    /// Clock rate in Hz
    pub clock_rate: u32,
    /// Channel count (audio only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    /// Preferred payload type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_payload_type: Option<u8>,
    /// Codec parameters
    #[serde(default)]
    pub parameters: Map<String, Value>,
}

impl CodecCapability {
    /// Whether two capabilities describe the same codec
    pub fn matches(&self, other: &CodecCapability) -> bool {
        self.kind == other.kind
            && self.mime_type.eq_ignore_ascii_case(&other.mime_type)
            && self.clock_rate == other.clock_rate
            && (self.channels.is_none() || other.channels.is_none() || self.channels == other.channels)
    }
}

/// Set of codecs and header extensions a party can handle
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    #[serde(default)]
    pub codecs: Vec<CodecCapability>,
    #[serde(default)]
    pub header_extensions: Vec<Value>,
}

impl RtpCapabilities {
    /// Whether any codec of `kind` is present
    pub fn supports(&self, kind: MediaKind) -> bool {
        self.codecs.iter().any(|codec| codec.kind == kind)
    }

    /// Codecs of `self` the `remote` side can also handle, keeping the
    /// remote's payload types
    pub fn intersect(&self, remote: &RtpCapabilities) -> RtpCapabilities {
        let codecs = remote
            .codecs
            .iter()
            .filter(|remote_codec| self.codecs.iter().any(|local| local.matches(remote_codec)))
            .cloned()
            .collect();

        RtpCapabilities {
            codecs,
            header_extensions: remote.header_extensions.clone(),
        }
    }
}

/// Result of a successful join
#[derive(Debug, Clone)]
pub struct JoinedRoom {
    /// Peers already in the room
    pub peers: Vec<PeerSummary>,
    /// Producers already published in the room
    pub producers: Vec<NewProducer>,
    /// Capabilities advertised by the router
    pub router_capabilities: Option<RtpCapabilities>,
}

/// Capability negotiator
pub struct CapabilityNegotiator {
    router: RouterClient,
    engine: Arc<dyn MediaEngine>,
}

impl CapabilityNegotiator {
    /// Create a new negotiator
    pub fn new(router: RouterClient, engine: Arc<dyn MediaEngine>) -> Self {
        Self { router, engine }
    }

    /// Join the room.
    ///
    /// Room and authentication rejections are reported as distinct errors;
    /// channel failures pass through unchanged.
    pub async fn join(&self, identity: &LocalIdentity) -> Result<JoinedRoom> {
        let reply = self.router.join(identity).await?;
        let reply = classify_join(self.router.room(), reply)?;

        info!(
            room = %self.router.room(),
            peers = reply.peers.len(),
            producers = reply.producers.len(),
            "Joined room"
        );

        Ok(JoinedRoom {
            peers: reply.peers,
            producers: reply.producers,
            router_capabilities: reply.router_rtp_capabilities,
        })
    }

    /// Load the local capability set against the router's and publish it.
    ///
    /// Any failure means the session cannot produce or consume and is
    /// reported as `CapabilitiesUnavailable`.
    pub async fn negotiate(&self, joined: &JoinedRoom) -> Result<RtpCapabilities> {
        let router_capabilities = joined.router_capabilities.as_ref().ok_or_else(|| {
            SfuError::CapabilitiesUnavailable("router advertised no capabilities".to_string())
        })?;

        let local = self
            .engine
            .load(router_capabilities)
            .await
            .map_err(|e| SfuError::CapabilitiesUnavailable(e.to_string()))?;

        self.publish_local_capabilities(&local).await?;
        Ok(local)
    }

    /// Inform the router of the local capability set
    pub async fn publish_local_capabilities(&self, capabilities: &RtpCapabilities) -> Result<()> {
        self.router
            .set_rtp_capabilities(capabilities)
            .await
            .map_err(|e| {
                warn!(room = %self.router.room(), error = %e, "Failed to set RTP capabilities");
                SfuError::CapabilitiesUnavailable(e.to_string())
            })
    }
}

fn classify_join(room: &str, reply: JoinResponse) -> Result<JoinResponse> {
    if reply.success && reply.error.is_none() {
        return Ok(reply);
    }

    let message = reply
        .error
        .clone()
        .unwrap_or_else(|| format!("failed to join room {}", room));

    if reply.requires_auth {
        Err(SfuError::AuthRequired)
    } else if reply.room_not_found {
        Err(SfuError::RoomNotFound(room.to_string()))
    } else if reply.room_not_available {
        Err(SfuError::RoomNotAvailable(room.to_string()))
    } else {
        Err(SfuError::JoinRejected(message))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::test_helpers::{opus, vp8, Fixture};

    #[test]
    fn test_intersect_keeps_common_codecs() {
        let local = RtpCapabilities {
            codecs: vec![opus(), vp8()],
            header_extensions: vec![],
        };
        let mut h264 = vp8();
        h264.mime_type = "video/H264".to_string();
        let remote = RtpCapabilities {
            codecs: vec![opus(), h264],
            header_extensions: vec![json!({"uri": "urn:ietf:params:rtp-hdrext:sdes:mid"})],
        };

        let common = local.intersect(&remote);
        assert_eq!(common.codecs.len(), 1);
        assert!(common.supports(MediaKind::Audio));
        assert!(!common.supports(MediaKind::Video));
        assert_eq!(common.header_extensions.len(), 1);
    }

    #[test]
    fn test_codec_match_is_case_insensitive() {
        let mut upper = vp8();
        upper.mime_type = "VIDEO/VP8".to_string();
        assert!(upper.matches(&vp8()));
        assert!(!opus().matches(&vp8()));
    }

    #[tokio::test]
    async fn test_join_classifies_rejections() {
        let fixture = Fixture::new("ABCD123");
        let negotiator = fixture.negotiator();

        fixture.router.reject_join(json!({"success": false, "requiresAuth": true, "error": "login"}));
        assert!(matches!(
            negotiator.join(&fixture.identity()).await,
            Err(SfuError::AuthRequired)
        ));

        fixture.router.reject_join(json!({"success": false, "roomNotFound": true}));
        assert!(matches!(
            negotiator.join(&fixture.identity()).await,
            Err(SfuError::RoomNotFound(code)) if code == "ABCD123"
        ));

        fixture.router.reject_join(json!({"success": false, "roomNotAvailable": true}));
        assert!(matches!(
            negotiator.join(&fixture.identity()).await,
            Err(SfuError::RoomNotAvailable(_))
        ));

        fixture.router.reject_join(json!({"error": "room is full"}));
        match negotiator.join(&fixture.identity()).await {
            Err(SfuError::JoinRejected(message)) => assert_eq!(message, "room is full"),
            other => panic!("unexpected join result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_join_then_negotiate() {
        let fixture = Fixture::new("ABCD123");
        let negotiator = fixture.negotiator();

        let joined = negotiator.join(&fixture.identity()).await.unwrap();
        let local = negotiator.negotiate(&joined).await.unwrap();

        assert!(local.supports(MediaKind::Audio));
        assert!(local.supports(MediaKind::Video));
        assert_eq!(fixture.router.request_count(crate::signaling::events::SET_RTP_CAPABILITIES), 1);
    }

    #[tokio::test]
    async fn test_set_capabilities_failure_is_degraded() {
        let fixture = Fixture::new("ABCD123");
        fixture
            .router
            .fail_event(crate::signaling::events::SET_RTP_CAPABILITIES, "not now");
        let negotiator = fixture.negotiator();

        let joined = negotiator.join(&fixture.identity()).await.unwrap();
        let err = negotiator.negotiate(&joined).await.unwrap_err();
        assert_eq!(err.class(), crate::ErrorClass::Degraded);
    }
}
