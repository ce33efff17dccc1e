// Router wire schemas
//
// Every request and reply exchanged with the router, in the camelCase JSON
// shape the router speaks. Parameters the session never inspects stay opaque.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    capabilities::RtpCapabilities,
    media::{MediaKind, MediaTag},
    simulcast::EncodingLayer,
    transport::Direction,
    ConsumerId, PeerId, ProducerId, TransportId,
};

/// Role of a participant in a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Cohost,
    Speaker,
    Viewer,
}

/// Description of the local device sent on join
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub os: String,
    pub browser: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub is_mobile: bool,
}

/// Who is joining
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalIdentity {
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    #[serde(default)]
    pub device: DeviceInfo,
}

/// A remote participant as announced by the router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSummary {
    pub peer_id: PeerId,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default)]
    pub user_email: Option<String>,
}

/// Display metadata attached to a remote producer
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

/// A remote producer announcement
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProducer {
    pub peer_id: PeerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    #[serde(flatten)]
    pub meta: ProducerMeta,
}

impl NewProducer {
    /// Parse a new-producer broadcast; the router may wrap the announcement
    /// in a one-element array
    pub fn from_broadcast(payload: Value) -> crate::Result<Self> {
        let payload = match payload {
            Value::Array(mut items) if !items.is_empty() => items.swap_remove(0),
            other => other,
        };
        serde_json::from_value(payload)
            .map_err(|e| crate::SfuError::protocol(super::events::NEW_PRODUCER, e))
    }
}

/// A peer-left broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerLeft {
    pub peer_id: PeerId,
    #[serde(default)]
    pub producer_ids: Option<Vec<ProducerId>>,
}

/// A producer-closed broadcast
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerClosed {
    pub producer_id: ProducerId,
    #[serde(default)]
    pub peer_id: Option<PeerId>,
}

/// `room:join` request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequest<'a> {
    pub code: &'a str,
    #[serde(flatten)]
    pub identity: &'a LocalIdentity,
}

/// `room:join` reply
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinResponse {
    #[serde(default = "default_true")]
    pub success: bool,
    #[serde(default)]
    pub peers: Vec<PeerSummary>,
    #[serde(default, alias = "rtpCapabilities")]
    pub router_rtp_capabilities: Option<RtpCapabilities>,
    #[serde(default)]
    pub producers: Vec<NewProducer>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub requires_auth: bool,
    #[serde(default)]
    pub room_not_found: bool,
    #[serde(default)]
    pub room_not_available: bool,
}

fn default_true() -> bool {
    true
}

/// `media:set-rtp-capabilities` request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SetCapabilitiesRequest<'a> {
    pub code: &'a str,
    pub rtp_capabilities: &'a RtpCapabilities,
}

/// `media:create-webrtc-transport` request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateTransportRequest<'a> {
    pub code: &'a str,
    pub direction: Direction,
}

/// DTLS fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

/// DTLS parameters of one transport endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DtlsParameters {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub fingerprints: Vec<DtlsFingerprint>,
}

/// Transport parameters issued by the router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportParams {
    pub id: TransportId,
    #[serde(default)]
    pub ice_parameters: Value,
    #[serde(default)]
    pub ice_candidates: Vec<Value>,
    #[serde(default)]
    pub dtls_parameters: DtlsParameters,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct CreateTransportResponse {
    #[serde(alias = "transport")]
    pub params: TransportParams,
}

/// `media:connect-transport` request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectTransportRequest<'a> {
    pub code: &'a str,
    pub transport_id: &'a str,
    pub dtls_parameters: &'a DtlsParameters,
}

/// Opaque RTP parameters produced and consumed by the media engine
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpParameters(pub Value);

/// Application data attached to a producer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppData {
    pub media_tag: MediaTag,
}

/// What the engine asks the router for when a track is produced
#[derive(Debug, Clone, PartialEq)]
pub struct ProduceParams {
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub app_data: AppData,
    pub encodings: Vec<EncodingLayer>,
}

/// `media:produce` request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProduceRequest<'a> {
    pub code: &'a str,
    pub transport_id: &'a str,
    pub kind: MediaKind,
    pub rtp_parameters: &'a RtpParameters,
    pub app_data: &'a AppData,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct ProduceResponse {
    #[serde(alias = "id")]
    pub producer_id: ProducerId,
}

/// `media:close-producer` request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CloseProducerRequest<'a> {
    pub code: &'a str,
    pub producer_id: &'a str,
}

/// `media:consume` request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeRequest<'a> {
    pub code: &'a str,
    pub producer_id: &'a str,
    pub consumer_transport_id: &'a str,
    pub rtp_capabilities: &'a RtpCapabilities,
}

/// Consumer parameters issued by the router
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumerParams {
    pub id: ConsumerId,
    pub producer_id: ProducerId,
    pub kind: MediaKind,
    #[serde(default)]
    pub rtp_parameters: RtpParameters,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct ConsumeResponse {
    pub params: ConsumerParams,
}

/// `media:resume-consumer` request
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeConsumerRequest<'a> {
    pub code: &'a str,
    pub consumer_id: &'a str,
}

/// `room:leave` request
#[derive(Debug, Clone, Serialize)]
pub struct LeaveRequest<'a> {
    pub code: &'a str,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_new_producer_accepts_wrapped_payload() {
        let wrapped = json!([{
            "peerId": "peer-b",
            "producerId": "prod-1",
            "kind": "video",
            "userName": "Bea"
        }]);
        let evt = NewProducer::from_broadcast(wrapped).unwrap();
        assert_eq!(evt.peer_id, "peer-b");
        assert_eq!(evt.kind, MediaKind::Video);
        assert_eq!(evt.meta.user_name.as_deref(), Some("Bea"));

        let bare = json!({"peerId": "peer-b", "producerId": "prod-2", "kind": "audio"});
        let evt = NewProducer::from_broadcast(bare).unwrap();
        assert_eq!(evt.producer_id, "prod-2");
        assert_eq!(evt.meta, ProducerMeta::default());
    }

    #[test]
    fn test_new_producer_rejects_missing_fields() {
        let err = NewProducer::from_broadcast(json!({"peerId": "peer-b"})).unwrap_err();
        assert!(matches!(err, crate::SfuError::Protocol(_)));
    }

    #[test]
    fn test_join_response_failure_flags() {
        let reply: JoinResponse = serde_json::from_value(json!({
            "success": false,
            "error": "Room not found",
            "roomNotFound": true
        }))
        .unwrap();
        assert!(!reply.success);
        assert!(reply.room_not_found);
        assert!(!reply.requires_auth);
        assert!(reply.peers.is_empty());
    }

    #[test]
    fn test_join_request_flattens_identity() {
        let identity = LocalIdentity {
            user_id: "u1".to_string(),
            user_name: Some("Ada".to_string()),
            user_email: None,
            device: DeviceInfo::default(),
        };
        let value = serde_json::to_value(JoinRequest { code: "ABCD123", identity: &identity }).unwrap();
        assert_eq!(value["code"], "ABCD123");
        assert_eq!(value["userId"], "u1");
        assert_eq!(value["userName"], "Ada");
        assert!(value.get("userEmail").is_none());
    }

    #[test]
    fn test_produce_response_accepts_id_alias() {
        let reply: ProduceResponse = serde_json::from_value(json!({"id": "prod-9"})).unwrap();
        assert_eq!(reply.producer_id, "prod-9");
    }
}
