// Typed router client
//
// Wraps a signaling channel with one method per router round trip so the
// rest of the core never touches untyped payloads.

use std::{sync::Arc, time::Duration};

use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{
    check_ack, events,
    protocol::{
        CloseProducerRequest, ConnectTransportRequest, ConsumeRequest, ConsumeResponse,
        ConsumerParams, CreateTransportRequest, CreateTransportResponse, DtlsParameters,
        JoinRequest, JoinResponse, LeaveRequest, LocalIdentity, ProduceParams, ProduceRequest,
        ProduceResponse, ResumeConsumerRequest, SetCapabilitiesRequest, TransportParams,
    },
    SignalingChannel,
};
use crate::{
    capabilities::RtpCapabilities, transport::Direction, ProducerId, Result, RoomCode,
    SfuError,
};

/// Router round trips for one room
#[derive(Clone)]
pub struct RouterClient {
    channel: Arc<dyn SignalingChannel>,
    room: RoomCode,
    ack_timeout: Duration,
}

impl RouterClient {
    /// Create a router client for a room
    pub fn new(channel: Arc<dyn SignalingChannel>, room: impl Into<RoomCode>, ack_timeout: Duration) -> Self {
        Self {
            channel,
            room: room.into(),
            ack_timeout,
        }
    }

    /// Room this client talks about
    pub fn room(&self) -> &str {
        &self.room
    }

    /// Underlying channel
    pub fn channel(&self) -> &Arc<dyn SignalingChannel> {
        &self.channel
    }

    /// Send a request and return the raw acknowledgement, without
    /// interpreting error payloads
    pub async fn request_raw<Req: Serialize>(&self, event: &str, request: &Req) -> Result<Value> {
        self.request_raw_with_timeout(event, request, self.ack_timeout).await
    }

    async fn request_raw_with_timeout<Req: Serialize>(
        &self,
        event: &str,
        request: &Req,
        timeout: Duration,
    ) -> Result<Value> {
        let payload = serde_json::to_value(request).map_err(|e| SfuError::protocol(event, e))?;
        debug!(room = %self.room, event, "router request");
        self.channel.emit_with_ack(event, payload, timeout).await
    }

    /// Send a request, check the ack for a rejection and decode the reply
    pub async fn request<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        event: &str,
        request: &Req,
    ) -> Result<Resp> {
        let reply = check_ack(event, self.request_raw(event, request).await?)?;
        serde_json::from_value(reply).map_err(|e| SfuError::protocol(event, e))
    }

    async fn request_unit<Req: Serialize>(&self, event: &str, request: &Req) -> Result<()> {
        check_ack(event, self.request_raw(event, request).await?).map(|_| ())
    }

    /// Join the room. Rejections are returned inside the decoded reply so
    /// the caller can tell them apart.
    pub async fn join(&self, identity: &LocalIdentity) -> Result<JoinResponse> {
        let reply = self
            .request_raw(
                events::JOIN_ROOM,
                &JoinRequest {
                    code: &self.room,
                    identity,
                },
            )
            .await?;
        serde_json::from_value(reply).map_err(|e| SfuError::protocol(events::JOIN_ROOM, e))
    }

    /// Tell the router which capabilities this device has
    pub async fn set_rtp_capabilities(&self, capabilities: &RtpCapabilities) -> Result<()> {
        self.request_unit(
            events::SET_RTP_CAPABILITIES,
            &SetCapabilitiesRequest {
                code: &self.room,
                rtp_capabilities: capabilities,
            },
        )
        .await
    }

    /// Request parameters for a new transport
    pub async fn create_transport(&self, direction: Direction) -> Result<TransportParams> {
        let reply: CreateTransportResponse = self
            .request(
                events::CREATE_TRANSPORT,
                &CreateTransportRequest {
                    code: &self.room,
                    direction,
                },
            )
            .await?;
        Ok(reply.params)
    }

    /// Forward local DTLS parameters for a transport
    pub async fn connect_transport(&self, transport_id: &str, dtls: &DtlsParameters) -> Result<()> {
        self.request_unit(
            events::CONNECT_TRANSPORT,
            &ConnectTransportRequest {
                code: &self.room,
                transport_id,
                dtls_parameters: dtls,
            },
        )
        .await
    }

    /// Obtain a producer identifier for a local track
    pub async fn produce(&self, transport_id: &str, params: &ProduceParams) -> Result<ProducerId> {
        let reply: ProduceResponse = self
            .request(
                events::PRODUCE,
                &ProduceRequest {
                    code: &self.room,
                    transport_id,
                    kind: params.kind,
                    rtp_parameters: &params.rtp_parameters,
                    app_data: &params.app_data,
                },
            )
            .await?;
        Ok(reply.producer_id)
    }

    /// Tell the router a producer is gone
    pub async fn close_producer(&self, producer_id: &str) -> Result<()> {
        self.request_unit(
            events::CLOSE_PRODUCER,
            &CloseProducerRequest {
                code: &self.room,
                producer_id,
            },
        )
        .await
    }

    /// Obtain consumer parameters for a remote producer
    pub async fn consume(
        &self,
        producer_id: &str,
        transport_id: &str,
        capabilities: &RtpCapabilities,
    ) -> Result<ConsumerParams> {
        let reply: ConsumeResponse = self
            .request(
                events::CONSUME,
                &ConsumeRequest {
                    code: &self.room,
                    producer_id,
                    consumer_transport_id: transport_id,
                    rtp_capabilities: capabilities,
                },
            )
            .await?;
        Ok(reply.params)
    }

    /// Resume a consumer
    pub async fn resume_consumer(&self, consumer_id: &str) -> Result<()> {
        self.request_unit(
            events::RESUME_CONSUMER,
            &ResumeConsumerRequest {
                code: &self.room,
                consumer_id,
            },
        )
        .await
    }

    /// Announce departure, waiting at most `timeout`
    pub async fn leave(&self, timeout: Duration) -> Result<()> {
        let reply = self
            .request_raw_with_timeout(events::LEAVE_ROOM, &LeaveRequest { code: &self.room }, timeout)
            .await?;
        check_ack(events::LEAVE_ROOM, reply).map(|_| ())
    }
}
