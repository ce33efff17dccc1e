// Producer module for the session core
//
// This module keeps the local tracks a session publishes, keyed by the
// producer identifier the router assigned.

use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    media::{MediaKind, MediaTag, MediaTrack, ProduceOptions, ProducerHandle},
    signaling::RouterClient,
    simulcast::{default_video_layers, layers_for, EncodingLayer},
    transport::TransportManager,
    ProducerId, Result, SfuError,
};

/// How tracks are published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PublishPolicy {
    /// Publish video with several encoding layers
    pub simulcast: bool,
    /// Layers used for video when none are given explicitly
    pub video_layers: Vec<EncodingLayer>,
}

impl Default for PublishPolicy {
    fn default() -> Self {
        Self {
            simulcast: true,
            video_layers: default_video_layers(),
        }
    }
}

/// A published local track
#[derive(Clone)]
pub struct PublishedProducer {
    pub handle: Arc<dyn ProducerHandle>,
    pub kind: MediaKind,
    pub tag: MediaTag,
    pub encodings: Vec<EncodingLayer>,
}

impl PublishedProducer {
    pub fn id(&self) -> &ProducerId {
        self.handle.id()
    }

    pub fn is_paused(&self) -> bool {
        self.handle.is_paused()
    }
}

/// Registry of a session's producers
pub struct ProducerRegistry {
    router: RouterClient,
    transports: Arc<TransportManager>,
    policy: PublishPolicy,
    closed: CancellationToken,
    producers: Mutex<HashMap<ProducerId, PublishedProducer>>,
}

impl ProducerRegistry {
    /// Create a registry; it stops accepting tracks once `closed` is cancelled
    pub fn new(
        router: RouterClient,
        transports: Arc<TransportManager>,
        policy: PublishPolicy,
        closed: CancellationToken,
    ) -> Self {
        Self {
            router,
            transports,
            policy,
            closed,
            producers: Mutex::new(HashMap::new()),
        }
    }

    /// Publish a local track.
    ///
    /// Creates the send transport on first use. Video gets the policy's
    /// simulcast layers unless `encodings` is given; audio never has layers.
    pub async fn publish(
        &self,
        track: MediaTrack,
        tag: MediaTag,
        encodings: Option<Vec<EncodingLayer>>,
    ) -> Result<ProducerId> {
        if self.closed.is_cancelled() {
            return Err(SfuError::SessionClosed);
        }

        let kind = track.kind();
        let encodings = layers_for(kind, encodings, self.policy.simulcast, &self.policy.video_layers);
        let transport = self.transports.ensure_send().await?;

        let handle = transport
            .produce(ProduceOptions {
                track,
                tag: tag.clone(),
                encodings: encodings.clone(),
            })
            .await?;
        let producer_id = handle.id().clone();

        let mut producers = self.producers.lock();
        if self.closed.is_cancelled() {
            drop(producers);
            debug!(%producer_id, "Discarding producer created after close");
            handle.close();
            return Err(SfuError::SessionClosed);
        }

        info!(
            room = %self.router.room(),
            %producer_id,
            %kind,
            %tag,
            layers = encodings.len(),
            "Producer published"
        );
        producers.insert(
            producer_id.clone(),
            PublishedProducer {
                handle,
                kind,
                tag,
                encodings,
            },
        );

        Ok(producer_id)
    }

    /// Pause or resume every producer tagged `tag`.
    ///
    /// Best effort: engine failures are logged. Returns how many producers
    /// matched.
    pub fn set_muted(&self, tag: &MediaTag, muted: bool) -> usize {
        let matching: Vec<_> = self
            .producers
            .lock()
            .values()
            .filter(|producer| &producer.tag == tag)
            .cloned()
            .collect();

        for producer in &matching {
            let result = if muted {
                producer.handle.pause()
            } else {
                producer.handle.resume()
            };
            match result {
                Ok(()) => debug!(producer_id = %producer.id(), %tag, muted, "Producer mute toggled"),
                Err(e) => {
                    warn!(producer_id = %producer.id(), %tag, muted, error = %e, "Failed to toggle producer")
                }
            }
        }

        matching.len()
    }

    /// Close one producer and tell the router; returns false if unknown
    pub async fn close(&self, producer_id: &str) -> bool {
        let Some(producer) = self.producers.lock().remove(producer_id) else {
            return false;
        };

        producer.handle.close();
        info!(producer_id, "Producer closed");

        if let Err(e) = self.router.close_producer(producer_id).await {
            warn!(producer_id, error = %e, "Failed to notify router of closed producer");
        }
        true
    }

    /// Close every producer locally; later `publish` calls fail
    pub fn close_all(&self) {
        self.closed.cancel();
        let drained: Vec<_> = self.producers.lock().drain().collect();

        for (producer_id, producer) in drained {
            debug!(%producer_id, "Closing producer");
            producer.handle.close();
        }
    }

    pub fn get(&self, producer_id: &str) -> Option<PublishedProducer> {
        self.producers.lock().get(producer_id).cloned()
    }

    pub fn producer_ids(&self) -> Vec<ProducerId> {
        self.producers.lock().keys().cloned().collect()
    }

    /// Producers published under `tag`
    pub fn by_tag(&self, tag: &MediaTag) -> Vec<PublishedProducer> {
        self.producers
            .lock()
            .values()
            .filter(|producer| &producer.tag == tag)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.producers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.producers.lock().is_empty()
    }
}
