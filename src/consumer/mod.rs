// Consumer module for the session core
//
// This module turns remote producer announcements into local consumers,
// exactly once per producer, and keeps the producer and peer indices used to
// tear them down again.
//
// Per producer: unseen -> locked -> consuming -> active -> closed. The lock is
// taken synchronously, before the first await, so duplicate announcements
// that arrive while a consume round trip is in flight are dropped.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    capabilities::RtpCapabilities,
    events::SessionEvents,
    media::{ConsumerHandle, MediaKind, MediaStream},
    signaling::{
        protocol::{NewProducer, PeerLeft, ProducerMeta},
        RouterClient,
    },
    transport::TransportManager,
    ConsumerId, PeerId, ProducerId, Result, SfuError,
};

/// A remote track ready to render
#[derive(Debug, Clone)]
pub struct RemoteTile {
    pub peer_id: PeerId,
    pub kind: MediaKind,
    /// Single-track stream wrapping the consumer's track
    pub stream: MediaStream,
    pub producer_id: ProducerId,
    pub consumer_id: ConsumerId,
    pub meta: ProducerMeta,
}

/// Where a producer is in its consume lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Unseen,
    Locked,
    Consuming,
    Active,
}

/// What became of one announcement
#[derive(Debug, Clone)]
pub enum ConsumeOutcome {
    /// A consumer was created
    Consumed(ConsumerId),
    /// The producer belongs to the local peer
    IgnoredSelf,
    /// The producer is already locked, being consumed or active
    IgnoredDuplicate,
    /// The session has no capabilities to consume with
    Unavailable,
    /// The producer was withdrawn or the session closed mid-flight
    Cancelled,
    /// The consume failed; the lock was released
    Failed(SfuError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Locked,
    Consuming,
}

struct Pending {
    peer_id: PeerId,
    generation: u64,
    stage: Stage,
}

struct ActiveConsumer {
    handle: Arc<dyn ConsumerHandle>,
    tile: RemoteTile,
}

#[derive(Default)]
struct Index {
    pending: HashMap<ProducerId, Pending>,
    consumers: HashMap<ConsumerId, ActiveConsumer>,
    by_producer: HashMap<ProducerId, ConsumerId>,
    peers: HashMap<PeerId, HashSet<ProducerId>>,
    next_generation: u64,
}

impl Index {
    fn is_known(&self, producer_id: &str) -> Option<&PeerId> {
        if let Some(pending) = self.pending.get(producer_id) {
            return Some(&pending.peer_id);
        }
        self.by_producer
            .get(producer_id)
            .and_then(|consumer_id| self.consumers.get(consumer_id))
            .map(|active| &active.tile.peer_id)
    }

    fn unindex_peer(&mut self, peer_id: &str, producer_id: &str) {
        if let Some(producers) = self.peers.get_mut(peer_id) {
            producers.remove(producer_id);
            if producers.is_empty() {
                self.peers.remove(peer_id);
            }
        }
    }

    /// Release a pending lock if it still belongs to `generation`
    fn release(&mut self, producer_id: &str, generation: u64) -> bool {
        match self.pending.get(producer_id) {
            Some(pending) if pending.generation == generation => {
                if let Some(pending) = self.pending.remove(producer_id) {
                    self.unindex_peer(&pending.peer_id, producer_id);
                }
                true
            }
            _ => false,
        }
    }
}

/// Registry of a session's consumers
pub struct ConsumerRegistry {
    router: RouterClient,
    transports: Arc<TransportManager>,
    events: Arc<dyn SessionEvents>,
    closed: CancellationToken,
    local_peer_id: RwLock<Option<PeerId>>,
    capabilities: RwLock<Option<RtpCapabilities>>,
    index: Mutex<Index>,
}

impl ConsumerRegistry {
    /// Create a registry; it stops consuming once `closed` is cancelled
    pub fn new(
        router: RouterClient,
        transports: Arc<TransportManager>,
        events: Arc<dyn SessionEvents>,
        closed: CancellationToken,
    ) -> Self {
        Self {
            router,
            transports,
            events,
            closed,
            local_peer_id: RwLock::new(None),
            capabilities: RwLock::new(None),
            index: Mutex::new(Index::default()),
        }
    }

    /// Peer identifier whose announcements are echoes of local producers
    pub fn set_local_peer_id(&self, peer_id: Option<PeerId>) {
        *self.local_peer_id.write() = peer_id;
    }

    /// Capabilities sent with consume requests; `None` disables consuming
    pub fn set_capabilities(&self, capabilities: Option<RtpCapabilities>) {
        *self.capabilities.write() = capabilities;
    }

    /// Handle a remote producer announcement.
    ///
    /// Consume failures are reported through `on_error` and release the lock
    /// so a later announcement can retry. A transport failure is returned
    /// unwrapped and left to the session's fault handling.
    pub async fn on_new_remote_producer(&self, announcement: NewProducer) -> ConsumeOutcome {
        let producer_id = announcement.producer_id.clone();

        if self.closed.is_cancelled() {
            return ConsumeOutcome::Cancelled;
        }
        if self.local_peer_id.read().as_deref() == Some(announcement.peer_id.as_str()) {
            debug!(%producer_id, peer_id = %announcement.peer_id, "Ignoring self-published producer");
            return ConsumeOutcome::IgnoredSelf;
        }
        let Some(capabilities) = self.capabilities.read().clone() else {
            warn!(%producer_id, "Cannot consume without negotiated capabilities");
            return ConsumeOutcome::Unavailable;
        };

        let generation = {
            let mut index = self.index.lock();
            if let Some(owner) = index.is_known(&producer_id) {
                if owner != &announcement.peer_id {
                    warn!(
                        %producer_id,
                        owner = %owner,
                        peer_id = %announcement.peer_id,
                        "Producer announced by a second peer"
                    );
                } else {
                    debug!(%producer_id, "Ignoring duplicate producer announcement");
                }
                return ConsumeOutcome::IgnoredDuplicate;
            }

            index.next_generation += 1;
            let generation = index.next_generation;
            index.pending.insert(
                producer_id.clone(),
                Pending {
                    peer_id: announcement.peer_id.clone(),
                    generation,
                    stage: Stage::Locked,
                },
            );
            index
                .peers
                .entry(announcement.peer_id.clone())
                .or_default()
                .insert(producer_id.clone());
            generation
        };

        match self.consume(&announcement, &capabilities, generation).await {
            Ok(Some(consumer_id)) => ConsumeOutcome::Consumed(consumer_id),
            Ok(None) => ConsumeOutcome::Cancelled,
            Err(e) => {
                if !self.index.lock().release(&producer_id, generation) {
                    debug!(%producer_id, error = %e, "Consume of withdrawn producer failed");
                    return ConsumeOutcome::Cancelled;
                }

                // transport failures belong to the session, not to this track
                if let SfuError::Transport { .. } = e {
                    warn!(%producer_id, error = %e, "Consume aborted by transport failure");
                    return ConsumeOutcome::Failed(e);
                }

                let err = SfuError::Consume {
                    producer_id: producer_id.clone(),
                    source: Box::new(e),
                };
                warn!(%producer_id, peer_id = %announcement.peer_id, error = %err, "Consume failed");
                self.events.on_error(&err);
                ConsumeOutcome::Failed(err)
            }
        }
    }

    async fn consume(
        &self,
        announcement: &NewProducer,
        capabilities: &RtpCapabilities,
        generation: u64,
    ) -> Result<Option<ConsumerId>> {
        let producer_id = &announcement.producer_id;
        let transport = self.transports.ensure_recv().await?;

        if !self.advance(producer_id, generation) {
            debug!(%producer_id, "Producer withdrawn before consume");
            return Ok(None);
        }

        let params = self
            .router
            .consume(producer_id, transport.id(), capabilities)
            .await?;
        let consumer = transport.consume(params).await?;
        let consumer_id = consumer.id().clone();

        let tile = RemoteTile {
            peer_id: announcement.peer_id.clone(),
            kind: consumer.kind(),
            stream: MediaStream::single(consumer.track().clone()),
            producer_id: producer_id.clone(),
            consumer_id: consumer_id.clone(),
            meta: announcement.meta.clone(),
        };

        let installed = {
            let mut index = self.index.lock();
            let ours = matches!(
                index.pending.get(producer_id),
                Some(pending) if pending.generation == generation
            );
            if ours && !self.closed.is_cancelled() {
                index.pending.remove(producer_id);
                index.by_producer.insert(producer_id.clone(), consumer_id.clone());
                index.consumers.insert(
                    consumer_id.clone(),
                    ActiveConsumer {
                        handle: Arc::clone(&consumer),
                        tile: tile.clone(),
                    },
                );
            }
            ours
        };

        if !installed || self.closed.is_cancelled() {
            debug!(%producer_id, %consumer_id, "Discarding consumer for withdrawn producer");
            consumer.close();
            return Ok(None);
        }

        info!(
            peer_id = %tile.peer_id,
            %producer_id,
            %consumer_id,
            kind = %tile.kind,
            "Consumer active"
        );
        self.events.on_new_remote_track(&tile);

        if let Err(e) = self.router.resume_consumer(&consumer_id).await {
            warn!(%consumer_id, error = %e, "Failed to resume consumer");
        }

        Ok(Some(consumer_id))
    }

    /// Move a pending producer from locked to consuming
    fn advance(&self, producer_id: &str, generation: u64) -> bool {
        match self.index.lock().pending.get_mut(producer_id) {
            Some(pending) if pending.generation == generation && !self.closed.is_cancelled() => {
                pending.stage = Stage::Consuming;
                true
            }
            _ => false,
        }
    }

    /// Close the consumer of a producer.
    ///
    /// Returns true if a track was closed. Unknown producers are a no-op; a
    /// producer still being consumed is withdrawn without callbacks.
    pub fn close_by_producer_id(&self, producer_id: &str) -> bool {
        let active = {
            let mut index = self.index.lock();
            if let Some(pending) = index.pending.remove(producer_id) {
                index.unindex_peer(&pending.peer_id, producer_id);
                debug!(producer_id, stage = ?pending.stage, "Withdrawing producer being consumed");
                return false;
            }

            let Some(consumer_id) = index.by_producer.remove(producer_id) else {
                return false;
            };
            let active = index.consumers.remove(&consumer_id);
            if let Some(active) = &active {
                let peer_id = active.tile.peer_id.clone();
                index.unindex_peer(&peer_id, producer_id);
            }
            active
        };

        let Some(active) = active else {
            return false;
        };

        active.handle.close();
        info!(
            producer_id,
            consumer_id = %active.tile.consumer_id,
            peer_id = %active.tile.peer_id,
            "Consumer closed"
        );
        self.events.on_remote_track_closed(producer_id);
        true
    }

    /// Close every consumer of a peer; returns how many tracks closed
    pub fn remove_peer(&self, peer_id: &str) -> usize {
        let producers = self.index.lock().peers.remove(peer_id).unwrap_or_default();

        let closed = producers
            .iter()
            .filter(|producer_id| self.close_by_producer_id(producer_id))
            .count();
        debug!(peer_id, closed, "Peer consumers removed");
        closed
    }

    /// Handle a peer-left broadcast: close the listed producers, then sweep
    /// whatever the peer index still holds for the peer
    pub fn peer_left(&self, event: &PeerLeft) -> usize {
        let listed = event
            .producer_ids
            .iter()
            .flatten()
            .filter(|producer_id| self.close_by_producer_id(producer_id))
            .count();
        listed + self.remove_peer(&event.peer_id)
    }

    /// Close every consumer without callbacks; later announcements are ignored
    pub fn close_all(&self) {
        self.closed.cancel();
        let consumers: Vec<_> = {
            let mut index = self.index.lock();
            index.pending.clear();
            index.by_producer.clear();
            index.peers.clear();
            index.consumers.drain().map(|(_, active)| active).collect()
        };

        for active in consumers {
            debug!(consumer_id = %active.tile.consumer_id, "Closing consumer");
            active.handle.close();
        }
    }

    /// Lifecycle state of a producer
    pub fn state(&self, producer_id: &str) -> ConsumerState {
        let index = self.index.lock();
        match index.pending.get(producer_id) {
            Some(Pending { stage: Stage::Locked, .. }) => ConsumerState::Locked,
            Some(Pending { stage: Stage::Consuming, .. }) => ConsumerState::Consuming,
            None if index.by_producer.contains_key(producer_id) => ConsumerState::Active,
            None => ConsumerState::Unseen,
        }
    }

    /// Consumer created for a producer, if active
    pub fn consumer_for(&self, producer_id: &str) -> Option<ConsumerId> {
        self.index.lock().by_producer.get(producer_id).cloned()
    }

    /// Producers of a peer that are locked, being consumed or active
    pub fn peer_producers(&self, peer_id: &str) -> Vec<ProducerId> {
        let mut producers: Vec<_> = self
            .index
            .lock()
            .peers
            .get(peer_id)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default();
        producers.sort();
        producers
    }

    /// Snapshot of every active remote track
    pub fn tiles(&self) -> Vec<RemoteTile> {
        self.index
            .lock()
            .consumers
            .values()
            .map(|active| active.tile.clone())
            .collect()
    }

    /// Number of active consumers
    pub fn len(&self) -> usize {
        self.index.lock().consumers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::future::join_all;
    use testresult::TestResult;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        media::Transport,
        signaling::events,
        test_helpers::{remote_producer, Fixture},
        ErrorClass,
    };

    #[tokio::test]
    async fn test_duplicate_announcements_consume_once() -> TestResult {
        let fixture = Fixture::loaded("ABCD123").await;
        fixture.router.register_producer("prod-1", MediaKind::Video);
        fixture.router.delay(events::CONSUME, Duration::from_millis(20));
        let (consumers, recorder) = fixture.consumers();

        let announcement = remote_producer("peer-b", "prod-1", MediaKind::Video);
        let outcomes = join_all((0..4).map(|_| consumers.on_new_remote_producer(announcement.clone()))).await;

        let consumed = outcomes
            .iter()
            .filter(|o| matches!(o, ConsumeOutcome::Consumed(_)))
            .count();
        let duplicates = outcomes
            .iter()
            .filter(|o| matches!(o, ConsumeOutcome::IgnoredDuplicate))
            .count();
        assert_eq!((consumed, duplicates), (1, 3));
        assert_eq!(fixture.router.request_count(events::CONSUME), 1);
        assert_eq!(recorder.new_tracks().len(), 1);
        assert_eq!(consumers.len(), 1);

        // a late duplicate after activation is still ignored
        assert!(matches!(
            consumers.on_new_remote_producer(announcement).await,
            ConsumeOutcome::IgnoredDuplicate
        ));
        assert_eq!(consumers.state("prod-1"), ConsumerState::Active);
        Ok(())
    }

    #[tokio::test]
    async fn test_tile_describes_remote_track() -> TestResult {
        let fixture = Fixture::loaded("ABCD123").await;
        fixture.router.register_producer("prod-1", MediaKind::Audio);
        let (consumers, recorder) = fixture.consumers();

        let mut announcement = remote_producer("peer-b", "prod-1", MediaKind::Audio);
        announcement.meta.user_name = Some("Bea".to_string());
        consumers.on_new_remote_producer(announcement).await;

        let tile = recorder.new_tracks().pop().ok_or("no tile")?;
        assert_eq!(tile.peer_id, "peer-b");
        assert_eq!(tile.producer_id, "prod-1");
        assert_eq!(tile.kind, MediaKind::Audio);
        assert_eq!(tile.stream.tracks().len(), 1);
        assert_eq!(tile.meta.user_name.as_deref(), Some("Bea"));
        assert_eq!(consumers.consumer_for("prod-1"), Some(tile.consumer_id.clone()));
        assert_eq!(fixture.router.request_count(events::RESUME_CONSUMER), 1);
        assert_eq!(
            fixture.router.requests(events::RESUME_CONSUMER)[0]["consumerId"],
            tile.consumer_id.as_str()
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_close_by_producer_id_is_idempotent() -> TestResult {
        let fixture = Fixture::loaded("ABCD123").await;
        fixture.router.register_producer("prod-1", MediaKind::Video);
        let (consumers, recorder) = fixture.consumers();

        consumers
            .on_new_remote_producer(remote_producer("peer-b", "prod-1", MediaKind::Video))
            .await;
        let stream = recorder.new_tracks().pop().ok_or("no tile")?.stream;

        assert!(consumers.close_by_producer_id("prod-1"));
        assert!(!consumers.close_by_producer_id("prod-1"));
        assert!(!consumers.close_by_producer_id("never-seen"));

        assert_eq!(recorder.closed_tracks(), vec!["prod-1".to_string()]);
        assert!(stream.tracks()[0].is_ended());
        assert!(consumers.peer_producers("peer-b").is_empty());
        assert_eq!(consumers.state("prod-1"), ConsumerState::Unseen);
        Ok(())
    }

    #[tokio::test]
    #[traced_test]
    async fn test_self_echo_is_never_consumed() -> TestResult {
        let fixture = Fixture::loaded("ABCD123").await;
        fixture.router.register_producer("prod-mine", MediaKind::Video);
        let (consumers, recorder) = fixture.consumers();

        let outcome = consumers
            .on_new_remote_producer(remote_producer(Fixture::LOCAL_PEER, "prod-mine", MediaKind::Video))
            .await;

        assert!(matches!(outcome, ConsumeOutcome::IgnoredSelf));
        assert_eq!(fixture.router.request_count(events::CONSUME), 0);
        assert_eq!(fixture.router.request_count(events::CREATE_TRANSPORT), 0);
        assert!(recorder.events().is_empty());
        assert!(logs_contain("Ignoring self-published producer"));
        Ok(())
    }

    #[tokio::test]
    async fn test_remove_peer_closes_each_producer() -> TestResult {
        let fixture = Fixture::loaded("ABCD123").await;
        let (consumers, recorder) = fixture.consumers();
        for id in ["prod-a", "prod-b", "prod-c"] {
            fixture.router.register_producer(id, MediaKind::Video);
            consumers
                .on_new_remote_producer(remote_producer("peer-b", id, MediaKind::Video))
                .await;
        }
        fixture.router.register_producer("prod-d", MediaKind::Audio);
        consumers
            .on_new_remote_producer(remote_producer("peer-c", "prod-d", MediaKind::Audio))
            .await;

        assert_eq!(consumers.peer_producers("peer-b").len(), 3);
        assert_eq!(consumers.remove_peer("peer-b"), 3);

        let mut closed = recorder.closed_tracks();
        closed.sort();
        assert_eq!(closed, vec!["prod-a", "prod-b", "prod-c"]);
        assert!(consumers.peer_producers("peer-b").is_empty());
        assert_eq!(consumers.peer_producers("peer-c"), vec!["prod-d".to_string()]);
        assert_eq!(consumers.remove_peer("peer-b"), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_peer_left_with_listed_producers() -> TestResult {
        let fixture = Fixture::loaded("ABCD123").await;
        let (consumers, recorder) = fixture.consumers();
        for id in ["prod-a", "prod-b"] {
            fixture.router.register_producer(id, MediaKind::Video);
            consumers
                .on_new_remote_producer(remote_producer("peer-b", id, MediaKind::Video))
                .await;
        }

        // the router lists one producer and a stale one; the sweep catches the rest
        let closed = consumers.peer_left(&PeerLeft {
            peer_id: "peer-b".to_string(),
            producer_ids: Some(vec!["prod-a".to_string(), "prod-gone".to_string()]),
        });

        assert_eq!(closed, 2);
        assert_eq!(recorder.closed_tracks().len(), 2);
        assert!(consumers.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_consume_failure_releases_lock() -> TestResult {
        let fixture = Fixture::loaded("ABCD123").await;
        fixture.router.register_producer("prod-1", MediaKind::Video);
        fixture.router.fail_consume_for("prod-1", "router busy");
        let (consumers, recorder) = fixture.consumers();
        let announcement = remote_producer("peer-b", "prod-1", MediaKind::Video);

        let outcome = consumers.on_new_remote_producer(announcement.clone()).await;
        let ConsumeOutcome::Failed(err) = outcome else {
            return Err(format!("unexpected outcome {outcome:?}").into());
        };
        assert_eq!(err.class(), ErrorClass::TrackFailure);
        assert_eq!(recorder.errors().len(), 1);
        assert_eq!(consumers.state("prod-1"), ConsumerState::Unseen);
        assert!(consumers.peer_producers("peer-b").is_empty());

        fixture.router.clear_failures();
        assert!(matches!(
            consumers.on_new_remote_producer(announcement).await,
            ConsumeOutcome::Consumed(_)
        ));
        assert_eq!(recorder.new_tracks().len(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_consume_timeout_is_track_scoped() -> TestResult {
        let fixture = Fixture::loaded_with_timeout("ABCD123", Duration::from_millis(30)).await;
        fixture.router.register_producer("prod-1", MediaKind::Video);
        fixture.router.drop_acks(events::CONSUME);
        let (consumers, recorder) = fixture.consumers();

        let outcome = consumers
            .on_new_remote_producer(remote_producer("peer-b", "prod-1", MediaKind::Video))
            .await;

        match outcome {
            ConsumeOutcome::Failed(SfuError::Consume { source, .. }) => {
                assert!(matches!(*source, SfuError::Timeout { .. }))
            }
            other => return Err(format!("unexpected outcome {other:?}").into()),
        }
        assert!(recorder.new_tracks().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_transport_connect_is_not_track_scoped() -> TestResult {
        let fixture = Fixture::loaded("ABCD123").await;
        fixture.router.register_producer("prod-1", MediaKind::Video);
        fixture.router.register_producer("prod-2", MediaKind::Audio);
        fixture.router.fail_event(events::CONNECT_TRANSPORT, "dtls rejected");
        let (consumers, recorder) = fixture.consumers();

        let outcome = consumers
            .on_new_remote_producer(remote_producer("peer-b", "prod-1", MediaKind::Video))
            .await;
        let ConsumeOutcome::Failed(err) = outcome else {
            return Err(format!("unexpected outcome {outcome:?}").into());
        };
        assert!(matches!(err, SfuError::Transport { .. }));
        assert_eq!(err.class(), ErrorClass::Fatal);
        assert!(recorder.errors().is_empty());
        assert_eq!(consumers.state("prod-1"), ConsumerState::Unseen);

        // the dead transport is not connected again
        let outcome = consumers
            .on_new_remote_producer(remote_producer("peer-b", "prod-2", MediaKind::Audio))
            .await;
        assert!(matches!(outcome, ConsumeOutcome::Failed(SfuError::Transport { .. })));
        assert_eq!(fixture.router.request_count(events::CONNECT_TRANSPORT), 1);
        assert!(fixture.engine.recv_transport().ok_or("no recv transport")?.is_closed());
        Ok(())
    }

    #[tokio::test]
    async fn test_close_during_consume_discards_consumer() -> TestResult {
        let fixture = Fixture::loaded("ABCD123").await;
        fixture.router.register_producer("prod-1", MediaKind::Video);
        fixture.router.delay(events::CONSUME, Duration::from_millis(40));
        let (consumers, recorder) = fixture.consumers();
        let consumers = Arc::new(consumers);

        let pending = tokio::spawn({
            let consumers = Arc::clone(&consumers);
            async move {
                consumers
                    .on_new_remote_producer(remote_producer("peer-b", "prod-1", MediaKind::Video))
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(consumers.state("prod-1"), ConsumerState::Consuming);
        assert!(!consumers.close_by_producer_id("prod-1"));

        assert!(matches!(pending.await?, ConsumeOutcome::Cancelled));
        assert!(consumers.is_empty());
        assert!(recorder.events().is_empty());
        assert_eq!(consumers.state("prod-1"), ConsumerState::Unseen);
        Ok(())
    }

    #[tokio::test]
    async fn test_second_peer_cannot_claim_producer() -> TestResult {
        let fixture = Fixture::loaded("ABCD123").await;
        fixture.router.register_producer("prod-1", MediaKind::Audio);
        let (consumers, _recorder) = fixture.consumers();

        consumers
            .on_new_remote_producer(remote_producer("peer-b", "prod-1", MediaKind::Audio))
            .await;
        let outcome = consumers
            .on_new_remote_producer(remote_producer("peer-c", "prod-1", MediaKind::Audio))
            .await;

        assert!(matches!(outcome, ConsumeOutcome::IgnoredDuplicate));
        assert!(consumers.peer_producers("peer-c").is_empty());
        assert_eq!(consumers.remove_peer("peer-b"), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_without_capabilities_nothing_is_consumed() -> TestResult {
        let fixture = Fixture::loaded("ABCD123").await;
        fixture.router.register_producer("prod-1", MediaKind::Audio);
        let (consumers, _recorder) = fixture.consumers();
        consumers.set_capabilities(None);

        let outcome = consumers
            .on_new_remote_producer(remote_producer("peer-b", "prod-1", MediaKind::Audio))
            .await;

        assert!(matches!(outcome, ConsumeOutcome::Unavailable));
        assert_eq!(fixture.router.request_count(events::CONSUME), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_close_all_fires_no_callbacks() -> TestResult {
        let fixture = Fixture::loaded("ABCD123").await;
        fixture.router.register_producer("prod-1", MediaKind::Audio);
        let (consumers, recorder) = fixture.consumers();
        consumers
            .on_new_remote_producer(remote_producer("peer-b", "prod-1", MediaKind::Audio))
            .await;
        recorder.clear();

        consumers.close_all();
        consumers.close_all();

        assert!(consumers.is_empty());
        assert!(recorder.events().is_empty());
        assert!(matches!(
            consumers
                .on_new_remote_producer(remote_producer("peer-b", "prod-2", MediaKind::Audio))
                .await,
            ConsumeOutcome::Cancelled
        ));
        Ok(())
    }
}
