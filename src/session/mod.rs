// Session management module for the session core
//
// This module drives one room session: connect, join, negotiate, consume
// what the room already publishes, publish local media, then react to room
// broadcasts until the caller leaves.

pub mod config;

use std::{
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub use config::SessionConfig;

use crate::{
    capabilities::{CapabilityNegotiator, JoinedRoom},
    consumer::{ConsumeOutcome, ConsumerRegistry, RemoteTile},
    events::SessionEvents,
    media::{LocalMediaSource, MediaEngine, MediaKind, MediaStream, MediaTag, MediaTrack},
    producer::ProducerRegistry,
    signaling::{
        events,
        protocol::{LocalIdentity, NewProducer, PeerLeft, PeerSummary, ProducerClosed},
        ChannelState, RouterClient, SignalingChannel, Subscription, SubscriptionId,
    },
    simulcast::EncodingLayer,
    transport::{TransportFault, TransportManager},
    PeerId, ProducerId, Result, RoomCode, SfuError,
};

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Not started
    Idle,
    /// `start` in progress
    Connecting,
    /// In the room
    Joined,
    /// A fatal failure; `leave` before starting again
    Error,
    /// Left the room
    Left,
}

/// Resources of one `start` .. `leave` cycle
struct ActiveSession {
    router: RouterClient,
    token: CancellationToken,
    transports: Arc<TransportManager>,
    producers: ProducerRegistry,
    consumers: Arc<ConsumerRegistry>,
    in_room: AtomicBool,
    subscriptions: Mutex<Vec<SubscriptionId>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    local_stream: Mutex<Option<MediaStream>>,
}

struct Inner {
    channel: Arc<dyn SignalingChannel>,
    engine: Arc<dyn MediaEngine>,
    media_source: Arc<dyn LocalMediaSource>,
    events: Arc<dyn SessionEvents>,
    config: SessionConfig,
    state: watch::Sender<SessionState>,
    last_error: Mutex<Option<SfuError>>,
    local_peer_id: Mutex<Option<PeerId>>,
    active: Mutex<Option<Arc<ActiveSession>>>,
}

/// A client session in one SFU room
pub struct Session {
    inner: Arc<Inner>,
}

impl Session {
    /// Create an idle session
    pub fn new(
        channel: Arc<dyn SignalingChannel>,
        engine: Arc<dyn MediaEngine>,
        media_source: Arc<dyn LocalMediaSource>,
        events: Arc<dyn SessionEvents>,
        config: SessionConfig,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::Idle);
        Self {
            inner: Arc::new(Inner {
                channel,
                engine,
                media_source,
                events,
                config,
                state,
                last_error: Mutex::new(None),
                local_peer_id: Mutex::new(None),
                active: Mutex::new(None),
            }),
        }
    }

    /// Join `room` and publish local media.
    ///
    /// Resolves once the session is joined: existing producers are consumed
    /// and local tracks are published. Any failure moves the session to
    /// `Error` and is returned unchanged. Accepted from `Idle` and `Left`.
    pub async fn start(&self, room: impl Into<RoomCode>, identity: LocalIdentity) -> Result<()> {
        let room = room.into();
        let active = self.inner.begin(&room)?;

        info!(%room, "Starting session");
        match self.inner.run(&active, &identity).await {
            Ok(()) if !active.token.is_cancelled() => self.inner.finish(&room),
            Ok(()) => Err(SfuError::SessionClosed),
            Err(_) if active.token.is_cancelled() => {
                debug!(%room, "Start interrupted by leave");
                Err(SfuError::SessionClosed)
            }
            Err(e) => {
                self.inner.fail(&active.token, e.clone());
                Err(e)
            }
        }
    }

    /// Leave the room and release everything. Idempotent; callable from any
    /// state, including while `start` is in flight.
    pub async fn leave(&self) {
        self.inner.leave().await;
    }

    /// Publish an extra local track
    pub async fn publish(
        &self,
        track: MediaTrack,
        tag: MediaTag,
        encodings: Option<Vec<EncodingLayer>>,
    ) -> Result<ProducerId> {
        let active = self.inner.active().ok_or(SfuError::SessionClosed)?;
        active.producers.publish(track, tag, encodings).await
    }

    /// Close one local producer
    pub async fn unpublish(&self, producer_id: &str) -> bool {
        match self.inner.active() {
            Some(active) => active.producers.close(producer_id).await,
            None => false,
        }
    }

    /// Pause or resume the microphone producers
    pub fn set_microphone_muted(&self, muted: bool) {
        self.set_muted(MediaTag::Mic, muted);
    }

    /// Pause or resume the camera producers
    pub fn set_camera_muted(&self, muted: bool) {
        self.set_muted(MediaTag::Cam, muted);
    }

    fn set_muted(&self, tag: MediaTag, muted: bool) {
        if let Some(active) = self.inner.active() {
            active.producers.set_muted(&tag, muted);
        }
    }

    pub fn state(&self) -> SessionState {
        *self.inner.state.borrow()
    }

    /// Watch state transitions
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    /// The error that moved the session to `Error`, if any
    pub fn last_error(&self) -> Option<SfuError> {
        self.inner.last_error.lock().clone()
    }

    /// Peer identifier assigned by the signaling channel
    pub fn local_peer_id(&self) -> Option<PeerId> {
        self.inner.local_peer_id.lock().clone()
    }

    /// Room of the current cycle
    pub fn room(&self) -> Option<RoomCode> {
        self.inner.active().map(|active| active.router.room().to_string())
    }

    /// Snapshot of the remote tracks currently consumed
    pub fn remote_tiles(&self) -> Vec<RemoteTile> {
        self.inner
            .active()
            .map(|active| active.consumers.tiles())
            .unwrap_or_default()
    }

    /// Locally captured media, once acquired
    pub fn local_stream(&self) -> Option<MediaStream> {
        self.inner
            .active()
            .and_then(|active| active.local_stream.lock().clone())
    }

    /// Producers published by this session
    pub fn producer_ids(&self) -> Vec<ProducerId> {
        self.inner
            .active()
            .map(|active| active.producers.producer_ids())
            .unwrap_or_default()
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(active) = self.inner.active.lock().take() {
            active.token.cancel();
            active.producers.close_all();
            active.consumers.close_all();
            active.transports.close_all();
        }
    }
}

impl Inner {
    fn active(&self) -> Option<Arc<ActiveSession>> {
        self.active.lock().clone()
    }

    fn set_state(&self, next: SessionState, allowed: impl Fn(SessionState) -> bool) -> bool {
        let changed = self.state.send_if_modified(|state| {
            if allowed(*state) && *state != next {
                *state = next;
                true
            } else {
                false
            }
        });
        if changed {
            self.events.on_state_changed(next);
        }
        changed
    }

    /// Claim the session for a new cycle and build its resources
    fn begin(self: &Arc<Self>, room: &str) -> Result<Arc<ActiveSession>> {
        let token = CancellationToken::new();
        let router = RouterClient::new(Arc::clone(&self.channel), room, self.config.ack_timeout());
        let (faults_tx, faults_rx) = mpsc::unbounded_channel();
        let transports = Arc::new(TransportManager::new(
            router.clone(),
            Arc::clone(&self.engine),
            faults_tx,
        ));
        let producers = ProducerRegistry::new(
            router.clone(),
            Arc::clone(&transports),
            self.config.publish_policy(),
            token.child_token(),
        );
        let consumers = Arc::new(ConsumerRegistry::new(
            router.clone(),
            Arc::clone(&transports),
            Arc::clone(&self.events),
            token.child_token(),
        ));
        let active = Arc::new(ActiveSession {
            router,
            token,
            transports,
            producers,
            consumers,
            in_room: AtomicBool::new(false),
            subscriptions: Mutex::new(Vec::new()),
            tasks: Mutex::new(Vec::new()),
            local_stream: Mutex::new(None),
        });

        {
            let mut slot = self.active.lock();
            let mut refused = None;
            self.state.send_if_modified(|state| match state {
                SessionState::Idle | SessionState::Left => {
                    *state = SessionState::Connecting;
                    true
                }
                other => {
                    refused = Some(*other);
                    false
                }
            });
            match refused {
                Some(SessionState::Error) => {
                    return Err(SfuError::InvalidState(
                        "session failed; leave before starting again".to_string(),
                    ))
                }
                Some(current) => {
                    return Err(SfuError::InvalidState(format!("session already {:?}", current)))
                }
                None => *slot = Some(Arc::clone(&active)),
            }
        }

        *self.last_error.lock() = None;
        self.events.on_state_changed(SessionState::Connecting);
        self.spawn_fault_watch(&active, faults_rx);
        Ok(active)
    }

    async fn run(self: &Arc<Self>, active: &Arc<ActiveSession>, identity: &LocalIdentity) -> Result<()> {
        let token = &active.token;
        let room = active.router.room().to_string();

        let peer_id = cancellable(token, self.channel.connect()).await?;
        info!(%room, %peer_id, "Signaling connected");
        *self.local_peer_id.lock() = Some(peer_id.clone());
        active.consumers.set_local_peer_id(Some(peer_id.clone()));
        self.events.on_connected();
        self.spawn_channel_watch(active);

        // subscribe before joining so no announcement falls between the
        // join reply and the first broadcast
        let subscriptions = self.subscribe(active);

        let negotiator = CapabilityNegotiator::new(active.router.clone(), Arc::clone(&self.engine));
        let joined = cancellable(token, negotiator.join(identity)).await?;
        active.in_room.store(true, Ordering::SeqCst);

        let stream = cancellable(token, self.media_source.acquire(&self.config.constraints)).await?;
        info!(%room, tracks = stream.tracks().len(), "Local media acquired");
        *active.local_stream.lock() = Some(stream.clone());

        let capabilities = match cancellable(token, negotiator.negotiate(&joined)).await {
            Ok(capabilities) => Some(capabilities),
            Err(e @ SfuError::CapabilitiesUnavailable(_)) => {
                warn!(%room, error = %e, "Session degraded: cannot produce or consume");
                self.events.on_error(&e);
                None
            }
            Err(e) => return Err(e),
        };
        let degraded = capabilities.is_none();
        active.consumers.set_capabilities(capabilities);

        self.announce_roster(&joined, &peer_id);
        self.spawn_pumps(active, subscriptions);

        if degraded {
            return Ok(());
        }

        cancellable(token, active.transports.ensure_recv()).await?;
        if self.config.consume_existing_producers {
            self.consume_existing(active, joined).await?;
        }

        for kind in [MediaKind::Video, MediaKind::Audio] {
            if let Some(track) = stream.track(kind) {
                cancellable(
                    token,
                    active
                        .producers
                        .publish(track.clone(), MediaTag::for_kind(kind), None),
                )
                .await?;
            }
        }

        Ok(())
    }

    async fn consume_existing(&self, active: &Arc<ActiveSession>, joined: JoinedRoom) -> Result<()> {
        for producer in joined.producers {
            let outcome = cancellable(&active.token, async {
                Ok(active.consumers.on_new_remote_producer(producer).await)
            })
            .await?;
            if let ConsumeOutcome::Failed(e @ SfuError::Transport { .. }) = outcome {
                return Err(e);
            }
        }
        Ok(())
    }

    fn finish(&self, room: &str) -> Result<()> {
        if self.set_state(SessionState::Joined, |s| s == SessionState::Connecting) {
            info!(room, "Session joined");
            return Ok(());
        }
        Err(self
            .last_error
            .lock()
            .clone()
            .unwrap_or(SfuError::SessionClosed))
    }

    /// Record a fatal failure and move to `Error`
    fn fail(&self, token: &CancellationToken, error: SfuError) {
        if token.is_cancelled() {
            debug!(%error, "Ignoring failure after leave");
            return;
        }
        if *self.state.borrow() == SessionState::Error {
            debug!(%error, "Session already failed");
            return;
        }
        error!(class = ?error.class(), %error, "Session failed");
        *self.last_error.lock() = Some(error.clone());
        self.events.on_error(&error);
        self.set_state(SessionState::Error, |s| {
            matches!(s, SessionState::Connecting | SessionState::Joined)
        });
    }

    fn announce_roster(&self, joined: &JoinedRoom, local_peer_id: &str) {
        for peer in joined.peers.iter().filter(|p| p.peer_id != local_peer_id) {
            self.events.on_peer_joined(peer);
        }
    }

    fn subscribe(&self, active: &ActiveSession) -> [Subscription; 4] {
        let subscriptions = events::SESSION_BROADCASTS.map(|event| self.channel.on(event));
        active
            .subscriptions
            .lock()
            .extend(subscriptions.iter().map(|s| s.id));
        subscriptions
    }

    fn spawn_pumps(self: &Arc<Self>, active: &Arc<ActiveSession>, subscriptions: [Subscription; 4]) {
        let mut tasks = Vec::with_capacity(subscriptions.len());

        for subscription in subscriptions {
            let weak = Arc::downgrade(self);
            let session = Arc::downgrade(active);
            let consumers = Arc::clone(&active.consumers);
            let token = active.token.clone();
            let event = subscription.event.clone();

            let task = match event.as_str() {
                events::NEW_PRODUCER => pump(token, subscription, move |payload| {
                    match NewProducer::from_broadcast(payload) {
                        Ok(announcement) => {
                            let Some(session) = session.upgrade() else { return };
                            let consumers = Arc::clone(&consumers);
                            let task = tokio::spawn(async move {
                                consumers.on_new_remote_producer(announcement).await;
                            });
                            let mut tasks = session.tasks.lock();
                            tasks.retain(|task| !task.is_finished());
                            tasks.push(task);
                        }
                        Err(e) => warn!(error = %e, "Dropping malformed announcement"),
                    }
                }),
                events::PRODUCER_CLOSED => pump(token, subscription, move |payload| {
                    match serde_json::from_value::<ProducerClosed>(payload) {
                        Ok(event) => {
                            consumers.close_by_producer_id(&event.producer_id);
                        }
                        Err(e) => warn!(error = %e, "Dropping malformed producer-closed"),
                    }
                }),
                events::PEER_LEFT => pump(token, subscription, move |payload| {
                    match serde_json::from_value::<PeerLeft>(payload) {
                        Ok(event) => {
                            let closed = consumers.peer_left(&event);
                            info!(peer_id = %event.peer_id, closed, "Peer left");
                            if let Some(inner) = weak.upgrade() {
                                inner.events.on_peer_left(&event.peer_id);
                            }
                        }
                        Err(e) => warn!(error = %e, "Dropping malformed peer-left"),
                    }
                }),
                _ => pump(token, subscription, move |payload| {
                    let Some(inner) = weak.upgrade() else { return };
                    match serde_json::from_value::<PeerSummary>(payload) {
                        Ok(peer) if inner.local_peer_id.lock().as_deref() == Some(peer.peer_id.as_str()) => {}
                        Ok(peer) => inner.events.on_peer_joined(&peer),
                        Err(e) => warn!(error = %e, "Dropping malformed peer-joined"),
                    }
                }),
            };
            tasks.push(task);
        }

        active.tasks.lock().extend(tasks);
    }

    fn spawn_channel_watch(self: &Arc<Self>, active: &Arc<ActiveSession>) {
        let weak = Arc::downgrade(self);
        let consumers = Arc::clone(&active.consumers);
        let token = active.token.clone();
        let mut state = self.channel.watch_state();
        state.borrow_and_update();

        let task = tokio::spawn(async move {
            let mut connected = true;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = state.changed() => if changed.is_err() { break },
                }
                let current = state.borrow_and_update().clone();
                let Some(inner) = weak.upgrade() else { break };

                match current {
                    ChannelState::Connected { peer_id } => {
                        info!(%peer_id, "Signaling reconnected");
                        *inner.local_peer_id.lock() = Some(peer_id.clone());
                        consumers.set_local_peer_id(Some(peer_id));
                        if !connected {
                            connected = true;
                            inner.events.on_connected();
                        }
                    }
                    ChannelState::Disconnected | ChannelState::Connecting => {
                        if connected {
                            connected = false;
                            warn!("Signaling disconnected");
                            inner.events.on_disconnected();
                        }
                    }
                    ChannelState::Failed => {
                        if connected {
                            inner.events.on_disconnected();
                        }
                        inner.fail(
                            &token,
                            SfuError::Disconnected("reconnection attempts exhausted".to_string()),
                        );
                        break;
                    }
                }
            }
        });
        active.tasks.lock().push(task);
    }

    fn spawn_fault_watch(self: &Arc<Self>, active: &Arc<ActiveSession>, mut faults: mpsc::UnboundedReceiver<TransportFault>) {
        let weak: Weak<Inner> = Arc::downgrade(self);
        let token = active.token.clone();

        let task = tokio::spawn(async move {
            loop {
                let fault = tokio::select! {
                    _ = token.cancelled() => break,
                    fault = faults.recv() => match fault {
                        Some(fault) => fault,
                        None => break,
                    },
                };
                match weak.upgrade() {
                    Some(inner) => inner.fail(&token, fault.into_error()),
                    None => break,
                }
            }
        });
        active.tasks.lock().push(task);
    }

    async fn leave(&self) {
        let active = self.active.lock().take();

        let Some(active) = active else {
            self.set_state(SessionState::Left, |s| s != SessionState::Left);
            return;
        };

        let room = active.router.room().to_string();
        info!(%room, "Leaving session");
        active.token.cancel();

        for id in active.subscriptions.lock().drain(..) {
            self.channel.off(id);
        }
        for task in active.tasks.lock().drain(..) {
            task.abort();
        }

        active.producers.close_all();
        active.consumers.close_all();
        active.transports.close_all();
        if let Some(stream) = active.local_stream.lock().take() {
            stream.stop();
        }

        if active.in_room.load(Ordering::SeqCst) && self.channel.is_connected() {
            if let Err(e) = active.router.leave(self.config.leave_timeout()).await {
                debug!(%room, error = %e, "Leave notification not acknowledged");
            }
        }
        if self.config.disconnect_on_leave {
            self.channel.disconnect().await;
        }

        self.set_state(SessionState::Left, |_| true);
        info!(%room, "Session left");
    }
}

/// Run `future` unless the session is left first
async fn cancellable<T>(token: &CancellationToken, future: impl Future<Output = Result<T>>) -> Result<T> {
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(SfuError::SessionClosed),
        result = future => result,
    }
}

/// Feed every payload of a subscription to `handle` until cancelled
fn pump<F>(token: CancellationToken, mut subscription: Subscription, mut handle: F) -> JoinHandle<()>
where
    F: FnMut(Value) + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                payload = subscription.recv() => match payload {
                    Some(payload) => handle(payload),
                    None => break,
                },
            }
        }
        debug!(event = %subscription.event, "Broadcast pump stopped");
    })
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use testresult::TestResult;

    use super::*;
    use crate::{
        events::EventRecorder,
        media::{headless::SyntheticMediaSource, MediaConstraints},
        test_helpers::Fixture,
    };

    fn session(fixture: &Fixture, config: SessionConfig) -> (Session, Arc<EventRecorder>) {
        let recorder = Arc::new(EventRecorder::new());
        let session = Session::new(
            fixture.channel.clone(),
            fixture.engine.clone(),
            Arc::new(SyntheticMediaSource::new()),
            recorder.clone(),
            config,
        );
        (session, recorder)
    }

    fn without_media() -> SessionConfig {
        SessionConfig {
            constraints: MediaConstraints {
                audio: false,
                video: None,
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_leave_aborts_broadcast_consume_in_flight() -> TestResult {
        let fixture = Fixture::new("ABCD123");
        let (session, recorder) = session(
            &fixture,
            SessionConfig {
                disconnect_on_leave: false,
                ..without_media()
            },
        );
        session.start("ABCD123", fixture.identity()).await?;
        let consumers = Arc::downgrade(&session.inner.active().ok_or("no active session")?.consumers);

        fixture.router.register_producer("prod-1", MediaKind::Video);
        fixture.router.delay(events::CONSUME, Duration::from_secs(5));
        fixture.channel.broadcast(
            events::NEW_PRODUCER,
            json!({"peerId": "peer-b", "producerId": "prod-1", "kind": "video"}),
        );
        for _ in 0..50 {
            if fixture.router.request_count(events::CONSUME) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(fixture.router.request_count(events::CONSUME), 1);

        session.leave().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(consumers.upgrade().is_none());
        assert!(recorder.new_tracks().is_empty());
        assert_eq!(session.state(), SessionState::Left);
        Ok(())
    }

    #[tokio::test]
    async fn test_first_fatal_error_is_kept() -> TestResult {
        let fixture = Fixture::new("ABCD123");
        let (session, recorder) = session(&fixture, without_media());
        session.start("ABCD123", fixture.identity()).await?;
        let token = session.inner.active().ok_or("no active session")?.token.clone();

        session.inner.fail(&token, SfuError::Engine("first".to_string()));
        session.inner.fail(&token, SfuError::Engine("second".to_string()));

        assert_eq!(session.state(), SessionState::Error);
        assert!(matches!(session.last_error(), Some(SfuError::Engine(ref m)) if m == "first"));
        assert_eq!(recorder.errors().len(), 1);
        Ok(())
    }
}
