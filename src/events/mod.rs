// Caller-facing events
//
// This module defines the callback surface the session core drives. The UI
// collaborator implements `SessionEvents`; the core never renders anything.

use parking_lot::Mutex;
use tracing::{error, info, warn};

use crate::{
    consumer::RemoteTile, session::SessionState, signaling::protocol::PeerSummary, ErrorClass,
    PeerId, ProducerId, SfuError,
};

/// Callbacks raised by a session.
///
/// Every method has a no-op default so implementors only override what they
/// render. Callbacks run on the task that observed the event and must not
/// block.
pub trait SessionEvents: Send + Sync {
    /// The signaling channel is connected
    fn on_connected(&self) {}

    /// The signaling channel dropped
    fn on_disconnected(&self) {}

    /// A classified failure; see [`SfuError::class`]
    fn on_error(&self, _error: &SfuError) {}

    /// A remote peer is in the room
    fn on_peer_joined(&self, _peer: &PeerSummary) {}

    /// A remote peer left the room
    fn on_peer_left(&self, _peer_id: &str) {}

    /// A remote track is ready to render
    fn on_new_remote_track(&self, _tile: &RemoteTile) {}

    /// The remote track for a producer is gone
    fn on_remote_track_closed(&self, _producer_id: &str) {}

    /// The session moved to a new state
    fn on_state_changed(&self, _state: SessionState) {}
}

/// Ignores every callback
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl SessionEvents for NoopEvents {}

/// Logs every callback
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingEvents;

impl SessionEvents for TracingEvents {
    fn on_connected(&self) {
        info!("Signaling connected");
    }

    fn on_disconnected(&self) {
        warn!("Signaling disconnected");
    }

    fn on_error(&self, error: &SfuError) {
        match error.class() {
            ErrorClass::TrackFailure | ErrorClass::Degraded | ErrorClass::Transient => {
                warn!(class = ?error.class(), %error, "Session warning")
            }
            class => error!(?class, %error, "Session error"),
        }
    }

    fn on_peer_joined(&self, peer: &PeerSummary) {
        info!(peer_id = %peer.peer_id, user_name = ?peer.user_name, "Peer joined");
    }

    fn on_peer_left(&self, peer_id: &str) {
        info!(peer_id, "Peer left");
    }

    fn on_new_remote_track(&self, tile: &RemoteTile) {
        info!(
            peer_id = %tile.peer_id,
            producer_id = %tile.producer_id,
            consumer_id = %tile.consumer_id,
            kind = %tile.kind,
            "Remote track"
        );
    }

    fn on_remote_track_closed(&self, producer_id: &str) {
        info!(producer_id, "Remote track closed");
    }

    fn on_state_changed(&self, state: SessionState) {
        info!(?state, "Session state changed");
    }
}

/// A recorded callback
#[derive(Debug, Clone)]
pub enum SessionEvent {
    Connected,
    Disconnected,
    Error(SfuError),
    PeerJoined(PeerId),
    PeerLeft(PeerId),
    NewRemoteTrack(RemoteTile),
    RemoteTrackClosed(ProducerId),
    StateChanged(SessionState),
}

/// Records every callback in arrival order
#[derive(Debug, Default)]
pub struct EventRecorder {
    events: Mutex<Vec<SessionEvent>>,
}

impl EventRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything recorded so far
    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().clone()
    }

    /// Tiles delivered through `on_new_remote_track`
    pub fn new_tracks(&self) -> Vec<RemoteTile> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SessionEvent::NewRemoteTrack(tile) => Some(tile.clone()),
                _ => None,
            })
            .collect()
    }

    /// Producers reported through `on_remote_track_closed`
    pub fn closed_tracks(&self) -> Vec<ProducerId> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SessionEvent::RemoteTrackClosed(id) => Some(id.clone()),
                _ => None,
            })
            .collect()
    }

    /// Errors reported through `on_error`
    pub fn errors(&self) -> Vec<SfuError> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SessionEvent::Error(error) => Some(error.clone()),
                _ => None,
            })
            .collect()
    }

    /// States reported through `on_state_changed`
    pub fn states(&self) -> Vec<SessionState> {
        self.events
            .lock()
            .iter()
            .filter_map(|event| match event {
                SessionEvent::StateChanged(state) => Some(*state),
                _ => None,
            })
            .collect()
    }

    /// Number of recorded callbacks matching `predicate`
    pub fn count(&self, predicate: impl Fn(&SessionEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|event| predicate(event)).count()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    fn push(&self, event: SessionEvent) {
        self.events.lock().push(event);
    }
}

impl SessionEvents for EventRecorder {
    fn on_connected(&self) {
        self.push(SessionEvent::Connected);
    }

    fn on_disconnected(&self) {
        self.push(SessionEvent::Disconnected);
    }

    fn on_error(&self, error: &SfuError) {
        self.push(SessionEvent::Error(error.clone()));
    }

    fn on_peer_joined(&self, peer: &PeerSummary) {
        self.push(SessionEvent::PeerJoined(peer.peer_id.clone()));
    }

    fn on_peer_left(&self, peer_id: &str) {
        self.push(SessionEvent::PeerLeft(peer_id.to_string()));
    }

    fn on_new_remote_track(&self, tile: &RemoteTile) {
        self.push(SessionEvent::NewRemoteTrack(tile.clone()));
    }

    fn on_remote_track_closed(&self, producer_id: &str) {
        self.push(SessionEvent::RemoteTrackClosed(producer_id.to_string()));
    }

    fn on_state_changed(&self, state: SessionState) {
        self.push(SessionEvent::StateChanged(state));
    }
}
