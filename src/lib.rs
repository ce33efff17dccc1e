// Client-side SFU session core
//
// This library negotiates send/receive transports with a remote SFU router,
// publishes local tracks as producers, consumes remote producers exactly once
// and tracks peer lifecycle events delivered over a signaling channel.

pub mod capabilities;
pub mod consumer;
pub mod events;
pub mod media;
pub mod producer;
pub mod session;
pub mod signaling;
pub mod simulcast;
pub mod transport;

#[cfg(test)]
pub(crate) mod test_helpers;

/// Identifier of a remote or local peer, assigned by the signaling channel
pub type PeerId = String;
/// Identifier of a producer, assigned by the router
pub type ProducerId = String;
/// Identifier of a consumer, assigned by the router
pub type ConsumerId = String;
/// Identifier of a transport, assigned by the router
pub type TransportId = String;
/// Room code a session joins
pub type RoomCode = String;

/// Error types for the session core
pub mod error {
    use std::time::Duration;

    use serde_json::Value;
    use thiserror::Error;

    use crate::{transport::Direction, ProducerId};

    #[derive(Error, Debug, Clone)]
    pub enum SfuError {
        #[error("Ack timed out for {event} after {after:?}")]
        Timeout { event: String, after: Duration },

        #[error("Signaling channel disconnected: {0}")]
        Disconnected(String),

        #[error("Router rejected {event}: {message}")]
        AckError {
            event: String,
            message: String,
            reply: Value,
        },

        #[error("Room not found: {0}")]
        RoomNotFound(String),

        #[error("Room is not available: {0}")]
        RoomNotAvailable(String),

        #[error("Authentication required")]
        AuthRequired,

        #[error("Join rejected: {0}")]
        JoinRejected(String),

        #[error("Media access denied: {0}")]
        MediaDenied(String),

        #[error("Failed to consume producer {producer_id}: {source}")]
        Consume {
            producer_id: ProducerId,
            source: Box<SfuError>,
        },

        #[error("{direction} transport error: {reason}")]
        Transport { direction: Direction, reason: String },

        #[error("Media capabilities unavailable: {0}")]
        CapabilitiesUnavailable(String),

        #[error("Media engine error: {0}")]
        Engine(String),

        #[error("Protocol error: {0}")]
        Protocol(String),

        #[error("Session closed")]
        SessionClosed,

        #[error("Invalid state: {0}")]
        InvalidState(String),

        #[error("Invalid configuration: {0}")]
        Config(String),
    }

    /// What a caller should offer the user for a given failure
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ErrorClass {
        /// Transient; a retry may succeed
        Transient,
        /// The router refused the request as made
        Rejected,
        /// The room cannot be joined
        RoomUnavailable,
        /// The caller must authenticate again
        ReauthRequired,
        /// Local capture was refused
        MediaPermission,
        /// A single remote track failed; the session continues
        TrackFailure,
        /// The session continues without the ability to produce or consume
        Degraded,
        /// The session is unusable and must be left and restarted
        Fatal,
    }

    impl SfuError {
        /// Classify the error for the caller-facing surface
        pub fn class(&self) -> ErrorClass {
            match self {
                SfuError::Timeout { .. } | SfuError::Disconnected(_) => ErrorClass::Transient,
                SfuError::AckError { .. } | SfuError::JoinRejected(_) => ErrorClass::Rejected,
                SfuError::RoomNotFound(_) | SfuError::RoomNotAvailable(_) => {
                    ErrorClass::RoomUnavailable
                }
                SfuError::AuthRequired => ErrorClass::ReauthRequired,
                SfuError::MediaDenied(_) => ErrorClass::MediaPermission,
                SfuError::Consume { .. } => ErrorClass::TrackFailure,
                SfuError::CapabilitiesUnavailable(_) => ErrorClass::Degraded,
                SfuError::Transport { .. }
                | SfuError::Engine(_)
                | SfuError::Protocol(_)
                | SfuError::SessionClosed
                | SfuError::InvalidState(_)
                | SfuError::Config(_) => ErrorClass::Fatal,
            }
        }

        /// Whether retrying the same operation later can succeed
        pub fn is_retryable(&self) -> bool {
            self.class() == ErrorClass::Transient
        }

        pub(crate) fn protocol(event: &str, err: serde_json::Error) -> Self {
            SfuError::Protocol(format!("Malformed payload for {}: {}", event, err))
        }
    }

    pub type Result<T> = std::result::Result<T, SfuError>;
}

pub use error::{ErrorClass, Result, SfuError};
pub use session::{Session, SessionConfig, SessionState};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Initialize logging for the session core
pub fn init_logging() {
    use tracing_subscriber::{fmt, EnvFilter};

    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(true)
        .init();
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn test_error_classification() {
        let timeout = SfuError::Timeout {
            event: "media:consume".to_string(),
            after: Duration::from_secs(8),
        };
        assert_eq!(timeout.class(), ErrorClass::Transient);
        assert!(timeout.is_retryable());

        let rejected = SfuError::AckError {
            event: "media:consume".to_string(),
            message: "no such producer".to_string(),
            reply: serde_json::Value::Null,
        };
        assert_eq!(rejected.class(), ErrorClass::Rejected);
        assert!(!rejected.is_retryable());

        assert_eq!(SfuError::AuthRequired.class(), ErrorClass::ReauthRequired);
        assert_eq!(
            SfuError::RoomNotFound("ABCD123".to_string()).class(),
            ErrorClass::RoomUnavailable
        );
        assert_eq!(
            SfuError::MediaDenied("camera".to_string()).class(),
            ErrorClass::MediaPermission
        );
    }

    #[test]
    fn test_consume_error_is_track_scoped() {
        let err = SfuError::Consume {
            producer_id: "p1".to_string(),
            source: Box::new(SfuError::Disconnected("socket closed".to_string())),
        };
        assert_eq!(err.class(), ErrorClass::TrackFailure);
        assert!(err.to_string().contains("p1"));
    }
}
