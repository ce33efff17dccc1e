// Signaling event names
//
// Request events are sent with an acknowledgement; broadcast events are
// pushed by the router without one.

/// Join a room
pub const JOIN_ROOM: &str = "room:join";
/// Leave a room
pub const LEAVE_ROOM: &str = "room:leave";

/// Inform the router of the local capability set
pub const SET_RTP_CAPABILITIES: &str = "media:set-rtp-capabilities";
/// Request transport parameters for one direction
pub const CREATE_TRANSPORT: &str = "media:create-webrtc-transport";
/// Forward DTLS parameters of a local transport
pub const CONNECT_TRANSPORT: &str = "media:connect-transport";
/// Request a producer identifier for a local track
pub const PRODUCE: &str = "media:produce";
/// Close a previously published producer
pub const CLOSE_PRODUCER: &str = "media:close-producer";
/// Request consumer parameters for a remote producer
pub const CONSUME: &str = "media:consume";
/// Resume a consumer created paused
pub const RESUME_CONSUMER: &str = "media:resume-consumer";

/// A peer joined the room
pub const PEER_JOINED: &str = "room:participant-joined";
/// A peer left the room
pub const PEER_LEFT: &str = "room:participant-left";
/// A remote peer published a producer
pub const NEW_PRODUCER: &str = "room:new-producer";
/// A remote producer was closed
pub const PRODUCER_CLOSED: &str = "room:producer-closed";

/// Broadcast events the session subscribes to while joined
pub const SESSION_BROADCASTS: [&str; 4] = [PEER_JOINED, PEER_LEFT, NEW_PRODUCER, PRODUCER_CLOSED];
