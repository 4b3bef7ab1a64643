//! Protocol profile -- the parameter set every server and eye must agree on.
//!
//! There is no version negotiation on the wire: a frame is a message code
//! followed by a JSON payload, and newer optional fields fall back to their
//! serde defaults. Anything that both ends need to agree on lives here so a
//! future profile can change it in one place.
//!
//! Node-local tuning (bind addresses, thumbnail polling) lives in the node
//! config instead.

/// A named set of ports, timings and size limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProtocolProfile {
    /// Profile identifier. Monotonically increasing.
    pub id: u16,

    // -- Discovery --
    /// UDP port the server listens on for REGISTER_EYE broadcasts.
    pub discovery_port: u16,
    /// Broadcasts an eye sends before reporting discovery failure.
    pub discovery_retry_count: u32,
    /// Seconds an eye waits for a REGISTER_EYE_ACK after each broadcast.
    pub discovery_recv_timeout_secs: u64,
    /// Seconds an eye sleeps after a socket error before retrying.
    pub discovery_error_backoff_secs: u64,

    // -- Port allocation --
    /// First control port handed out by the server.
    pub first_control_port: u16,
    /// Ports consumed per eye: control + data (control + 1).
    pub port_stride: u16,

    // -- Heartbeat --
    /// Seconds to wait for a ping to be written and for its ack.
    pub heartbeat_timeout_secs: u64,
    /// Seconds between successful round-trips (also the grace delay
    /// before the first ping).
    pub heartbeat_interval_secs: u64,

    // -- Transport --
    /// Seconds a queued control message may wait for the transport.
    pub write_timeout_secs: u64,
    /// Maximum encoded frame size (tag + payload).
    pub max_frame_bytes: usize,

    // -- Vision defaults --
    /// Stream resolution and framerate when a peer omits them.
    pub stream_width: u32,
    pub stream_height: u32,
    pub stream_framerate: u32,
    /// Thumbnail size requested by the server's polling loop.
    pub thumbnail_width: u32,
    pub thumbnail_height: u32,
}

impl ProtocolProfile {
    /// Data port paired with a control port.
    pub const fn data_port(&self, control_port: u16) -> u16 {
        control_port + 1
    }

    /// Data port paired with a control port received from a peer; None
    /// when the pair would run past the last port.
    pub const fn checked_data_port(&self, control_port: u16) -> Option<u16> {
        control_port.checked_add(1)
    }
}

/// Profile 0: the ports and timings deployed eyes already use.
pub const PROFILE_0: ProtocolProfile = ProtocolProfile {
    id: 0,

    // Discovery
    discovery_port: 8888,
    discovery_retry_count: 10,
    discovery_recv_timeout_secs: 10,
    discovery_error_backoff_secs: 10,

    // Port allocation
    first_control_port: 8001,
    port_stride: 2,

    // Heartbeat
    heartbeat_timeout_secs: 10,
    heartbeat_interval_secs: 60,

    // Transport
    write_timeout_secs: 10,
    max_frame_bytes: 64 * 1024,

    // Vision defaults
    stream_width: 640,
    stream_height: 480,
    stream_framerate: 24,
    thumbnail_width: 800,
    thumbnail_height: 450,
};
