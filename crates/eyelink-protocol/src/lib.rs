//! Eyelink Protocol -- wire types, frame codec, protocol defaults.
//!
//! One frame = 1-byte message code + UTF-8 JSON payload.
//! UDP discovery carries one bare frame per datagram; TCP control channels
//! wrap each frame in a 4-byte big-endian length prefix.

pub mod codec;
pub mod messages;
pub mod profile;

pub use codec::{deserialize_payload, encode, Frame, FrameCodec};
pub use messages::*;
pub use profile::{ProtocolProfile, PROFILE_0};

/// Maximum encoded frame size (tag + payload).
pub const MAX_FRAME_BYTES: usize = PROFILE_0.max_frame_bytes;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    MalformedFrame(&'static str),
    #[error("{code:?} field {field} cannot be encoded: {reason}")]
    InvalidField {
        code: MessageCode,
        field: &'static str,
        reason: &'static str,
    },
    #[error("unknown message code {0}")]
    UnknownCode(u8),
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },
    #[error("payload for {code:?} does not match its schema: {source}")]
    Decode {
        code: MessageCode,
        #[source]
        source: serde_json::Error,
    },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
