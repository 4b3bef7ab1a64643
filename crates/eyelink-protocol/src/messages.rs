//! Wire message types.
//!
//! Field names are PascalCase on the wire so existing eyes and servers
//! can decode them unchanged. Fields added after the first release carry
//! serde defaults; an older peer simply omits them.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::{ProtocolError, PROFILE_0};

/// One-byte message code leading every frame. Never renumber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageCode {
    None = 0,
    RegisterEye = 1,
    RegisterEyeAck = 2,
    RequestStream = 3,
    Heartbeat = 4,
    HeartbeatAck = 5,
    DeregisterEye = 6,
    RequestPicture = 7,
    VisionReady = 8,
}

impl MessageCode {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            MessageCode::None => "NONE",
            MessageCode::RegisterEye => "REGISTER_EYE",
            MessageCode::RegisterEyeAck => "REGISTER_EYE_ACK",
            MessageCode::RequestStream => "REQUEST_STREAM",
            MessageCode::Heartbeat => "HEARTBEAT",
            MessageCode::HeartbeatAck => "HEARTBEAT_ACK",
            MessageCode::DeregisterEye => "DEREGISTER_EYE",
            MessageCode::RequestPicture => "REQUEST_PICTURE",
            MessageCode::VisionReady => "VISION_READY",
        }
    }
}

impl TryFrom<u8> for MessageCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => MessageCode::None,
            1 => MessageCode::RegisterEye,
            2 => MessageCode::RegisterEyeAck,
            3 => MessageCode::RequestStream,
            4 => MessageCode::Heartbeat,
            5 => MessageCode::HeartbeatAck,
            6 => MessageCode::DeregisterEye,
            7 => MessageCode::RequestPicture,
            8 => MessageCode::VisionReady,
            other => return Err(ProtocolError::UnknownCode(other)),
        })
    }
}

/// A message body with a fixed code.
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const CODE: MessageCode;

    fn into_message(self) -> Message;
}

/// Kind of media an eye was asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum VisionRequestType {
    #[default]
    None,
    Stream,
    Picture,
}

impl VisionRequestType {
    pub fn name(self) -> &'static str {
        match self {
            VisionRequestType::None => "none",
            VisionRequestType::Stream => "stream",
            VisionRequestType::Picture => "picture",
        }
    }
}

impl From<VisionRequestType> for u8 {
    fn from(value: VisionRequestType) -> Self {
        match value {
            VisionRequestType::None => 0,
            VisionRequestType::Stream => 1,
            VisionRequestType::Picture => 2,
        }
    }
}

impl TryFrom<u8> for VisionRequestType {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(VisionRequestType::None),
            1 => Ok(VisionRequestType::Stream),
            2 => Ok(VisionRequestType::Picture),
            other => Err(format!("unknown vision request type {other}")),
        }
    }
}

// ============================================================================
// Registration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegisterEye {
    pub eye_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RegisterEyeAck {
    /// Control port allocated to the eye; data port is `port + 1`.
    pub port: u16,
    /// Address the eye should connect its control channel to.
    pub ip: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DeregisterEye {
    pub eye_name: String,
}

// ============================================================================
// Heartbeat
// ============================================================================

/// Liveness ping. `seq` of 0 means the sender does not number its pings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Heartbeat {
    #[serde(default)]
    pub seq: u64,
}

/// Answer to a ping, echoing its `seq`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct HeartbeatAck {
    #[serde(default)]
    pub seq: u64,
}

// ============================================================================
// Vision requests
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestStream {
    /// Stream length in seconds.
    pub stream_length: f32,
    /// Server data port the eye should stream to.
    pub port: u16,
    #[serde(default = "default_stream_width")]
    pub video_width: u32,
    #[serde(default = "default_stream_height")]
    pub video_height: u32,
    #[serde(default = "default_framerate")]
    pub framerate: u32,
}

impl RequestStream {
    /// Stream request at the default resolution.
    pub fn new(stream_length: f32, port: u16) -> Self {
        Self {
            stream_length,
            port,
            video_width: default_stream_width(),
            video_height: default_stream_height(),
            framerate: default_framerate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct RequestPicture {
    pub port: u16,
    pub picture_width: u32,
    pub picture_height: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct VisionReady {
    pub request_type: VisionRequestType,
}

fn default_stream_width() -> u32 {
    PROFILE_0.stream_width
}
fn default_stream_height() -> u32 {
    PROFILE_0.stream_height
}
fn default_framerate() -> u32 {
    PROFILE_0.stream_framerate
}

// ============================================================================
// Message enum
// ============================================================================

/// Every message that can travel in a frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    RegisterEye(RegisterEye),
    RegisterEyeAck(RegisterEyeAck),
    RequestStream(RequestStream),
    Heartbeat(Heartbeat),
    HeartbeatAck(HeartbeatAck),
    DeregisterEye(DeregisterEye),
    RequestPicture(RequestPicture),
    VisionReady(VisionReady),
}

impl Message {
    pub fn code(&self) -> MessageCode {
        match self {
            Message::RegisterEye(_) => MessageCode::RegisterEye,
            Message::RegisterEyeAck(_) => MessageCode::RegisterEyeAck,
            Message::RequestStream(_) => MessageCode::RequestStream,
            Message::Heartbeat(_) => MessageCode::Heartbeat,
            Message::HeartbeatAck(_) => MessageCode::HeartbeatAck,
            Message::DeregisterEye(_) => MessageCode::DeregisterEye,
            Message::RequestPicture(_) => MessageCode::RequestPicture,
            Message::VisionReady(_) => MessageCode::VisionReady,
        }
    }

    /// Reject field values JSON cannot carry. serde_json writes a
    /// non-finite float as `null`, which no peer can decode.
    pub fn validate(&self) -> Result<(), ProtocolError> {
        if let Message::RequestStream(m) = self {
            if !m.stream_length.is_finite() {
                return Err(ProtocolError::InvalidField {
                    code: MessageCode::RequestStream,
                    field: "StreamLength",
                    reason: "not a finite number",
                });
            }
        }
        Ok(())
    }

    /// Serialize the payload only (no code byte).
    pub fn payload_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Message::RegisterEye(m) => serde_json::to_vec(m),
            Message::RegisterEyeAck(m) => serde_json::to_vec(m),
            Message::RequestStream(m) => serde_json::to_vec(m),
            Message::Heartbeat(m) => serde_json::to_vec(m),
            Message::HeartbeatAck(m) => serde_json::to_vec(m),
            Message::DeregisterEye(m) => serde_json::to_vec(m),
            Message::RequestPicture(m) => serde_json::to_vec(m),
            Message::VisionReady(m) => serde_json::to_vec(m),
        }
    }
}

macro_rules! impl_payload {
    ($($ty:ident),* $(,)?) => {
        $(
            impl Payload for $ty {
                const CODE: MessageCode = MessageCode::$ty;

                fn into_message(self) -> Message {
                    Message::$ty(self)
                }
            }

            impl From<$ty> for Message {
                fn from(value: $ty) -> Self {
                    Message::$ty(value)
                }
            }
        )*
    };
}

impl_payload!(
    RegisterEye,
    RegisterEyeAck,
    RequestStream,
    Heartbeat,
    HeartbeatAck,
    DeregisterEye,
    RequestPicture,
    VisionReady,
);
