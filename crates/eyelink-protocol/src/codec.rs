//! Frame encoding and the length-delimited stream codec.
//!
//! Frame: 1-byte message code + UTF-8 JSON payload.
//! Stream framing: 4-byte big-endian length prefix + frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::messages::{Message, MessageCode, Payload};
use crate::{ProtocolError, MAX_FRAME_BYTES};

/// Length prefix size in bytes.
const LENGTH_PREFIX_SIZE: usize = 4;

/// A frame split into its code byte and still-encoded payload.
///
/// Receivers only look at the code; the payload is decoded later and only
/// if somebody is interested in that message type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub code: u8,
    pub payload: Bytes,
}

impl Frame {
    /// Split raw frame bytes. Fails only when there is no code byte.
    pub fn parse(data: &[u8]) -> Result<Self, ProtocolError> {
        Self::from_bytes(Bytes::copy_from_slice(data))
    }

    /// Zero-copy variant of [`Frame::parse`].
    pub fn from_bytes(mut data: Bytes) -> Result<Self, ProtocolError> {
        if data.is_empty() {
            return Err(ProtocolError::MalformedFrame("empty frame"));
        }
        let code = data.get_u8();
        Ok(Self {
            code,
            payload: data,
        })
    }

    pub fn message_code(&self) -> Result<MessageCode, ProtocolError> {
        MessageCode::try_from(self.code)
    }

    /// Decode the payload as `T`, regardless of the code byte.
    pub fn payload_as<T: Payload>(&self) -> Result<T, ProtocolError> {
        deserialize_payload(&self.payload)
    }

    /// Decode the payload according to the code byte.
    pub fn into_message(self) -> Result<Message, ProtocolError> {
        use crate::messages::*;

        let msg = match self.message_code()? {
            MessageCode::None => return Err(ProtocolError::UnknownCode(0)),
            MessageCode::RegisterEye => Message::RegisterEye(self.payload_as::<RegisterEye>()?),
            MessageCode::RegisterEyeAck => {
                Message::RegisterEyeAck(self.payload_as::<RegisterEyeAck>()?)
            }
            MessageCode::RequestStream => {
                Message::RequestStream(self.payload_as::<RequestStream>()?)
            }
            MessageCode::Heartbeat => Message::Heartbeat(self.payload_as::<Heartbeat>()?),
            MessageCode::HeartbeatAck => Message::HeartbeatAck(self.payload_as::<HeartbeatAck>()?),
            MessageCode::DeregisterEye => {
                Message::DeregisterEye(self.payload_as::<DeregisterEye>()?)
            }
            MessageCode::RequestPicture => {
                Message::RequestPicture(self.payload_as::<RequestPicture>()?)
            }
            MessageCode::VisionReady => Message::VisionReady(self.payload_as::<VisionReady>()?),
        };
        Ok(msg)
    }
}

/// Encode a message as `code ++ json`.
pub fn encode(message: &Message) -> Result<Bytes, ProtocolError> {
    message.validate()?;
    let payload = message.payload_json()?;
    let size = payload.len() + 1;
    if size > MAX_FRAME_BYTES {
        return Err(ProtocolError::FrameTooLarge {
            size,
            max: MAX_FRAME_BYTES,
        });
    }

    let mut buf = BytesMut::with_capacity(size);
    buf.put_u8(message.code().as_u8());
    buf.extend_from_slice(&payload);
    Ok(buf.freeze())
}

/// Decode a payload against `T`'s schema.
pub fn deserialize_payload<T: Payload>(payload: &[u8]) -> Result<T, ProtocolError> {
    serde_json::from_slice(payload).map_err(|source| ProtocolError::Decode {
        code: T::CODE,
        source,
    })
}

impl Message {
    /// Decode a complete frame (code + payload) into a message.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        Frame::parse(data)?.into_message()
    }

    pub fn encode(&self) -> Result<Bytes, ProtocolError> {
        encode(self)
    }
}

/// Length-delimited framing for control channels.
///
/// Yields raw frame bodies rather than parsed frames: a frame with a bad
/// code or payload must not poison the stream, so parsing happens in the
/// receive loop. Only an oversized length prefix is a stream error, since
/// there is no way to resynchronise after it.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    max_frame_bytes: usize,
}

impl FrameCodec {
    pub fn new() -> Self {
        Self::with_max_frame_bytes(MAX_FRAME_BYTES)
    }

    pub fn with_max_frame_bytes(max_frame_bytes: usize) -> Self {
        Self { max_frame_bytes }
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least the length prefix
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > self.max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                size: length,
                max: self.max_frame_bytes,
            });
        }

        let total = LENGTH_PREFIX_SIZE + length;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_bytes {
            return Err(ProtocolError::FrameTooLarge {
                size: item.len(),
                max: self.max_frame_bytes,
            });
        }

        dst.reserve(LENGTH_PREFIX_SIZE + item.len());
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::*;
    use proptest::prelude::*;

    #[test]
    fn test_encode_layout() {
        let msg = Message::RegisterEye(RegisterEye {
            eye_name: "cam1".into(),
        });
        let bytes = encode(&msg).unwrap();
        assert_eq!(bytes[0], 1);
        assert_eq!(&bytes[1..], br#"{"EyeName":"cam1"}"#);
    }

    #[test]
    fn test_empty_frame_is_malformed() {
        assert!(matches!(
            Frame::parse(&[]),
            Err(ProtocolError::MalformedFrame(_))
        ));
    }

    #[test]
    fn test_code_only_frame_parses_but_payload_fails() {
        let frame = Frame::parse(&[4]).unwrap();
        assert_eq!(frame.message_code().unwrap(), MessageCode::Heartbeat);
        assert!(frame.payload.is_empty());
        assert!(matches!(
            frame.payload_as::<Heartbeat>(),
            Err(ProtocolError::Decode {
                code: MessageCode::Heartbeat,
                ..
            })
        ));
    }

    #[test]
    fn test_type_mismatch_is_decode_error() {
        let mut data = vec![MessageCode::RegisterEyeAck.as_u8()];
        data.extend_from_slice(br#"{"Port":"not a number","Ip":"10.0.0.1"}"#);
        let err = Message::decode(&data).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::Decode {
                code: MessageCode::RegisterEyeAck,
                ..
            }
        ));
    }

    #[test]
    fn test_unknown_code_rejected_by_full_decode() {
        assert!(matches!(
            Message::decode(&[42, b'{', b'}']),
            Err(ProtocolError::UnknownCode(42))
        ));
        assert!(matches!(
            Message::decode(&[0, b'{', b'}']),
            Err(ProtocolError::UnknownCode(0))
        ));
    }

    #[test]
    fn test_non_finite_stream_length_not_encoded() {
        for length in [f32::NAN, f32::INFINITY, f32::NEG_INFINITY] {
            let msg = Message::RequestStream(RequestStream::new(length, 8002));
            assert!(matches!(
                encode(&msg),
                Err(ProtocolError::InvalidField {
                    code: MessageCode::RequestStream,
                    field: "StreamLength",
                    ..
                })
            ));
        }
    }

    #[test]
    fn test_extreme_finite_stream_length_roundtrips() {
        for length in [f32::MAX, f32::MIN, f32::MIN_POSITIVE, -0.0, 1.0e-45] {
            let msg = Message::RequestStream(RequestStream::new(length, 8002));
            let decoded = Message::decode(&encode(&msg).unwrap()).unwrap();
            match decoded {
                Message::RequestStream(r) => {
                    assert_eq!(r.stream_length.to_bits(), length.to_bits())
                }
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    #[test]
    fn test_stream_codec_roundtrip() {
        let mut codec = FrameCodec::new();
        let frame = encode(&Message::Heartbeat(Heartbeat { seq: 7 })).unwrap();

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();
        assert_eq!(buf.len(), frame.len() + LENGTH_PREFIX_SIZE);

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded, frame);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_stream_codec_partial_frame() {
        let mut codec = FrameCodec::new();
        let frame = encode(&Message::DeregisterEye(DeregisterEye {
            eye_name: "cam1".into(),
        }))
        .unwrap();

        let mut buf = BytesMut::new();
        codec.encode(frame, &mut buf).unwrap();

        let half = buf.len() / 2;
        let mut partial = buf.split_to(half);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        assert!(codec.decode(&mut partial).unwrap().is_some());
    }

    #[test]
    fn test_stream_codec_yields_empty_body() {
        // A zero-length frame is handed up for the receive loop to reject
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(0);
        let body = codec.decode(&mut buf).unwrap().unwrap();
        assert!(body.is_empty());
    }

    #[test]
    fn test_oversized_frame_rejected() {
        let mut codec = FrameCodec::with_max_frame_bytes(16);
        let mut buf = BytesMut::new();
        buf.put_u32(17);
        buf.extend_from_slice(&[0u8; 17]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(ProtocolError::FrameTooLarge { size: 17, max: 16 })
        ));
    }

    fn arb_request_type() -> impl Strategy<Value = VisionRequestType> {
        prop_oneof![
            Just(VisionRequestType::None),
            Just(VisionRequestType::Stream),
            Just(VisionRequestType::Picture),
        ]
    }

    fn finite_f32() -> impl Strategy<Value = f32> {
        any::<u32>()
            .prop_map(f32::from_bits)
            .prop_filter("finite", |v| v.is_finite())
    }

    fn arb_message() -> impl Strategy<Value = Message> {
        prop_oneof![
            ".{0,32}".prop_map(|eye_name| Message::RegisterEye(RegisterEye { eye_name })),
            (any::<u16>(), "[0-9.]{1,15}")
                .prop_map(|(port, ip)| Message::RegisterEyeAck(RegisterEyeAck { port, ip })),
            (finite_f32(), any::<u16>(), any::<u32>(), any::<u32>(), 1u32..120).prop_map(
                |(stream_length, port, video_width, video_height, framerate)| {
                    Message::RequestStream(RequestStream {
                        stream_length,
                        port,
                        video_width,
                        video_height,
                        framerate,
                    })
                }
            ),
            any::<u64>().prop_map(|seq| Message::Heartbeat(Heartbeat { seq })),
            any::<u64>().prop_map(|seq| Message::HeartbeatAck(HeartbeatAck { seq })),
            ".{0,32}".prop_map(|eye_name| Message::DeregisterEye(DeregisterEye { eye_name })),
            (any::<u16>(), any::<u32>(), any::<u32>()).prop_map(
                |(port, picture_width, picture_height)| {
                    Message::RequestPicture(RequestPicture {
                        port,
                        picture_width,
                        picture_height,
                    })
                }
            ),
            arb_request_type()
                .prop_map(|request_type| Message::VisionReady(VisionReady { request_type })),
        ]
    }

    proptest! {
        #[test]
        fn prop_decode_inverts_encode(msg in arb_message()) {
            let bytes = encode(&msg).unwrap();
            prop_assert_eq!(bytes[0], msg.code().as_u8());
            let decoded = Message::decode(&bytes).unwrap();
            prop_assert_eq!(decoded, msg);
        }
    }
}
