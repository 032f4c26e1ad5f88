//! Message framing for network transport
//!
//! Provides length-prefixed framing with a one-byte frame type.

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Maximum frame size (16 MB)
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Framing errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("Frame too large: {0} bytes (max {MAX_FRAME_SIZE})")]
    TooLarge(usize),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<postcard::Error> for FrameError {
    fn from(e: postcard::Error) -> Self {
        FrameError::Serialization(e.to_string())
    }
}

/// A framed message
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    /// Frame type
    pub frame_type: FrameType,
    /// Payload bytes
    pub payload: Vec<u8>,
}

/// Frame types
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Ping for keepalive
    Ping = 0,
    /// Pong response
    Pong = 1,
    /// Handshake carrying the sender's PeerInfo
    Hello = 2,
    /// Orderly disconnect
    Goodbye = 3,
    /// One-way message, no reply expected
    Oneway = 10,
    /// Request; payload starts with an 8-byte request id
    Request = 11,
    /// Response; payload starts with the request id it answers
    Response = 12,
}

impl TryFrom<u8> for FrameType {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Ping),
            1 => Ok(Self::Pong),
            2 => Ok(Self::Hello),
            3 => Ok(Self::Goodbye),
            10 => Ok(Self::Oneway),
            11 => Ok(Self::Request),
            12 => Ok(Self::Response),
            _ => Err(FrameError::Serialization(format!("Unknown frame type: {}", value))),
        }
    }
}

/// Codec for length-prefixed frames
///
/// Wire format:
/// - 4 bytes: length (big-endian, includes type byte)
/// - 1 byte: frame type
/// - N bytes: payload
#[derive(Debug, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// Create a new codec
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        // Need at least 5 bytes (4 length + 1 type)
        if src.len() < 5 {
            return Ok(None);
        }

        // Peek at length
        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }
        if length == 0 {
            return Err(FrameError::Serialization("zero-length frame".into()));
        }

        // Need full frame
        if src.len() < 4 + length {
            src.reserve(4 + length - src.len());
            return Ok(None);
        }

        src.advance(4);
        let frame_type = FrameType::try_from(src[0])?;
        src.advance(1);

        let payload = src.split_to(length - 1).to_vec();

        Ok(Some(Frame { frame_type, payload }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let length = 1 + item.payload.len();
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge(length));
        }

        dst.reserve(4 + length);
        dst.put_u32(length as u32);
        dst.put_u8(item.frame_type as u8);
        dst.put_slice(&item.payload);

        Ok(())
    }
}

impl Frame {
    /// Create a new frame
    pub fn new(frame_type: FrameType, payload: Vec<u8>) -> Self {
        Self { frame_type, payload }
    }

    /// Create a ping frame
    pub fn ping() -> Self {
        Self::new(FrameType::Ping, vec![])
    }

    /// Create a pong frame
    pub fn pong() -> Self {
        Self::new(FrameType::Pong, vec![])
    }

    /// Create a goodbye frame
    pub fn goodbye() -> Self {
        Self::new(FrameType::Goodbye, vec![])
    }

    /// Frame with a request id prefix followed by `body`
    pub fn correlated(frame_type: FrameType, request_id: u64, body: &[u8]) -> Self {
        let mut payload = Vec::with_capacity(8 + body.len());
        payload.extend_from_slice(&request_id.to_be_bytes());
        payload.extend_from_slice(body);
        Self::new(frame_type, payload)
    }

    /// Split a correlated payload into (request id, body)
    pub fn split_correlated(&self) -> Result<(u64, &[u8]), FrameError> {
        if self.payload.len() < 8 {
            return Err(FrameError::Serialization("missing request id".into()));
        }
        let (id, body) = self.payload.split_at(8);
        let mut id_bytes = [0u8; 8];
        id_bytes.copy_from_slice(id);
        Ok((u64::from_be_bytes(id_bytes), body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_frame_waits_for_more() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec
            .encode(Frame::new(FrameType::Oneway, vec![9; 32]), &mut buf)
            .unwrap();

        let mut partial = buf.split_to(10);
        assert!(codec.decode(&mut partial).unwrap().is_none());

        partial.unsplit(buf);
        let frame = codec.decode(&mut partial).unwrap().unwrap();
        assert_eq!(frame.payload, vec![9; 32]);
        assert!(partial.is_empty());
    }

    #[test]
    fn test_two_frames_in_one_buffer() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(Frame::ping(), &mut buf).unwrap();
        codec.encode(Frame::goodbye(), &mut buf).unwrap();

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().frame_type, FrameType::Ping);
        assert_eq!(
            codec.decode(&mut buf).unwrap().unwrap().frame_type,
            FrameType::Goodbye
        );
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32((MAX_FRAME_SIZE + 1) as u32);
        buf.put_u8(0);
        assert!(matches!(codec.decode(&mut buf), Err(FrameError::TooLarge(_))));
    }

    #[test]
    fn test_unknown_frame_type_rejected() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(99);
        assert!(codec.decode(&mut buf).is_err());
    }

    #[test]
    fn test_correlated_payload() {
        let frame = Frame::correlated(FrameType::Request, 77, b"body");
        let (id, body) = frame.split_correlated().unwrap();
        assert_eq!(id, 77);
        assert_eq!(body, b"body");

        let short = Frame::new(FrameType::Response, vec![1, 2]);
        assert!(short.split_correlated().is_err());
    }
}
