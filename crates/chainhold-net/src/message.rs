//! Wire protocol messages exchanged between peers (postcard-serialized).

use crate::framing::{Frame, FrameError, FrameType};
use crate::peer::PeerInfo;
use chainhold_core::{ChainSummary, GossipItem, Header, ValidationPackage};
use serde::{Deserialize, Serialize};

/// Application-level message
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    /// Liveness check
    Ping,
    /// Liveness reply
    Pong,
    /// Unsolicited items the sender believes the receiver may lack
    GossipPush { items: Vec<GossipItem> },
    /// Anti-entropy pull: "here is what I hold, send what I'm missing"
    PullRequest {
        summary: Vec<ChainSummary>,
        max_items: u32,
    },
    /// Reply to a pull
    PullResponse {
        items: Vec<GossipItem>,
        has_more: bool,
    },
    /// Ask the author of `header` for its validation package
    PackageRequest { header: Header },
    /// Reply to a package request; None if the responder cannot build it
    PackageResponse { package: Option<ValidationPackage> },
}

impl WireMessage {
    /// Short name for logging
    pub fn kind(&self) -> &'static str {
        match self {
            WireMessage::Ping => "ping",
            WireMessage::Pong => "pong",
            WireMessage::GossipPush { .. } => "gossip_push",
            WireMessage::PullRequest { .. } => "pull_request",
            WireMessage::PullResponse { .. } => "pull_response",
            WireMessage::PackageRequest { .. } => "package_request",
            WireMessage::PackageResponse { .. } => "package_response",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, FrameError> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FrameError> {
        Ok(postcard::from_bytes(bytes)?)
    }

    /// One-way frame
    pub fn to_oneway_frame(&self) -> Result<Frame, FrameError> {
        Ok(Frame::new(FrameType::Oneway, self.encode()?))
    }

    /// Request frame tagged with `request_id`
    pub fn to_request_frame(&self, request_id: u64) -> Result<Frame, FrameError> {
        Ok(Frame::correlated(FrameType::Request, request_id, &self.encode()?))
    }

    /// Response frame answering `request_id`
    pub fn to_response_frame(&self, request_id: u64) -> Result<Frame, FrameError> {
        Ok(Frame::correlated(FrameType::Response, request_id, &self.encode()?))
    }
}

/// Handshake frame announcing ourselves
pub fn hello_frame(info: &PeerInfo) -> Result<Frame, FrameError> {
    Ok(Frame::new(FrameType::Hello, postcard::to_allocvec(info)?))
}

/// Parse a handshake frame
pub fn parse_hello(frame: &Frame) -> Result<PeerInfo, FrameError> {
    if frame.frame_type != FrameType::Hello {
        return Err(FrameError::Serialization(format!(
            "expected hello, got {:?}",
            frame.frame_type
        )));
    }
    Ok(postcard::from_bytes(&frame.payload)?)
}
