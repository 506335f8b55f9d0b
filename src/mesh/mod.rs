//! # Mesh Transport Primitives
//!
//! Frame vocabulary and link abstraction for the metering mesh. Two
//! transports implement [`MeshLink`]: a UDP backend ([`udp`], multicast for
//! discover probes, unicast for everything else) and an in-process hub
//! ([`loopback`]) used by tests and single-box demos.
//!
//! A link delivers [`MeshEvent`]s on an unbounded channel: decoded frames
//! plus attachment changes. Sends are fire-and-forget; reliability above
//! datagram level (request acknowledgement, chunk retry) is the agent's job.

pub mod loopback;
pub mod udp;

use std::fmt;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::modem::DeviceState;

/// 32-bit mesh address. `0xffffffff` addresses every attached node.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeAddr(pub u32);

impl NodeAddr {
    pub const BROADCAST: NodeAddr = NodeAddr(0xffff_ffff);

    pub fn is_broadcast(self) -> bool {
        self == NodeAddr::BROADCAST
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

impl fmt::Debug for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:08x}", self.0)
    }
}

/// Commands a peer can ask of our metering resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeterCommand {
    /// "Who is out there?" — multicast, never answered directly; peers come
    /// back with a [`MeterCommand::ReportState`] request of their own.
    Discover,
    /// "My modem is in this state."
    ReportState(DeviceState),
    /// "Please receive my measurement and publish it."
    UploadMeasurement,
}

impl MeterCommand {
    pub fn name(&self) -> &'static str {
        match self {
            MeterCommand::Discover => "discover",
            MeterCommand::ReportState(_) => "report-state",
            MeterCommand::UploadMeasurement => "upload-measurement",
        }
    }
}

/// Response codes for negotiation requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MeshCode {
    /// Request accepted.
    Changed,
    /// Receiver is already serving an upload.
    ServiceUnavailable,
}

/// Receiver's verdict on one transferred chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockDisposition {
    Accepted,
    /// Transient condition; resend the same chunk.
    Retry,
    /// Chunk cannot fit the receiver's publish path; fatal for the transfer.
    Overrun,
    /// Unrecoverable failure; abandon the transfer.
    Abort,
}

/// Source address and transport-level message id carried by every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameMeta {
    pub source: NodeAddr,
    pub message_id: u16,
}

/// Everything that travels between mesh peers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum MeshFrame {
    Request {
        meta: FrameMeta,
        dest: NodeAddr,
        command: MeterCommand,
    },
    Response {
        meta: FrameMeta,
        dest: NodeAddr,
        /// Message id of the request this answers.
        in_reply_to: u16,
        code: MeshCode,
    },
    /// One chunk of a measurement in flight.
    Block {
        meta: FrameMeta,
        dest: NodeAddr,
        /// Ties chunks of one upload round together.
        round: Uuid,
        /// Byte offset of this chunk within the measurement.
        position: u32,
        total_len: u32,
        more: bool,
        data: Vec<u8>,
    },
    /// Receiver's acknowledgement for one block.
    BlockResult {
        meta: FrameMeta,
        dest: NodeAddr,
        round: Uuid,
        position: u32,
        disposition: BlockDisposition,
    },
}

impl MeshFrame {
    pub fn meta(&self) -> FrameMeta {
        match self {
            MeshFrame::Request { meta, .. }
            | MeshFrame::Response { meta, .. }
            | MeshFrame::Block { meta, .. }
            | MeshFrame::BlockResult { meta, .. } => *meta,
        }
    }

    pub fn dest(&self) -> NodeAddr {
        match self {
            MeshFrame::Request { dest, .. }
            | MeshFrame::Response { dest, .. }
            | MeshFrame::Block { dest, .. }
            | MeshFrame::BlockResult { dest, .. } => *dest,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            MeshFrame::Request { .. } => "request",
            MeshFrame::Response { .. } => "response",
            MeshFrame::Block { .. } => "block",
            MeshFrame::BlockResult { .. } => "block-result",
        }
    }
}

/// Attachment state of the node on its mesh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshRole {
    Attached,
    Detached,
}

/// Delivered by a transport on its event channel.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    Frame(MeshFrame),
    Role(MeshRole),
}

/// A mesh transport. Sends never block; frames to unknown or detached
/// destinations are dropped after a log line, matching datagram semantics.
pub trait MeshLink: Send + Sync {
    fn local_addr(&self) -> NodeAddr;
    fn send(&self, frame: MeshFrame) -> Result<()>;
}

/// Leading bytes of every datagram so foreign traffic on the group is
/// cheaply recognized and dropped.
pub const FRAME_MAGIC: [u8; 4] = *b"MM01";

pub fn encode_frame(frame: &MeshFrame) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(64);
    out.extend_from_slice(&FRAME_MAGIC);
    let body = bincode::serialize(frame)?;
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a datagram. `None` covers both foreign magic and malformed bodies;
/// callers log and drop.
pub fn decode_frame(data: &[u8]) -> Option<MeshFrame> {
    let body = data.strip_prefix(&FRAME_MAGIC[..])?;
    bincode::deserialize(body).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_codec_round_trip() {
        let frame = MeshFrame::Request {
            meta: FrameMeta {
                source: NodeAddr(0xdead_beef),
                message_id: 4711,
            },
            dest: NodeAddr::BROADCAST,
            command: MeterCommand::ReportState(DeviceState::Idle),
        };
        let wire = encode_frame(&frame).unwrap();
        assert_eq!(&wire[..4], b"MM01");
        assert_eq!(decode_frame(&wire).unwrap(), frame);
    }

    #[test]
    fn decode_rejects_foreign_and_truncated_data() {
        assert!(decode_frame(b"XX99old-protocol").is_none());
        assert!(decode_frame(b"MM01").is_none());
        assert!(decode_frame(b"MM01\xff\xff\xff\xff\xff\xff\xff\xff").is_none());
        assert!(decode_frame(b"").is_none());
    }

    #[test]
    fn addr_formats_as_hex() {
        assert_eq!(NodeAddr(0xc0ffee).to_string(), "0x00c0ffee");
        assert!(NodeAddr::BROADCAST.is_broadcast());
        assert!(!NodeAddr(1).is_broadcast());
    }
}
