//! Chunked movement of one measurement payload.
//!
//! Three engines, all pure: [`OutboundTransfer`] slices the measurement into
//! blocks for a serving peer, [`InboundTransfer`] folds arriving blocks into
//! the local modem bridge, and [`LocalPush`] feeds the bridge directly when
//! our own modem is usable. The server owns all I/O; the engines only decide
//! what the next frame or step is, so every edge case is testable with plain
//! function calls.
//!
//! Both transfer directions maintain a running CRC32 of the payload. The
//! digest appears in the completion log line on each side, which is how an
//! operator matches up "sent" and "received" across two nodes' logs.

use crc::{Crc, CRC_32_ISO_HDLC};
use log::{debug, info, warn};
use uuid::Uuid;

use crate::mesh::{BlockDisposition, FrameMeta, MeshFrame, NodeAddr};
use crate::metrics;
use crate::modem::ModemError;

// A static, not a const: the running digests borrow it for 'static.
static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// Produces the payload one chunk at a time.
///
/// Content must be deterministic per `(index, position)` pair: a chunk that
/// is resent after a lost acknowledgement has to be byte-identical to its
/// first transmission.
pub trait MeasurementSource: Send {
    /// Bytes for chunk `index` starting at byte `position`, and whether
    /// further chunks follow.
    fn produce_chunk(&mut self, index: u32, position: u32) -> (Vec<u8>, bool);
    fn total_len(&self) -> u32;
}

/// Stand-in measurement data: a rolling digit pattern, `block_size` bytes
/// per chunk for a fixed chunk count.
pub struct PatternSource {
    block_size: u16,
    total_chunks: u32,
}

impl PatternSource {
    pub fn new(block_size: u16, total_chunks: u32) -> Self {
        PatternSource {
            block_size,
            total_chunks,
        }
    }
}

impl MeasurementSource for PatternSource {
    fn produce_chunk(&mut self, index: u32, position: u32) -> (Vec<u8>, bool) {
        let data = (0..u32::from(self.block_size))
            .map(|i| b'0' + ((position + i) % 10) as u8)
            .collect();
        (data, index + 1 < self.total_chunks)
    }

    fn total_len(&self) -> u32 {
        u32::from(self.block_size) * self.total_chunks
    }
}

/// Verdict of feeding one acknowledgement (or its absence) into an
/// [`OutboundTransfer`].
#[derive(Debug, PartialEq)]
pub enum SendOutcome {
    /// Next frame to put on the wire.
    Continue(MeshFrame),
    /// Peer is busy; hold the chunk and let the liveness timer drive the
    /// retransmit.
    Wait,
    /// The acknowledgement did not belong to the chunk in flight.
    Ignored,
    Complete { digest: u32, bytes: u32 },
    Abandoned,
}

/// Sender side of a mesh transfer: one chunk in flight at a time, resent
/// verbatim until acknowledged or the retry budget is gone.
pub struct OutboundTransfer {
    local: NodeAddr,
    peer: NodeAddr,
    round: Uuid,
    source: Box<dyn MeasurementSource>,
    chunk_index: u32,
    position: u32,
    /// Transmissions of the current chunk, including the first.
    attempts: u8,
    retry_limit: u8,
    current: Option<MeshFrame>,
    final_chunk: bool,
    digest: crc::Digest<'static, u32>,
    next_message_id: u16,
}

impl OutboundTransfer {
    pub fn new(
        local: NodeAddr,
        peer: NodeAddr,
        source: Box<dyn MeasurementSource>,
        retry_limit: u8,
    ) -> Self {
        OutboundTransfer {
            local,
            peer,
            round: Uuid::new_v4(),
            source,
            chunk_index: 0,
            position: 0,
            attempts: 0,
            retry_limit,
            current: None,
            final_chunk: false,
            digest: CRC32.digest(),
            next_message_id: rand::random(),
        }
    }

    pub fn round(&self) -> Uuid {
        self.round
    }

    pub fn peer(&self) -> NodeAddr {
        self.peer
    }

    /// Byte offset of the chunk currently in flight.
    pub fn position(&self) -> u32 {
        self.position
    }

    fn next_id(&mut self) -> u16 {
        let id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        id
    }

    /// Build the first block. Call once, right after the peer accepts.
    pub fn start(&mut self) -> MeshFrame {
        self.build_chunk()
    }

    fn build_chunk(&mut self) -> MeshFrame {
        let (data, more) = self.source.produce_chunk(self.chunk_index, self.position);
        self.digest.update(&data);
        self.final_chunk = !more;
        let message_id = self.next_id();
        let frame = MeshFrame::Block {
            meta: FrameMeta {
                source: self.local,
                message_id,
            },
            dest: self.peer,
            round: self.round,
            position: self.position,
            total_len: self.source.total_len(),
            more,
            data,
        };
        self.attempts = 1;
        self.current = Some(frame.clone());
        metrics::inc_chunks_sent();
        frame
    }

    /// Feed the peer's verdict on a block back in.
    pub fn on_block_result(
        &mut self,
        round: Uuid,
        position: u32,
        disposition: BlockDisposition,
    ) -> SendOutcome {
        if round != self.round || position != self.position {
            debug!(
                "Verdict for round {round} position {position} does not match the chunk in flight"
            );
            return SendOutcome::Ignored;
        }
        match disposition {
            BlockDisposition::Accepted => {
                let chunk_len = match &self.current {
                    Some(MeshFrame::Block { data, .. }) => data.len() as u32,
                    _ => 0,
                };
                if self.final_chunk {
                    let digest =
                        std::mem::replace(&mut self.digest, CRC32.digest()).finalize();
                    SendOutcome::Complete {
                        digest,
                        bytes: self.position + chunk_len,
                    }
                } else {
                    self.position += chunk_len;
                    self.chunk_index += 1;
                    SendOutcome::Continue(self.build_chunk())
                }
            }
            BlockDisposition::Retry => {
                debug!(
                    "Peer busy at position {}; holding the chunk for the retransmit timer",
                    self.position
                );
                SendOutcome::Wait
            }
            BlockDisposition::Overrun => {
                warn!(
                    "Peer cannot fit our blocks into its publish path; abandoning round {}",
                    self.round
                );
                metrics::inc_transfers_abandoned();
                SendOutcome::Abandoned
            }
            BlockDisposition::Abort => {
                warn!("Peer aborted round {}", self.round);
                metrics::inc_transfers_abandoned();
                SendOutcome::Abandoned
            }
        }
    }

    /// No verdict arrived in time for the chunk in flight.
    pub fn on_timeout(&mut self) -> SendOutcome {
        self.retry("no acknowledgement")
    }

    fn retry(&mut self, why: &str) -> SendOutcome {
        if self.attempts >= self.retry_limit {
            warn!(
                "Chunk at position {} failed {} times ({}); abandoning round {}",
                self.position, self.attempts, why, self.round
            );
            metrics::inc_transfers_abandoned();
            return SendOutcome::Abandoned;
        }
        match self.current.clone() {
            Some(frame) => {
                self.attempts += 1;
                metrics::inc_chunk_retries();
                debug!(
                    "Resending chunk at position {} ({}), attempt {}/{}",
                    self.position, why, self.attempts, self.retry_limit
                );
                SendOutcome::Continue(frame)
            }
            None => SendOutcome::Abandoned,
        }
    }
}

/// How an arriving block relates to the transfer in progress.
#[derive(Debug, PartialEq, Eq)]
pub enum BlockClass {
    /// The next expected chunk.
    New,
    /// A chunk we already consumed; the peer missed our verdict.
    DuplicateAcked,
    /// Ahead of the expected position. The sender never skips, so this
    /// cannot belong to the transfer.
    OutOfOrder,
}

/// Verdict of consuming one block.
#[derive(Debug, PartialEq)]
pub enum ReceiveOutcome {
    /// Verdict frame to send; the transfer continues.
    Continue(MeshFrame),
    /// Verdict frame to send; the transfer is finished.
    Complete {
        frame: MeshFrame,
        digest: u32,
        bytes: u32,
    },
    /// Verdict frame to send; the transfer failed and must be dropped.
    Failed { frame: MeshFrame },
}

/// Receiver side of a mesh transfer: each new chunk is offered to the modem
/// bridge for publishing, and the bridge's answer decides the verdict sent
/// back to the peer.
pub struct InboundTransfer {
    local: NodeAddr,
    peer: NodeAddr,
    /// Bound when the first block arrives; the peer picks the round id.
    round: Option<Uuid>,
    expected_position: u32,
    digest: crc::Digest<'static, u32>,
    next_message_id: u16,
}

impl InboundTransfer {
    pub fn new(local: NodeAddr, peer: NodeAddr) -> Self {
        InboundTransfer {
            local,
            peer,
            round: None,
            expected_position: 0,
            digest: CRC32.digest(),
            next_message_id: rand::random(),
        }
    }

    pub fn peer(&self) -> NodeAddr {
        self.peer
    }

    pub fn expected_position(&self) -> u32 {
        self.expected_position
    }

    /// Whether a block with this round id belongs to us. The first block
    /// binds the round; later blocks must match it.
    pub fn accepts(&mut self, round: Uuid) -> bool {
        match self.round {
            None => {
                self.round = Some(round);
                true
            }
            Some(bound) => bound == round,
        }
    }

    pub fn classify(&self, position: u32) -> BlockClass {
        if position == self.expected_position {
            BlockClass::New
        } else if position < self.expected_position {
            BlockClass::DuplicateAcked
        } else {
            BlockClass::OutOfOrder
        }
    }

    /// Re-acknowledge a chunk the peer resent because our verdict was lost.
    pub fn reack(&mut self, position: u32) -> MeshFrame {
        debug!("Re-acknowledging already consumed chunk at position {position}");
        self.verdict(position, BlockDisposition::Accepted)
    }

    /// Abort verdict for a block that cannot belong to this transfer.
    pub fn fail(&mut self, position: u32) -> MeshFrame {
        metrics::inc_transfers_abandoned();
        self.verdict(position, BlockDisposition::Abort)
    }

    /// Fold the next new chunk in. `upload` is the bridge's synchronous
    /// accept/reject decision for publishing this chunk.
    ///
    /// The final chunk (`more == false`) completes the transfer whatever the
    /// bridge said: availability is declared the moment the payload has
    /// fully arrived, while the last publish finishes asynchronously on the
    /// bridge's own retry machinery.
    pub fn consume(
        &mut self,
        data: &[u8],
        more: bool,
        upload: Result<(), ModemError>,
    ) -> ReceiveOutcome {
        let position = self.expected_position;
        if !more {
            if let Err(ref err) = upload {
                warn!(
                    "Final chunk at position {position} not accepted for publish ({err}); \
                     completing the round anyway"
                );
            }
            self.digest.update(data);
            self.expected_position += data.len() as u32;
            metrics::inc_chunks_received();
            let digest = std::mem::replace(&mut self.digest, CRC32.digest()).finalize();
            let frame = self.verdict(position, BlockDisposition::Accepted);
            return ReceiveOutcome::Complete {
                frame,
                digest,
                bytes: self.expected_position,
            };
        }
        match upload {
            Ok(()) => {
                self.digest.update(data);
                self.expected_position += data.len() as u32;
                metrics::inc_chunks_received();
                ReceiveOutcome::Continue(self.verdict(position, BlockDisposition::Accepted))
            }
            Err(ModemError::Busy) => {
                debug!("Bridge is mid-publish; asking {} to resend position {position}", self.peer);
                ReceiveOutcome::Continue(self.verdict(position, BlockDisposition::Retry))
            }
            Err(ModemError::PayloadTooLarge { max }) => {
                warn!(
                    "Chunk of {} bytes exceeds the {max}-byte publish limit; failing round",
                    data.len()
                );
                metrics::inc_transfers_abandoned();
                ReceiveOutcome::Failed {
                    frame: self.verdict(position, BlockDisposition::Overrun),
                }
            }
            Err(err) => {
                warn!("Publishing chunk at position {position} failed: {err}; failing round");
                metrics::inc_transfers_abandoned();
                ReceiveOutcome::Failed {
                    frame: self.verdict(position, BlockDisposition::Abort),
                }
            }
        }
    }

    fn verdict(&mut self, position: u32, disposition: BlockDisposition) -> MeshFrame {
        let message_id = self.next_message_id;
        self.next_message_id = self.next_message_id.wrapping_add(1);
        MeshFrame::BlockResult {
            meta: FrameMeta {
                source: self.local,
                message_id,
            },
            dest: self.peer,
            round: self.round.unwrap_or_else(Uuid::nil),
            position,
            disposition,
        }
    }
}

/// Outcome of one local push step.
#[derive(Debug, PartialEq, Eq)]
pub enum PushOutcome {
    /// Block accepted; schedule the next one after the pacing interval.
    Scheduled,
    /// Bridge is busy; retry the same block after the back-off delay.
    Deferred,
    Complete { digest: u32, bytes: u32 },
    Abandoned,
}

/// Feeds the measurement straight into the local bridge, block by block,
/// when our own modem is the one doing the publishing. A busy bridge defers
/// the step without a separate retry budget; the bridge's own publish
/// ceiling bounds how long that can go on.
pub struct LocalPush {
    source: Box<dyn MeasurementSource>,
    round: Uuid,
    chunk_index: u32,
    position: u32,
    current: (Vec<u8>, bool),
    digest: crc::Digest<'static, u32>,
}

impl LocalPush {
    pub fn new(mut source: Box<dyn MeasurementSource>) -> Self {
        let current = source.produce_chunk(0, 0);
        LocalPush {
            source,
            round: Uuid::new_v4(),
            chunk_index: 0,
            position: 0,
            current,
            digest: CRC32.digest(),
        }
    }

    pub fn round(&self) -> Uuid {
        self.round
    }

    /// The block to hand the bridge next. Stable until the bridge accepts
    /// it, so a deferred step retries the identical bytes.
    pub fn current_block(&self) -> (Vec<u8>, bool) {
        (self.current.0.clone(), self.current.1)
    }

    /// Fold the bridge's verdict on the current block in.
    pub fn on_upload_result(&mut self, result: Result<(), ModemError>) -> PushOutcome {
        match result {
            Ok(()) => {
                let (data, more) = &self.current;
                self.digest.update(data);
                self.position += data.len() as u32;
                let more = *more;
                metrics::inc_chunks_sent();
                if !more {
                    let digest = std::mem::replace(&mut self.digest, CRC32.digest()).finalize();
                    info!(
                        "Local push complete: {} bytes, crc32 {digest:08x}",
                        self.position
                    );
                    return PushOutcome::Complete {
                        digest,
                        bytes: self.position,
                    };
                }
                self.chunk_index += 1;
                self.current = self.source.produce_chunk(self.chunk_index, self.position);
                PushOutcome::Scheduled
            }
            Err(ModemError::Busy) => {
                debug!(
                    "Bridge still publishing; deferring block at position {}",
                    self.position
                );
                PushOutcome::Deferred
            }
            Err(err) => {
                warn!("Local push abandoned at position {}: {err}", self.position);
                metrics::inc_transfers_abandoned();
                PushOutcome::Abandoned
            }
        }
    }
}
