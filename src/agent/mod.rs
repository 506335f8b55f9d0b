//! # Measurement Agent
//!
//! The mesh-facing half of the node: peer negotiation, chunked measurement
//! transfer, and the task that drives both against the modem bridge.
//!
//! - [`negotiate`] decides who uploads through whom. Pure state machine,
//!   no I/O.
//! - [`transfer`] moves one measurement as fixed-size blocks, with per-chunk
//!   retransmits on the sending side and bridge-verdict mapping on the
//!   receiving side. Also pure.
//! - [`server`] owns both engines plus every timer, runs the
//!   `tokio::select!` loop, and is the only place frames and modem calls
//!   actually happen.

pub mod negotiate;
pub mod server;
pub mod transfer;

pub use server::{AgentHandle, AgentServer, AgentStatus};
