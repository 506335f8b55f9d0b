//! # Meshmeter - Measurement Upload Agent for Mesh-Networked Metering Nodes
//!
//! Meshmeter runs on a metering node that sits on a low-power mesh and owns (or borrows)
//! a cellular modem. Nodes discover each other, negotiate which of them currently has a
//! usable modem, move the measurement over the mesh in fixed-size chunks, and publish it
//! to the cloud through a line-oriented AT-command channel.
//!
//! ## Features
//!
//! - **Peer Negotiation**: Discover/report-state/upload-measurement exchange that picks a
//!   publishing node, with loopback suppression and duplicate-request filtering.
//! - **Chunked Transfer**: Fixed-size blocks with per-chunk acknowledgements, bounded
//!   retransmits, and CRC32 digests for cross-node log correlation.
//! - **Modem Bridge**: Reliable cloud-publish primitive over a serial AT-command channel,
//!   with a bounded retransmit loop, liveness timeouts, and an unbounded sync watchdog.
//! - **Local Push Mode**: Nodes whose own modem is idle feed the measurement straight to
//!   the bridge, block by block, without touching the mesh.
//! - **Simulated Modem**: A scripted stand-in device selected by configuration, so the
//!   whole protocol is testable without hardware.
//! - **Async Design**: Built with Tokio; every state machine lives in a single task and
//!   talks to the others over channels.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use meshmeter::config::Config;
//! use meshmeter::agent::AgentServer;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Load configuration
//!     let config = Config::load("config.toml").await?;
//!
//!     // Create and run the agent
//!     let (server, _handle) = AgentServer::new(config).await?;
//!     server.run().await?;
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Module Organization
//!
//! - [`agent`] - Negotiation engine, chunked transfer engines, and the agent task
//! - [`mesh`] - Frame types and the UDP/loopback mesh transports
//! - [`modem`] - Modem bridge state machine, AT-command codec, serial and simulated ports
//! - [`config`] - Configuration management and validation
//! - [`metrics`] - Process-wide counters surfaced through the status command
//! - [`logutil`] - Log sanitization helpers for raw modem lines
//!
//! ## Architecture
//!
//! Meshmeter uses a modular architecture with clear separation of concerns:
//!
//! ```text
//! ┌─────────────────────┐
//! │     Agent Task      │ ← Negotiation + transfer state machines
//! └─────────────────────┘
//!      │           │
//! ┌─────────┐ ┌─────────────┐
//! │  Mesh   │ │Modem Bridge │ ← Peer frames / AT-command channel
//! │  Link   │ │    Task     │
//! └─────────┘ └─────────────┘
//!                   │
//!             ┌───────────┐
//!             │ Serial or │ ← Real device or simulator
//!             │ Simulated │
//!             └───────────┘
//! ```

pub mod agent;
pub mod config;
pub mod logutil;
pub mod mesh;
pub mod metrics;
pub mod modem;
