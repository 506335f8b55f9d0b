//! The agent task: one `tokio::select!` loop that owns the negotiation
//! engine, the transfer engines, and every timer.
//!
//! All frame handling and timer work happens inside this single task, so the
//! protocol state never needs a lock. Timers follow the same discipline as
//! the modem bridge: a [`TimedWork`] entry is swept against the clock on a
//! coarse tick, and cancellation means invalidation — a fired entry whose
//! round or position no longer matches the live state is simply dropped.
//! The one exception is re-arming a wait that is already armed (chunk
//! retransmits, receive inactivity), which eagerly replaces the old entry so
//! a single logical wait never has two timers.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Result};
use log::{debug, info, trace, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::config::Config;
use crate::mesh::{
    loopback::LoopbackMesh, udp, BlockDisposition, FrameMeta, MeshEvent, MeshFrame, MeshLink,
    MeshRole, MeterCommand, NodeAddr,
};
use crate::metrics;
use crate::modem::{
    sim, CommandPort, DeviceState, ModemBridge, ModemError, ModemHandle, ModemTuning, StateObserver,
};

use super::negotiate::{Action, Negotiator};
use super::transfer::{
    BlockClass, InboundTransfer, LocalPush, OutboundTransfer, PatternSource, PushOutcome,
    ReceiveOutcome, SendOutcome,
};

/// How often the agent task sweeps its timer list.
const TICK: Duration = Duration::from_millis(50);

/// Delayed work swept by the run loop.
#[derive(Debug, Clone, PartialEq, Eq)]
enum WorkItem {
    /// Periodic upload trigger.
    UploadTick,
    /// No answer to an upload offer with this message id.
    OfferTimeout { message_id: u16 },
    /// No verdict for the outbound chunk at this position.
    ChunkTimeout { round: Uuid, position: u32 },
    /// The sender of the inbound round has gone silent.
    ReceiveTimeout,
    /// Next local push block is due.
    PushStep { round: Uuid },
}

struct TimedWork {
    due: Instant,
    work: WorkItem,
}

/// Requests accepted by the agent task.
pub enum AgentCommand {
    TriggerUpload,
    TriggerDiscovery,
    Status { reply: oneshot::Sender<AgentStatus> },
    /// Device state transition forwarded from the modem bridge.
    DeviceState(DeviceState),
    Shutdown,
}

/// Point-in-time view of the agent, for `status` output and tests.
#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub node_id: String,
    pub attached: bool,
    pub device_state: DeviceState,
    pub uploading: bool,
    pub serving: bool,
    pub metrics: metrics::Snapshot,
}

/// Cloneable handle other tasks use to reach the agent.
#[derive(Clone)]
pub struct AgentHandle {
    commands: mpsc::UnboundedSender<AgentCommand>,
}

impl AgentHandle {
    /// Start an upload round now, as if the periodic trigger had fired.
    pub fn trigger_upload(&self) {
        let _ = self.commands.send(AgentCommand::TriggerUpload);
    }

    pub fn trigger_discovery(&self) {
        let _ = self.commands.send(AgentCommand::TriggerDiscovery);
    }

    pub async fn status(&self) -> Result<AgentStatus> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(AgentCommand::Status { reply: tx })
            .map_err(|_| anyhow!("agent task is gone"))?;
        rx.await.map_err(|_| anyhow!("agent task is gone"))
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(AgentCommand::Shutdown);
    }
}

/// Forwards device state transitions out of the bridge task into the agent's
/// control channel. Fires only on real changes; the bridge already logs the
/// same-state case.
struct StateForwarder {
    commands: mpsc::UnboundedSender<AgentCommand>,
}

impl StateObserver for StateForwarder {
    fn device_state_changed(&mut self, previous: DeviceState, current: DeviceState) {
        if previous != current {
            let _ = self.commands.send(AgentCommand::DeviceState(current));
        }
    }
}

/// The agent task. Owns the mesh link, the modem handle, and all protocol
/// state; see the module docs for the timer discipline.
pub struct AgentServer {
    config: Config,
    local: NodeAddr,
    link: Arc<dyn MeshLink>,
    events: mpsc::UnboundedReceiver<MeshEvent>,
    modem: ModemHandle,
    control_tx: mpsc::UnboundedSender<AgentCommand>,
    control_rx: mpsc::UnboundedReceiver<AgentCommand>,
    negotiator: Negotiator,
    outbound: Option<OutboundTransfer>,
    inbound: Option<InboundTransfer>,
    local_push: Option<LocalPush>,
    pending: Vec<TimedWork>,
    attached: bool,
    /// Discover probe sent for the first attach.
    announced: bool,
}

impl AgentServer {
    /// Build the agent from configuration: mesh link and modem backing are
    /// chosen by `mesh.mode` and `modem.mode`.
    pub async fn new(config: Config) -> Result<(AgentServer, AgentHandle)> {
        config.validate()?;
        let local = match config.parse_node_id()? {
            Some(id) => NodeAddr(id),
            None => {
                let addr = NodeAddr(rand::random());
                info!("No node id configured; using random address {}", addr);
                addr
            }
        };
        let (link, events): (Arc<dyn MeshLink>, _) = if config.mesh.mode == "loopback" {
            let hub = LoopbackMesh::new();
            let (link, events) = hub.endpoint(local);
            (link, events)
        } else {
            let (link, events) = udp::open(
                &config.mesh.bind_addr,
                config.mesh.port,
                &config.mesh.multicast_group,
                local,
            )
            .await?;
            (link, events)
        };
        AgentServer::with_link(config, local, link, events).await
    }

    /// Build the agent on an existing mesh link. Used by `new` and by tests
    /// that put several agents on one loopback hub.
    pub async fn with_link(
        config: Config,
        local: NodeAddr,
        link: Arc<dyn MeshLink>,
        events: mpsc::UnboundedReceiver<MeshEvent>,
    ) -> Result<(AgentServer, AgentHandle)> {
        let port;
        let lines;
        let initial;
        if config.modem.mode == "sim" {
            let (p, l) = sim::spawn(sim::SimProfile::default());
            port = p;
            lines = l;
            initial = DeviceState::Off;
        } else {
            #[cfg(feature = "serial")]
            {
                let (p, l) =
                    crate::modem::serial::open(&config.modem.port, config.modem.baud_rate).await?;
                port = p;
                lines = l;
                initial = DeviceState::Unknown;
            }
            #[cfg(not(feature = "serial"))]
            {
                anyhow::bail!("this build has no serial support; set modem.mode = \"sim\"");
            }
        }
        Ok(AgentServer::with_parts(
            config, local, link, events, port, lines, initial,
        ))
    }

    /// Build the agent on an existing mesh link and modem port. The most
    /// injectable form; tests script the device with [`sim::SimProfile`].
    pub fn with_parts(
        config: Config,
        local: NodeAddr,
        link: Arc<dyn MeshLink>,
        events: mpsc::UnboundedReceiver<MeshEvent>,
        port: Box<dyn CommandPort>,
        lines: mpsc::UnboundedReceiver<String>,
        initial_state: DeviceState,
    ) -> (AgentServer, AgentHandle) {
        let (control_tx, control_rx) = mpsc::unbounded_channel();
        let observer = Box::new(StateForwarder {
            commands: control_tx.clone(),
        });
        let tuning = ModemTuning::from_config(&config.modem);
        let modem = ModemBridge::spawn(port, lines, initial_state, tuning, observer);
        let handle = AgentHandle {
            commands: control_tx.clone(),
        };
        let server = AgentServer {
            local,
            link,
            events,
            modem,
            control_tx,
            control_rx,
            negotiator: Negotiator::new(local),
            outbound: None,
            inbound: None,
            local_push: None,
            pending: Vec::new(),
            attached: false,
            announced: false,
            config,
        };
        (server, handle)
    }

    pub fn handle(&self) -> AgentHandle {
        AgentHandle {
            commands: self.control_tx.clone(),
        }
    }

    pub fn local_addr(&self) -> NodeAddr {
        self.local
    }

    /// Run until shutdown is requested or a channel closes.
    pub async fn run(mut self) -> Result<()> {
        info!(
            "Measurement agent {} starting (mesh '{}', modem '{}')",
            self.local, self.config.mesh.mode, self.config.modem.mode
        );
        let interval = self.config.agent.upload_interval_secs;
        if interval > 0 {
            self.arm(Duration::from_secs(interval), WorkItem::UploadTick);
        } else {
            info!("Periodic upload trigger disabled");
        }
        let mut sweep = tokio::time::interval(TICK);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                event = self.events.recv() => {
                    match event {
                        Some(MeshEvent::Frame(frame)) => self.handle_frame(frame).await,
                        Some(MeshEvent::Role(role)) => self.handle_role(role).await,
                        None => {
                            warn!("Mesh event channel closed; stopping agent");
                            break;
                        }
                    }
                }
                cmd = self.control_rx.recv() => {
                    match cmd {
                        Some(AgentCommand::Shutdown) | None => {
                            info!("Agent shutdown requested");
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd).await,
                    }
                }
                _ = sweep.tick() => {
                    self.run_due_work(Instant::now()).await;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }
        self.modem.shutdown();
        info!("Measurement agent stopped");
        Ok(())
    }

    fn arm(&mut self, after: Duration, work: WorkItem) {
        self.pending.push(TimedWork {
            due: Instant::now() + after,
            work,
        });
    }

    /// Arm the verdict timeout for the outbound chunk at `position`,
    /// replacing any timer still armed for this round.
    fn arm_chunk_timeout(&mut self, round: Uuid, position: u32) {
        self.pending
            .retain(|t| !matches!(t.work, WorkItem::ChunkTimeout { round: r, .. } if r == round));
        let after = Duration::from_millis(self.config.transfer.chunk_timeout_ms);
        self.arm(after, WorkItem::ChunkTimeout { round, position });
    }

    /// (Re-)arm the inbound inactivity window. Sized to outlive the sender's
    /// whole retransmit budget, so it only fires once the peer has truly
    /// given up or died.
    fn arm_receive_timeout(&mut self) {
        self.pending
            .retain(|t| t.work != WorkItem::ReceiveTimeout);
        let t = &self.config.transfer;
        let after =
            Duration::from_millis(t.chunk_timeout_ms * (u64::from(t.chunk_retry_limit) + 1));
        self.arm(after, WorkItem::ReceiveTimeout);
    }

    async fn run_due_work(&mut self, now: Instant) {
        let mut due = Vec::new();
        let mut i = 0;
        while i < self.pending.len() {
            if self.pending[i].due <= now {
                due.push(self.pending.swap_remove(i).work);
            } else {
                i += 1;
            }
        }
        for work in due {
            self.handle_work(work).await;
        }
    }

    async fn handle_work(&mut self, work: WorkItem) {
        match work {
            WorkItem::UploadTick => {
                let interval = self.config.agent.upload_interval_secs;
                if interval > 0 {
                    self.arm(Duration::from_secs(interval), WorkItem::UploadTick);
                }
                debug!("Periodic upload trigger");
                let actions = self.negotiator.trigger_upload(self.effective_state());
                self.perform(actions).await;
            }
            WorkItem::OfferTimeout { message_id } => {
                if self.negotiator.on_offer_timeout(message_id) {
                    warn!("No answer to upload offer {}; giving up on this round", message_id);
                }
            }
            WorkItem::ChunkTimeout { round, position } => {
                let outcome = match self.outbound.as_mut() {
                    Some(tx) if tx.round() == round && tx.position() == position => tx.on_timeout(),
                    // Stale timer; the transfer moved on or ended.
                    _ => return,
                };
                self.apply_send_outcome(round, position, outcome);
            }
            WorkItem::ReceiveTimeout => {
                if let Some(transfer) = self.inbound.take() {
                    warn!(
                        "No block from {} since position {}; dropping the round",
                        transfer.peer(),
                        transfer.expected_position()
                    );
                    metrics::inc_transfers_abandoned();
                    self.modem.set_device_state(DeviceState::Idle);
                }
            }
            WorkItem::PushStep { round } => self.push_step(round).await,
        }
    }

    async fn handle_frame(&mut self, frame: MeshFrame) {
        let dest = frame.dest();
        if dest != self.local && !dest.is_broadcast() {
            trace!("Frame for {} is not ours; dropping", dest);
            return;
        }
        match frame {
            MeshFrame::Request { meta, command, .. } => {
                let actions = self
                    .negotiator
                    .on_request(meta, command, self.effective_state());
                self.perform(actions).await;
            }
            MeshFrame::Response {
                meta,
                in_reply_to,
                code,
                ..
            } => {
                let actions = self.negotiator.on_response(meta, in_reply_to, code);
                self.perform(actions).await;
            }
            MeshFrame::Block {
                meta,
                round,
                position,
                more,
                data,
                ..
            } => {
                self.handle_block(meta, round, position, more, data).await;
            }
            MeshFrame::BlockResult {
                meta,
                round,
                position,
                disposition,
                ..
            } => {
                let outcome = match self.outbound.as_mut() {
                    Some(tx) if tx.peer() == meta.source => {
                        tx.on_block_result(round, position, disposition)
                    }
                    _ => {
                        debug!("Block verdict from {} with no matching transfer", meta.source);
                        return;
                    }
                };
                self.apply_send_outcome(round, position, outcome);
            }
        }
    }

    /// One inbound block. The transfer is taken out of its slot while the
    /// chunk is offered to the bridge and put back unless the round ended.
    async fn handle_block(
        &mut self,
        meta: FrameMeta,
        round: Uuid,
        position: u32,
        more: bool,
        data: Vec<u8>,
    ) {
        let Some(mut transfer) = self.inbound.take() else {
            debug!("Block from {} with no transfer in progress", meta.source);
            self.send_frame(stray_abort(self.local, meta.source, round, position));
            return;
        };
        if transfer.peer() != meta.source || !transfer.accepts(round) {
            debug!(
                "Block from {} does not belong to the round served for {}",
                meta.source,
                transfer.peer()
            );
            self.send_frame(stray_abort(self.local, meta.source, round, position));
            self.inbound = Some(transfer);
            return;
        }
        match transfer.classify(position) {
            BlockClass::DuplicateAcked => {
                let frame = transfer.reack(position);
                self.inbound = Some(transfer);
                self.arm_receive_timeout();
                self.send_frame(frame);
            }
            BlockClass::OutOfOrder => {
                warn!(
                    "Block at position {} from {} (expected {}); aborting the round",
                    position,
                    meta.source,
                    transfer.expected_position()
                );
                let frame = transfer.fail(position);
                self.end_inbound();
                self.send_frame(frame);
            }
            BlockClass::New => {
                trace!(
                    "Block at position {} ({} bytes, more={})",
                    position,
                    data.len(),
                    more
                );
                let result = self.modem.cloud_upload(data.clone()).await;
                if result == Err(ModemError::PreviousFailure) {
                    // An earlier publish died unacknowledged. Clear the latch
                    // so the device is usable again; this chunk still fails.
                    info!("Acknowledging earlier publish failure");
                    self.modem.clear_failure();
                }
                match transfer.consume(&data, more, result) {
                    ReceiveOutcome::Continue(frame) => {
                        self.inbound = Some(transfer);
                        self.arm_receive_timeout();
                        self.send_frame(frame);
                    }
                    ReceiveOutcome::Complete {
                        frame,
                        digest,
                        bytes,
                    } => {
                        info!(
                            "Measurement received: {} bytes, crc32 {:08x}, round {}",
                            bytes, digest, round
                        );
                        metrics::inc_rounds_completed();
                        self.end_inbound();
                        self.send_frame(frame);
                    }
                    ReceiveOutcome::Failed { frame } => {
                        self.end_inbound();
                        self.send_frame(frame);
                    }
                }
            }
        }
    }

    /// Drop inbound transfer state and free the device for the next round.
    fn end_inbound(&mut self) {
        self.inbound = None;
        self.pending.retain(|t| t.work != WorkItem::ReceiveTimeout);
        self.modem.set_device_state(DeviceState::Idle);
    }

    fn apply_send_outcome(&mut self, round: Uuid, position: u32, outcome: SendOutcome) {
        match outcome {
            SendOutcome::Continue(frame) => {
                if let MeshFrame::Block { position, .. } = &frame {
                    self.arm_chunk_timeout(round, *position);
                }
                self.send_frame(frame);
            }
            SendOutcome::Wait => {
                self.arm_chunk_timeout(round, position);
            }
            SendOutcome::Ignored => {}
            SendOutcome::Complete { digest, bytes } => {
                info!(
                    "Measurement delivered: {} bytes, crc32 {:08x}, round {}",
                    bytes, digest, round
                );
                metrics::inc_rounds_completed();
                self.end_outbound(round);
            }
            SendOutcome::Abandoned => {
                self.end_outbound(round);
            }
        }
    }

    /// Drop outbound transfer state so the next round can start.
    fn end_outbound(&mut self, round: Uuid) {
        self.outbound = None;
        self.pending
            .retain(|t| !matches!(t.work, WorkItem::ChunkTimeout { round: r, .. } if r == round));
        self.negotiator.upload_finished();
    }

    async fn perform(&mut self, actions: Vec<Action>) {
        for action in actions {
            match action {
                Action::Respond {
                    dest,
                    message_id,
                    in_reply_to,
                    code,
                } => {
                    self.send_frame(MeshFrame::Response {
                        meta: FrameMeta {
                            source: self.local,
                            message_id,
                        },
                        dest,
                        in_reply_to,
                        code,
                    });
                }
                Action::Request {
                    dest,
                    message_id,
                    command,
                } => {
                    if command == MeterCommand::UploadMeasurement {
                        // The one exchange whose silence would leave the
                        // upload intent stuck.
                        self.arm(
                            Duration::from_millis(self.config.transfer.negotiation_timeout_ms),
                            WorkItem::OfferTimeout { message_id },
                        );
                    }
                    self.send_frame(MeshFrame::Request {
                        meta: FrameMeta {
                            source: self.local,
                            message_id,
                        },
                        dest,
                        command,
                    });
                }
                Action::BeginReceive { peer } => self.begin_receive(peer),
                Action::BeginSend { peer } => self.begin_send(peer),
                Action::BeginLocalPush => self.begin_local_push().await,
            }
        }
    }

    fn begin_receive(&mut self, peer: NodeAddr) {
        if self.inbound.is_some() {
            warn!("Already serving a round; ignoring new one from {}", peer);
            return;
        }
        info!("Receiving measurement from {}", peer);
        self.modem.set_device_state(DeviceState::Busy);
        metrics::inc_rounds_started();
        self.inbound = Some(InboundTransfer::new(self.local, peer));
        self.arm_receive_timeout();
    }

    fn begin_send(&mut self, peer: NodeAddr) {
        if self.outbound.is_some() {
            warn!("Upload round already in progress; ignoring accept from {}", peer);
            return;
        }
        let t = &self.config.transfer;
        let source = Box::new(PatternSource::new(t.block_size, t.total_chunks));
        let mut transfer = OutboundTransfer::new(self.local, peer, source, t.chunk_retry_limit);
        let round = transfer.round();
        info!("Uploading measurement to {} (round {})", peer, round);
        metrics::inc_rounds_started();
        let frame = transfer.start();
        self.outbound = Some(transfer);
        self.arm_chunk_timeout(round, 0);
        self.send_frame(frame);
    }

    async fn begin_local_push(&mut self) {
        if self.local_push.is_some() {
            return;
        }
        let t = &self.config.transfer;
        let push = LocalPush::new(Box::new(PatternSource::new(t.block_size, t.total_chunks)));
        let round = push.round();
        info!("Publishing measurement through the local modem (round {})", round);
        self.modem.set_device_state(DeviceState::Busy);
        metrics::inc_rounds_started();
        self.local_push = Some(push);
        self.push_step(round).await;
    }

    /// One local push step: hand the current block to the bridge and
    /// schedule the next step from its verdict.
    async fn push_step(&mut self, round: Uuid) {
        let (data, _more) = match self.local_push.as_ref() {
            Some(push) if push.round() == round => push.current_block(),
            // Stale timer; the push ended.
            _ => return,
        };
        let result = self.modem.cloud_upload(data).await;
        if result == Err(ModemError::PreviousFailure) {
            info!("Acknowledging earlier publish failure");
            self.modem.clear_failure();
        }
        let outcome = match self.local_push.as_mut() {
            Some(push) if push.round() == round => push.on_upload_result(result),
            _ => return,
        };
        let pace = Duration::from_millis(self.config.transfer.local_push_interval_ms);
        let backoff = Duration::from_millis(self.config.transfer.local_retry_delay_ms);
        match outcome {
            PushOutcome::Scheduled => self.arm(pace, WorkItem::PushStep { round }),
            PushOutcome::Deferred => self.arm(backoff, WorkItem::PushStep { round }),
            PushOutcome::Complete { .. } => {
                metrics::inc_rounds_completed();
                self.end_local_push();
            }
            PushOutcome::Abandoned => self.end_local_push(),
        }
    }

    fn end_local_push(&mut self) {
        self.local_push = None;
        self.negotiator.upload_finished();
        self.modem.set_device_state(DeviceState::Idle);
    }

    async fn handle_role(&mut self, role: MeshRole) {
        match role {
            MeshRole::Attached => {
                if !self.attached {
                    info!("Mesh attached");
                }
                self.attached = true;
                if !self.announced && self.config.agent.discover_on_start {
                    self.announced = true;
                    let actions = self.negotiator.trigger_discovery();
                    self.perform(actions).await;
                }
            }
            MeshRole::Detached => {
                if self.attached {
                    warn!("Mesh detached; frames will be dropped until reattach");
                }
                self.attached = false;
            }
        }
    }

    async fn handle_command(&mut self, cmd: AgentCommand) {
        match cmd {
            AgentCommand::TriggerUpload => {
                let actions = self.negotiator.trigger_upload(self.effective_state());
                self.perform(actions).await;
            }
            AgentCommand::TriggerDiscovery => {
                let actions = self.negotiator.trigger_discovery();
                self.perform(actions).await;
            }
            AgentCommand::Status { reply } => {
                let _ = reply.send(self.status());
            }
            AgentCommand::DeviceState(state) => self.on_device_state(state).await,
            // Handled in the run loop so the modem can be shut down cleanly.
            AgentCommand::Shutdown => {}
        }
    }

    /// The bridge reported a device state transition.
    async fn on_device_state(&mut self, state: DeviceState) {
        if state == DeviceState::Idle {
            // Freshly synced or freed up: make sure the cloud side is up for
            // the next publish.
            match self.modem.cloud_connect().await {
                Ok(()) | Err(ModemError::AlreadyConnecting) => {}
                Err(err) => warn!("Cloud connect failed: {}", err),
            }
        }
    }

    /// What peers should believe about our modem. A round we are serving or
    /// pushing occupies the device even before the bridge task has applied
    /// the BUSY transition.
    fn effective_state(&self) -> DeviceState {
        if self.inbound.is_some() || self.local_push.is_some() {
            DeviceState::Busy
        } else {
            self.modem.device_state()
        }
    }

    fn status(&self) -> AgentStatus {
        AgentStatus {
            node_id: self.local.to_string(),
            attached: self.attached,
            device_state: self.effective_state(),
            uploading: self.negotiator.uploading(),
            serving: self.inbound.is_some(),
            metrics: metrics::snapshot(),
        }
    }

    fn send_frame(&self, frame: MeshFrame) {
        if !self.attached {
            warn!("Mesh detached; dropping {} to {}", frame.kind(), frame.dest());
            return;
        }
        if let Err(err) = self.link.send(frame) {
            warn!("Mesh send failed: {}", err);
        }
    }
}

/// Abort verdict for a block that cannot be tied to any round in progress.
fn stray_abort(local: NodeAddr, dest: NodeAddr, round: Uuid, position: u32) -> MeshFrame {
    MeshFrame::BlockResult {
        meta: FrameMeta {
            source: local,
            message_id: rand::random(),
        },
        dest,
        round,
        position,
        disposition: BlockDisposition::Abort,
    }
}
