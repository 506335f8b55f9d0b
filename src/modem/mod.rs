//! # Modem Bridge
//!
//! Turns the modem's line-oriented AT-command channel into a reliable
//! "publish N bytes to the cloud" primitive and tracks the device's
//! availability for negotiation.
//!
//! The bridge runs as a single task owning all modem state. Other tasks talk
//! to it through a [`ModemHandle`]: requests go in as [`ModemCommand`]
//! messages, accept/reject decisions come back over oneshot channels, and the
//! current [`DeviceState`] is mirrored into an atomic so readers get a cheap
//! snapshot without crossing the task boundary.
//!
//! Three pieces of state live here:
//!
//! - **DeviceState** (`UNKNOWN`/`OFF`/`IDLE`/`BUSY`): what we tell peers when
//!   they ask whether we can serve an upload.
//! - **LinkState**: whether the cloud connection behind `AT#XCLOUDCON` is up.
//! - **PublishState** with a bounded retransmit loop: an accepted publish is
//!   written to the port and re-written each time the liveness timer expires
//!   with no report from the modem, up to a fixed ceiling, after which the
//!   publish is abandoned and the bridge refuses further uploads until the
//!   failure is acknowledged with [`ModemHandle::clear_failure`].
//!
//! Modem bring-up is the one unbounded loop: until the `Ready` banner is
//! seen, a watchdog pulses the wake line and re-arms itself indefinitely.

pub mod command;
#[cfg(feature = "serial")]
pub mod serial;
pub mod sim;

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crc::{Crc, CRC_32_ISO_HDLC};
use log::{debug, info, trace, warn};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

use crate::logutil::escape_log;
use crate::metrics;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// How often the bridge task sweeps its deadlines.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Errors surfaced to callers of the bridge.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ModemError {
    #[error("payload is empty")]
    InvalidInput,
    #[error("encoded payload exceeds the modem command buffer (max {max} bytes)")]
    PayloadTooLarge { max: usize },
    #[error("a publish is already in flight")]
    Busy,
    #[error("previous publish failed and has not been acknowledged")]
    PreviousFailure,
    #[error("cloud connection attempt already in progress or established")]
    AlreadyConnecting,
    #[error("modem bridge task is gone")]
    ChannelClosed,
    #[error("serial write failed: {0}")]
    Io(String),
}

/// Operating state of this node's modem, as reported to mesh peers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    /// Real device present but not yet heard from.
    Unknown,
    /// Device known to be powered down or never provisioned.
    Off,
    /// Ready to serve an upload.
    Idle,
    /// Serving an upload right now.
    Busy,
}

impl DeviceState {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            DeviceState::Unknown => 0,
            DeviceState::Off => 1,
            DeviceState::Idle => 2,
            DeviceState::Busy => 3,
        }
    }

    pub(crate) fn from_u8(raw: u8) -> Self {
        match raw {
            1 => DeviceState::Off,
            2 => DeviceState::Idle,
            3 => DeviceState::Busy,
            _ => DeviceState::Unknown,
        }
    }

    /// Whether a peer in this state can accept an upload round.
    pub fn can_serve(self) -> bool {
        self == DeviceState::Idle
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DeviceState::Unknown => "unknown",
            DeviceState::Off => "off",
            DeviceState::Idle => "idle",
            DeviceState::Busy => "busy",
        };
        f.write_str(s)
    }
}

/// State of the cloud connection behind `AT#XCLOUDCON`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Disconnected,
    Connecting,
    Connected,
}

/// State of the publish sub-machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PublishState {
    Idle,
    Publishing,
    Failed,
}

/// Notified synchronously on every `set_state`, in the bridge task.
/// Used for presentation only (indicator logging); must not block.
pub trait StateObserver: Send {
    fn device_state_changed(&mut self, previous: DeviceState, current: DeviceState);
}

/// One side of the modem's command channel: outbound lines plus a hardware
/// wake pulse. Inbound lines arrive on the channel handed to
/// [`ModemBridge::spawn`] by the port constructor.
pub trait CommandPort: Send {
    /// Write one command line; the port appends the CRLF terminator.
    fn send_line(&mut self, line: &str) -> Result<(), ModemError>;
    /// Pulse whatever mechanism wakes a silent device. Best-effort.
    fn wake(&mut self);
}

/// Requests accepted by the bridge task.
pub enum ModemCommand {
    CloudConnect {
        reply: oneshot::Sender<Result<(), ModemError>>,
    },
    CloudUpload {
        payload: Vec<u8>,
        reply: oneshot::Sender<Result<(), ModemError>>,
    },
    SetDeviceState {
        state: DeviceState,
    },
    ClearFailure,
    Query {
        reply: oneshot::Sender<ModemStatus>,
    },
    Shutdown,
}

/// Point-in-time view of the bridge, for `status` output and tests.
#[derive(Debug, Clone, Serialize)]
pub struct ModemStatus {
    pub device_state: DeviceState,
    pub link_state: LinkState,
    pub publish_state: PublishState,
    pub synced: bool,
    pub transmissions: u8,
}

/// Timing knobs, extracted from [`crate::config::ModemConfig`].
#[derive(Debug, Clone)]
pub struct ModemTuning {
    pub publish_timeout: Duration,
    pub publish_retry_limit: u8,
    pub sync_watchdog: Duration,
}

impl ModemTuning {
    pub fn from_config(cfg: &crate::config::ModemConfig) -> Self {
        ModemTuning {
            publish_timeout: Duration::from_millis(cfg.publish_timeout_ms),
            publish_retry_limit: cfg.publish_retry_limit,
            sync_watchdog: Duration::from_secs(cfg.sync_watchdog_secs),
        }
    }
}

/// Cloneable handle other tasks use to reach the bridge.
#[derive(Clone)]
pub struct ModemHandle {
    commands: mpsc::UnboundedSender<ModemCommand>,
    device_state: Arc<AtomicU8>,
}

impl ModemHandle {
    /// Last known device state, read without touching the bridge task.
    pub fn device_state(&self) -> DeviceState {
        DeviceState::from_u8(self.device_state.load(Ordering::Relaxed))
    }

    /// Ask the bridge to open the cloud connection. Resolves as soon as the
    /// connect command is on the wire; the handshake outcome arrives later as
    /// an unsolicited notification.
    pub async fn cloud_connect(&self) -> Result<(), ModemError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ModemCommand::CloudConnect { reply: tx })
            .map_err(|_| ModemError::ChannelClosed)?;
        rx.await.map_err(|_| ModemError::ChannelClosed)?
    }

    /// Hand a payload to the bridge for publishing. Resolves with the
    /// accept/reject decision; delivery itself is handled by the bridge's
    /// retransmit loop.
    pub async fn cloud_upload(&self, payload: Vec<u8>) -> Result<(), ModemError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ModemCommand::CloudUpload { payload, reply: tx })
            .map_err(|_| ModemError::ChannelClosed)?;
        rx.await.map_err(|_| ModemError::ChannelClosed)?
    }

    /// Request a device state transition. Fire-and-forget; the bridge task
    /// applies it in order with everything else it is doing.
    pub fn set_device_state(&self, state: DeviceState) {
        let _ = self.commands.send(ModemCommand::SetDeviceState { state });
    }

    /// Acknowledge a failed publish so the next upload is accepted again.
    pub fn clear_failure(&self) {
        let _ = self.commands.send(ModemCommand::ClearFailure);
    }

    pub async fn status(&self) -> Result<ModemStatus, ModemError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(ModemCommand::Query { reply: tx })
            .map_err(|_| ModemError::ChannelClosed)?;
        rx.await.map_err(|_| ModemError::ChannelClosed)
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(ModemCommand::Shutdown);
    }
}

/// A publish between acceptance and its terminal report.
struct InflightPublish {
    /// Encoded command line, resent verbatim on each retransmission.
    line: String,
    digest: u32,
    len: usize,
    deadline: Instant,
    started: Instant,
}

/// The bridge task. Owns the port and every piece of modem state; see the
/// module docs for the state machines.
pub struct ModemBridge {
    port: Box<dyn CommandPort>,
    lines: mpsc::UnboundedReceiver<String>,
    commands: mpsc::UnboundedReceiver<ModemCommand>,
    observer: Box<dyn StateObserver>,
    tuning: ModemTuning,
    device_state: DeviceState,
    shared_state: Arc<AtomicU8>,
    link_state: LinkState,
    publish_state: PublishState,
    synced: bool,
    /// Transmissions of the current publish, including the first write.
    transmissions: u8,
    inflight: Option<InflightPublish>,
    sync_deadline: Option<Instant>,
}

impl ModemBridge {
    /// Spawn the bridge task and return the handle other tasks keep.
    pub fn spawn(
        port: Box<dyn CommandPort>,
        lines: mpsc::UnboundedReceiver<String>,
        initial_state: DeviceState,
        tuning: ModemTuning,
        observer: Box<dyn StateObserver>,
    ) -> ModemHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let bridge = ModemBridge::new(port, lines, rx, initial_state, tuning, observer);
        let handle = ModemHandle {
            commands: tx,
            device_state: bridge.shared_state.clone(),
        };
        tokio::spawn(bridge.run());
        handle
    }

    fn new(
        port: Box<dyn CommandPort>,
        lines: mpsc::UnboundedReceiver<String>,
        commands: mpsc::UnboundedReceiver<ModemCommand>,
        initial_state: DeviceState,
        tuning: ModemTuning,
        observer: Box<dyn StateObserver>,
    ) -> Self {
        ModemBridge {
            port,
            lines,
            commands,
            observer,
            tuning,
            device_state: initial_state,
            shared_state: Arc::new(AtomicU8::new(initial_state.as_u8())),
            link_state: LinkState::Disconnected,
            publish_state: PublishState::Idle,
            synced: false,
            transmissions: 0,
            inflight: None,
            sync_deadline: None,
        }
    }

    async fn run(mut self) {
        info!(
            "Modem bridge task started (publish timeout {:?}, retry limit {}, watchdog {:?})",
            self.tuning.publish_timeout, self.tuning.publish_retry_limit, self.tuning.sync_watchdog
        );
        self.sync_deadline = Some(Instant::now() + self.tuning.sync_watchdog);
        let mut sweep = tokio::time::interval(SWEEP_INTERVAL);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                cmd = self.commands.recv() => {
                    match cmd {
                        Some(ModemCommand::Shutdown) | None => {
                            if self.link_state == LinkState::Connected {
                                debug!("TX {}", command::CMD_CLOUD_DISCONNECT);
                                let _ = self.port.send_line(command::CMD_CLOUD_DISCONNECT);
                            }
                            break;
                        }
                        Some(cmd) => self.handle_command(cmd),
                    }
                }
                line = self.lines.recv() => {
                    match line {
                        Some(line) => self.handle_line(&line),
                        None => {
                            warn!("Modem line channel closed; stopping bridge");
                            break;
                        }
                    }
                }
                _ = sweep.tick() => {
                    self.check_deadlines(Instant::now());
                }
            }
        }
        info!("Modem bridge task stopped");
    }

    fn handle_command(&mut self, cmd: ModemCommand) {
        match cmd {
            ModemCommand::CloudConnect { reply } => {
                let result = self.start_connect();
                let _ = reply.send(result);
            }
            ModemCommand::CloudUpload { payload, reply } => {
                let result = self.start_upload(payload, Instant::now());
                let _ = reply.send(result);
            }
            ModemCommand::SetDeviceState { state } => self.set_device_state(state),
            ModemCommand::ClearFailure => self.clear_failure(),
            ModemCommand::Query { reply } => {
                let _ = reply.send(self.status());
            }
            // Handled in the run loop so the port can be closed down cleanly.
            ModemCommand::Shutdown => {}
        }
    }

    /// Apply a device state transition and notify the observer. Every call
    /// fires the observer exactly once, including same-state transitions.
    fn set_device_state(&mut self, state: DeviceState) {
        let previous = self.device_state;
        self.device_state = state;
        self.shared_state.store(state.as_u8(), Ordering::Relaxed);
        if previous == state {
            debug!("Device state {} (unchanged)", state);
        } else {
            info!("Device state {} -> {}", previous, state);
        }
        self.observer.device_state_changed(previous, state);
    }

    fn start_connect(&mut self) -> Result<(), ModemError> {
        if self.link_state != LinkState::Disconnected {
            return Err(ModemError::AlreadyConnecting);
        }
        if !self.synced {
            warn!("Cloud connect requested before modem sync; sending anyway");
        }
        debug!("TX {}", command::CMD_CLOUD_CONNECT);
        self.port.send_line(command::CMD_CLOUD_CONNECT)?;
        info!("Cloud connection requested");
        self.link_state = LinkState::Connecting;
        Ok(())
    }

    fn start_upload(&mut self, payload: Vec<u8>, now: Instant) -> Result<(), ModemError> {
        let line = command::encode_cloud_send(&payload)?;
        match self.publish_state {
            PublishState::Publishing => return Err(ModemError::Busy),
            PublishState::Failed => return Err(ModemError::PreviousFailure),
            PublishState::Idle => {}
        }
        let digest = CRC32.checksum(&payload);
        info!(
            "Cloud publish accepted ({} bytes, crc32 {:08x})",
            payload.len(),
            digest
        );
        self.publish_state = PublishState::Publishing;
        self.transmissions = 0;
        self.inflight = Some(InflightPublish {
            line,
            digest,
            len: payload.len(),
            deadline: now,
            started: now,
        });
        self.transmit(now);
        Ok(())
    }

    /// Write the in-flight command and re-arm its liveness deadline. A write
    /// error is logged and left to the retransmit loop; the deadline is armed
    /// either way so the attempt still counts against the ceiling.
    fn transmit(&mut self, now: Instant) {
        let timeout = self.tuning.publish_timeout;
        if let Some(inflight) = &mut self.inflight {
            self.transmissions = self.transmissions.saturating_add(1);
            inflight.deadline = now + timeout;
            metrics::inc_publish_sent();
            trace!("TX {}", escape_log(&inflight.line));
            if let Err(e) = self.port.send_line(&inflight.line) {
                warn!("Serial write for publish failed: {}", e);
            }
        }
    }

    fn clear_failure(&mut self) {
        if self.publish_state == PublishState::Failed {
            info!("Publish failure acknowledged; uploads accepted again");
            self.publish_state = PublishState::Idle;
            self.transmissions = 0;
        } else {
            debug!("clear_failure with no failed publish");
        }
    }

    fn handle_line(&mut self, line: &str) {
        trace!("RX {}", escape_log(line));
        match command::parse_line(line) {
            command::ModemEvent::Sync => self.handle_sync(),
            command::ModemEvent::CommandOk => debug!("Command acknowledged"),
            command::ModemEvent::CommandError(Some(code)) => {
                warn!("Modem reported command error {}", code)
            }
            command::ModemEvent::CommandError(None) => warn!("Modem reported command error"),
            command::ModemEvent::CloudLink(true) => {
                info!("Cloud link established");
                self.link_state = LinkState::Connected;
            }
            command::ModemEvent::CloudLink(false) => {
                if self.link_state == LinkState::Connecting {
                    warn!("Cloud connection attempt rejected");
                } else {
                    warn!("Cloud link lost");
                }
                self.link_state = LinkState::Disconnected;
            }
            command::ModemEvent::PublishOk => self.finish_publish(true, None),
            command::ModemEvent::PublishError(code) => self.finish_publish(false, code),
            command::ModemEvent::Registration(stat) => {
                info!(
                    "Network registration: {} ({})",
                    stat,
                    command::registration_text(stat)
                );
            }
            command::ModemEvent::Other(text) => {
                debug!("Unhandled modem line: {}", escape_log(&text))
            }
        }
    }

    /// `Ready` seen. First sync moves an UNKNOWN/OFF device to IDLE; a repeat
    /// banner means the device rebooted, so the link is down and the bring-up
    /// sequence runs again. An in-flight publish is left armed; its liveness
    /// deadline re-sends it to the rebooted device.
    fn handle_sync(&mut self) {
        if self.synced {
            warn!("Modem re-synchronized; device likely rebooted");
            self.link_state = LinkState::Disconnected;
        } else {
            info!("Modem synchronized");
            self.synced = true;
            self.sync_deadline = None;
        }
        if matches!(self.device_state, DeviceState::Unknown | DeviceState::Off) {
            self.set_device_state(DeviceState::Idle);
        }
        self.link_bringup();
    }

    /// Fixed three-command configuration burst, sent in order without waiting
    /// for acknowledgements. Failures are logged, not retried; the next sync
    /// banner is the recovery path.
    fn link_bringup(&mut self) {
        for cmd in command::LINK_BRINGUP {
            debug!("TX {}", cmd);
            if let Err(e) = self.port.send_line(cmd) {
                warn!("Link bring-up command '{}' failed: {}", cmd, e);
            }
        }
    }

    /// Terminal report for the in-flight publish. Success returns the publish
    /// machine to idle; an explicit rejection is final (no retransmission).
    /// Either way the device becomes available for the next round.
    fn finish_publish(&mut self, ok: bool, code: Option<u32>) {
        let Some(inflight) = self.inflight.take() else {
            if ok && self.publish_state == PublishState::Failed {
                warn!("Publish acknowledgement arrived after the publish was abandoned; ignoring");
            } else {
                debug!("Publish report with nothing in flight");
            }
            return;
        };
        if ok {
            metrics::inc_publish_acked();
            metrics::observe_publish_latency(inflight.started);
            info!(
                "Cloud publish acknowledged (crc32 {:08x}, {} bytes, {} transmission(s))",
                inflight.digest, inflight.len, self.transmissions
            );
            self.publish_state = PublishState::Idle;
            self.transmissions = 0;
        } else {
            metrics::inc_publish_failed();
            match code {
                Some(code) => warn!(
                    "Cloud publish rejected with code {} (crc32 {:08x})",
                    code, inflight.digest
                ),
                None => warn!("Cloud publish rejected (crc32 {:08x})", inflight.digest),
            }
            self.publish_state = PublishState::Failed;
        }
        self.set_device_state(DeviceState::Idle);
    }

    /// Deadline sweep, driven by the run loop's tick. Takes `now` as a
    /// parameter so tests can drive time explicitly.
    fn check_deadlines(&mut self, now: Instant) {
        if !self.synced {
            if let Some(deadline) = self.sync_deadline {
                if now >= deadline {
                    warn!(
                        "Modem silent for {:?}; pulsing wake line",
                        self.tuning.sync_watchdog
                    );
                    self.port.wake();
                    self.sync_deadline = Some(now + self.tuning.sync_watchdog);
                }
            }
        }
        let due = matches!(&self.inflight, Some(inflight) if now >= inflight.deadline);
        if due {
            if self.transmissions >= self.tuning.publish_retry_limit {
                if let Some(inflight) = self.inflight.take() {
                    metrics::inc_publish_failed();
                    warn!(
                        "Cloud publish abandoned after {} transmission(s) (crc32 {:08x})",
                        self.transmissions, inflight.digest
                    );
                    self.publish_state = PublishState::Failed;
                    self.set_device_state(DeviceState::Idle);
                }
            } else {
                metrics::inc_publish_retries();
                warn!(
                    "No publish report within {:?}; retransmitting ({}/{})",
                    self.tuning.publish_timeout,
                    self.transmissions + 1,
                    self.tuning.publish_retry_limit
                );
                self.transmit(now);
            }
        }
    }

    fn status(&self) -> ModemStatus {
        ModemStatus {
            device_state: self.device_state,
            link_state: self.link_state,
            publish_state: self.publish_state,
            synced: self.synced,
            transmissions: self.transmissions,
        }
    }
}
