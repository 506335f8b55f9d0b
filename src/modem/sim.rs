//! Simulated modem for development boxes and tests.
//!
//! Emulates the device on the far side of the command channel: it boots,
//! prints the `Ready` banner, answers the bring-up commands, accepts cloud
//! connect/send commands and emits the matching notifications after short
//! delays. The [`SimProfile`] knobs let tests hold back the banner, refuse
//! the connection or swallow publish reports to exercise the bridge's
//! watchdog and retransmit paths.

use std::time::Duration;

use log::debug;
use tokio::sync::mpsc;
use tokio::time::sleep;

use super::command;
use super::{CommandPort, ModemError};
use crate::logutil::escape_log;

/// Behavior knobs for the simulated device.
#[derive(Debug, Clone)]
pub struct SimProfile {
    /// Print the ready banner this long after power-on (or after a wake pulse).
    pub boot_delay: Duration,
    /// Announce the cloud link this long after the connect command.
    pub connect_delay: Duration,
    /// Report a publish outcome this long after the send command.
    pub publish_delay: Duration,
    /// Boot on its own; when false the device stays silent until woken.
    pub auto_boot: bool,
    /// Swallow the report for this many publishes (exercises liveness timeouts).
    pub drop_publishes: u32,
    /// Reject this many publishes with an explicit error report.
    pub fail_publishes: u32,
    /// Answer every connect attempt with a refusal.
    pub refuse_connect: bool,
}

impl Default for SimProfile {
    fn default() -> Self {
        SimProfile {
            boot_delay: Duration::from_millis(300),
            connect_delay: Duration::from_millis(200),
            publish_delay: Duration::from_millis(250),
            auto_boot: true,
            drop_publishes: 0,
            fail_publishes: 0,
            refuse_connect: false,
        }
    }
}

enum SimInput {
    Line(String),
    Wake,
}

struct SimModemPort {
    tx: mpsc::UnboundedSender<SimInput>,
}

impl CommandPort for SimModemPort {
    fn send_line(&mut self, line: &str) -> Result<(), ModemError> {
        self.tx
            .send(SimInput::Line(line.to_string()))
            .map_err(|_| ModemError::Io("simulated modem stopped".to_string()))
    }

    fn wake(&mut self) {
        let _ = self.tx.send(SimInput::Wake);
    }
}

/// Start a simulated modem. Returns the same pair [`super::serial::open`]
/// does, so the bridge cannot tell the two apart.
pub fn spawn(profile: SimProfile) -> (Box<dyn CommandPort>, mpsc::UnboundedReceiver<String>) {
    let (line_tx, line_rx) = mpsc::unbounded_channel();
    let (input_tx, input_rx) = mpsc::unbounded_channel();
    let sim = SimModem {
        profile,
        lines: line_tx,
        inputs: input_rx,
        booted: false,
        connected: false,
        cereg_reports: false,
        drop_remaining: 0,
        fail_remaining: 0,
    };
    tokio::spawn(sim.run());
    (Box::new(SimModemPort { tx: input_tx }), line_rx)
}

struct SimModem {
    profile: SimProfile,
    lines: mpsc::UnboundedSender<String>,
    inputs: mpsc::UnboundedReceiver<SimInput>,
    booted: bool,
    connected: bool,
    cereg_reports: bool,
    drop_remaining: u32,
    fail_remaining: u32,
}

impl SimModem {
    async fn run(mut self) {
        self.drop_remaining = self.profile.drop_publishes;
        self.fail_remaining = self.profile.fail_publishes;
        if self.profile.auto_boot {
            sleep(self.profile.boot_delay).await;
            self.boot();
        }
        while let Some(input) = self.inputs.recv().await {
            match input {
                SimInput::Wake => {
                    if !self.booted {
                        sleep(self.profile.boot_delay).await;
                        self.boot();
                    }
                }
                SimInput::Line(line) => self.handle_command(&line).await,
            }
        }
        debug!("Simulated modem stopped");
    }

    fn boot(&mut self) {
        self.booted = true;
        self.connected = false;
        self.reply(command::SYNC_BANNER);
    }

    fn reply(&self, line: &str) {
        let _ = self.lines.send(line.to_string());
    }

    async fn handle_command(&mut self, line: &str) {
        let line = line.trim();
        if !self.booted {
            // a powered-down device eats input
            debug!("Simulated modem ignoring '{}' while off", escape_log(line));
            return;
        }
        if let Some(payload) = command::decode_cloud_send(line) {
            self.reply("OK");
            if self.drop_remaining > 0 {
                self.drop_remaining -= 1;
                debug!(
                    "Simulated modem swallowing publish report ({} bytes)",
                    payload.len()
                );
                return;
            }
            sleep(self.profile.publish_delay).await;
            if !self.connected {
                self.reply("#XCLOUDSEND: ERROR,1");
            } else if self.fail_remaining > 0 {
                self.fail_remaining -= 1;
                self.reply("#XCLOUDSEND: ERROR,7");
            } else {
                self.reply("#XCLOUDSEND: OK");
            }
            return;
        }
        match line {
            "AT#XCLOUDCON=1" => {
                self.reply("OK");
                sleep(self.profile.connect_delay).await;
                if self.profile.refuse_connect {
                    self.reply("#XCLOUDCON: 0");
                } else {
                    self.connected = true;
                    self.reply("#XCLOUDCON: 1");
                }
            }
            "AT#XCLOUDCON=0" => {
                self.reply("OK");
                self.connected = false;
                self.reply("#XCLOUDCON: 0");
            }
            "AT+CEREG=5" => {
                self.cereg_reports = true;
                self.reply("OK");
            }
            "AT+CFUN=1" => {
                self.reply("OK");
                if self.cereg_reports {
                    sleep(Duration::from_millis(100)).await;
                    self.reply("+CEREG: 1");
                }
            }
            l if l.starts_with("AT") => self.reply("OK"),
            other => {
                debug!("Simulated modem rejecting '{}'", escape_log(other));
                self.reply("ERROR");
            }
        }
    }
}
