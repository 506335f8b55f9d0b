//! Serial command channel for a real AT-command modem.
//!
//! Writes stay on the bridge task; reads run on a dedicated blocking thread
//! because `serialport` exposes a synchronous `Read`. The reader splits the
//! byte stream into lines and forwards them over an unbounded channel.

use std::io::{Read, Write};
use std::time::Duration;

use anyhow::{anyhow, Result};
use log::{debug, info, trace, warn};
use serialport::SerialPort;
use tokio::sync::mpsc;

use super::command::LineAccumulator;
use super::{CommandPort, ModemError};
use crate::logutil::hex_snippet;

struct SerialCommandPort {
    port: Box<dyn SerialPort>,
}

/// Open the modem's serial port and start its reader thread. Returns the
/// write side and the channel complete lines arrive on.
pub async fn open(
    port_name: &str,
    baud_rate: u32,
) -> Result<(Box<dyn CommandPort>, mpsc::UnboundedReceiver<String>)> {
    info!(
        "Opening modem serial port {} at {} baud",
        port_name, baud_rate
    );
    let mut builder = serialport::new(port_name, baud_rate).timeout(Duration::from_millis(200));
    // Some USB serial adapters need explicit settings
    #[cfg(unix)]
    {
        builder = builder
            .data_bits(serialport::DataBits::Eight)
            .stop_bits(serialport::StopBits::One)
            .parity(serialport::Parity::None);
    }
    let mut port = builder
        .open()
        .map_err(|e| anyhow!("Failed to open serial port {}: {}", port_name, e))?;
    // Raise DTR/RTS so a sleeping device notices the host
    let _ = port.write_data_terminal_ready(true);
    let _ = port.write_request_to_send(true);
    // Small settle delay
    tokio::time::sleep(Duration::from_millis(150)).await;
    // Clear any boot noise already buffered
    if let Ok(available) = port.bytes_to_read() {
        if available > 0 {
            let mut purge_buf = vec![0u8; available as usize];
            let _ = port.read(&mut purge_buf);
            debug!("Flushed {} buffered bytes from {}", available, port_name);
        }
    }

    let reader = port
        .try_clone()
        .map_err(|e| anyhow!("Failed to clone serial port {}: {}", port_name, e))?;
    let (line_tx, line_rx) = mpsc::unbounded_channel();
    let name = port_name.to_string();
    std::thread::Builder::new()
        .name("modem-serial-rx".to_string())
        .spawn(move || reader_loop(reader, line_tx, name))?;

    Ok((Box::new(SerialCommandPort { port }), line_rx))
}

fn reader_loop(
    mut port: Box<dyn SerialPort>,
    lines: mpsc::UnboundedSender<String>,
    name: String,
) {
    let mut acc = LineAccumulator::new();
    let mut buf = [0u8; 512];
    loop {
        if lines.is_closed() {
            debug!("Line receiver dropped; stopping serial reader for {}", name);
            return;
        }
        match port.read(&mut buf) {
            Ok(0) => std::thread::sleep(Duration::from_millis(20)),
            Ok(n) => {
                trace!("RAW {} bytes: {}", n, hex_snippet(&buf[..n], 64));
                for line in acc.push(&buf[..n]) {
                    if lines.send(line).is_err() {
                        return;
                    }
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {}
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                warn!("Serial read error on {}: {}", name, e);
                std::thread::sleep(Duration::from_millis(500));
            }
        }
    }
}

impl CommandPort for SerialCommandPort {
    fn send_line(&mut self, line: &str) -> Result<(), ModemError> {
        let mut framed = Vec::with_capacity(line.len() + 2);
        framed.extend_from_slice(line.as_bytes());
        framed.extend_from_slice(b"\r\n");
        self.port
            .write_all(&framed)
            .map_err(|e| ModemError::Io(e.to_string()))
    }

    fn wake(&mut self) {
        // Drop and re-raise DTR; the firmware treats the rising edge as a
        // wake request. Held low briefly so slow UARTs register the edge.
        let _ = self.port.write_data_terminal_ready(false);
        std::thread::sleep(Duration::from_millis(50));
        let _ = self.port.write_data_terminal_ready(true);
    }
}
