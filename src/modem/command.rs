//! AT command codec for the cellular modem link.
//!
//! The modem speaks a line-oriented dialect: commands go out as single
//! CRLF-terminated lines, responses and unsolicited notifications come back
//! the same way. This module owns the fixed command vocabulary, the hex
//! payload encoding for cloud publishes, and the incremental line splitter
//! used by the serial reader.

use bytes::BytesMut;

use super::ModemError;

/// Fixed size of the modem's command reception buffer. An encoded command
/// line longer than this is truncated by the device, so we refuse to send it.
pub const COMMAND_BUFFER_SIZE: usize = 512;

/// Banner the modem prints once its application core is up.
pub const SYNC_BANNER: &str = "Ready";

/// Link bring-up sequence, sent unconditionally in order after sync.
/// Failures are logged and not retried; a later re-sync re-runs the sequence.
pub const LINK_BRINGUP: [&str; 3] = [
    "AT%XSYSTEMMODE=0,1,0,0", // LTE-M only
    "AT+CEREG=5",             // unsolicited registration status with location
    "AT+CFUN=1",              // radio on
];

pub const CMD_CLOUD_CONNECT: &str = "AT#XCLOUDCON=1";
pub const CMD_CLOUD_DISCONNECT: &str = "AT#XCLOUDCON=0";

const CLOUD_SEND_PREFIX: &str = "AT#XCLOUDSEND=";

/// Largest payload whose encoded `AT#XCLOUDSEND` line still fits the command
/// buffer. Each payload byte costs two hex digits.
pub fn max_cloud_payload() -> usize {
    let mut n = 0usize;
    loop {
        let next = n + 1;
        // prefix + decimal length + `,"` + hex digits + closing quote
        let line_len = CLOUD_SEND_PREFIX.len() + decimal_digits(next) + 3 + next * 2;
        if line_len > COMMAND_BUFFER_SIZE {
            return n;
        }
        n = next;
    }
}

fn decimal_digits(mut n: usize) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}

/// Encode a cloud publish as `AT#XCLOUDSEND=<len>,"<hex>"`.
///
/// Rejects empty payloads and payloads whose encoded line would overflow the
/// command buffer; nothing is written in either case.
pub fn encode_cloud_send(payload: &[u8]) -> Result<String, ModemError> {
    use std::fmt::Write;

    if payload.is_empty() {
        return Err(ModemError::InvalidInput);
    }
    let max = max_cloud_payload();
    if payload.len() > max {
        return Err(ModemError::PayloadTooLarge { max });
    }
    let mut line = String::with_capacity(CLOUD_SEND_PREFIX.len() + 8 + payload.len() * 2);
    let _ = write!(&mut line, "{}{},\"", CLOUD_SEND_PREFIX, payload.len());
    for b in payload {
        let _ = write!(&mut line, "{:02X}", b);
    }
    line.push('"');
    debug_assert!(line.len() <= COMMAND_BUFFER_SIZE);
    Ok(line)
}

/// Decode an `AT#XCLOUDSEND` line back into its payload. Returns `None` for
/// anything malformed. Used by the simulated modem and by tests.
pub fn decode_cloud_send(line: &str) -> Option<Vec<u8>> {
    let rest = line.trim().strip_prefix(CLOUD_SEND_PREFIX)?;
    let (len_str, quoted) = rest.split_once(',')?;
    let len: usize = len_str.parse().ok()?;
    let hex = quoted.strip_prefix('"')?.strip_suffix('"')?;
    if hex.len() != len * 2 {
        return None;
    }
    let raw = hex.as_bytes();
    let mut payload = Vec::with_capacity(len);
    for pair in raw.chunks_exact(2) {
        let hi = (pair[0] as char).to_digit(16)?;
        let lo = (pair[1] as char).to_digit(16)?;
        payload.push(((hi << 4) | lo) as u8);
    }
    Some(payload)
}

/// Classified line from the modem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModemEvent {
    /// Boot banner; the device (re)entered its synchronized state.
    Sync,
    /// Plain `OK` acknowledging the previous command.
    CommandOk,
    /// Plain `ERROR` or `+CME ERROR: <n>`.
    CommandError(Option<u32>),
    /// `#XCLOUDCON: 1|0` — cloud link came up / went down.
    CloudLink(bool),
    /// `#XCLOUDSEND: OK` — the in-flight publish was accepted upstream.
    PublishOk,
    /// `#XCLOUDSEND: ERROR[,<n>]` — the in-flight publish was rejected.
    PublishError(Option<u32>),
    /// `+CEREG: <stat>` network registration status report.
    Registration(u8),
    /// Anything we do not understand; logged and dropped.
    Other(String),
}

/// Classify one trimmed line from the modem.
pub fn parse_line(line: &str) -> ModemEvent {
    let line = line.trim();
    match line {
        SYNC_BANNER => ModemEvent::Sync,
        "OK" => ModemEvent::CommandOk,
        "ERROR" => ModemEvent::CommandError(None),
        "#XCLOUDCON: 1" => ModemEvent::CloudLink(true),
        "#XCLOUDCON: 0" => ModemEvent::CloudLink(false),
        "#XCLOUDSEND: OK" => ModemEvent::PublishOk,
        _ => {
            if let Some(rest) = line.strip_prefix("#XCLOUDSEND: ERROR") {
                let code = rest.strip_prefix(',').and_then(|c| c.trim().parse().ok());
                ModemEvent::PublishError(code)
            } else if let Some(rest) = line.strip_prefix("+CME ERROR:") {
                ModemEvent::CommandError(rest.trim().parse().ok())
            } else if let Some(rest) = line.strip_prefix("+CEREG:") {
                match rest.trim().split(',').next().and_then(|s| s.trim().parse().ok()) {
                    Some(stat) => ModemEvent::Registration(stat),
                    None => ModemEvent::Other(line.to_string()),
                }
            } else {
                ModemEvent::Other(line.to_string())
            }
        }
    }
}

/// Human-readable text for a +CEREG registration status.
pub fn registration_text(stat: u8) -> &'static str {
    match stat {
        0 => "not registered, not searching",
        1 => "registered, home network",
        2 => "not registered, searching",
        3 => "registration denied",
        4 => "unknown",
        5 => "registered, roaming",
        _ => "reserved",
    }
}

/// Incremental splitter turning raw serial bytes into trimmed lines.
///
/// Lines are LF-terminated; a trailing CR is stripped and blank lines are
/// dropped. Bytes of an unterminated line are held until the terminator
/// arrives. The buffer is capped so a modem stuck mid-line cannot grow it
/// without bound.
pub struct LineAccumulator {
    buf: BytesMut,
}

const MAX_PENDING_LINE: usize = 4096;

impl LineAccumulator {
    pub fn new() -> Self {
        LineAccumulator {
            buf: BytesMut::with_capacity(COMMAND_BUFFER_SIZE),
        }
    }

    /// Feed raw bytes; returns every complete line they finished.
    pub fn push(&mut self, data: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(data);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let raw = self.buf.split_to(pos + 1);
            let mut end = raw.len() - 1;
            if end > 0 && raw[end - 1] == b'\r' {
                end -= 1;
            }
            if end == 0 {
                continue;
            }
            let line = String::from_utf8_lossy(&raw[..end]).into_owned();
            lines.push(line);
        }
        if self.buf.len() > MAX_PENDING_LINE {
            log::warn!(
                "Discarding {} bytes of unterminated modem output",
                self.buf.len()
            );
            self.buf.clear();
        }
        lines
    }
}

impl Default for LineAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
