//! Logging utilities for sanitizing modem lines and payload bytes so logs stay single-line.
//! Escapes control characters that otherwise break log readability.

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///   Truncates very long strings (over `max_preview`) with an ellipsis to cap log noise.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 300; // generous for debug; adjust if needed
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                // Represent other control chars as hex \xNN
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Render the leading bytes of a payload as lowercase hex for debug logs,
/// e.g. `[30 31 32 33 ..] (128 bytes)`. Shows at most `limit` bytes.
pub fn hex_snippet(data: &[u8], limit: usize) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(limit * 3 + 16);
    out.push('[');
    for (i, b) in data.iter().take(limit).enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(&mut out, "{:02x}", b);
    }
    if data.len() > limit {
        out.push_str(" ..");
    }
    let _ = write!(&mut out, "] ({} bytes)", data.len());
    out
}
