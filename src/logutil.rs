//! Logging helpers for byte-level traffic, keeping raw bus bytes readable in
//! single-line log output.

use std::fmt::Write as _;

/// Render up to `max` bytes of `data` as space-separated hex, appending an
/// ellipsis with the remaining count when truncated.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    let shown = data.len().min(max);
    let mut out = String::with_capacity(shown * 3 + 16);
    for (i, b) in data[..shown].iter().enumerate() {
        if i > 0 {
            out.push(' ');
        }
        let _ = write!(&mut out, "{b:02x}");
    }
    if data.len() > shown {
        let _ = write!(&mut out, " …(+{} bytes)", data.len() - shown);
    }
    out
}
