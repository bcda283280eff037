//! Number formatting utilities for sweep output.

use std::time::Duration;

/// Format a byte size with binary suffixes.
/// - < 1K: "XXXB"
/// - 1K - 1M: "X.XKB", exact multiples as "XKB"
/// - 1M - 1G: "X.XMB", exact multiples as "XMB"
/// - >= 1G: "X.XXGB"
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes < KB {
        format!("{}B", bytes)
    } else if bytes < MB {
        scaled(bytes, KB, "KB")
    } else if bytes < GB {
        scaled(bytes, MB, "MB")
    } else {
        format!("{:.2}GB", bytes as f64 / GB as f64)
    }
}

fn scaled(bytes: u64, unit: u64, suffix: &str) -> String {
    if bytes.is_multiple_of(unit) {
        format!("{}{}", bytes / unit, suffix)
    } else {
        format!("{:.1}{}", bytes as f64 / unit as f64, suffix)
    }
}

/// Format a relative change as a signed percentage with one decimal.
/// Infinite changes (a step up from zero latency) render as "inf".
pub fn format_change(change: f64) -> String {
    if change.is_infinite() {
        "inf".to_string()
    } else {
        format!("{:+.1}%", change * 100.0)
    }
}

/// Format a value with padding for table alignment.
pub fn padded(s: &str, width: usize) -> String {
    format!("{:>width$}", s, width = width)
}

/// Format an elapsed run time.
/// - < 60s: "X.Xs"
/// - < 1h: "XmYYs"
/// - otherwise: "XhYYm"
pub fn format_elapsed(elapsed: Duration) -> String {
    let secs = elapsed.as_secs();
    if secs < 60 {
        format!("{:.1}s", elapsed.as_secs_f64())
    } else if secs < 3600 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    }
}
