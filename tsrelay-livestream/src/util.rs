//! Shared utilities for the livestream crate.

use std::time::Duration;

/// Wall-clock seconds since the epoch, the timestamp format used in shared records.
#[must_use]
pub fn now_secs() -> f64 {
    chrono::Utc::now().timestamp_millis() as f64 / 1000.0
}

/// Exponential backoff delay: `initial * 2^(attempt-1)`, capped at `max`.
#[must_use]
pub fn backoff_delay(attempt: u32, initial: Duration, max: Duration) -> Duration {
    let factor = 1u32 << attempt.clamp(1, 16).saturating_sub(1);
    initial.saturating_mul(factor).min(max)
}

/// Human-readable byte count (`B`, `KB`, `MB`, `GB`).
#[must_use]
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.2} {}", UNITS[unit])
    }
}

/// Average bitrate in kbit/s over `seconds`.
#[must_use]
pub fn bitrate_kbps(bytes: u64, seconds: f64) -> f64 {
    if seconds <= 0.0 {
        return 0.0;
    }
    bytes as f64 * 8.0 / seconds / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_caps() {
        let initial = Duration::from_secs(1);
        let max = Duration::from_secs(30);
        assert_eq!(backoff_delay(1, initial, max), Duration::from_secs(1));
        assert_eq!(backoff_delay(3, initial, max), Duration::from_secs(4));
        assert_eq!(backoff_delay(10, initial, max), max);
        assert_eq!(backoff_delay(0, initial, max), initial);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
        assert_eq!(format_bytes(3 * 1024 * 1024 * 1024), "3.00 GB");
    }

    #[test]
    fn test_bitrate() {
        assert!((bitrate_kbps(125_000, 1.0) - 1000.0).abs() < f64::EPSILON);
        assert!(bitrate_kbps(100, 0.0).abs() < f64::EPSILON);
    }
}
