//! Wall-clock timestamps.
//!
//! Record timestamps (bars, executions, positions) are **milliseconds** since
//! Unix epoch, matching what the exchanges send.

use std::time::{SystemTime, UNIX_EPOCH};

#[inline]
fn since_epoch() -> std::time::Duration {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default()
}

/// Current time as **milliseconds** since Unix epoch.
#[inline]
pub fn now_ms() -> u64 {
    since_epoch().as_millis() as u64
}

/// Current time as **microseconds** since Unix epoch.
#[inline]
pub fn now_us() -> u64 {
    since_epoch().as_micros() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn units_agree() {
        let ms = now_ms();
        let us = now_us();
        assert!(us / 1_000 >= ms);
        assert!(us / 1_000 - ms < 1_000);
    }
}
