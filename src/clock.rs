// Copyright (c) Meta Platforms, Inc. and affiliates.

// This software may be used and distributed according to the terms of the
// GNU General Public License version 2.

//! Monotonic timestamps and sleeping in the units the results file uses.

use std::time::Duration;

use anyhow::{Context, Result};
use nix::time::{clock_gettime, ClockId};

pub const NSEC_PER_MSEC: u64 = 1_000_000;
pub const NSEC_PER_SEC: u64 = 1_000_000_000;

/// Nanoseconds on the raw monotonic clock.
pub fn now_ns() -> Result<u64> {
    let ts = clock_gettime(ClockId::CLOCK_MONOTONIC_RAW)
        .context("Failed to read CLOCK_MONOTONIC_RAW")?;
    Ok(ts.tv_sec() as u64 * NSEC_PER_SEC + ts.tv_nsec() as u64)
}

pub fn sleep_ms(ms: u64) {
    std::thread::sleep(Duration::from_millis(ms));
}

pub fn ns_to_secs(ns: u64) -> f64 {
    ns as f64 / NSEC_PER_SEC as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_is_monotonic() {
        let a = now_ns().unwrap();
        sleep_ms(2);
        let b = now_ns().unwrap();
        assert!(a > 0);
        assert!(b >= a + 2 * NSEC_PER_MSEC);
    }

    #[test]
    fn test_ns_to_secs() {
        assert_eq!(ns_to_secs(1_500_000_000), 1.5);
        assert_eq!(ns_to_secs(0), 0.0);
    }
}
