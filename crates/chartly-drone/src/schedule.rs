// SPDX-License-Identifier: MIT OR Apache-2.0

//! Deterministic per-(drone, profile) scheduling.

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::time::Duration;

/// Deterministic jitter inside `[0, window)`.
///
/// Defined as the first 8 bytes (big-endian) of
/// `sha256(drone_id + "|" + profile_id)`, reduced modulo the window. The
/// same inputs always yield the same jitter, spreading a fleet's fetches
/// without any coordination.
#[must_use]
pub fn deterministic_jitter(drone_id: &str, profile_id: &str, window: Duration) -> Duration {
    if window.is_zero() {
        return Duration::ZERO;
    }
    let mut hasher = Sha256::new();
    hasher.update(drone_id.as_bytes());
    hasher.update(b"|");
    hasher.update(profile_id.as_bytes());
    let digest = hasher.finalize();
    let mut first8 = [0u8; 8];
    first8.copy_from_slice(&digest[..8]);
    let n = u64::from_be_bytes(first8);
    Duration::from_nanos(n % window.as_nanos() as u64)
}

/// The next due instant: `last_run + interval + deterministic_jitter`.
#[must_use]
pub fn next_run(
    last_run: DateTime<Utc>,
    interval: Duration,
    drone_id: &str,
    profile_id: &str,
    jitter_window: Duration,
) -> DateTime<Utc> {
    let jitter = deterministic_jitter(drone_id, profile_id, jitter_window);
    last_run
        + chrono::Duration::from_std(interval).unwrap_or(chrono::Duration::MAX)
        + chrono::Duration::from_std(jitter).unwrap_or_default()
}

/// Decide whether a profile is due.
///
/// A profile with no recorded run or no usable interval is always due.
#[must_use]
pub fn is_due(
    now: DateTime<Utc>,
    last_run: Option<DateTime<Utc>>,
    interval: Option<Duration>,
    drone_id: &str,
    profile_id: &str,
    jitter_window: Duration,
) -> bool {
    let Some(last_run) = last_run else {
        return true;
    };
    let Some(interval) = interval else {
        return true;
    };
    now >= next_run(last_run, interval, drone_id, profile_id, jitter_window)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn jitter_is_deterministic_and_bounded() {
        let window = Duration::from_secs(10);
        let first = deterministic_jitter("d", "p", window);
        let second = deterministic_jitter("d", "p", window);
        assert_eq!(first, second);
        assert!(first < window);

        // Different identities spread differently (with overwhelming odds).
        let other = deterministic_jitter("d", "q", window);
        assert_ne!(first, other);
    }

    #[test]
    fn zero_window_means_zero_jitter() {
        assert_eq!(deterministic_jitter("d", "p", Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn due_exactly_at_next_run_boundary() {
        // next = last + interval + j; not due 1ns before, due at and after.
        let last = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let interval = Duration::from_secs(60);
        let window = Duration::from_secs(10);
        let next = next_run(last, interval, "d", "p", window);

        let just_before = next - chrono::Duration::nanoseconds(1);
        assert!(!is_due(just_before, Some(last), Some(interval), "d", "p", window));
        assert!(is_due(next, Some(last), Some(interval), "d", "p", window));
        assert!(is_due(
            next + chrono::Duration::seconds(1),
            Some(last),
            Some(interval),
            "d",
            "p",
            window
        ));
    }

    #[test]
    fn next_run_matches_the_jitter_formula() {
        let last = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let interval = Duration::from_secs(60);
        let window = Duration::from_secs(10);
        let jitter = deterministic_jitter("d", "p", window);
        let expected = last
            + chrono::Duration::from_std(interval).unwrap()
            + chrono::Duration::from_std(jitter).unwrap();
        assert_eq!(next_run(last, interval, "d", "p", window), expected);
    }

    #[test]
    fn missing_last_run_or_interval_is_due() {
        let now = Utc::now();
        assert!(is_due(now, None, Some(Duration::from_secs(60)), "d", "p", Duration::ZERO));
        assert!(is_due(now, Some(now), None, "d", "p", Duration::ZERO));
    }
}
