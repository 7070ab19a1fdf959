//! Time helpers.
//!
//! `ktime_ms` is the monotonic clock every primitive in this crate reports
//! against; it starts at zero the first time any component reads it.

use std::sync::OnceLock;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

static CLOCK_ORIGIN: OnceLock<Instant> = OnceLock::new();

/// The process-wide monotonic origin used by [`ktime_ms`].
pub fn clock_origin() -> Instant {
    *CLOCK_ORIGIN.get_or_init(Instant::now)
}

/// Milliseconds elapsed on the monotonic clock since [`clock_origin`].
#[allow(clippy::cast_possible_truncation)]
pub fn ktime_ms() -> u64 {
    clock_origin().elapsed().as_millis() as u64
}

/// Convert an instant to milliseconds on the monotonic clock.
#[allow(clippy::cast_possible_truncation)]
pub fn instant_to_ms(at: Instant) -> u64 {
    at.saturating_duration_since(clock_origin()).as_millis() as u64
}

/// Wall clock milliseconds since the Unix epoch.
pub fn now_ms() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_ktime_is_monotonic() {
        let a = ktime_ms();
        std::thread::sleep(Duration::from_millis(5));
        let b = ktime_ms();
        assert!(b >= a + 5);
    }

    #[test]
    fn test_instant_to_ms_relative_to_origin() {
        let origin = clock_origin();
        assert_eq!(instant_to_ms(origin), 0);
        assert!(instant_to_ms(origin + Duration::from_millis(40)) >= 40);
    }

    #[test]
    fn test_now_ms_positive() {
        assert!(now_ms() > 0);
    }
}
