//! Tests for utility functions

use deferred_work::util::{clock_origin, instant_to_ms, ktime_ms, now_ms};
use std::time::{Duration, Instant};

#[test]
fn test_ktime_starts_near_origin() {
    let origin = clock_origin();
    assert_eq!(instant_to_ms(origin), 0);
    assert!(ktime_ms() >= instant_to_ms(origin));
}

#[test]
fn test_instant_before_origin_saturates() {
    let origin = clock_origin();
    let earlier = origin.checked_sub(Duration::from_millis(10)).unwrap_or(origin);
    assert_eq!(instant_to_ms(earlier), 0);
}

#[test]
fn test_instant_to_ms_tracks_elapsed() {
    let before = ktime_ms();
    let later = Instant::now() + Duration::from_millis(50);
    assert!(instant_to_ms(later) >= before + 50);
}

#[test]
fn test_wall_clock() {
    assert!(now_ms() > 0);
}
