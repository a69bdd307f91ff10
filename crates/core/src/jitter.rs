//! Randomised scheduling offsets.
//!
//! Every instance in a fleet runs the same schedule, so fixed intervals line
//! up and hit the store at the same moment. These helpers spread them out.

use std::time::Duration;

use rand::Rng;

/// Default spread applied by [`jittered`] callers that have no opinion.
pub const DEFAULT_JITTER_FRACTION: f64 = 0.25;

/// Returns `base` scaled by a random factor in `[1 - fraction, 1 + fraction)`.
///
/// `fraction` is clamped to `0.0..=1.0`. A zero `base` or zero `fraction`
/// returns `base` unchanged.
pub fn jittered(base: Duration, fraction: f64) -> Duration {
    let fraction = if fraction.is_finite() {
        fraction.clamp(0.0, 1.0)
    } else {
        0.0
    };
    if base.is_zero() || fraction == 0.0 {
        return base;
    }

    let factor = rand::thread_rng().gen_range((1.0 - fraction)..(1.0 + fraction));
    base.mul_f64(factor)
}

/// Returns a uniformly random duration in `[0, max]`.
pub fn up_to(max: Duration) -> Duration {
    if max.is_zero() {
        return max;
    }
    let millis = max.as_millis().min(u64::MAX as u128) as u64;
    Duration::from_millis(rand::thread_rng().gen_range(0..=millis))
}
