#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current Unix time in milliseconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}

/// Current Unix time in seconds.
#[inline]
pub fn unix_secs_now() -> u64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_secs()
}

/// Exponential backoff: `min * 2^attempt`, clamped to `[min, max]`.
pub fn backoff_delay(attempt: u32, min: Duration, max: Duration) -> Duration {
	let pow = attempt.min(16);
	let ms = min.as_millis().saturating_mul(1u128 << pow);
	Duration::from_millis(ms.min(u64::MAX as u128) as u64).min(max).max(min)
}
