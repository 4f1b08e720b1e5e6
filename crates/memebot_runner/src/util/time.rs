#![forbid(unsafe_code)]

use std::time::{Duration, SystemTime, UNIX_EPOCH};

const DAY_MS: i64 = 86_400_000;

/// Current Unix time in milliseconds.
#[inline]
pub fn unix_ms_now() -> i64 {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.unwrap_or(Duration::from_secs(0))
		.as_millis() as i64
}

/// UTC calendar day number (days since the Unix epoch).
#[inline]
pub fn utc_day(unix_ms: i64) -> i64 {
	unix_ms.div_euclid(DAY_MS)
}

/// `YYYY-MM-DD` of a UTC day number.
pub fn utc_date_label(day: i64) -> String {
	chrono::DateTime::from_timestamp_millis(day * DAY_MS)
		.map(|dt| dt.format("%Y-%m-%d").to_string())
		.unwrap_or_else(|| day.to_string())
}

/// Inverse of [`utc_date_label`].
pub fn utc_day_from_label(label: &str) -> Option<i64> {
	let date = chrono::NaiveDate::parse_from_str(label, "%Y-%m-%d").ok()?;
	let midnight = date.and_hms_opt(0, 0, 0)?.and_utc();
	Some(utc_day(midnight.timestamp_millis()))
}
