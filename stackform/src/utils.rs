//! Timestamp and id helpers.

use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A UTC timestamp.
pub type Timestamp = DateTime<Utc>;

/// Returns the current UTC time as `YYYY-MM-DDTHH:MM:SS.ffffff+00:00`.
///
/// ```
/// use stackform::utils::iso_timestamp;
///
/// let ts = iso_timestamp();
/// assert!(ts.contains('T'));
/// assert!(ts.ends_with("+00:00"));
/// ```
#[must_use]
pub fn iso_timestamp() -> String {
    format_timestamp(&Utc::now())
}

/// Formats a timestamp the same way as [`iso_timestamp`].
#[must_use]
pub fn format_timestamp(at: &Timestamp) -> String {
    at.format("%Y-%m-%dT%H:%M:%S%.6f+00:00").to_string()
}

/// Generates a time-ordered run id.
#[must_use]
pub fn generate_run_id() -> Uuid {
    Uuid::now_v7()
}

/// Milliseconds between two timestamps, never negative.
#[must_use]
pub fn elapsed_ms(from: &Timestamp, to: &Timestamp) -> u64 {
    u64::try_from((*to - *from).num_milliseconds()).unwrap_or(0)
}
