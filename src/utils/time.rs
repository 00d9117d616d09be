//! Timestamps for instance log headers

use chrono::Utc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Seconds since the Unix epoch; 0 when the clock is set before it
pub fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_else(|_| {
            warn!("System time is before UNIX epoch, using 0 as timestamp");
            Duration::from_secs(0)
        })
        .as_secs()
}

/// Current UTC time as `YYYY-MM-DD HH:MM:SS`
pub fn log_timestamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S").to_string()
}
