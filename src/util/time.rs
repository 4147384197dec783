use std::time::{SystemTime, UNIX_EPOCH};

/// Timeout value treated as "wait indefinitely" (roughly one year).
pub const FOREVER: f64 = 32_000_000.0;

/// Reading of the local clock in seconds.
///
/// All `last_seen` bookkeeping and resolve deadlines are expressed on this
/// timeline.
pub fn clock() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
