//! Reconnect delay schedules

use std::time::Duration;

/// Upper bound for the connection manager's doubling schedule
pub const MAX_CHANNEL_BACKOFF: Duration = Duration::from_millis(16_000);

/// Session reconnect delays; attempts past the end reuse the last entry
pub const SESSION_BACKOFF_DELAYS: [Duration; 6] = [
    Duration::from_millis(1_000),
    Duration::from_millis(2_000),
    Duration::from_millis(4_000),
    Duration::from_millis(8_000),
    Duration::from_millis(15_000),
    Duration::from_millis(30_000),
];

/// Delay before channel reconnect attempt `attempt` (0-indexed):
/// `min(initial * 2^attempt, 16s)`
pub fn channel_backoff(initial: Duration, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt);
    initial.saturating_mul(factor).min(MAX_CHANNEL_BACKOFF)
}

/// Delay before session reconnect attempt `attempt` (0-indexed)
pub fn session_backoff(attempt: u32) -> Duration {
    SESSION_BACKOFF_DELAYS
        .get(attempt as usize)
        .copied()
        .unwrap_or(SESSION_BACKOFF_DELAYS[SESSION_BACKOFF_DELAYS.len() - 1])
}
