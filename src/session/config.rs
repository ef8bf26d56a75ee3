use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Timers and limits for a session manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionOptions {
    /// How often activity is reported while connected
    /// Default: 30 seconds
    pub heartbeat_interval: Duration,

    /// How often remaining lifetime is checked
    /// Default: 60 seconds
    pub expiry_check_interval: Duration,

    /// Remaining lifetimes at or below which a one-shot warning fires
    /// Default: 30 minutes, 5 minutes
    pub warning_thresholds: Vec<Duration>,

    /// Scheduled reconnect attempts before the session enters `Error`
    pub max_reconnect_attempts: u32,

    /// Session updates are received on `<prefix>.<session id>`
    pub update_subject_prefix: String,
}

impl SessionOptions {
    /// Subject carrying updates for one session
    pub fn update_subject(&self, session_id: &str) -> String {
        format!("{}.{}", self.update_subject_prefix, session_id)
    }

    /// Timer periods must be non-zero
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            bail!("heartbeat interval must be greater than zero");
        }
        if self.expiry_check_interval.is_zero() {
            bail!("expiry check interval must be greater than zero");
        }
        Ok(())
    }
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(30),
            expiry_check_interval: Duration::from_secs(60),
            warning_thresholds: vec![Duration::from_secs(30 * 60), Duration::from_secs(5 * 60)],
            max_reconnect_attempts: 5,
            update_subject_prefix: "session".to_string(),
        }
    }
}
