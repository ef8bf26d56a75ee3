use crate::connection::ConnectionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Session record as stored by the session service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Opaque identifier
    pub id: String,

    /// Short human-enterable join code
    pub code: String,

    pub is_active: bool,

    pub expires_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Lifetime left at `now`, zero once expired
    pub fn remaining_at(&self, now: DateTime<Utc>) -> Duration {
        (self.expires_at - now).to_std().unwrap_or(Duration::ZERO)
    }
}

/// Snapshot delivered to session listeners
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionState {
    /// Cached session record, present while the session is held
    pub session: Option<Session>,

    pub connection_state: ConnectionState,

    /// Reason for the last failure, if any
    pub error: Option<String>,

    /// Reconnect attempts since the last successful connection
    pub reconnect_attempts: u32,

    /// When activity was last reported successfully
    pub last_heartbeat: Option<DateTime<Utc>>,

    /// Set once an expiry warning has fired; cleared by extending
    pub expiry_warning_shown: bool,
}

/// Fire-and-forget notifications for the rest of the application
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionNotice {
    /// Remaining lifetime dropped below a warning threshold
    ExpiryWarning { session_id: String, remaining: Duration },
    /// Session expired or was closed server-side
    Expired { session_id: String },
}
