//! Session lifecycle management
//!
//! This module provides the `SessionManager` abstraction that manages:
//! - Joining or fetching a session through a `SessionStore`
//! - Subscribing to server-side session updates
//! - Heartbeats while connected
//! - Expiry warnings and forced expiry
//! - Backoff reconnection after the subscription drops

mod config;
mod retry;
mod session;
mod state;
mod store;

pub use config::SessionOptions;
pub use retry::RetryPolicy;
pub use session::{SessionManager, RECONNECT_EXHAUSTED, SESSION_EXPIRED};
pub use state::{Session, SessionNotice, SessionState};
pub use store::{NatsSessionStore, SessionStore};
