//! Connection management over a real-time transport
//!
//! This module provides:
//! - `ConnectionState`, the state vocabulary shared with the session manager
//! - Backoff schedules for both managers
//! - The channel registry types
//! - `ConnectionManager`, which owns channels and reconnects on failure

pub mod backoff;
mod channel;
mod manager;
mod state;

pub use backoff::{channel_backoff, session_backoff};
pub use channel::{ChannelConfig, ChannelEntry, ChannelOptions, ChannelStatus, ChannelType};
pub use manager::{ConnectionConfig, ConnectionManager};
pub use state::ConnectionState;
