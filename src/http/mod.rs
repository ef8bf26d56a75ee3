//! HTTP API for the application shell
//!
//! This module exposes the session manager over REST:
//! - GET /session/state - Session snapshot, health and remaining lifetime
//! - POST /session/extend - Extend the session
//! - POST /session/leave - Leave the session
//! - GET /health - Health check

mod handlers;
mod routes;
mod state;

pub use routes::create_router;
pub use state::AppState;
