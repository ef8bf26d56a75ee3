use crate::session::SessionManager;

/// Shared application state for HTTP handlers
#[derive(Clone)]
pub struct AppState {
    /// Session kept alive by this process
    pub session: SessionManager,
}

impl AppState {
    pub fn new(session: SessionManager) -> Self {
        Self { session }
    }
}
