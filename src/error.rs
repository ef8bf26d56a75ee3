use thiserror::Error;

/// Rejections returned to callers of the managers.
///
/// Everything else surfaces as a plain `anyhow::Error`; these variants exist
/// so callers can `downcast_ref` the cases they may want to act on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("connection manager is not initialized")]
    NotInitialized,

    #[error("no session or user context available for reconnect")]
    MissingContext,

    #[error("no active session")]
    NoSession,
}
