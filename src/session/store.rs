use super::state::Session;
use crate::transport::{RpcReply, SessionCodeRequest, SessionIdRequest};
use anyhow::{Context, Result};
use async_nats::Client;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

/// Session persistence service.
///
/// Callers only distinguish success from failure; error contents are for
/// logging.
#[async_trait::async_trait]
pub trait SessionStore: Send + Sync {
    /// Fetch a session by its join code without joining it
    async fn get_session_by_code(&self, code: &str) -> Result<Session>;

    /// Join a session by code, registering a participant
    async fn join_session(&self, code: &str) -> Result<Session>;

    /// Record activity for the session
    async fn update_last_activity(&self, session_id: &str) -> Result<()>;

    /// Whether the session is still open
    async fn check_session_active(&self, session_id: &str) -> Result<bool>;

    /// Push the session's expiry further out
    async fn extend_session(&self, session_id: &str) -> Result<()>;

    /// Leave the session as a participant
    async fn leave_session(&self, session_id: &str) -> Result<()>;
}

/// `SessionStore` over NATS request/reply on `<prefix>.<operation>`
pub struct NatsSessionStore {
    client: Client,
    prefix: String,
}

impl NatsSessionStore {
    pub fn new(client: Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    async fn call<Req, Resp>(&self, operation: &str, request: &Req) -> Result<Resp>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let subject = format!("{}.{}", self.prefix, operation);
        let payload = serde_json::to_vec(request)?;

        debug!("Requesting {}", subject);

        let message = self
            .client
            .request(subject.clone(), payload.into())
            .await
            .with_context(|| format!("Request to {} failed", subject))?;

        let reply: RpcReply<Resp> = serde_json::from_slice(&message.payload)
            .with_context(|| format!("Invalid reply from {}", subject))?;

        reply.into_result()
    }

    async fn call_by_id<Resp: DeserializeOwned>(&self, operation: &str, session_id: &str) -> Result<Resp> {
        let request = SessionIdRequest {
            session_id: session_id.to_string(),
        };
        self.call(operation, &request).await
    }
}

#[async_trait::async_trait]
impl SessionStore for NatsSessionStore {
    async fn get_session_by_code(&self, code: &str) -> Result<Session> {
        let request = SessionCodeRequest {
            code: code.to_string(),
        };
        self.call("get_by_code", &request).await
    }

    async fn join_session(&self, code: &str) -> Result<Session> {
        let request = SessionCodeRequest {
            code: code.to_string(),
        };
        self.call("join", &request).await
    }

    async fn update_last_activity(&self, session_id: &str) -> Result<()> {
        self.call_by_id("update_activity", session_id).await
    }

    async fn check_session_active(&self, session_id: &str) -> Result<bool> {
        self.call_by_id("check_active", session_id).await
    }

    async fn extend_session(&self, session_id: &str) -> Result<()> {
        self.call_by_id("extend", session_id).await
    }

    async fn leave_session(&self, session_id: &str) -> Result<()> {
        self.call_by_id("leave", session_id).await
    }
}
