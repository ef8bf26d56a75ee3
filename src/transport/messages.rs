use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};

/// Request body for operations addressed by session code
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionCodeRequest {
    pub code: String,
}

/// Request body for operations addressed by session id
#[derive(Debug, Serialize, Deserialize)]
pub struct SessionIdRequest {
    pub session_id: String,
}

/// Reply envelope from the session service: `{"ok": ...}` or `{"error": "..."}`
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RpcReply<T> {
    Ok(T),
    Error(String),
}

impl<T> RpcReply<T> {
    pub fn into_result(self) -> Result<T> {
        match self {
            RpcReply::Ok(value) => Ok(value),
            RpcReply::Error(message) => Err(anyhow!(message)),
        }
    }
}
