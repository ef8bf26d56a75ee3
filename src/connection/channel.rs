use crate::transport::TransportChannel;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// What a channel carries.
///
/// The connection manager only records this; event semantics belong to
/// whichever subsystem created the channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelType {
    MessageStream,
    Presence,
    Participant,
}

impl ChannelType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::MessageStream => "message-stream",
            ChannelType::Presence => "presence",
            ChannelType::Participant => "participant",
        }
    }
}

/// Last known health of a registered channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

/// Transport-specific overrides for a channel
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChannelOptions {
    /// Subject to subscribe to instead of the derived `channels.<session>.<name>`
    pub subject: Option<String>,
}

/// Request to create a logical channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Logical name, unique within one connection manager
    pub name: String,

    pub channel_type: ChannelType,

    pub options: Option<ChannelOptions>,
}

impl ChannelConfig {
    pub fn new(name: impl Into<String>, channel_type: ChannelType) -> Self {
        Self {
            name: name.into(),
            channel_type,
            options: None,
        }
    }

    pub fn with_subject(mut self, subject: impl Into<String>) -> Self {
        self.options = Some(ChannelOptions {
            subject: Some(subject.into()),
        });
        self
    }

    /// Subject this channel subscribes to for the given session
    pub fn subject(&self, session_id: &str) -> String {
        self.options
            .as_ref()
            .and_then(|options| options.subject.clone())
            .unwrap_or_else(|| format!("channels.{}.{}", session_id, self.name))
    }
}

/// A channel registered with the connection manager
#[derive(Clone)]
pub struct ChannelEntry {
    pub name: String,
    pub handle: Arc<dyn TransportChannel>,
    pub channel_type: ChannelType,
    pub status: ChannelStatus,
    pub created_at: DateTime<Utc>,
}

impl std::fmt::Debug for ChannelEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelEntry")
            .field("name", &self.name)
            .field("id", &self.handle.id())
            .field("channel_type", &self.channel_type)
            .field("status", &self.status)
            .field("created_at", &self.created_at)
            .finish()
    }
}
