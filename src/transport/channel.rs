use crate::connection::ChannelType;
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::broadcast;

/// Events delivered on a transport channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Underlying connection is (re)established
    Connect,
    /// Underlying connection dropped
    Disconnect,
    /// Transport reported an error for this channel or its connection
    Error(String),
    /// Subscription did not confirm in time
    TimedOut,
    /// Subscription ended from the transport side
    Closed,
    /// Payload published on the channel's subject
    Message(Vec<u8>),
}

impl ChannelEvent {
    /// True for events that mean the channel can no longer be trusted
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ChannelEvent::Disconnect
                | ChannelEvent::Error(_)
                | ChannelEvent::TimedOut
                | ChannelEvent::Closed
        )
    }
}

/// Parameters for opening a channel on a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRequest {
    /// Unique id for this subscription instance
    pub id: String,

    /// Subject (topic) to subscribe to
    pub subject: String,

    pub channel_type: ChannelType,
}

/// A live subscription on a transport
#[async_trait::async_trait]
pub trait TransportChannel: Send + Sync {
    /// Unique id of this subscription instance
    fn id(&self) -> &str;

    /// Subject the channel is subscribed to
    fn subject(&self) -> &str;

    /// Receive system events and messages for this channel
    fn events(&self) -> broadcast::Receiver<ChannelEvent>;

    /// Release the subscription
    async fn unsubscribe(&self) -> Result<()>;
}

/// Real-time transport capable of opening named channels.
///
/// Implementations:
/// - NATS: `NatsTransport`
/// - Tests: in-memory fakes
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Open a fresh subscription
    async fn open(&self, request: ChannelRequest) -> Result<Arc<dyn TransportChannel>>;

    /// Transport name for logging
    fn name(&self) -> &str;
}
