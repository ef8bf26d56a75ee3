//! Real-time transport seam
//!
//! The managers only see `Transport` / `TransportChannel`. The NATS
//! implementation maps client connection events onto every open channel and
//! forwards subscription payloads as `ChannelEvent::Message`.

mod channel;
pub mod messages;
pub mod nats;

pub use channel::{ChannelEvent, ChannelRequest, Transport, TransportChannel};
pub use messages::{RpcReply, SessionCodeRequest, SessionIdRequest};
pub use nats::{NatsChannel, NatsTransport};
