pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod listeners;
pub mod session;
pub mod transport;

pub use config::Config;
pub use connection::{
    ChannelConfig, ChannelEntry, ChannelStatus, ChannelType, ConnectionConfig, ConnectionManager,
    ConnectionState,
};
pub use error::LinkError;
pub use http::{create_router, AppState};
pub use listeners::{ListenerHandle, Listeners};
pub use session::{
    NatsSessionStore, RetryPolicy, Session, SessionManager, SessionNotice, SessionOptions,
    SessionState, SessionStore,
};
pub use transport::{ChannelEvent, ChannelRequest, NatsTransport, Transport, TransportChannel};
