use anyhow::{Context, Result};
use clap::Parser;
use session_link::{
    create_router, AppState, ChannelConfig, ChannelType, Config, ConnectionConfig,
    ConnectionManager, NatsSessionStore, NatsTransport, SessionManager, SessionNotice,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "session-link", about = "Keep a real-time session alive over NATS")]
struct Args {
    /// Config file path (extension optional)
    #[arg(long, default_value = "config/session-link")]
    config: String,

    /// Session join code
    #[arg(long)]
    code: String,

    /// User identity (generated when omitted)
    #[arg(long)]
    user: Option<String>,

    /// The session was just created by this user; fetch instead of join
    #[arg(long)]
    new: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    let cfg = Config::load(&args.config)?;
    let user_id = args
        .user
        .unwrap_or_else(|| format!("user-{}", uuid::Uuid::new_v4()));

    info!("{} starting", cfg.service.name);
    info!("NATS: {}", cfg.nats.url);

    let transport = Arc::new(NatsTransport::connect(&cfg.nats.url).await?);
    let store = Arc::new(NatsSessionStore::new(
        transport.client(),
        cfg.nats.rpc_prefix.clone(),
    ));

    let sessions = SessionManager::new(
        store,
        transport.clone(),
        cfg.session.retry_policy(),
        cfg.session.options(&cfg.nats.update_prefix)?,
    );

    let _state_log = sessions.subscribe(|state| {
        info!(
            "Session state: {} (attempts={}, error={:?})",
            state.connection_state, state.reconnect_attempts, state.error
        );
    });
    tokio::spawn(log_notices(sessions.notices()));

    sessions
        .initialize(&args.code, &user_id, args.new)
        .await
        .context("Failed to start session")?;

    let session = sessions
        .session()
        .context("Session disappeared right after initialization")?;

    // Presence rides on its own channel and is re-created after reconnects
    let connections = ConnectionManager::new(transport.clone());
    let mut connection_config = ConnectionConfig::new(session.id.clone(), user_id.clone());
    connection_config.events = vec![ChannelType::Presence];
    connection_config.max_reconnect_attempts = cfg.connection.max_reconnect_attempts;
    connection_config.initial_reconnect_delay = cfg.connection.initial_reconnect_delay();
    connections.initialize(connection_config).await?;

    let _connection_log = connections.subscribe_to_connection_state(|state| {
        info!("Connection state: {}", state);
    });

    let presence = ChannelConfig::new("presence", ChannelType::Presence);
    connections.create_channel(presence.clone()).await?;

    let reopen = connections.clone();
    let _reconnect_hook = connections.on_reconnect(move || {
        let manager = reopen.clone();
        let presence = presence.clone();
        tokio::spawn(async move {
            if let Err(e) = manager.create_channel(presence).await {
                error!("Failed to re-create presence channel: {:#}", e);
            }
        });
    });

    if cfg.http.enabled {
        let addr = format!("{}:{}", cfg.http.bind, cfg.http.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))?;
        info!("HTTP server listening on {}", addr);

        axum::serve(listener, create_router(AppState::new(sessions.clone())))
            .with_graceful_shutdown(shutdown_signal())
            .await?;
    } else {
        shutdown_signal().await;
    }

    info!("Shutting down");
    sessions.leave().await;
    connections.cleanup().await;

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}

async fn log_notices(mut notices: broadcast::Receiver<SessionNotice>) {
    loop {
        match notices.recv().await {
            Ok(SessionNotice::ExpiryWarning {
                session_id,
                remaining,
            }) => warn!(
                "Session {} expires in {} minute(s)",
                session_id,
                remaining.as_secs() / 60
            ),
            Ok(SessionNotice::Expired { session_id }) => {
                warn!("Session {} expired; restart to rejoin", session_id)
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
