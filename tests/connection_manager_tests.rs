// Integration tests for the connection manager
//
// Channels are opened on an in-memory transport; failures are injected by
// emitting events on the fake channels. Timer-driven behaviour runs on
// paused tokio time.

mod common;

use anyhow::Result;
use common::{settle, FakeTransport};
use session_link::{
    ChannelConfig, ChannelEvent, ChannelStatus, ChannelType, ConnectionConfig, ConnectionManager,
    ConnectionState, LinkError,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn record_states(manager: &ConnectionManager) -> Arc<Mutex<Vec<ConnectionState>>> {
    let states = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&states);
    let _ = manager.subscribe_to_connection_state(move |state| sink.lock().unwrap().push(*state));
    states
}

fn count_reconnects(manager: &ConnectionManager) -> Arc<AtomicUsize> {
    let count = Arc::new(AtomicUsize::new(0));
    let sink = Arc::clone(&count);
    let _ = manager.on_reconnect(move || {
        sink.fetch_add(1, Ordering::SeqCst);
    });
    count
}

async fn initialized(transport: &Arc<FakeTransport>) -> Result<ConnectionManager> {
    let manager = ConnectionManager::new(transport.clone());
    manager
        .initialize(ConnectionConfig::new("session-1", "user-1"))
        .await?;
    Ok(manager)
}

#[tokio::test]
async fn test_create_channel_requires_initialize() {
    let transport = FakeTransport::new();
    let manager = ConnectionManager::new(transport.clone());

    let err = manager
        .create_channel(ChannelConfig::new("messages", ChannelType::MessageStream))
        .await
        .err()
        .expect("create_channel before initialize should fail");

    assert_eq!(err.downcast_ref::<LinkError>(), Some(&LinkError::NotInitialized));
    assert_eq!(transport.open_count(), 0);
}

#[tokio::test]
async fn test_initialize_moves_through_connecting_to_connected() -> Result<()> {
    let transport = FakeTransport::new();
    let manager = ConnectionManager::new(transport.clone());
    let states = record_states(&manager);

    manager
        .initialize(ConnectionConfig::new("session-1", "user-1"))
        .await?;

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(manager.is_initialized());
    assert_eq!(manager.reconnect_attempts(), 0);
    assert_eq!(
        *states.lock().unwrap(),
        vec![
            ConnectionState::Disconnected,
            ConnectionState::Connecting,
            ConnectionState::Connected,
        ]
    );

    Ok(())
}

#[tokio::test]
async fn test_create_channel_twice_replaces_previous() -> Result<()> {
    let transport = FakeTransport::new();
    let manager = initialized(&transport).await?;

    let config = ChannelConfig::new("messages", ChannelType::MessageStream);
    let first = manager.create_channel(config.clone()).await?;
    let second = manager.create_channel(config).await?;

    assert_eq!(manager.channel_names(), vec!["messages".to_string()]);
    assert_ne!(first.id(), second.id());

    let opened = transport.opened();
    assert_eq!(opened.len(), 2);
    assert_eq!(opened[0].unsubscribe_count(), 1, "first handle released once");
    assert_eq!(opened[1].unsubscribe_count(), 0);

    let current = manager.get_channel("messages").expect("channel registered");
    assert_eq!(current.id(), second.id());

    Ok(())
}

#[tokio::test]
async fn test_channel_request_embeds_session_and_token() -> Result<()> {
    let transport = FakeTransport::new();
    let manager = initialized(&transport).await?;

    manager
        .create_channel(ChannelConfig::new("messages", ChannelType::MessageStream))
        .await?;
    manager
        .create_channel(
            ChannelConfig::new("presence", ChannelType::Presence).with_subject("rooms.1234.presence"),
        )
        .await?;

    let opened = transport.opened();
    assert!(opened[0].request().id.starts_with("session-1:messages:"));
    assert_eq!(opened[0].request().subject, "channels.session-1.messages");
    assert_eq!(opened[0].request().channel_type, ChannelType::MessageStream);
    assert!(opened[1].request().id.starts_with("session-1:presence:"));
    assert_eq!(opened[1].request().subject, "rooms.1234.presence");

    let entry = manager.channel("presence").expect("presence registered");
    assert_eq!(entry.channel_type, ChannelType::Presence);
    assert_eq!(entry.status, ChannelStatus::Subscribed);

    Ok(())
}

#[tokio::test]
async fn test_remove_channel_is_idempotent() -> Result<()> {
    let transport = FakeTransport::new();
    let manager = initialized(&transport).await?;

    manager
        .create_channel(ChannelConfig::new("messages", ChannelType::MessageStream))
        .await?;

    manager.remove_channel("messages").await;
    manager.remove_channel("messages").await;
    manager.remove_channel("never-created").await;

    assert!(manager.get_channel("messages").is_none());
    assert_eq!(transport.last().unsubscribe_count(), 1);
    assert_eq!(manager.state(), ConnectionState::Connected);

    Ok(())
}

#[tokio::test]
async fn test_remove_channel_swallows_transport_errors() -> Result<()> {
    let transport = FakeTransport::new();
    let manager = initialized(&transport).await?;

    manager
        .create_channel(ChannelConfig::new("messages", ChannelType::MessageStream))
        .await?;
    transport.last().set_fail_unsubscribe(true);

    manager.remove_channel("messages").await;

    assert!(manager.get_channel("messages").is_none());
    assert_eq!(transport.last().unsubscribe_count(), 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_channel_error_triggers_backoff_reconnect() -> Result<()> {
    let transport = FakeTransport::new();
    let manager = initialized(&transport).await?;
    let reconnects = count_reconnects(&manager);

    manager
        .create_channel(ChannelConfig::new("messages", ChannelType::MessageStream))
        .await?;
    transport.last().emit(ChannelEvent::Error("socket reset".to_string()));
    settle().await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(
        manager.channel("messages").map(|entry| entry.status),
        Some(ChannelStatus::ChannelError)
    );
    assert!(manager.reconnect_pending());

    // First retry waits the initial delay
    tokio::time::sleep(Duration::from_millis(999)).await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert_eq!(reconnects.load(Ordering::SeqCst), 0);

    tokio::time::sleep(Duration::from_millis(2)).await;
    settle().await;

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(reconnects.load(Ordering::SeqCst), 1);
    assert_eq!(manager.reconnect_attempts(), 0);
    assert!(manager.channel_names().is_empty(), "old handles are gone");
    assert_eq!(transport.last().unsubscribe_count(), 1);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_duplicate_failures_schedule_one_retry() -> Result<()> {
    let transport = FakeTransport::new();
    let manager = initialized(&transport).await?;
    let reconnects = count_reconnects(&manager);

    manager
        .create_channel(ChannelConfig::new("messages", ChannelType::MessageStream))
        .await?;
    manager
        .create_channel(ChannelConfig::new("presence", ChannelType::Presence))
        .await?;

    for channel in transport.opened() {
        channel.emit(ChannelEvent::TimedOut);
        channel.emit(ChannelEvent::Closed);
    }
    settle().await;

    tokio::time::sleep(Duration::from_secs(30)).await;

    assert_eq!(reconnects.load(Ordering::SeqCst), 1);
    assert_eq!(manager.state(), ConnectionState::Connected);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failed_retries_back_off_until_ceiling() -> Result<()> {
    let transport = FakeTransport::new();
    let manager = initialized(&transport).await?;
    let states = record_states(&manager);

    manager
        .create_channel(ChannelConfig::new("messages", ChannelType::MessageStream))
        .await?;
    let channel = transport.last();
    channel.set_fail_unsubscribe(true);

    channel.emit(ChannelEvent::Disconnect);
    settle().await;

    // Attempt 1 fires at 1s
    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert_eq!(channel.unsubscribe_count(), 1);
    assert_eq!(manager.reconnect_attempts(), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    // Attempt 2 waits a further 2s
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(channel.unsubscribe_count(), 1);
    tokio::time::sleep(Duration::from_millis(1_000)).await;
    assert_eq!(channel.unsubscribe_count(), 2);

    // Attempts 3-5 at 4s, 8s and 16s intervals, then scheduling stops
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(channel.unsubscribe_count(), 5);
    assert_eq!(manager.reconnect_attempts(), 5);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(!manager.reconnect_pending());

    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(channel.unsubscribe_count(), 5);

    let reconnecting = states
        .lock()
        .unwrap()
        .iter()
        .filter(|state| **state == ConnectionState::Reconnecting)
        .count();
    assert_eq!(reconnecting, 5);

    Ok(())
}

#[tokio::test]
async fn test_force_reconnect_without_context_fails() -> Result<()> {
    let transport = FakeTransport::new();
    let manager = ConnectionManager::new(transport.clone());

    let err = manager.force_reconnect().await.unwrap_err();
    assert_eq!(err.downcast_ref::<LinkError>(), Some(&LinkError::MissingContext));
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    manager
        .initialize(ConnectionConfig::new("session-1", ""))
        .await?;
    let err = manager.force_reconnect().await.unwrap_err();
    assert_eq!(err.downcast_ref::<LinkError>(), Some(&LinkError::MissingContext));
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_force_reconnect_cancels_pending_retry() -> Result<()> {
    let transport = FakeTransport::new();
    let manager = initialized(&transport).await?;
    let reconnects = count_reconnects(&manager);

    manager
        .create_channel(ChannelConfig::new("messages", ChannelType::MessageStream))
        .await?;
    manager
        .create_channel(ChannelConfig::new("presence", ChannelType::Presence))
        .await?;
    transport.opened()[0].emit(ChannelEvent::Error("lost".to_string()));
    settle().await;
    assert!(manager.reconnect_pending());

    manager.force_reconnect().await?;

    assert!(!manager.reconnect_pending());
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(manager.reconnect_attempts(), 0);
    assert!(manager.channel_names().is_empty());
    for channel in transport.opened() {
        assert_eq!(channel.unsubscribe_count(), 1);
    }
    assert_eq!(reconnects.load(Ordering::SeqCst), 1);

    // The cancelled retry never fires
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(reconnects.load(Ordering::SeqCst), 1);

    Ok(())
}

#[tokio::test]
async fn test_force_reconnect_fails_when_teardown_fails() -> Result<()> {
    let transport = FakeTransport::new();
    let manager = initialized(&transport).await?;
    let reconnects = count_reconnects(&manager);

    manager
        .create_channel(ChannelConfig::new("messages", ChannelType::MessageStream))
        .await?;
    transport.last().set_fail_unsubscribe(true);

    assert!(manager.force_reconnect().await.is_err());
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.get_channel("messages").is_some(), "failed channel stays registered");
    assert_eq!(reconnects.load(Ordering::SeqCst), 0);

    Ok(())
}

#[tokio::test]
async fn test_reinitialize_tears_down_existing_channels() -> Result<()> {
    let transport = FakeTransport::new();
    let manager = initialized(&transport).await?;

    manager
        .create_channel(ChannelConfig::new("messages", ChannelType::MessageStream))
        .await?;

    manager
        .initialize(ConnectionConfig::new("session-2", "user-1"))
        .await?;

    assert!(manager.channel_names().is_empty());
    assert_eq!(transport.last().unsubscribe_count(), 1);
    assert_eq!(manager.state(), ConnectionState::Connected);

    Ok(())
}

#[tokio::test]
async fn test_reinitialize_failure_reverts_to_disconnected() -> Result<()> {
    let transport = FakeTransport::new();
    let manager = initialized(&transport).await?;

    manager
        .create_channel(ChannelConfig::new("messages", ChannelType::MessageStream))
        .await?;
    transport.last().set_fail_unsubscribe(true);

    let result = manager
        .initialize(ConnectionConfig::new("session-2", "user-1"))
        .await;

    assert!(result.is_err());
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    Ok(())
}

#[tokio::test]
async fn test_cleanup_is_idempotent() -> Result<()> {
    let transport = FakeTransport::new();
    let manager = initialized(&transport).await?;
    let states = record_states(&manager);
    let reconnects = count_reconnects(&manager);

    manager
        .create_channel(ChannelConfig::new("messages", ChannelType::MessageStream))
        .await?;

    manager.cleanup().await;
    manager.cleanup().await;

    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(!manager.is_initialized());
    assert!(manager.channel_names().is_empty());
    assert_eq!(transport.last().unsubscribe_count(), 1);

    // Listener sets were cleared
    let seen_before = states.lock().unwrap().len();
    manager
        .initialize(ConnectionConfig::new("session-1", "user-1"))
        .await?;
    manager.force_reconnect().await?;
    assert_eq!(states.lock().unwrap().len(), seen_before);
    assert_eq!(reconnects.load(Ordering::SeqCst), 0);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_events_from_removed_channel_are_ignored() -> Result<()> {
    let transport = FakeTransport::new();
    let manager = initialized(&transport).await?;

    manager
        .create_channel(ChannelConfig::new("messages", ChannelType::MessageStream))
        .await?;
    let stale = transport.last();
    manager
        .create_channel(ChannelConfig::new("messages", ChannelType::MessageStream))
        .await?;

    stale.emit(ChannelEvent::Closed);
    settle().await;

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(!manager.reconnect_pending());

    Ok(())
}

#[tokio::test]
async fn test_unsubscribed_state_listener_is_silent() -> Result<()> {
    let transport = FakeTransport::new();
    let manager = ConnectionManager::new(transport.clone());

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let handle = manager.subscribe_to_connection_state(move |state| sink.lock().unwrap().push(*state));
    handle.unsubscribe();

    manager
        .initialize(ConnectionConfig::new("session-1", "user-1"))
        .await?;

    assert_eq!(*seen.lock().unwrap(), vec![ConnectionState::Disconnected]);

    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_failure_events_record_channel_status() -> Result<()> {
    let transport = FakeTransport::new();
    let manager = initialized(&transport).await?;

    manager
        .create_channel(ChannelConfig::new("presence", ChannelType::Presence))
        .await?;
    manager
        .create_channel(ChannelConfig::new("roster", ChannelType::Participant))
        .await?;
    let opened = transport.opened();

    // Payloads and connects are not failures
    opened[0].emit(ChannelEvent::Message(b"hello".to_vec()));
    opened[0].emit(ChannelEvent::Connect);
    settle().await;
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(!manager.reconnect_pending());

    opened[0].emit(ChannelEvent::TimedOut);
    opened[1].emit(ChannelEvent::Closed);
    settle().await;

    assert_eq!(
        manager.channel("presence").map(|entry| entry.status),
        Some(ChannelStatus::TimedOut)
    );
    assert_eq!(
        manager.channel("roster").map(|entry| entry.status),
        Some(ChannelStatus::Closed)
    );
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(manager.reconnect_pending());

    Ok(())
}

#[tokio::test]
async fn test_cleanup_drops_channels_that_fail_to_unsubscribe() -> Result<()> {
    let transport = FakeTransport::new();
    let manager = initialized(&transport).await?;

    manager
        .create_channel(ChannelConfig::new("messages", ChannelType::MessageStream))
        .await?;
    transport.last().set_fail_unsubscribe(true);

    manager.cleanup().await;

    assert_eq!(transport.last().unsubscribe_count(), 1);
    assert!(manager.channel_names().is_empty());
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_listeners_see_changes_in_mutation_order() -> Result<()> {
    let transport = FakeTransport::new();
    let manager = initialized(&transport).await?;
    let states = record_states(&manager);

    let mut tasks = Vec::new();
    for _ in 0..32 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move { manager.force_reconnect().await }));
    }
    for task in tasks {
        task.await??;
    }

    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(
        states.lock().unwrap().last().copied(),
        Some(ConnectionState::Connected),
        "last delivered state matches the current one"
    );

    Ok(())
}
