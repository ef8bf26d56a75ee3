use super::backoff::channel_backoff;
use super::channel::{ChannelConfig, ChannelEntry, ChannelStatus, ChannelType};
use super::state::ConnectionState;
use crate::error::LinkError;
use crate::listeners::{ListenerHandle, Listeners};
use crate::transport::{ChannelEvent, ChannelRequest, Transport, TransportChannel};
use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Context a connection manager is initialized with
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub session_id: String,

    pub user_id: String,

    /// Channel kinds this connection is expected to carry (empty = any)
    pub events: Vec<ChannelType>,

    /// Scheduled retries before giving up (default: 5)
    pub max_reconnect_attempts: u32,

    /// Delay before the first retry; doubles per attempt (default: 1s)
    pub initial_reconnect_delay: Duration,
}

impl ConnectionConfig {
    pub fn new(session_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            user_id: user_id.into(),
            events: Vec::new(),
            max_reconnect_attempts: 5,
            initial_reconnect_delay: Duration::from_millis(1_000),
        }
    }

    fn has_context(&self) -> bool {
        !self.session_id.is_empty() && !self.user_id.is_empty()
    }
}

struct Registered {
    entry: ChannelEntry,
    /// Task watching the channel's system events
    watcher: JoinHandle<()>,
}

struct ManagerState {
    connection_state: ConnectionState,
    config: Option<ConnectionConfig>,
    channels: HashMap<String, Registered>,
    reconnect_attempts: u32,
    reconnect_task: Option<JoinHandle<()>>,
}

struct Inner {
    transport: Arc<dyn Transport>,
    state: Mutex<ManagerState>,
    /// Held across a state change and its notification so listeners see
    /// changes in the order they were made
    notify_order: ReentrantMutex<()>,
    state_listeners: Listeners<ConnectionState>,
    reconnect_callbacks: Listeners<()>,
    /// Uniqueness token embedded in every transport channel id
    channel_seq: AtomicU64,
    /// Bumped on initialize/cleanup; async continuations from an older
    /// generation discard their results
    generation: AtomicU64,
}

/// Owns named channels over a transport and keeps the aggregate connection
/// state, reconnecting with exponential backoff when a channel fails.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            inner: Arc::new(Inner {
                transport,
                state: Mutex::new(ManagerState {
                    connection_state: ConnectionState::Disconnected,
                    config: None,
                    channels: HashMap::new(),
                    reconnect_attempts: 0,
                    reconnect_task: None,
                }),
                notify_order: ReentrantMutex::new(()),
                state_listeners: Listeners::new(),
                reconnect_callbacks: Listeners::new(),
                channel_seq: AtomicU64::new(0),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Initialize with session/user context.
    ///
    /// A live manager tears down its existing channels first. On failure the
    /// state reverts to `Disconnected`.
    pub async fn initialize(&self, config: ConnectionConfig) -> Result<()> {
        if self.is_initialized() {
            info!(
                "Re-initializing connection manager for session {}; tearing down channels",
                config.session_id
            );
        } else {
            info!("Initializing connection manager for session {}", config.session_id);
        }

        self.cancel_reconnect();
        self.set_state(ConnectionState::Connecting);

        if let Err(e) = self.teardown_channels().await {
            error!("Connection manager initialization failed: {:#}", e);
            self.set_state(ConnectionState::Disconnected);
            return Err(e.context("Failed to initialize connection manager"));
        }

        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        {
            let mut state = self.inner.state.lock();
            state.config = Some(config);
            state.reconnect_attempts = 0;
        }

        self.set_state(ConnectionState::Connected);
        Ok(())
    }

    /// Subscribe a fresh channel under `config.name`, replacing any existing
    /// channel with that name. Returns the raw handle so the caller can
    /// consume its events.
    pub async fn create_channel(&self, config: ChannelConfig) -> Result<Arc<dyn TransportChannel>> {
        let (session_id, declared) = {
            let state = self.inner.state.lock();
            let ctx = state.config.as_ref().ok_or(LinkError::NotInitialized)?;
            (ctx.session_id.clone(), ctx.events.clone())
        };

        if !declared.is_empty() && !declared.contains(&config.channel_type) {
            warn!(
                "Channel {} has type {} which this connection did not declare",
                config.name,
                config.channel_type.as_str()
            );
        }

        let previous = self.inner.state.lock().channels.remove(&config.name);
        if let Some(previous) = previous {
            debug!("Replacing existing channel {}", config.name);
            previous.watcher.abort();
            if let Err(e) = previous.entry.handle.unsubscribe().await {
                warn!("Failed to unsubscribe replaced channel {}: {:#}", config.name, e);
            }
        }

        let generation = self.generation();
        let token = self.inner.channel_seq.fetch_add(1, Ordering::SeqCst);
        let request = ChannelRequest {
            id: format!("{}:{}:{}", session_id, config.name, token),
            subject: config.subject(&session_id),
            channel_type: config.channel_type,
        };

        let handle = self
            .inner
            .transport
            .open(request)
            .await
            .with_context(|| format!("Failed to open channel {}", config.name))?;

        if self.generation() != generation {
            // Cleaned up or re-initialized while the subscription was opening
            if let Err(e) = handle.unsubscribe().await {
                warn!("Failed to release stale channel {}: {:#}", config.name, e);
            }
            return Err(anyhow!(LinkError::NotInitialized))
                .context(format!("Connection manager was reset while opening {}", config.name));
        }

        let watcher = self.spawn_watcher(config.name.clone(), Arc::clone(&handle));
        let entry = ChannelEntry {
            name: config.name.clone(),
            handle: Arc::clone(&handle),
            channel_type: config.channel_type,
            status: ChannelStatus::Subscribed,
            created_at: Utc::now(),
        };

        let displaced = self
            .inner
            .state
            .lock()
            .channels
            .insert(config.name.clone(), Registered { entry, watcher });

        if let Some(displaced) = displaced {
            // A concurrent create for the same name finished first
            displaced.watcher.abort();
            let name = config.name.clone();
            tokio::spawn(async move {
                if let Err(e) = displaced.entry.handle.unsubscribe().await {
                    warn!("Failed to unsubscribe displaced channel {}: {:#}", name, e);
                }
            });
        }

        info!(
            "Created {} channel {} ({}) on {}",
            config.channel_type.as_str(),
            config.name,
            handle.id(),
            self.inner.transport.name()
        );

        Ok(handle)
    }

    /// Unsubscribe and forget a channel. Best-effort: transport errors are
    /// logged, unknown names are ignored.
    pub async fn remove_channel(&self, name: &str) {
        let removed = self.inner.state.lock().channels.remove(name);
        let Some(removed) = removed else {
            return;
        };

        removed.watcher.abort();
        match removed.entry.handle.unsubscribe().await {
            Ok(()) => info!("Removed channel {}", name),
            Err(e) => warn!("Failed to unsubscribe channel {}: {:#}", name, e),
        }
    }

    pub fn get_channel(&self, name: &str) -> Option<Arc<dyn TransportChannel>> {
        self.inner
            .state
            .lock()
            .channels
            .get(name)
            .map(|registered| Arc::clone(&registered.entry.handle))
    }

    /// Snapshot of a registered channel
    pub fn channel(&self, name: &str) -> Option<ChannelEntry> {
        self.inner
            .state
            .lock()
            .channels
            .get(name)
            .map(|registered| registered.entry.clone())
    }

    pub fn channel_names(&self) -> Vec<String> {
        self.inner.state.lock().channels.keys().cloned().collect()
    }

    /// Run `callback` after every successful reconnect. Channels are gone by
    /// then; this is where their owners re-create them.
    pub fn on_reconnect<F>(&self, callback: F) -> ListenerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.inner.reconnect_callbacks.add(move |_: &()| callback())
    }

    /// Receive the current state immediately, then every change
    pub fn subscribe_to_connection_state<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        let _order = self.inner.notify_order.lock();
        let current = self.state();
        self.inner.state_listeners.add_with_current(listener, &current)
    }

    /// Tear down every channel and signal owners to re-subscribe
    pub async fn force_reconnect(&self) -> Result<()> {
        info!("Forcing reconnect");

        self.cancel_reconnect();
        self.set_state(ConnectionState::Reconnecting);

        if let Err(e) = self.reconnect(self.generation()).await {
            error!("Forced reconnect failed: {:#}", e);
            self.set_state(ConnectionState::Disconnected);
            return Err(e);
        }

        Ok(())
    }

    /// Cancel retries, drop every channel and listener, return to
    /// `Disconnected`. Safe to call repeatedly.
    pub async fn cleanup(&self) {
        self.cancel_reconnect();
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        self.release_channels().await;

        self.inner.state_listeners.clear();
        self.inner.reconnect_callbacks.clear();

        {
            let mut state = self.inner.state.lock();
            state.config = None;
            state.reconnect_attempts = 0;
        }
        self.set_state(ConnectionState::Disconnected);
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().connection_state
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.state.lock().reconnect_attempts
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.state.lock().config.is_some()
    }

    /// Whether a retry is currently armed
    pub fn reconnect_pending(&self) -> bool {
        self.inner.state.lock().reconnect_task.is_some()
    }

    fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    fn from_weak(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    fn set_state(&self, next: ConnectionState) {
        let _order = self.inner.notify_order.lock();
        {
            let mut state = self.inner.state.lock();
            if state.connection_state == next {
                return;
            }
            debug!("Connection state {} -> {}", state.connection_state, next);
            state.connection_state = next;
        }
        self.inner.state_listeners.notify(&next);
    }

    fn cancel_reconnect(&self) {
        if let Some(task) = self.inner.state.lock().reconnect_task.take() {
            debug!("Cancelling pending reconnect");
            task.abort();
        }
    }

    /// Unsubscribe every channel. A failed unsubscribe keeps its entry
    /// registered and the first error is returned.
    async fn teardown_channels(&self) -> Result<()> {
        let drained: Vec<(String, Registered)> =
            self.inner.state.lock().channels.drain().collect();

        let mut first_error = None;

        for (name, registered) in drained {
            match registered.entry.handle.unsubscribe().await {
                Ok(()) => {
                    registered.watcher.abort();
                    debug!("Tore down channel {}", name);
                }
                Err(e) => {
                    warn!("Failed to tear down channel {}: {:#}", name, e);
                    if first_error.is_none() {
                        first_error = Some(e.context(format!("Failed to tear down channel {}", name)));
                    }
                    let mut state = self.inner.state.lock();
                    if let std::collections::hash_map::Entry::Vacant(slot) = state.channels.entry(name) {
                        slot.insert(registered);
                    } else {
                        registered.watcher.abort();
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Unsubscribe and forget every channel, logging failures
    async fn release_channels(&self) {
        let drained: Vec<(String, Registered)> =
            self.inner.state.lock().channels.drain().collect();

        for (name, registered) in drained {
            registered.watcher.abort();
            if let Err(e) = registered.entry.handle.unsubscribe().await {
                warn!("Failed to release channel {}: {:#}", name, e);
            }
        }
    }

    /// Shared by `force_reconnect` and scheduled retries
    async fn reconnect(&self, generation: u64) -> Result<()> {
        let has_context = self
            .inner
            .state
            .lock()
            .config
            .as_ref()
            .map(ConnectionConfig::has_context)
            .unwrap_or(false);

        if !has_context {
            return Err(anyhow!(LinkError::MissingContext));
        }

        self.teardown_channels().await?;

        if self.generation() != generation {
            bail!("Connection manager was reset during reconnect");
        }

        self.inner.state.lock().reconnect_attempts = 0;
        self.set_state(ConnectionState::Connected);

        info!("Reconnected; notifying channel owners");
        self.inner.reconnect_callbacks.notify(&());

        Ok(())
    }

    fn handle_channel_failure(&self, name: &str, id: &str, status: ChannelStatus) {
        {
            let mut state = self.inner.state.lock();
            match state.channels.get_mut(name) {
                Some(registered) if registered.entry.handle.id() == id => {
                    registered.entry.status = status;
                }
                // Replaced or removed since the event was raised
                _ => return,
            }
        }

        self.set_state(ConnectionState::Disconnected);
        self.schedule_reconnect();
    }

    fn mark_subscribed(&self, name: &str, id: &str) {
        let mut state = self.inner.state.lock();
        if let Some(registered) = state.channels.get_mut(name) {
            if registered.entry.handle.id() == id {
                registered.entry.status = ChannelStatus::Subscribed;
            }
        }
    }

    fn schedule_reconnect(&self) {
        let mut state = self.inner.state.lock();

        if state.reconnect_task.is_some() {
            debug!("Reconnect already scheduled");
            return;
        }

        let Some(config) = state.config.as_ref() else {
            return;
        };

        if state.reconnect_attempts >= config.max_reconnect_attempts {
            warn!(
                "Giving up after {} reconnect attempts",
                state.reconnect_attempts
            );
            return;
        }

        let delay = channel_backoff(config.initial_reconnect_delay, state.reconnect_attempts);
        let generation = self.generation();
        let weak = self.downgrade();

        info!(
            "Scheduling reconnect attempt {} in {:?}",
            state.reconnect_attempts + 1,
            delay
        );

        state.reconnect_task = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            let Some(manager) = Self::from_weak(&weak) else {
                return;
            };
            if manager.generation() != generation {
                return;
            }

            let attempt = {
                let mut state = manager.inner.state.lock();
                state.reconnect_task = None;
                state.reconnect_attempts += 1;
                state.reconnect_attempts
            };

            manager.set_state(ConnectionState::Reconnecting);

            match manager.reconnect(generation).await {
                Ok(()) => info!("Reconnect attempt {} succeeded", attempt),
                Err(e) => {
                    warn!("Reconnect attempt {} failed: {:#}", attempt, e);
                    if manager.generation() == generation {
                        manager.set_state(ConnectionState::Disconnected);
                        manager.schedule_reconnect();
                    }
                }
            }
        }));
    }

    fn spawn_watcher(&self, name: String, handle: Arc<dyn TransportChannel>) -> JoinHandle<()> {
        let mut events = handle.events();
        let id = handle.id().to_string();
        let weak = self.downgrade();

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Channel {} watcher skipped {} events", name, skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let Some(manager) = Self::from_weak(&weak) else {
                    break;
                };

                match event {
                    ChannelEvent::Message(_) => {}
                    ChannelEvent::Connect => manager.mark_subscribed(&name, &id),
                    failure if failure.is_failure() => {
                        warn!("Channel {} failed: {:?}", name, failure);
                        let status = match failure {
                            ChannelEvent::TimedOut => ChannelStatus::TimedOut,
                            ChannelEvent::Closed => ChannelStatus::Closed,
                            _ => ChannelStatus::ChannelError,
                        };
                        manager.handle_channel_failure(&name, &id, status);
                        if status == ChannelStatus::Closed {
                            break;
                        }
                    }
                    _ => {}
                }
            }
        })
    }
}
