use super::config::SessionOptions;
use super::retry::RetryPolicy;
use super::state::{Session, SessionNotice, SessionState};
use super::store::SessionStore;
use crate::connection::{session_backoff, ChannelType, ConnectionState};
use crate::error::LinkError;
use crate::listeners::{ListenerHandle, Listeners};
use crate::transport::{ChannelEvent, ChannelRequest, Transport, TransportChannel};
use anyhow::{bail, Context, Result};
use chrono::Utc;
use parking_lot::{Mutex, ReentrantMutex};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Error recorded once reconnect attempts are used up
pub const RECONNECT_EXHAUSTED: &str = "Failed to reconnect after multiple attempts";

/// Error recorded when the session expires or is closed server-side
pub const SESSION_EXPIRED: &str = "Session has expired";

const NOTICE_CAPACITY: usize = 16;

/// Live subscription to session updates
struct Subscription {
    channel: Arc<dyn TransportChannel>,
    watcher: JoinHandle<()>,
}

/// Background work owned by the current session
#[derive(Default)]
struct Tasks {
    heartbeat: Option<JoinHandle<()>>,
    expiry: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
    subscription: Option<Subscription>,
}

struct Inner {
    store: Arc<dyn SessionStore>,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
    options: SessionOptions,
    state: Mutex<SessionState>,
    /// Held across a state change and its notification so listeners see
    /// changes in the order they were made
    notify_order: ReentrantMutex<()>,
    tasks: Mutex<Tasks>,
    listeners: Listeners<SessionState>,
    notices: broadcast::Sender<SessionNotice>,
    subscription_seq: AtomicU64,
    /// Bumped on initialize and teardown; continuations started under an
    /// older generation must not touch state
    generation: AtomicU64,
}

/// Keeps one session alive: join, heartbeat, expiry watch, reconnect,
/// extend and leave.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn SessionStore>,
        transport: Arc<dyn Transport>,
        retry: RetryPolicy,
        options: SessionOptions,
    ) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                store,
                transport,
                retry,
                options,
                state: Mutex::new(SessionState::default()),
                notify_order: ReentrantMutex::new(()),
                tasks: Mutex::new(Tasks::default()),
                listeners: Listeners::new(),
                notices,
                subscription_seq: AtomicU64::new(0),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Fetch (newly created) or join (existing) the session, subscribe to
    /// its updates and start the heartbeat and expiry timers.
    ///
    /// On failure the state becomes `Error` and the error is returned.
    pub async fn initialize(&self, code: &str, user_id: &str, is_newly_created: bool) -> Result<()> {
        info!(
            "Initializing session {} for user {} (newly created: {})",
            code, user_id, is_newly_created
        );

        self.inner.options.validate()?;

        // Drop whatever a previous initialize left running
        if let Some(channel) = self.teardown() {
            release(channel).await;
        }
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;

        self.update(|state| {
            *state = SessionState {
                connection_state: ConnectionState::Connecting,
                ..SessionState::default()
            };
        });

        let store = Arc::clone(&self.inner.store);
        let code_owned = code.to_string();

        let result = if is_newly_created {
            // The creator already counts as a participant
            self.inner
                .retry
                .run("get_session_by_code", || {
                    let store = Arc::clone(&store);
                    let code = code_owned.clone();
                    async move { store.get_session_by_code(&code).await }
                })
                .await
        } else {
            self.inner
                .retry
                .run("join_session", || {
                    let store = Arc::clone(&store);
                    let code = code_owned.clone();
                    async move { store.join_session(&code).await }
                })
                .await
        };

        if self.is_stale(generation) {
            bail!("Session initialization for {} was superseded", code);
        }

        let session = match result {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to initialize session {}: {:#}", code, e);
                let message = e.root_cause().to_string();
                self.update(|state| {
                    state.connection_state = ConnectionState::Error;
                    state.error = Some(message);
                });
                return Err(e.context(format!("Failed to initialize session {}", code)));
            }
        };

        info!("Session {} ready (id {})", session.code, session.id);

        let session_id = session.id.clone();
        self.update(|state| {
            state.session = Some(session);
            state.connection_state = ConnectionState::Connected;
            state.error = None;
            state.reconnect_attempts = 0;
        });

        if let Err(e) = self.open_subscription(&session_id, generation).await {
            warn!("Failed to subscribe to session updates: {:#}", e);
            self.handle_disconnect(generation);
        }

        self.start_timers(generation);

        Ok(())
    }

    /// Receive the current state immediately, then every change
    pub fn subscribe<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&SessionState) + Send + Sync + 'static,
    {
        let _order = self.inner.notify_order.lock();
        let current = self.state();
        self.inner.listeners.add_with_current(listener, &current)
    }

    /// Expiry warnings and expiry notices
    pub fn notices(&self) -> broadcast::Receiver<SessionNotice> {
        self.inner.notices.subscribe()
    }

    /// Ask the session service for more time. Clears the expiry warning
    /// latch on success; failures leave state untouched.
    pub async fn extend_session(&self) -> Result<()> {
        let session_id = self.session_id().ok_or(LinkError::NoSession)?;
        let generation = self.generation();

        self.inner
            .store
            .extend_session(&session_id)
            .await
            .with_context(|| format!("Failed to extend session {}", session_id))?;

        info!("Extended session {}", session_id);

        if !self.is_stale(generation) {
            self.update(|state| state.expiry_warning_shown = false);
        }

        Ok(())
    }

    /// Leave the session (best-effort) and tear everything down
    pub async fn leave(&self) {
        if let Some(session_id) = self.session_id() {
            info!("Leaving session {}", session_id);
            if let Err(e) = self.inner.store.leave_session(&session_id).await {
                warn!("Failed to leave session {}: {:#}", session_id, e);
            }
        }

        if let Some(channel) = self.teardown() {
            release(channel).await;
        }

        self.update(|state| *state = SessionState::default());
    }

    pub fn state(&self) -> SessionState {
        self.inner.state.lock().clone()
    }

    pub fn session(&self) -> Option<Session> {
        self.inner.state.lock().session.clone()
    }

    /// Connected, holding a session, and no recorded error
    pub fn is_healthy(&self) -> bool {
        let state = self.inner.state.lock();
        state.connection_state == ConnectionState::Connected
            && state.session.is_some()
            && state.error.is_none()
    }

    /// Lifetime left on the held session; zero when expired or none is held
    pub fn time_until_expiry(&self) -> Duration {
        self.inner
            .state
            .lock()
            .session
            .as_ref()
            .map(|session| session.remaining_at(Utc::now()))
            .unwrap_or(Duration::ZERO)
    }

    fn session_id(&self) -> Option<String> {
        self.inner
            .state
            .lock()
            .session
            .as_ref()
            .map(|session| session.id.clone())
    }

    fn generation(&self) -> u64 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    fn is_stale(&self, generation: u64) -> bool {
        self.generation() != generation
    }

    fn downgrade(&self) -> Weak<Inner> {
        Arc::downgrade(&self.inner)
    }

    fn from_weak(weak: &Weak<Inner>) -> Option<Self> {
        weak.upgrade().map(|inner| Self { inner })
    }

    /// Apply `mutate` and notify listeners if anything changed
    fn update<F>(&self, mutate: F)
    where
        F: FnOnce(&mut SessionState),
    {
        let _order = self.inner.notify_order.lock();
        let snapshot = {
            let mut state = self.inner.state.lock();
            let before = state.clone();
            mutate(&mut state);
            if *state == before {
                return;
            }
            if state.connection_state != before.connection_state {
                debug!(
                    "Session state {} -> {}",
                    before.connection_state, state.connection_state
                );
            }
            state.clone()
        };

        self.inner.listeners.notify(&snapshot);
    }

    fn notify(&self, notice: SessionNotice) {
        // Nobody listening is fine
        let _ = self.inner.notices.send(notice);
    }

    /// Stop timers, cancel retries and detach the subscription. Returns the
    /// channel so the caller decides whether to await its release.
    fn teardown(&self) -> Option<Arc<dyn TransportChannel>> {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        let mut tasks = self.inner.tasks.lock();
        for task in [tasks.heartbeat.take(), tasks.expiry.take(), tasks.reconnect.take()]
            .into_iter()
            .flatten()
        {
            task.abort();
        }

        tasks.subscription.take().map(|subscription| {
            subscription.watcher.abort();
            subscription.channel
        })
    }

    async fn open_subscription(&self, session_id: &str, generation: u64) -> Result<()> {
        let token = self.inner.subscription_seq.fetch_add(1, Ordering::SeqCst);
        let request = ChannelRequest {
            id: format!("session:{}:{}", session_id, token),
            subject: self.inner.options.update_subject(session_id),
            channel_type: ChannelType::MessageStream,
        };

        let channel = self
            .inner
            .transport
            .open(request)
            .await
            .context("Failed to subscribe to session updates")?;

        if self.is_stale(generation) {
            release(channel).await;
            bail!("Session was torn down while subscribing");
        }

        debug!(
            "Subscribed to session updates on {} via {}",
            channel.subject(),
            self.inner.transport.name()
        );

        let watcher = self.spawn_subscription_watcher(Arc::clone(&channel), generation);
        let previous = self
            .inner
            .tasks
            .lock()
            .subscription
            .replace(Subscription { channel, watcher });

        if let Some(previous) = previous {
            previous.watcher.abort();
            tokio::spawn(release(previous.channel));
        }

        Ok(())
    }

    fn spawn_subscription_watcher(
        &self,
        channel: Arc<dyn TransportChannel>,
        generation: u64,
    ) -> JoinHandle<()> {
        let mut events = channel.events();
        let weak = self.downgrade();

        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("Session subscription skipped {} events", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let Some(manager) = Self::from_weak(&weak) else {
                    break;
                };
                if manager.is_stale(generation) {
                    break;
                }

                match event {
                    ChannelEvent::Message(payload) => match serde_json::from_slice::<Session>(&payload) {
                        Ok(session) => manager.handle_session_update(session, generation),
                        Err(e) => warn!("Ignoring malformed session update: {}", e),
                    },
                    ChannelEvent::Connect => debug!("Session subscription connected"),
                    failure if failure.is_failure() => {
                        warn!("Session subscription failed: {:?}", failure);
                        manager.handle_disconnect(generation);
                        if failure == ChannelEvent::Closed {
                            break;
                        }
                    }
                    _ => {}
                }
            }
        })
    }

    fn handle_session_update(&self, session: Session, generation: u64) {
        if self.is_stale(generation) {
            return;
        }

        match self.session_id() {
            Some(current) if current == session.id => {}
            _ => {
                warn!("Ignoring update for unrelated session {}", session.id);
                return;
            }
        }

        if !session.is_active {
            info!("Session {} was closed by the server", session.id);
            self.expire(generation);
            return;
        }

        self.update(|state| state.session = Some(session));
    }

    fn handle_disconnect(&self, generation: u64) {
        if self.is_stale(generation) {
            return;
        }

        // Only a live connection can drop; later events are noise from the
        // same outage
        if self.inner.state.lock().connection_state != ConnectionState::Connected {
            return;
        }

        warn!("Session connection lost");
        self.update(|state| state.connection_state = ConnectionState::Disconnected);
        self.schedule_reconnect(generation);
    }

    fn schedule_reconnect(&self, generation: u64) {
        if self.is_stale(generation) {
            return;
        }

        if self.inner.tasks.lock().reconnect.is_some() {
            debug!("Session reconnect already scheduled");
            return;
        }

        let attempts = self.inner.state.lock().reconnect_attempts;
        if attempts >= self.inner.options.max_reconnect_attempts {
            error!("Giving up on session after {} reconnect attempts", attempts);
            self.update(|state| {
                state.connection_state = ConnectionState::Error;
                state.error = Some(RECONNECT_EXHAUSTED.to_string());
            });
            return;
        }

        let delay = session_backoff(attempts);
        let weak = self.downgrade();

        info!(
            "Scheduling session reconnect attempt {} in {:?}",
            attempts + 1,
            delay
        );

        let mut tasks = self.inner.tasks.lock();
        if tasks.reconnect.is_some() {
            return;
        }
        tasks.reconnect = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(manager) = Self::from_weak(&weak) {
                manager.attempt_reconnect(generation).await;
            }
        }));
    }

    async fn attempt_reconnect(&self, generation: u64) {
        // This task is the pending retry; clear the slot so it can be re-armed
        self.inner.tasks.lock().reconnect = None;

        if self.is_stale(generation) {
            return;
        }

        let Some(session_id) = self.session_id() else {
            return;
        };

        self.update(|state| {
            state.reconnect_attempts += 1;
            state.connection_state = ConnectionState::Reconnecting;
        });

        let active = self.inner.store.check_session_active(&session_id).await;
        if self.is_stale(generation) {
            return;
        }

        match active {
            Ok(false) => {
                info!("Session {} is no longer active", session_id);
                self.expire(generation);
            }
            Ok(true) => match self.open_subscription(&session_id, generation).await {
                Ok(()) => {
                    info!("Session {} reconnected", session_id);
                    self.update(|state| {
                        state.connection_state = ConnectionState::Connected;
                        state.reconnect_attempts = 0;
                        state.error = None;
                    });
                }
                Err(e) => {
                    warn!("Session reconnect failed to subscribe: {:#}", e);
                    self.schedule_reconnect(generation);
                }
            },
            Err(e) => {
                warn!("Session liveness check failed: {:#}", e);
                self.schedule_reconnect(generation);
            }
        }
    }

    fn start_timers(&self, generation: u64) {
        let heartbeat = self.spawn_periodic(self.inner.options.heartbeat_interval, generation, |manager, generation| {
            Box::pin(async move { manager.heartbeat(generation).await })
        });
        let expiry = self.spawn_periodic(self.inner.options.expiry_check_interval, generation, |manager, generation| {
            Box::pin(async move { manager.check_expiry(generation) })
        });

        let mut tasks = self.inner.tasks.lock();
        if let Some(old) = tasks.heartbeat.replace(heartbeat) {
            old.abort();
        }
        if let Some(old) = tasks.expiry.replace(expiry) {
            old.abort();
        }
    }

    /// Run `tick` every `period` (first run one period from now) until the
    /// generation changes or the manager is dropped
    fn spawn_periodic<F>(&self, period: Duration, generation: u64, tick: F) -> JoinHandle<()>
    where
        F: Fn(SessionManager, u64) -> futures::future::BoxFuture<'static, ()> + Send + 'static,
    {
        let weak = self.downgrade();

        tokio::spawn(async move {
            let mut ticker = interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let Some(manager) = Self::from_weak(&weak) else {
                    break;
                };
                if manager.is_stale(generation) {
                    break;
                }

                tick(manager, generation).await;
            }
        })
    }

    async fn heartbeat(&self, generation: u64) {
        if self.inner.state.lock().connection_state != ConnectionState::Connected {
            return;
        }
        let Some(session_id) = self.session_id() else {
            return;
        };

        match self.inner.store.update_last_activity(&session_id).await {
            Ok(()) => {
                if !self.is_stale(generation) {
                    self.update(|state| state.last_heartbeat = Some(Utc::now()));
                }
            }
            // A missed heartbeat is not a disconnect
            Err(e) => warn!("Heartbeat for session {} failed: {:#}", session_id, e),
        }
    }

    fn check_expiry(&self, generation: u64) {
        let (session_id, remaining, warned) = {
            let state = self.inner.state.lock();
            let Some(session) = state.session.as_ref() else {
                return;
            };
            (
                session.id.clone(),
                session.remaining_at(Utc::now()),
                state.expiry_warning_shown,
            )
        };

        if remaining.is_zero() {
            self.expire(generation);
            return;
        }

        let below_threshold = self
            .inner
            .options
            .warning_thresholds
            .iter()
            .any(|threshold| remaining <= *threshold);

        if below_threshold && !warned {
            info!(
                "Session {} expires in {} minute(s)",
                session_id,
                remaining.as_secs() / 60
            );
            self.update(|state| state.expiry_warning_shown = true);
            self.notify(SessionNotice::ExpiryWarning {
                session_id,
                remaining,
            });
        }
    }

    /// Enter `Error`, announce the expiry and release everything
    fn expire(&self, generation: u64) {
        if self.is_stale(generation) {
            return;
        }
        let Some(session_id) = self.session_id() else {
            return;
        };

        warn!("Session {} expired", session_id);

        // May be running on one of the tasks being aborted, so the release
        // happens on its own task
        if let Some(channel) = self.teardown() {
            tokio::spawn(release(channel));
        }

        self.update(|state| {
            state.connection_state = ConnectionState::Error;
            state.error = Some(SESSION_EXPIRED.to_string());
            state.session = None;
        });
        self.notify(SessionNotice::Expired { session_id });
    }
}

/// Best-effort unsubscribe
async fn release(channel: Arc<dyn TransportChannel>) {
    if let Err(e) = channel.unsubscribe().await {
        warn!("Failed to release session subscription {}: {:#}", channel.id(), e);
    }
}
