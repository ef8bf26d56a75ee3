// In-memory stand-ins for the transport and the session service.
//
// Both record every call so tests can assert on what the managers did.

#![allow(dead_code)]

use anyhow::{bail, Result};
use chrono::{Duration as ChronoDuration, Utc};
use session_link::{
    ChannelEvent, ChannelRequest, Session, SessionStore, Transport, TransportChannel,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;

pub fn session_expiring_in(remaining: ChronoDuration) -> Session {
    let now = Utc::now();
    Session {
        id: "session-1".to_string(),
        code: "1234".to_string(),
        is_active: true,
        expires_at: now + remaining,
        created_at: now,
    }
}

/// Let spawned tasks run without moving paused time forward
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

// ============================================================================
// Transport
// ============================================================================

pub struct FakeChannel {
    request: ChannelRequest,
    events: broadcast::Sender<ChannelEvent>,
    unsubscribes: AtomicUsize,
    fail_unsubscribe: AtomicBool,
}

impl FakeChannel {
    pub fn emit(&self, event: ChannelEvent) {
        let _ = self.events.send(event);
    }

    pub fn unsubscribe_count(&self) -> usize {
        self.unsubscribes.load(Ordering::SeqCst)
    }

    pub fn set_fail_unsubscribe(&self, fail: bool) {
        self.fail_unsubscribe.store(fail, Ordering::SeqCst);
    }

    pub fn request(&self) -> &ChannelRequest {
        &self.request
    }
}

#[async_trait::async_trait]
impl TransportChannel for FakeChannel {
    fn id(&self) -> &str {
        &self.request.id
    }

    fn subject(&self) -> &str {
        &self.request.subject
    }

    fn events(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    async fn unsubscribe(&self) -> Result<()> {
        self.unsubscribes.fetch_add(1, Ordering::SeqCst);
        if self.fail_unsubscribe.load(Ordering::SeqCst) {
            bail!("transport refused unsubscribe");
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct FakeTransport {
    opened: Mutex<Vec<Arc<FakeChannel>>>,
    fail_open: AtomicBool,
}

impl FakeTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn opened(&self) -> Vec<Arc<FakeChannel>> {
        self.opened.lock().unwrap().clone()
    }

    pub fn open_count(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    pub fn last(&self) -> Arc<FakeChannel> {
        self.opened
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no channel opened")
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.fail_open.store(fail, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Transport for FakeTransport {
    async fn open(&self, request: ChannelRequest) -> Result<Arc<dyn TransportChannel>> {
        if self.fail_open.load(Ordering::SeqCst) {
            bail!("transport unavailable");
        }

        let (events, _) = broadcast::channel(64);
        let channel = Arc::new(FakeChannel {
            request,
            events,
            unsubscribes: AtomicUsize::new(0),
            fail_unsubscribe: AtomicBool::new(false),
        });
        self.opened.lock().unwrap().push(Arc::clone(&channel));
        Ok(channel)
    }

    fn name(&self) -> &str {
        "fake"
    }
}

// ============================================================================
// Session service
// ============================================================================

pub struct FakeStore {
    session: Mutex<Session>,
    calls: Mutex<Vec<String>>,
    pub fail_fetch: AtomicBool,
    pub fail_heartbeat: AtomicBool,
    pub fail_check: AtomicBool,
    pub active: AtomicBool,
    pub fail_extend: AtomicBool,
    pub fail_leave: AtomicBool,
}

impl FakeStore {
    pub fn new(session: Session) -> Arc<Self> {
        Arc::new(Self {
            session: Mutex::new(session),
            calls: Mutex::new(Vec::new()),
            fail_fetch: AtomicBool::new(false),
            fail_heartbeat: AtomicBool::new(false),
            fail_check: AtomicBool::new(false),
            active: AtomicBool::new(true),
            fail_extend: AtomicBool::new(false),
            fail_leave: AtomicBool::new(false),
        })
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.as_str() == operation)
            .count()
    }

    fn record(&self, operation: &str) {
        self.calls.lock().unwrap().push(operation.to_string());
    }

    fn flag(flag: &AtomicBool) -> bool {
        flag.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl SessionStore for FakeStore {
    async fn get_session_by_code(&self, _code: &str) -> Result<Session> {
        self.record("get_session_by_code");
        if Self::flag(&self.fail_fetch) {
            bail!("session not found");
        }
        Ok(self.session.lock().unwrap().clone())
    }

    async fn join_session(&self, _code: &str) -> Result<Session> {
        self.record("join_session");
        if Self::flag(&self.fail_fetch) {
            bail!("session not found");
        }
        Ok(self.session.lock().unwrap().clone())
    }

    async fn update_last_activity(&self, _session_id: &str) -> Result<()> {
        self.record("update_last_activity");
        if Self::flag(&self.fail_heartbeat) {
            bail!("activity update rejected");
        }
        Ok(())
    }

    async fn check_session_active(&self, _session_id: &str) -> Result<bool> {
        self.record("check_session_active");
        if Self::flag(&self.fail_check) {
            bail!("session service unreachable");
        }
        Ok(Self::flag(&self.active))
    }

    async fn extend_session(&self, _session_id: &str) -> Result<()> {
        self.record("extend_session");
        if Self::flag(&self.fail_extend) {
            bail!("extension limit reached");
        }
        Ok(())
    }

    async fn leave_session(&self, _session_id: &str) -> Result<()> {
        self.record("leave_session");
        if Self::flag(&self.fail_leave) {
            bail!("leave rejected");
        }
        Ok(())
    }
}
