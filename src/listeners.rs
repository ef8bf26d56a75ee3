//! Listener fan-out shared by the connection and session managers.
//!
//! Listeners run in registration order. A panicking listener is logged and
//! skipped so it cannot break delivery to the ones registered after it.

use parking_lot::Mutex;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Weak};
use tracing::error;

type Callback<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct Registry<T> {
    next_id: u64,
    entries: Vec<(u64, Callback<T>)>,
}

/// Ordered set of callbacks receiving `&T`
pub struct Listeners<T> {
    registry: Arc<Mutex<Registry<T>>>,
}

impl<T: 'static> Listeners<T> {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }

    /// Register a listener, returning the handle that removes it
    pub fn add<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.insert(Arc::new(listener))
    }

    /// Register a listener and immediately deliver `current` to it alone
    pub fn add_with_current<F>(&self, listener: F, current: &T) -> ListenerHandle
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let listener: Callback<T> = Arc::new(listener);
        let handle = self.insert(Arc::clone(&listener));
        invoke(&listener, current);
        handle
    }

    /// Deliver `value` to every registered listener
    pub fn notify(&self, value: &T) {
        // Snapshot so listeners may (un)register from inside a callback
        let snapshot: Vec<Callback<T>> = {
            let registry = self.registry.lock();
            registry.entries.iter().map(|(_, cb)| Arc::clone(cb)).collect()
        };

        for listener in &snapshot {
            invoke(listener, value);
        }
    }

    pub fn clear(&self) {
        self.registry.lock().entries.clear();
    }

    pub fn len(&self) -> usize {
        self.registry.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert(&self, listener: Callback<T>) -> ListenerHandle {
        let id = {
            let mut registry = self.registry.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.entries.push((id, listener));
            id
        };

        let weak: Weak<Mutex<Registry<T>>> = Arc::downgrade(&self.registry);
        ListenerHandle {
            remove: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry.lock().entries.retain(|(entry_id, _)| *entry_id != id);
                }
            })),
        }
    }
}

impl<T: 'static> Default for Listeners<T> {
    fn default() -> Self {
        Self::new()
    }
}

fn invoke<T>(listener: &Callback<T>, value: &T) {
    if catch_unwind(AssertUnwindSafe(|| listener(value))).is_err() {
        error!("Listener panicked; continuing with remaining listeners");
    }
}

/// Removes its listener when `unsubscribe` is called.
///
/// Dropping the handle leaves the listener registered.
pub struct ListenerHandle {
    remove: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ListenerHandle {
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ListenerHandle")
            .field("active", &self.remove.is_some())
            .finish()
    }
}
