//! Typed listener sets with disposer handles.
//!
//! Delivery iterates a snapshot of the registered slots, so a callback may
//! register or unregister listeners (itself included) while it runs. A
//! panicking callback is caught and logged; the remaining callbacks still
//! run.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

pub(crate) type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

/// One registered callback.
pub(crate) struct Slot<T> {
    pub(crate) id: u64,
    active: AtomicBool,
    callback: Callback<T>,
}

impl<T> Slot<T> {
    pub(crate) fn new(id: u64, callback: Callback<T>) -> Self {
        Self {
            id,
            active: AtomicBool::new(true),
            callback,
        }
    }

    pub(crate) fn deactivate(&self) {
        self.active.store(false, Ordering::Release);
    }

    /// Run the callback unless it was removed. Returns `false` if it panicked.
    pub(crate) fn invoke(&self, value: &T, channel: &str) -> bool {
        if !self.active.load(Ordering::Acquire) {
            return true;
        }
        match panic::catch_unwind(AssertUnwindSafe(|| (self.callback)(value))) {
            Ok(()) => true,
            Err(payload) => {
                let reason = payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "non-string panic".to_string());
                tracing::error!(channel, listener = self.id, %reason, "Listener panicked");
                false
            }
        }
    }
}

/// Handle returned by every registration. `unobserve` is idempotent, and
/// dropping the handle unobserves as well.
#[must_use = "dropping an ObserverHandle unobserves immediately"]
pub struct ObserverHandle {
    dispose: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ObserverHandle {
    pub(crate) fn new(dispose: impl FnOnce() + Send + 'static) -> Self {
        Self {
            dispose: Mutex::new(Some(Box::new(dispose))),
        }
    }

    /// Remove the callback. Later calls do nothing.
    pub fn unobserve(&self) {
        let dispose = lock(&self.dispose).take();
        if let Some(dispose) = dispose {
            dispose();
        }
    }

    pub fn is_active(&self) -> bool {
        lock(&self.dispose).is_some()
    }
}

impl Drop for ObserverHandle {
    fn drop(&mut self) {
        self.unobserve();
    }
}

impl std::fmt::Debug for ObserverHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverHandle")
            .field("active", &self.is_active())
            .finish()
    }
}

/// A set of listeners for one event type.
pub struct ListenerSet<T> {
    channel: &'static str,
    next_id: AtomicU64,
    slots: Mutex<Vec<Arc<Slot<T>>>>,
}

impl<T: Send + Sync + 'static> ListenerSet<T> {
    pub fn new(channel: &'static str) -> Arc<Self> {
        Arc::new(Self {
            channel,
            next_id: AtomicU64::new(1),
            slots: Mutex::new(Vec::new()),
        })
    }

    pub fn add(self: &Arc<Self>, callback: impl Fn(&T) + Send + Sync + 'static) -> ObserverHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot::new(id, Box::new(callback)));
        lock(&self.slots).push(slot.clone());

        let set = Arc::downgrade(self);
        ObserverHandle::new(move || {
            slot.deactivate();
            if let Some(set) = set.upgrade() {
                lock(&set.slots).retain(|s| s.id != slot.id);
            }
        })
    }

    /// Deliver `value` to every listener. Returns how many panicked.
    pub fn emit(&self, value: &T) -> usize {
        let snapshot: Vec<Arc<Slot<T>>> = lock(&self.slots).clone();
        snapshot
            .iter()
            .filter(|slot| !slot.invoke(value, self.channel))
            .count()
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Lock a mutex, recovering the data if a previous holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
