//! Subscription registry: task id → interested observers.
//!
//! Keeps server-side interest in sync with local observers: the first
//! observer of a task sends `subscribe_task`, removing the last one sends
//! `unsubscribe_task` and drops the entry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tw_protocol::{OutboundCommand, TaskId, TaskUpdate};

use crate::listeners::{ObserverHandle, Slot};

/// Outbound side of the push channel, as seen by the registry.
pub trait CommandSink: Send + Sync {
    /// Try to send `command`. Returns `true` if it was handed to a live
    /// connection; otherwise it was dropped.
    fn send(&self, command: &OutboundCommand) -> bool;
}

/// Whether the server knows about our interest in a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    /// No subscribe has reached a live connection (yet, or since the last drop).
    Unsent,
    /// Subscribe handed to the connection, no ack seen.
    Sent,
    /// Server confirmed the subscription.
    Acked,
}

struct TaskEntry {
    observers: Vec<Arc<Slot<TaskUpdate>>>,
    interest: Interest,
}

struct RegistryInner {
    entries: DashMap<TaskId, TaskEntry>,
    sink: Arc<dyn CommandSink>,
    next_id: AtomicU64,
}

/// Central task subscription registry shared by the client and dispatcher.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<RegistryInner>,
}

impl SubscriptionRegistry {
    pub fn new(sink: Arc<dyn CommandSink>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: DashMap::new(),
                sink,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    // ─── Observers ───────────────────────────────────────────

    /// Register `callback` for updates of `task_id`.
    pub fn observe(
        &self,
        task_id: TaskId,
        callback: impl Fn(&TaskUpdate) + Send + Sync + 'static,
    ) -> ObserverHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let slot = Arc::new(Slot::new(id, Box::new(callback)));

        {
            let mut entry = self.inner.entries.entry(task_id).or_insert_with(|| TaskEntry {
                observers: Vec::new(),
                interest: Interest::Unsent,
            });
            entry.observers.push(slot.clone());
            if entry.interest == Interest::Unsent
                && self
                    .inner
                    .sink
                    .send(&OutboundCommand::SubscribeTask { task_id })
            {
                entry.interest = Interest::Sent;
            }
            tracing::debug!(task_id, observers = entry.observers.len(), "Observer added");
        }

        let registry = Arc::downgrade(&self.inner);
        ObserverHandle::new(move || {
            slot.deactivate();
            if let Some(inner) = registry.upgrade() {
                remove_observer(&inner, task_id, slot.id);
            }
        })
    }

    /// Deliver an update to every observer of `task_id`. Returns the number
    /// of observers reached.
    pub fn deliver(&self, task_id: TaskId, update: &TaskUpdate) -> usize {
        let snapshot = match self.inner.entries.get(&task_id) {
            Some(entry) => entry.observers.clone(),
            None => {
                tracing::debug!(task_id, "Update for task without observers");
                return 0;
            }
        };

        for slot in &snapshot {
            slot.invoke(update, "task_update");
        }
        snapshot.len()
    }

    // ─── Server-side interest ────────────────────────────────

    /// Record a subscription ack from the server.
    pub fn mark_acked(&self, task_id: TaskId) {
        if let Some(mut entry) = self.inner.entries.get_mut(&task_id) {
            if entry.interest == Interest::Sent {
                entry.interest = Interest::Acked;
            }
        }
    }

    /// The link dropped: the server forgot every subscription.
    pub fn reset_interest(&self) {
        for mut entry in self.inner.entries.iter_mut() {
            entry.interest = Interest::Unsent;
        }
    }

    /// Send `subscribe_task` for every watched task the server does not
    /// know about. Returns how many were sent.
    pub fn resync(&self) -> usize {
        let mut sent = 0;
        for mut entry in self.inner.entries.iter_mut() {
            let task_id = *entry.key();
            if entry.interest == Interest::Unsent
                && self
                    .inner
                    .sink
                    .send(&OutboundCommand::SubscribeTask { task_id })
            {
                entry.interest = Interest::Sent;
                sent += 1;
            }
        }
        if sent > 0 {
            tracing::info!(tasks = sent, "Re-subscribed watched tasks");
        }
        sent
    }

    // ─── Stats ───────────────────────────────────────────────

    pub fn interest(&self, task_id: TaskId) -> Option<Interest> {
        self.inner.entries.get(&task_id).map(|e| e.interest)
    }

    pub fn is_watched(&self, task_id: TaskId) -> bool {
        self.inner.entries.contains_key(&task_id)
    }

    pub fn watched_tasks(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.inner.entries.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    pub fn observer_count(&self) -> usize {
        self.inner
            .entries
            .iter()
            .map(|e| e.observers.len())
            .sum()
    }
}

fn remove_observer(inner: &RegistryInner, task_id: TaskId, slot_id: u64) {
    let now_empty = match inner.entries.get_mut(&task_id) {
        Some(mut entry) => {
            entry.observers.retain(|s| s.id != slot_id);
            entry.observers.is_empty()
        }
        None => false,
    };
    if !now_empty {
        return;
    }

    if let Some((_, entry)) = inner
        .entries
        .remove_if(&task_id, |_, e| e.observers.is_empty())
    {
        tracing::debug!(task_id, "Last observer removed");
        if entry.interest != Interest::Unsent {
            inner
                .sink
                .send(&OutboundCommand::UnsubscribeTask { task_id });
        }
    }
}
