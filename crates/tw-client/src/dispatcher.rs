//! Routes decoded push frames to their consumers.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tw_protocol::{decode_frame, InboundEvent, SchedulerStatus};

use crate::board::{TaskBoard, UpdateSource};
use crate::connection::{ConnectionEvent, LinkHandler};
use crate::listeners::{lock, ListenerSet};
use crate::poller::TaskOutcome;
use crate::registry::SubscriptionRegistry;

/// Fan-out point between the connection and every listener.
pub struct Dispatcher {
    registry: SubscriptionRegistry,
    board: Arc<TaskBoard>,
    scheduler: Arc<ListenerSet<SchedulerStatus>>,
    notifications: Arc<ListenerSet<Value>>,
    connection_events: Arc<ListenerSet<ConnectionEvent>>,
    latest_scheduler: Mutex<Option<SchedulerStatus>>,
}

impl Dispatcher {
    pub fn new(
        registry: SubscriptionRegistry,
        board: Arc<TaskBoard>,
        scheduler: Arc<ListenerSet<SchedulerStatus>>,
        notifications: Arc<ListenerSet<Value>>,
        connection_events: Arc<ListenerSet<ConnectionEvent>>,
    ) -> Self {
        Self {
            registry,
            board,
            scheduler,
            notifications,
            connection_events,
            latest_scheduler: Mutex::new(None),
        }
    }

    /// Most recent scheduler snapshot seen on the channel.
    pub fn latest_scheduler_status(&self) -> Option<SchedulerStatus> {
        lock(&self.latest_scheduler).clone()
    }

    /// Decode and route one text frame. Bad frames are logged and dropped.
    pub fn dispatch_frame(&self, frame: &str) {
        match decode_frame(frame) {
            Ok(event) => self.dispatch(event),
            Err(e) => tracing::warn!(len = frame.len(), "Dropping inbound frame: {}", e),
        }
    }

    pub fn dispatch(&self, event: InboundEvent) {
        match event {
            InboundEvent::TaskUpdate {
                task_id, update, ..
            } => {
                self.board.record_update(task_id, &update, UpdateSource::Push);
                if let Some(outcome) = TaskOutcome::from_update(&update) {
                    self.board.record_outcome(task_id, &outcome);
                }
                let reached = self.registry.deliver(task_id, &update);
                tracing::trace!(
                    task_id,
                    progress = update.progress,
                    status = %update.status,
                    observers = reached,
                    "Task update"
                );
            }
            InboundEvent::SchedulerStatus(status) => {
                *lock(&self.latest_scheduler) = Some(status.clone());
                self.scheduler.emit(&status);
            }
            InboundEvent::Notification(payload) => {
                self.notifications.emit(&payload);
            }
            InboundEvent::SubscriptionAck { task_id, message } => {
                tracing::debug!(?task_id, %message, "Subscription confirmed");
                if let Some(task_id) = task_id {
                    self.registry.mark_acked(task_id);
                }
            }
            InboundEvent::UnsubscriptionAck { task_id, message } => {
                tracing::debug!(?task_id, %message, "Unsubscription confirmed");
            }
            InboundEvent::Pong { timestamp } => {
                let rtt_ms = timestamp.map(|sent| {
                    (chrono::Utc::now().timestamp_millis().max(0) as u64).saturating_sub(sent)
                });
                tracing::debug!(?rtt_ms, "Pong");
            }
            InboundEvent::Error { message } => {
                tracing::warn!(%message, "Server reported an error");
                self.connection_events
                    .emit(&ConnectionEvent::ServerWarning { message });
            }
            InboundEvent::Unknown { kind } => {
                tracing::debug!(%kind, "Ignoring unknown message type");
            }
        }
    }
}

impl LinkHandler for Dispatcher {
    fn on_frame(&self, frame: &str) {
        self.dispatch_frame(frame);
    }

    fn on_link_up(&self) {
        self.registry.resync();
    }

    fn on_link_down(&self) {
        self.registry.reset_interest();
    }
}
