//! Client composition root.
//!
//! [`TaskClient`] wires the identity, push connection, registry, dispatcher,
//! polling fallback and task board together. There is no global instance;
//! construct as many clients as needed.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use tw_common::{AppConfig, ClientResult, FetchError};
use tw_protocol::{OutboundCommand, SchedulerStatus, TaskId, TaskStatusReport, TaskUpdate};

use crate::board::{report_to_update, TaskBoard, TaskSnapshot, UpdateSource};
use crate::connection::{
    CommandGate, ConnectionEvent, ConnectionManager, ConnectionState, PushSettings,
};
use crate::dispatcher::Dispatcher;
use crate::fetch::HttpStatusSource;
use crate::identity::ClientIdentity;
use crate::listeners::{ListenerSet, ObserverHandle};
use crate::poller::{spawn_poll, PollHandle, PollOptions, StatusSource};
use crate::registry::SubscriptionRegistry;
use crate::transport::{Connector, WsConnector};

/// Connection statistics for diagnostics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientStats {
    pub client_id: String,
    pub state: ConnectionState,
    pub watched_tasks: Vec<TaskId>,
    pub total_observers: usize,
    pub active_polls: usize,
    pub reconnect_attempts: u32,
}

/// Result of [`TaskClient::watch`]. Dropping it stops observing.
#[derive(Debug)]
#[must_use = "dropping a TaskWatch unobserves the task"]
pub struct TaskWatch {
    pub observer: ObserverHandle,
    /// Present when the push channel was down and polling took over.
    pub poll: Option<PollHandle>,
}

/// Status source that also feeds each polled report to the task's
/// observers and the board, so consumers see one stream of updates.
struct Mirrored {
    inner: Arc<dyn StatusSource>,
    registry: SubscriptionRegistry,
    board: Arc<TaskBoard>,
}

#[async_trait]
impl StatusSource for Mirrored {
    async fn fetch_status(&self, task_id: TaskId) -> Result<TaskStatusReport, FetchError> {
        let report = self.inner.fetch_status(task_id).await?;
        let update = report_to_update(&report);
        self.board.record_update(task_id, &update, UpdateSource::Poll);
        self.registry.deliver(task_id, &update);
        Ok(report)
    }
}

pub struct TaskClient {
    identity: ClientIdentity,
    connection: ConnectionManager,
    registry: SubscriptionRegistry,
    dispatcher: Arc<Dispatcher>,
    board: Arc<TaskBoard>,
    source: Arc<dyn StatusSource>,
    poll_options: PollOptions,
    polls: Arc<DashMap<TaskId, PollHandle>>,
    scheduler: Arc<ListenerSet<SchedulerStatus>>,
    notifications: Arc<ListenerSet<Value>>,
    connection_events: Arc<ListenerSet<ConnectionEvent>>,
}

impl TaskClient {
    /// Production client: WebSocket push channel and HTTP status source.
    pub fn from_config(cfg: &AppConfig) -> ClientResult<Self> {
        let identity = ClientIdentity::generate();
        let push = PushSettings::from_config(&cfg.push, &identity);
        let source = Arc::new(HttpStatusSource::from_config(&cfg.api)?);
        Ok(Self::new(
            identity,
            push,
            Arc::new(WsConnector),
            source,
            PollOptions::from(&cfg.polling),
        ))
    }

    pub fn new(
        identity: ClientIdentity,
        push: PushSettings,
        connector: Arc<dyn Connector>,
        source: Arc<dyn StatusSource>,
        poll_options: PollOptions,
    ) -> Self {
        let gate = CommandGate::new();
        let registry = SubscriptionRegistry::new(gate.clone());
        let board = Arc::new(TaskBoard::new());
        let scheduler = ListenerSet::new("scheduler_status");
        let notifications = ListenerSet::new("notification");
        let connection_events = ListenerSet::new("connection");

        let dispatcher = Arc::new(Dispatcher::new(
            registry.clone(),
            board.clone(),
            scheduler.clone(),
            notifications.clone(),
            connection_events.clone(),
        ));
        let connection = ConnectionManager::new(
            push,
            connector,
            dispatcher.clone(),
            connection_events.clone(),
            gate,
        );
        let source: Arc<dyn StatusSource> = Arc::new(Mirrored {
            inner: source,
            registry: registry.clone(),
            board: board.clone(),
        });

        tracing::debug!(client_id = %identity, url = connection.url(), "Client created");

        Self {
            identity,
            connection,
            registry,
            dispatcher,
            board,
            source,
            poll_options,
            polls: Arc::new(DashMap::new()),
            scheduler,
            notifications,
            connection_events,
        }
    }

    pub fn identity(&self) -> &ClientIdentity {
        &self.identity
    }

    // ─── Push channel ────────────────────────────────────────

    pub async fn connect(&self) -> ClientResult<()> {
        self.connection.connect().await?;
        Ok(())
    }

    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    /// Ask the server for a scheduler snapshot. `false` if not connected.
    pub fn request_scheduler_status(&self) -> bool {
        self.connection.send(&OutboundCommand::GetSchedulerStatus)
    }

    pub fn latest_scheduler_status(&self) -> Option<SchedulerStatus> {
        self.dispatcher.latest_scheduler_status()
    }

    // ─── Listeners ───────────────────────────────────────────

    /// Observe push (and polled) updates of one task.
    pub fn observe(
        &self,
        task_id: TaskId,
        callback: impl Fn(&TaskUpdate) + Send + Sync + 'static,
    ) -> ObserverHandle {
        self.registry.observe(task_id, callback)
    }

    pub fn on_scheduler_status(
        &self,
        callback: impl Fn(&SchedulerStatus) + Send + Sync + 'static,
    ) -> ObserverHandle {
        self.scheduler.add(callback)
    }

    pub fn on_notification(
        &self,
        callback: impl Fn(&Value) + Send + Sync + 'static,
    ) -> ObserverHandle {
        self.notifications.add(callback)
    }

    pub fn on_connection_event(
        &self,
        callback: impl Fn(&ConnectionEvent) + Send + Sync + 'static,
    ) -> ObserverHandle {
        self.connection_events.add(callback)
    }

    // ─── Polling fallback ────────────────────────────────────

    /// Poll `task_id` until it resolves. A task has at most one active
    /// poll; tracking it again joins the running one.
    pub fn track(&self, task_id: TaskId) -> PollHandle {
        match self.polls.entry(task_id) {
            Entry::Occupied(entry) if !entry.get().is_finished() => {
                tracing::debug!(task_id, "Joining active poll");
                entry.get().clone()
            }
            entry => {
                let handle = self.spawn_tracked(task_id);
                entry.insert(handle.clone());
                handle
            }
        }
    }

    fn spawn_tracked(&self, task_id: TaskId) -> PollHandle {
        let polls = Arc::downgrade(&self.polls);
        let board = self.board.clone();
        spawn_poll(
            task_id,
            self.source.clone(),
            self.poll_options.clone(),
            move |outcome| {
                if let Some(outcome) = outcome {
                    board.record_outcome(task_id, outcome);
                }
                if let Some(polls) = polls.upgrade() {
                    polls.remove_if(&task_id, |_, h| h.is_finished());
                }
            },
        )
    }

    /// Stop the active poll of `task_id`, if any.
    pub fn cancel_tracking(&self, task_id: TaskId) -> bool {
        match self.polls.remove(&task_id) {
            Some((_, handle)) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Observe `task_id`, falling back to polling when the push channel is
    /// not connected. Polled reports reach `callback` like push updates.
    pub fn watch(
        &self,
        task_id: TaskId,
        callback: impl Fn(&TaskUpdate) + Send + Sync + 'static,
    ) -> TaskWatch {
        let observer = self.observe(task_id, callback);
        let poll = if self.is_connected() {
            None
        } else {
            tracing::warn!(task_id, "Push channel not connected, polling instead");
            Some(self.track(task_id))
        };
        TaskWatch { observer, poll }
    }

    /// Like [`watch`](Self::watch), but always polls as well, so the task
    /// reaches a terminal outcome even if push never reports one.
    pub fn follow(
        &self,
        task_id: TaskId,
        callback: impl Fn(&TaskUpdate) + Send + Sync + 'static,
    ) -> TaskWatch {
        let observer = self.observe(task_id, callback);
        let poll = Some(self.track(task_id));
        TaskWatch { observer, poll }
    }

    // ─── State ───────────────────────────────────────────────

    pub fn snapshot(&self, task_id: TaskId) -> Option<TaskSnapshot> {
        self.board.get(task_id)
    }

    pub fn stats(&self) -> ClientStats {
        ClientStats {
            client_id: self.identity.to_string(),
            state: self.connection.state(),
            watched_tasks: self.registry.watched_tasks(),
            total_observers: self.registry.observer_count(),
            active_polls: self.polls.iter().filter(|p| !p.is_finished()).count(),
            reconnect_attempts: self.connection.reconnect_attempts(),
        }
    }

    /// Disconnect and cancel every active poll.
    pub async fn shutdown(&self) {
        self.connection.disconnect().await;
        self.cancel_all_polls();
    }

    fn cancel_all_polls(&self) {
        for entry in self.polls.iter() {
            entry.value().cancel();
        }
        self.polls.clear();
    }
}

impl Drop for TaskClient {
    fn drop(&mut self) {
        self.cancel_all_polls();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::MockConnector;
    use crate::poller::tests::ScriptedSource;
    use crate::poller::TaskOutcome;
    use std::sync::Mutex;
    use std::time::Duration;

    fn report(status: &str, progress: f64) -> Result<TaskStatusReport, u16> {
        Ok(TaskStatusReport::new(status, progress))
    }

    fn client(connector: Arc<MockConnector>, source: Arc<ScriptedSource>) -> TaskClient {
        TaskClient::new(
            ClientIdentity::from_string("client_1_test00000"),
            PushSettings {
                url: "ws://test/ws/client_1_test00000".into(),
                reconnect_interval: Duration::from_secs(3),
                max_reconnect_attempts: 5,
                keepalive_interval: None,
            },
            connector,
            source,
            PollOptions {
                interval: Duration::from_secs(2),
                ..PollOptions::default()
            },
        )
    }

    fn progress_log() -> (Arc<Mutex<Vec<f64>>>, impl Fn(&TaskUpdate) + Send + Sync) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let l = log.clone();
        (log, move |u: &TaskUpdate| l.lock().unwrap().push(u.progress))
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_polls_while_disconnected() {
        let source = Arc::new(ScriptedSource::new(vec![
            report("processing", 20.0),
            report("processing", 60.0),
            report("completed", 100.0),
        ]));
        let client = client(MockConnector::with_plan(&[]), source.clone());
        let (log, callback) = progress_log();

        let watch = client.watch(11, callback);
        let poll = watch.poll.as_ref().expect("polling fallback");
        assert_eq!(
            poll.outcome().await,
            Some(TaskOutcome::Completed { result_ref: None })
        );

        assert_eq!(*log.lock().unwrap(), vec![20.0, 60.0, 100.0]);
        let snap = client.snapshot(11).unwrap();
        assert_eq!(snap.source, UpdateSource::Poll);
        assert_eq!(snap.outcome, Some(TaskOutcome::Completed { result_ref: None }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_watch_uses_push_when_connected() {
        let connector = MockConnector::with_plan(&[true]);
        let source = Arc::new(ScriptedSource::new(vec![report("processing", 1.0)]));
        let client = client(connector.clone(), source.clone());
        client.connect().await.unwrap();

        let (log, callback) = progress_log();
        let watch = client.watch(42, callback);
        assert!(watch.poll.is_none());

        let mut server = connector.take_server();
        assert_eq!(
            server.from_client.recv().await.unwrap(),
            r#"{"type":"subscribe_task","task_id":42}"#
        );
        server
            .to_client
            .send(Ok(
                r#"{"type":"task_update","task_id":42,"data":{"progress":50,"status":"processing"}}"#
                    .into(),
            ))
            .unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(*log.lock().unwrap(), vec![50.0]);
        assert_eq!(source.calls(), 0);
        assert_eq!(client.snapshot(42).unwrap().source, UpdateSource::Push);
    }

    #[tokio::test(start_paused = true)]
    async fn test_second_track_joins_active_poll() {
        let source = Arc::new(ScriptedSource::new(vec![
            report("processing", 10.0),
            report("processing", 20.0),
            report("failed", 20.0),
        ]));
        let client = client(MockConnector::with_plan(&[]), source.clone());

        let first = client.track(3);
        let second = client.track(3);
        assert_eq!(client.stats().active_polls, 1);

        let outcome = first.outcome().await;
        assert!(matches!(outcome, Some(TaskOutcome::Failed { .. })));
        assert_eq!(second.outcome().await, outcome);
        assert_eq!(source.calls(), 3);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(client.stats().active_polls, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_tracking_stops_poll() {
        let source = Arc::new(ScriptedSource::new(vec![report("processing", 10.0)]));
        let client = client(MockConnector::with_plan(&[]), source.clone());

        let handle = client.track(4);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(client.cancel_tracking(4));
        assert_eq!(handle.outcome().await, None);
        assert!(!client.cancel_tracking(4));
        assert!(client.snapshot(4).unwrap().outcome.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_after_reconnect() {
        let connector = MockConnector::with_plan(&[true, true]);
        let client = client(connector.clone(), Arc::new(ScriptedSource::new(vec![])));
        client.connect().await.unwrap();

        let _observer = client.observe(7, |_| {});
        drop(connector.take_server());

        let mut rx = client.connection.state_receiver();
        rx.wait_for(|s| *s == ConnectionState::Reconnecting)
            .await
            .unwrap();
        rx.wait_for(|s| *s == ConnectionState::Connected)
            .await
            .unwrap();

        let mut server = connector.take_server();
        assert_eq!(
            server.from_client.recv().await.unwrap(),
            r#"{"type":"subscribe_task","task_id":7}"#
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_stats_and_scheduler_request() {
        let connector = MockConnector::with_plan(&[true]);
        let client = client(connector.clone(), Arc::new(ScriptedSource::new(vec![])));
        assert!(!client.request_scheduler_status());

        client.connect().await.unwrap();
        let _a = client.observe(1, |_| {});
        let _b = client.observe(1, |_| {});
        let _c = client.observe(2, |_| {});
        assert!(client.request_scheduler_status());

        let stats = client.stats();
        assert_eq!(stats.client_id, "client_1_test00000");
        assert_eq!(stats.state, ConnectionState::Connected);
        assert_eq!(stats.watched_tasks, vec![1, 2]);
        assert_eq!(stats.total_observers, 3);
        assert_eq!(stats.reconnect_attempts, 0);
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["state"], "connected");

        client.shutdown().await;
        assert_eq!(client.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_track_starts_one_poll() {
        let source = Arc::new(ScriptedSource::new(vec![report("processing", 10.0)]));
        let client = Arc::new(client(MockConnector::with_plan(&[]), source.clone()));
        let barrier = Arc::new(std::sync::Barrier::new(8));
        let runtime = tokio::runtime::Handle::current();

        let threads: Vec<_> = (0..8)
            .map(|_| {
                let client = client.clone();
                let barrier = barrier.clone();
                let runtime = runtime.clone();
                std::thread::spawn(move || {
                    let _guard = runtime.enter();
                    barrier.wait();
                    client.track(5)
                })
            })
            .collect();
        let handles: Vec<PollHandle> = threads.into_iter().map(|t| t.join().unwrap()).collect();

        assert!(handles.iter().all(|h| h.same_run(&handles[0])));
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(source.calls(), 1);
        assert_eq!(client.stats().active_polls, 1);
        assert!(client.cancel_tracking(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_follow_resolves_when_push_stays_silent() {
        let connector = MockConnector::with_plan(&[true]);
        let source = Arc::new(ScriptedSource::new(vec![
            report("processing", 40.0),
            report("completed", 100.0),
        ]));
        let client = client(connector, source);
        client.connect().await.unwrap();

        let (log, callback) = progress_log();
        let follow = client.follow(8, callback);
        let poll = follow.poll.as_ref().expect("follow always polls");

        let expected = Some(TaskOutcome::Completed { result_ref: None });
        assert_eq!(poll.outcome().await, expected);
        assert!(client.is_connected());
        assert_eq!(*log.lock().unwrap(), vec![40.0, 100.0]);
        assert_eq!(client.snapshot(8).unwrap().outcome, expected);
    }
}
