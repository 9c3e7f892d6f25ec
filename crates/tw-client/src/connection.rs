//! Push channel connection management.
//!
//! Owns the single socket: connects, detects loss, reconnects with a fixed
//! delay up to a bounded number of attempts, and reports every state
//! transition to connection listeners. Outbound commands pass through a
//! [`CommandGate`] that only accepts frames while the link is up.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tw_common::config::PushConfig;
use tw_common::TransportError;
use tw_protocol::OutboundCommand;

use crate::identity::ClientIdentity;
use crate::listeners::{lock, ListenerSet};
use crate::registry::CommandSink;
use crate::transport::{Connector, Link};

/// How long `disconnect` waits for a graceful close before aborting.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// Link lost, waiting for the next attempt.
    Reconnecting,
    /// Gave up after the configured attempts; only `connect()` leaves it.
    Exhausted,
}

/// Events delivered to connection listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
        /// Reconnect attempt counter at the time of the transition.
        attempt: u32,
    },
    /// Non-fatal error reported by the server.
    ServerWarning { message: String },
}

/// Receives what arrives over the link.
pub trait LinkHandler: Send + Sync {
    fn on_frame(&self, frame: &str);

    /// The link reached Connected (initially or after a reconnect).
    fn on_link_up(&self) {}

    /// The link was lost or torn down.
    fn on_link_down(&self) {}
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushSettings {
    /// Full endpoint address, client identity included.
    pub url: String,
    pub reconnect_interval: Duration,
    pub max_reconnect_attempts: u32,
    pub keepalive_interval: Option<Duration>,
}

impl PushSettings {
    pub fn from_config(cfg: &PushConfig, identity: &ClientIdentity) -> Self {
        Self {
            url: identity.push_url(&cfg.ws_base_url),
            reconnect_interval: Duration::from_millis(cfg.reconnect_interval_ms),
            max_reconnect_attempts: cfg.max_reconnect_attempts,
            keepalive_interval: (cfg.keepalive_interval_secs > 0)
                .then(|| Duration::from_secs(cfg.keepalive_interval_secs)),
        }
    }
}

// ─── Outbound gate ───────────────────────────────────────────

/// Outbound frame queue for the live link. Closed whenever the link is not
/// Connected; sends in that window are dropped, never queued.
#[derive(Debug, Default)]
pub struct CommandGate {
    tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl CommandGate {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn open(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        *lock(&self.tx) = Some(tx);
        rx
    }

    fn close(&self) {
        lock(&self.tx).take();
    }

    pub fn is_open(&self) -> bool {
        lock(&self.tx).as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

impl CommandSink for CommandGate {
    fn send(&self, command: &OutboundCommand) -> bool {
        let frame = match command.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::error!(command = command.kind(), "{}", e);
                return false;
            }
        };

        let delivered = lock(&self.tx)
            .as_ref()
            .is_some_and(|tx| tx.send(frame).is_ok());
        if !delivered {
            tracing::warn!(
                command = command.kind(),
                "Push channel not connected, dropping command"
            );
        }
        delivered
    }
}

// ─── Connection manager ──────────────────────────────────────

struct Run {
    generation: u64,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

struct Inner {
    settings: PushSettings,
    connector: Arc<dyn Connector>,
    handler: Arc<dyn LinkHandler>,
    events: Arc<ListenerSet<ConnectionEvent>>,
    gate: Arc<CommandGate>,
    state: watch::Sender<ConnectionState>,
    attempts: AtomicU32,
    generation: AtomicU64,
    run: Mutex<Option<Run>>,
}

impl Inner {
    /// Move to `to` unless this run was cancelled. Returns `false` if the
    /// run was cancelled and the caller should stop.
    fn transition(&self, cancel: &CancellationToken, to: ConnectionState) -> bool {
        let mut applied = false;
        let mut from = None;
        self.state.send_if_modified(|state| {
            if cancel.is_cancelled() {
                return false;
            }
            applied = true;
            if *state == to {
                return false;
            }
            from = Some(std::mem::replace(state, to));
            true
        });
        if let Some(from) = from {
            self.emit_state(from, to);
        }
        applied
    }

    fn emit_state(&self, from: ConnectionState, to: ConnectionState) {
        let attempt = self.attempts.load(Ordering::SeqCst);
        tracing::debug!(?from, ?to, attempt, "Connection state changed");
        self.events
            .emit(&ConnectionEvent::StateChanged { from, to, attempt });
    }
}

/// Owns the push channel's lifecycle. At most one live socket at a time.
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        settings: PushSettings,
        connector: Arc<dyn Connector>,
        handler: Arc<dyn LinkHandler>,
        events: Arc<ListenerSet<ConnectionEvent>>,
        gate: Arc<CommandGate>,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            inner: Arc::new(Inner {
                settings,
                connector,
                handler,
                events,
                gate,
                state,
                attempts: AtomicU32::new(0),
                generation: AtomicU64::new(0),
                run: Mutex::new(None),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Watch state changes (e.g. to await a particular state).
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }

    pub fn url(&self) -> &str {
        &self.inner.settings.url
    }

    /// Send a command if connected; otherwise it is dropped with a warning.
    pub fn send(&self, command: &OutboundCommand) -> bool {
        self.inner.gate.send(command)
    }

    /// Connect the push channel.
    ///
    /// Resolves once Connected. Fails if the first open fails; no reconnect
    /// cycle is started in that case. If a connection attempt is already in
    /// flight this waits for its result.
    pub async fn connect(&self) -> Result<(), TransportError> {
        let inner = &self.inner;

        let mut previous = None;
        inner.state.send_if_modified(|state| match state {
            ConnectionState::Disconnected | ConnectionState::Exhausted => {
                previous = Some(std::mem::replace(state, ConnectionState::Connecting));
                true
            }
            _ => false,
        });
        let Some(previous) = previous else {
            return self.wait_connected().await;
        };

        inner.attempts.store(0, Ordering::SeqCst);
        inner.emit_state(previous, ConnectionState::Connecting);

        let generation = inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let cancel = CancellationToken::new();
        let stale = lock(&inner.run).replace(Run {
            generation,
            cancel: cancel.clone(),
            task: None,
        });
        if let Some(stale) = stale {
            stale.cancel.cancel();
            if let Some(task) = stale.task {
                task.abort();
            }
        }

        tracing::info!(url = %inner.settings.url, "Connecting push channel");
        let opened = tokio::select! {
            _ = cancel.cancelled() => Err(TransportError::Cancelled),
            r = inner.connector.open(&inner.settings.url) => r,
        };

        let link = match opened {
            Ok(link) => link,
            Err(e) => {
                tracing::warn!("Push channel connect failed: {}", e);
                inner.transition(&cancel, ConnectionState::Disconnected);
                return Err(e);
            }
        };

        let outgoing = inner.gate.open();
        if !inner.transition(&cancel, ConnectionState::Connected) {
            inner.gate.close();
            return Err(TransportError::Cancelled);
        }
        tracing::info!(url = %inner.settings.url, "Push channel connected");
        inner.handler.on_link_up();

        let task = tokio::spawn(supervise(inner.clone(), link, outgoing, cancel));
        match lock(&inner.run).as_mut() {
            Some(run) if run.generation == generation => run.task = Some(task),
            // Torn down meanwhile; the task sees its cancelled token and exits.
            _ => {}
        }
        Ok(())
    }

    async fn wait_connected(&self) -> Result<(), TransportError> {
        let mut rx = self.inner.state.subscribe();
        let state = rx
            .wait_for(|s| {
                matches!(
                    s,
                    ConnectionState::Connected
                        | ConnectionState::Disconnected
                        | ConnectionState::Exhausted
                )
            })
            .await
            .map(|s| *s)
            .map_err(|_| TransportError::Cancelled)?;

        match state {
            ConnectionState::Connected => Ok(()),
            ConnectionState::Exhausted => Err(TransportError::Exhausted(
                self.inner.settings.max_reconnect_attempts,
            )),
            _ => Err(TransportError::Closed("disconnected".to_string())),
        }
    }

    /// Tear the channel down. Cancels the reconnect timer and keepalive;
    /// calling it again is a no-op.
    pub async fn disconnect(&self) {
        let run = lock(&self.inner.run).take();
        self.inner.gate.close();

        if let Some(run) = run {
            run.cancel.cancel();
            if let Some(mut task) = run.task {
                if tokio::time::timeout(CLOSE_GRACE, &mut task).await.is_err() {
                    tracing::warn!("Push channel did not close in time, aborting");
                    task.abort();
                }
            }
        }

        let from = self.inner.state.send_replace(ConnectionState::Disconnected);
        if from != ConnectionState::Disconnected {
            self.inner.attempts.store(0, Ordering::SeqCst);
            self.inner.handler.on_link_down();
            self.inner.emit_state(from, ConnectionState::Disconnected);
            tracing::info!("Push channel disconnected");
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        self.inner.gate.close();
        if let Some(run) = lock(&self.inner.run).take() {
            run.cancel.cancel();
            if let Some(task) = run.task {
                task.abort();
            }
        }
    }
}

/// Long-lived task for one `connect()`: runs the link, reconnects on loss.
async fn supervise(
    inner: Arc<Inner>,
    mut link: Link,
    mut outgoing: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    loop {
        let reason = run_link(&inner, link, &mut outgoing, &cancel).await;
        inner.gate.close();
        if cancel.is_cancelled() {
            tracing::debug!("Push channel closed by disconnect");
            return;
        }

        tracing::warn!(%reason, "Push channel lost");
        inner.handler.on_link_down();

        match reconnect(&inner, &cancel).await {
            Some((next_link, next_outgoing)) => {
                link = next_link;
                outgoing = next_outgoing;
            }
            None => return,
        }
    }
}

/// Fixed-delay reconnect loop. `None` when exhausted or cancelled.
async fn reconnect(
    inner: &Inner,
    cancel: &CancellationToken,
) -> Option<(Link, mpsc::UnboundedReceiver<String>)> {
    let max = inner.settings.max_reconnect_attempts;
    let delay = inner.settings.reconnect_interval;

    loop {
        let attempt = inner.attempts.load(Ordering::SeqCst) + 1;
        let exhausted = attempt > max;
        if !exhausted {
            inner.attempts.store(attempt, Ordering::SeqCst);
        }
        // Exhausted is only ever entered from Reconnecting.
        if !inner.transition(cancel, ConnectionState::Reconnecting) {
            return None;
        }
        if exhausted {
            tracing::warn!("Max reconnection attempts ({}) reached, giving up", max);
            inner.transition(cancel, ConnectionState::Exhausted);
            return None;
        }

        tracing::info!(
            "Reconnecting (attempt {}/{}, retry in {:?})...",
            attempt,
            max,
            delay
        );
        tokio::select! {
            _ = cancel.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        if !inner.transition(cancel, ConnectionState::Connecting) {
            return None;
        }
        let opened = tokio::select! {
            _ = cancel.cancelled() => return None,
            r = inner.connector.open(&inner.settings.url) => r,
        };

        match opened {
            Ok(link) => {
                let outgoing = inner.gate.open();
                inner.attempts.store(0, Ordering::SeqCst);
                if !inner.transition(cancel, ConnectionState::Connected) {
                    inner.gate.close();
                    return None;
                }
                tracing::info!("Reconnected (attempt {})", attempt);
                inner.handler.on_link_up();
                return Some((link, outgoing));
            }
            Err(e) => {
                tracing::warn!("Reconnection attempt {} failed: {}", attempt, e);
            }
        }
    }
}

/// Pump one link until it drops or the run is cancelled. Returns the reason.
async fn run_link(
    inner: &Inner,
    link: Link,
    outgoing: &mut mpsc::UnboundedReceiver<String>,
    cancel: &CancellationToken,
) -> String {
    let Link {
        mut sink,
        mut stream,
    } = link;
    let mut keepalive = inner.settings.keepalive_interval.map(|period| {
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.close().await;
                return "disconnected".to_string();
            }

            frame = outgoing.recv() => match frame {
                Some(frame) => {
                    if let Err(e) = sink.send(frame).await {
                        return format!("write_error: {}", e);
                    }
                }
                None => return "outbound queue closed".to_string(),
            },

            msg = stream.next() => match msg {
                Some(Ok(text)) => inner.handler.on_frame(&text),
                Some(Err(e)) => return e.to_string(),
                None => return "stream ended".to_string(),
            },

            _ = next_tick(&mut keepalive) => {
                let ping = OutboundCommand::Ping {
                    timestamp: chrono::Utc::now().timestamp_millis().max(0) as u64,
                };
                match ping.encode() {
                    Ok(frame) => {
                        if let Err(e) = sink.send(frame).await {
                            return format!("write_error: {}", e);
                        }
                        tracing::trace!("Keepalive ping sent");
                    }
                    Err(e) => tracing::error!("{}", e),
                }
            }
        }
    }
}

async fn next_tick(keepalive: &mut Option<Interval>) {
    match keepalive {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}
