//! Polling fallback: drive status checks for one task until it reaches a
//! terminal outcome, a policy limit, or is cancelled.
//!
//! Every non-terminal iteration sleeps on the tokio clock, so tests can run
//! on a paused runtime and fast-forward time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tw_common::config::PollingConfig;
use tw_common::FetchError;
use tw_protocol::{TaskId, TaskStatus, TaskStatusReport, TaskUpdate};

/// Reason used when the task reports a status outside the REST contract.
pub const UNEXPECTED_STATUS: &str = "unexpected status";
/// Reason used when fetches kept failing.
pub const NETWORK_FAILURE: &str = "network";

/// Terminal result both channels converge on.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    Completed { result_ref: Option<String> },
    Failed { reason: String },
    TimedOut,
    /// Progress plateaued at or above the stuck threshold.
    Stuck { progress: f64 },
}

impl TaskOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    /// Outcome carried by a pushed update, if its status is terminal.
    pub fn from_update(update: &TaskUpdate) -> Option<TaskOutcome> {
        match update.status {
            TaskStatus::Completed => Some(Self::Completed {
                result_ref: update
                    .extra
                    .get("result_ref")
                    .and_then(|v| v.as_str())
                    .map(str::to_string),
            }),
            TaskStatus::Failed => Some(Self::Failed {
                reason: update
                    .error_message
                    .clone()
                    .unwrap_or_else(|| "task failed".to_string()),
            }),
            _ => None,
        }
    }
}

/// Source of task status reports (HTTP in production).
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch_status(&self, task_id: TaskId) -> Result<TaskStatusReport, FetchError>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct PollOptions {
    pub interval: Duration,
    pub max_attempts: u32,
    pub stuck_progress: f64,
    pub stuck_attempts: u32,
    pub max_consecutive_errors: u32,
}

impl Default for PollOptions {
    fn default() -> Self {
        Self::from(&PollingConfig::default())
    }
}

impl From<&PollingConfig> for PollOptions {
    fn from(cfg: &PollingConfig) -> Self {
        Self {
            interval: Duration::from_millis(cfg.interval_ms),
            max_attempts: cfg.max_attempts,
            stuck_progress: cfg.stuck_progress,
            stuck_attempts: cfg.stuck_attempts,
            max_consecutive_errors: cfg.max_consecutive_errors,
        }
    }
}

/// Bookkeeping for one polling run.
#[derive(Debug, Clone)]
pub struct PollAttempt {
    pub task_id: TaskId,
    pub attempt_count: u32,
    pub started_at: Instant,
    pub last_progress: Option<f64>,
    plateau: u32,
    consecutive_errors: u32,
}

impl PollAttempt {
    fn new(task_id: TaskId) -> Self {
        Self {
            task_id,
            attempt_count: 0,
            started_at: Instant::now(),
            last_progress: None,
            plateau: 0,
            consecutive_errors: 0,
        }
    }

    /// Account for a non-terminal response.
    fn record_progress(&mut self, progress: f64, options: &PollOptions) {
        self.attempt_count += 1;
        self.consecutive_errors = 0;
        self.plateau = if progress < options.stuck_progress {
            0
        } else {
            match self.last_progress {
                Some(last) if progress <= last && self.plateau > 0 => self.plateau + 1,
                _ => 1,
            }
        };
        self.last_progress = Some(progress);
    }

    fn record_error(&mut self) {
        self.attempt_count += 1;
        self.consecutive_errors += 1;
    }

    /// Policy check after a non-terminal iteration.
    fn verdict(&self, options: &PollOptions) -> Option<TaskOutcome> {
        if options.max_consecutive_errors > 0
            && self.consecutive_errors >= options.max_consecutive_errors
        {
            return Some(TaskOutcome::Failed {
                reason: NETWORK_FAILURE.to_string(),
            });
        }
        if self.attempt_count > options.max_attempts {
            return Some(TaskOutcome::TimedOut);
        }
        if self.plateau > options.stuck_attempts {
            return Some(TaskOutcome::Stuck {
                progress: self.last_progress.unwrap_or_default(),
            });
        }
        None
    }
}

/// Poll `task_id` until it resolves. Returns `None` if `cancel` fired first;
/// no outcome is produced after cancellation.
pub async fn poll_until_terminal<S>(
    task_id: TaskId,
    source: &S,
    options: &PollOptions,
    cancel: &CancellationToken,
) -> Option<TaskOutcome>
where
    S: StatusSource + ?Sized,
{
    let mut attempt = PollAttempt::new(task_id);
    tracing::debug!(task_id, interval = ?options.interval, "Polling started");

    loop {
        let fetched = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(task_id, attempts = attempt.attempt_count, "Polling cancelled");
                return None;
            }
            r = source.fetch_status(task_id) => r,
        };

        match fetched {
            Ok(report) => {
                if let Some(outcome) = terminal_outcome(task_id, &report) {
                    log_outcome(&attempt, &outcome);
                    return Some(outcome);
                }
                attempt.record_progress(report.progress, options);
                tracing::trace!(
                    task_id,
                    attempt = attempt.attempt_count,
                    progress = report.progress,
                    status = %report.status,
                    "Task still running"
                );
            }
            Err(e) => {
                attempt.record_error();
                tracing::warn!(
                    task_id,
                    attempt = attempt.attempt_count,
                    consecutive = attempt.consecutive_errors,
                    "Status fetch failed: {}",
                    e
                );
            }
        }

        if let Some(outcome) = attempt.verdict(options) {
            log_outcome(&attempt, &outcome);
            return Some(outcome);
        }

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                tracing::debug!(task_id, attempts = attempt.attempt_count, "Polling cancelled");
                return None;
            }
            _ = tokio::time::sleep(options.interval) => {}
        }
    }
}

fn terminal_outcome(task_id: TaskId, report: &TaskStatusReport) -> Option<TaskOutcome> {
    match &report.status {
        TaskStatus::Completed => Some(TaskOutcome::Completed {
            result_ref: report.result_ref.clone(),
        }),
        TaskStatus::Failed => Some(TaskOutcome::Failed {
            reason: report
                .error_message
                .clone()
                .unwrap_or_else(|| "task failed".to_string()),
        }),
        TaskStatus::Pending | TaskStatus::Processing => None,
        TaskStatus::Other(status) => {
            tracing::warn!(task_id, %status, "Status outside the REST contract");
            Some(TaskOutcome::Failed {
                reason: UNEXPECTED_STATUS.to_string(),
            })
        }
    }
}

fn log_outcome(attempt: &PollAttempt, outcome: &TaskOutcome) {
    let elapsed = attempt.started_at.elapsed();
    match outcome {
        TaskOutcome::Completed { .. } => tracing::info!(
            task_id = attempt.task_id,
            attempts = attempt.attempt_count,
            ?elapsed,
            "Task completed"
        ),
        other => tracing::warn!(
            task_id = attempt.task_id,
            attempts = attempt.attempt_count,
            ?elapsed,
            outcome = ?other,
            "Polling ended without completion"
        ),
    }
}

// ─── Spawned polls ───────────────────────────────────────────

/// Handle to a spawned poll loop. Clones share the same run.
#[derive(Debug, Clone)]
pub struct PollHandle {
    task_id: TaskId,
    cancel: CancellationToken,
    finished: Arc<AtomicBool>,
    outcome: watch::Receiver<Option<TaskOutcome>>,
}

impl PollHandle {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    /// Stop scheduling further attempts. The run then ends without outcome.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// The loop has exited, with or without an outcome.
    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    /// Both handles refer to the same spawned run.
    pub fn same_run(&self, other: &PollHandle) -> bool {
        Arc::ptr_eq(&self.finished, &other.finished)
    }

    /// Outcome if the run already finished.
    pub fn peek(&self) -> Option<TaskOutcome> {
        self.outcome.borrow().clone()
    }

    /// Wait for the run. `None` means it was cancelled.
    pub async fn outcome(&self) -> Option<TaskOutcome> {
        let mut rx = self.outcome.clone();
        let outcome = match rx.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => None,
        };
        outcome
    }
}

/// Spawn [`poll_until_terminal`] on the runtime. `on_finish` runs once the
/// loop exits, with the outcome if there is one.
pub fn spawn_poll(
    task_id: TaskId,
    source: Arc<dyn StatusSource>,
    options: PollOptions,
    on_finish: impl FnOnce(Option<&TaskOutcome>) + Send + 'static,
) -> PollHandle {
    let cancel = CancellationToken::new();
    let (tx, rx) = watch::channel(None);

    let finished = Arc::new(AtomicBool::new(false));

    let token = cancel.clone();
    let done = finished.clone();
    tokio::spawn(async move {
        let outcome = poll_until_terminal(task_id, source.as_ref(), &options, &token).await;
        done.store(true, Ordering::Release);
        on_finish(outcome.as_ref());
        if let Some(outcome) = outcome {
            let _ = tx.send(Some(outcome));
        }
    });

    PollHandle {
        task_id,
        cancel,
        finished,
        outcome: rx,
    }
}
