//! Latest known state per task, written by both the push channel and the
//! polling fallback.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tw_protocol::{TaskId, TaskStatus, TaskStatusReport, TaskUpdate};

use crate::poller::TaskOutcome;

/// Which channel produced the last write. Diagnostic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateSource {
    Push,
    Poll,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TaskSnapshot {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub progress: f64,
    pub downloaded_size: Option<u64>,
    pub total_size: Option<u64>,
    pub error_message: Option<String>,
    pub outcome: Option<TaskOutcome>,
    pub source: UpdateSource,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct TaskBoard {
    tasks: DashMap<TaskId, TaskSnapshot>,
}

impl TaskBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_update(&self, task_id: TaskId, update: &TaskUpdate, source: UpdateSource) {
        let mut entry = self
            .tasks
            .entry(task_id)
            .or_insert_with(|| TaskSnapshot::empty(task_id, source));
        entry.status = update.status.clone();
        entry.progress = update.progress;
        if update.downloaded_size.is_some() {
            entry.downloaded_size = update.downloaded_size;
        }
        if update.total_size.is_some() {
            entry.total_size = update.total_size;
        }
        if update.error_message.is_some() {
            entry.error_message = update.error_message.clone();
        }
        entry.source = source;
        entry.updated_at = Utc::now();
    }

    pub fn record_outcome(&self, task_id: TaskId, outcome: &TaskOutcome) {
        let mut entry = self
            .tasks
            .entry(task_id)
            .or_insert_with(|| TaskSnapshot::empty(task_id, UpdateSource::Poll));
        entry.outcome = Some(outcome.clone());
        entry.updated_at = Utc::now();
    }

    pub fn get(&self, task_id: TaskId) -> Option<TaskSnapshot> {
        self.tasks.get(&task_id).map(|s| s.clone())
    }

    pub fn forget(&self, task_id: TaskId) -> Option<TaskSnapshot> {
        self.tasks.remove(&task_id).map(|(_, s)| s)
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

impl TaskSnapshot {
    fn empty(task_id: TaskId, source: UpdateSource) -> Self {
        Self {
            task_id,
            status: TaskStatus::Pending,
            progress: 0.0,
            downloaded_size: None,
            total_size: None,
            error_message: None,
            outcome: None,
            source,
            updated_at: Utc::now(),
        }
    }
}

/// Convert a REST status report into the push update shape so observers
/// see one type regardless of channel.
pub fn report_to_update(report: &TaskStatusReport) -> TaskUpdate {
    let mut update = TaskUpdate::new(report.status.clone(), report.progress);
    update.error_message = report.error_message.clone();
    if let Some(result_ref) = &report.result_ref {
        update
            .extra
            .insert("result_ref".to_string(), result_ref.clone().into());
    }
    update
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_updates_merge_sizes() {
        let board = TaskBoard::new();
        let mut first = TaskUpdate::new("processing", 10.0);
        first.total_size = Some(1000);
        board.record_update(3, &first, UpdateSource::Push);

        let mut second = TaskUpdate::new("processing", 50.0);
        second.downloaded_size = Some(500);
        board.record_update(3, &second, UpdateSource::Poll);

        let snap = board.get(3).unwrap();
        assert_eq!(snap.progress, 50.0);
        assert_eq!(snap.total_size, Some(1000));
        assert_eq!(snap.downloaded_size, Some(500));
        assert_eq!(snap.source, UpdateSource::Poll);
        assert!(snap.outcome.is_none());
    }

    #[test]
    fn test_outcome_recorded() {
        let board = TaskBoard::new();
        board.record_outcome(4, &TaskOutcome::Stuck { progress: 95.0 });
        assert_eq!(
            board.get(4).unwrap().outcome,
            Some(TaskOutcome::Stuck { progress: 95.0 })
        );
        assert!(board.forget(4).is_some());
        assert!(board.is_empty());
    }

    #[test]
    fn test_report_to_update_carries_result_ref() {
        let mut report = TaskStatusReport::new("completed", 100.0);
        report.result_ref = Some("out/42.nc".into());
        let update = report_to_update(&report);
        assert_eq!(update.status, TaskStatus::Completed);
        assert_eq!(update.extra["result_ref"], "out/42.nc");
    }
}
