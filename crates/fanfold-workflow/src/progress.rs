//! Overall progress of a running workflow.
//!
//! Every operation walks [`TOTAL_INTERVALS`] intervals, so a workflow with
//! `cycle_count` cycles of `concurrent_count` operations has
//! `cycle_count * concurrent_count * TOTAL_INTERVALS` intervals in total.
//! Progress is the share of those intervals credited so far: whole cycles
//! already joined (`prior_intervals`) plus what the current cycle's
//! operations report.

use std::collections::HashMap;

use fanfold_queue::{QueueError, TaskQueue, TaskStatus};
use serde::{Deserialize, Serialize};

use crate::operation::{ProgressPayload, TOTAL_INTERVALS};

/// Status and last published payload of one operation.
#[derive(Debug, Clone, PartialEq)]
pub struct OperationSnapshot {
  pub task_id: String,
  pub status: TaskStatus,
  pub payload: Option<serde_json::Value>,
}

impl OperationSnapshot {
  pub async fn capture(queue: &dyn TaskQueue, task_id: &str) -> Result<Self, QueueError> {
    Ok(Self {
      task_id: task_id.to_string(),
      status: queue.status(task_id).await?,
      payload: queue.last_status_payload(task_id).await?,
    })
  }

  /// Intervals this operation has finished, clamped to [`TOTAL_INTERVALS`].
  ///
  /// SUCCESS and FAILURE close the operation and credit every interval.
  /// PROGRESS and ABORTED credit the step they report. Anything else,
  /// including a missing or foreign payload, credits nothing.
  pub fn credited_intervals(&self) -> u64 {
    let total = u64::from(TOTAL_INTERVALS);
    match self.status {
      TaskStatus::Success | TaskStatus::Failure => total,
      TaskStatus::Progress | TaskStatus::Aborted => self
        .payload
        .as_ref()
        .and_then(|p| serde_json::from_value::<ProgressPayload>(p.clone()).ok())
        .map(|p| u64::from(p.progress).min(total))
        .unwrap_or(0),
      _ => 0,
    }
  }
}

/// A point-in-time view of overall progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
  /// Whole percent in 0..=100.
  pub percentage: u32,
  pub current_interval: u64,
}

impl Progress {
  fn from_intervals(current: u64, total: u64) -> Self {
    if total == 0 {
      return Self {
        percentage: 100,
        current_interval: 0,
      };
    }
    let current = current.min(total);
    Self {
      percentage: (u128::from(current) * 100 / u128::from(total)) as u32,
      current_interval: current,
    }
  }
}

/// Compute progress from one set of snapshots. Pure; the same inputs always
/// give the same result.
pub fn compute_progress(
  snapshots: &[OperationSnapshot],
  prior_intervals: u64,
  total_intervals: u64,
) -> Progress {
  let current = snapshots
    .iter()
    .map(OperationSnapshot::credited_intervals)
    .fold(prior_intervals, |acc, credited| acc.saturating_add(credited));
  Progress::from_intervals(current, total_intervals)
}

/// Progress across successive polls.
///
/// Keeps the highest credit seen per operation so a retried operation,
/// whose fresh attempt starts again at step 0, never pulls the total down.
#[derive(Debug, Default)]
pub struct ProgressAggregator {
  high_water: HashMap<String, u64>,
}

impl ProgressAggregator {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn compute(
    &mut self,
    snapshots: &[OperationSnapshot],
    prior_intervals: u64,
    total_intervals: u64,
  ) -> Progress {
    let mut current = prior_intervals;
    for snapshot in snapshots {
      let mark = self.high_water.entry(snapshot.task_id.clone()).or_insert(0);
      *mark = (*mark).max(snapshot.credited_intervals());
      current = current.saturating_add(*mark);
    }
    Progress::from_intervals(current, total_intervals)
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn snapshot(task_id: &str, status: TaskStatus, progress: Option<u32>) -> OperationSnapshot {
    OperationSnapshot {
      task_id: task_id.to_string(),
      status,
      payload: progress.map(|p| json!({"progress": p, "total": 10, "index": 0})),
    }
  }

  #[test]
  fn test_second_cycle_midway() {
    // 2 cycles of 3 operations, first cycle done, current ops at 5/10 each.
    let snapshots = [
      snapshot("a", TaskStatus::Progress, Some(5)),
      snapshot("b", TaskStatus::Progress, Some(5)),
      snapshot("c", TaskStatus::Progress, Some(5)),
    ];

    let progress = compute_progress(&snapshots, 30, 60);

    assert_eq!(progress.current_interval, 45);
    assert_eq!(progress.percentage, 75);
  }

  #[test]
  fn test_compute_is_idempotent() {
    let snapshots = [
      snapshot("a", TaskStatus::Progress, Some(3)),
      snapshot("b", TaskStatus::Success, Some(9)),
    ];
    assert_eq!(
      compute_progress(&snapshots, 0, 20),
      compute_progress(&snapshots, 0, 20)
    );
  }

  #[test]
  fn test_finished_workflow_is_complete() {
    let snapshots = [
      snapshot("a", TaskStatus::Success, None),
      snapshot("b", TaskStatus::Failure, None),
    ];

    let progress = compute_progress(&snapshots, 20, 40);

    assert_eq!(progress.percentage, 100);
    assert_eq!(progress.current_interval, 40);
  }

  #[test]
  fn test_unknown_states_credit_nothing() {
    let snapshots = [
      snapshot("a", TaskStatus::Pending, None),
      snapshot("b", TaskStatus::Started, None),
      OperationSnapshot {
        task_id: "c".to_string(),
        status: TaskStatus::Retry,
        payload: Some(json!({"reason": "boom", "retries": 1})),
      },
      OperationSnapshot {
        task_id: "d".to_string(),
        status: TaskStatus::Progress,
        payload: Some(json!("not an object")),
      },
    ];

    assert_eq!(compute_progress(&snapshots, 0, 40).current_interval, 0);
  }

  #[test]
  fn test_reported_progress_is_clamped() {
    let snapshots = [snapshot("a", TaskStatus::Progress, Some(250))];
    assert_eq!(compute_progress(&snapshots, 0, 10).percentage, 100);
    assert_eq!(snapshots[0].credited_intervals(), 10);
  }

  #[test]
  fn test_aborted_operation_keeps_reported_step() {
    let snapshots = [snapshot("a", TaskStatus::Aborted, Some(4))];
    assert_eq!(compute_progress(&snapshots, 0, 10).current_interval, 4);
  }

  #[test]
  fn test_aggregator_survives_retry_restart() {
    let mut aggregator = ProgressAggregator::new();

    let before = aggregator.compute(&[snapshot("a", TaskStatus::Progress, Some(6))], 0, 10);
    let retrying = aggregator.compute(&[snapshot("a", TaskStatus::Retry, None)], 0, 10);
    let restarted = aggregator.compute(&[snapshot("a", TaskStatus::Progress, Some(1))], 0, 10);
    let done = aggregator.compute(&[snapshot("a", TaskStatus::Success, None)], 0, 10);

    assert_eq!(before.percentage, 60);
    assert_eq!(retrying.percentage, 60);
    assert_eq!(restarted.percentage, 60);
    assert_eq!(done.percentage, 100);
  }

  #[test]
  fn test_aggregator_is_monotonic_over_a_run() {
    let mut aggregator = ProgressAggregator::new();
    let mut last = 0;

    for cycle in 0..2u64 {
      let ids = [format!("{cycle}-a"), format!("{cycle}-b")];
      for step in 0..10 {
        let snapshots: Vec<_> = ids
          .iter()
          .map(|id| snapshot(id, TaskStatus::Progress, Some(step)))
          .collect();
        let progress = aggregator.compute(&snapshots, cycle * 20, 40);
        assert!(progress.percentage >= last);
        last = progress.percentage;
      }
      let finished: Vec<_> = ids
        .iter()
        .map(|id| snapshot(id, TaskStatus::Success, None))
        .collect();
      let progress = aggregator.compute(&finished, cycle * 20, 40);
      assert!(progress.percentage >= last);
      last = progress.percentage;
    }

    assert_eq!(last, 100);
  }

  #[test]
  fn test_huge_totals_do_not_overflow() {
    assert_eq!(compute_progress(&[], u64::MAX / 2, u64::MAX).percentage, 49);

    let finished = [snapshot("a", TaskStatus::Success, None)];
    let progress = compute_progress(&finished, u64::MAX - 5, u64::MAX);
    assert_eq!(progress.current_interval, u64::MAX);
    assert_eq!(progress.percentage, 100);

    let mut aggregator = ProgressAggregator::new();
    let progress = aggregator.compute(&finished, u64::MAX - 5, u64::MAX);
    assert_eq!(progress.percentage, 100);
  }

  #[test]
  fn test_zero_total_reads_complete() {
    assert_eq!(compute_progress(&[], 0, 0).percentage, 100);
  }
}
