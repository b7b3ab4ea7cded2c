//! Best-effort cancellation of everything a queue knows about.

use std::collections::BTreeSet;
use std::sync::Arc;

use fanfold_queue::{Inventory, QueueError, TaskQueue};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::WorkflowError;

/// A task found on a worker during discovery.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CancellationTarget {
  pub worker_id: String,
  pub task_id: String,
}

/// Outcome of a [`CancellationController::cancel_all`] sweep.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelReport {
  /// Every task that was asked to abort.
  pub targets: Vec<CancellationTarget>,
  pub aborted: usize,
  /// Abort requests that returned an error. Logged and skipped.
  pub failed: usize,
  /// Tasks dropped from the backlog by the final purge.
  pub purged: usize,
}

/// Aborts running, reserved and scheduled tasks, then purges the backlog.
pub struct CancellationController {
  queue: Arc<dyn TaskQueue>,
}

impl CancellationController {
  pub fn new(queue: Arc<dyn TaskQueue>) -> Self {
    Self { queue }
  }

  /// Union of the active, reserved and scheduled inventories.
  ///
  /// An inventory that cannot be read is logged and treated as empty.
  pub async fn discover(&self) -> Vec<CancellationTarget> {
    let inventories: [(&str, Result<Inventory, QueueError>); 3] = [
      ("active", self.queue.inspect_active().await),
      ("reserved", self.queue.inspect_reserved().await),
      ("scheduled", self.queue.inspect_scheduled().await),
    ];

    let mut targets = BTreeSet::new();
    for (kind, inventory) in inventories {
      match inventory {
        Ok(inventory) => {
          for (worker_id, task_ids) in inventory {
            for task_id in task_ids {
              targets.insert(CancellationTarget {
                worker_id: worker_id.clone(),
                task_id,
              });
            }
          }
        }
        Err(e) => warn!(inventory = kind, error = %e, "inventory_unavailable"),
      }
    }

    targets.into_iter().collect()
  }

  /// Abort every discovered task, then purge the backlog exactly once.
  ///
  /// Individual abort failures never stop the sweep. Only a failed purge is
  /// reported as an error.
  pub async fn cancel_all(&self) -> Result<CancelReport, WorkflowError> {
    let targets = self.discover().await;
    let mut report = CancelReport::default();

    for target in &targets {
      info!(worker_id = %target.worker_id, task_id = %target.task_id, "canceling_task");
      match self.queue.abort(&target.task_id).await {
        Ok(()) => report.aborted += 1,
        Err(e) => {
          error!(task_id = %target.task_id, error = %e, "task_abort_failed");
          report.failed += 1;
        }
      }
    }

    report.purged = self.queue.purge_backlog().await?;
    report.targets = targets;

    info!(
      aborted = report.aborted,
      failed = report.failed,
      purged = report.purged,
      "cancel_all_completed"
    );
    Ok(report)
  }
}
