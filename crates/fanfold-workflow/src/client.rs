//! Orchestration client: submit a workflow, watch it, cancel it.

use std::sync::Arc;

use fanfold_config::{OrchestratorConfig, UnitKind};
use fanfold_queue::{QueueError, TaskHandle, TaskQueue, TaskRequest, TaskStatus};
use futures::future::try_join_all;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument, warn};

use crate::cancel::{CancelReport, CancellationController};
use crate::context::WorkflowContext;
use crate::cycle::{Continuation, CreateCycleArgs, CycleResult, cycle_task_id};
use crate::error::{WorkflowError, from_result, to_args};
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};
use crate::progress::{OperationSnapshot, Progress, ProgressAggregator};

/// How a monitored workflow ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MonitorOutcome {
  /// Every cycle ran and cleanup finished.
  Completed,
  /// The chain was cut short by an abort or purge.
  Cancelled,
}

/// Summary returned by [`Orchestrator::monitor`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorReport {
  pub outcome: MonitorOutcome,
  /// Cycles whose operations were dispatched.
  pub cycles: u32,
  /// Last percentage reported.
  pub percentage: u32,
}

/// Entry point for running workflows on a [`TaskQueue`].
///
/// Generic over the notifier so progress can be observed without a channel
/// when none is needed.
pub struct Orchestrator<N: ExecutionNotifier = NoopNotifier> {
  queue: Arc<dyn TaskQueue>,
  config: OrchestratorConfig,
  notifier: N,
}

impl Orchestrator<NoopNotifier> {
  pub fn new(queue: Arc<dyn TaskQueue>, config: OrchestratorConfig) -> Self {
    Self::with_notifier(queue, config, NoopNotifier)
  }
}

impl<N: ExecutionNotifier> Orchestrator<N> {
  pub fn with_notifier(queue: Arc<dyn TaskQueue>, config: OrchestratorConfig, notifier: N) -> Self {
    Self {
      queue,
      config,
      notifier,
    }
  }

  pub fn queue(&self) -> &Arc<dyn TaskQueue> {
    &self.queue
  }

  /// Validate the system and dispatch the first cycle.
  ///
  /// Rejects zero counts before anything is enqueued. Runs the
  /// `validate_system` unit and waits for it; a failed validation is
  /// returned and no cycle is started. The returned handle is the first
  /// `create_cycle` task, with an id of the form `workflow_0_<uuid>`.
  #[instrument(name = "workflow_submit", skip(self))]
  pub async fn submit(
    &self,
    cycle_count: u32,
    concurrent_count: u32,
  ) -> Result<TaskHandle, WorkflowError> {
    let ctx = WorkflowContext::new(cycle_count, concurrent_count)?;

    let validation = TaskHandle::submit(
      &self.queue,
      TaskRequest::new(UnitKind::ValidateSystem.name(), json!({})),
    )
    .await?;
    validation
      .await_result()
      .await
      .map_err(|source| WorkflowError::Preflight { source })?;

    let request = TaskRequest::new(UnitKind::CreateCycle.name(), to_args(&CreateCycleArgs { ctx })?)
      .with_task_id(cycle_task_id(0));
    let handle = TaskHandle::submit(&self.queue, request).await?;

    info!(task_id = %handle.id(), "workflow_submitted");
    Ok(handle)
  }

  /// Follow the chain from `workflow` to its end, reporting progress.
  ///
  /// Polls the current cycle's operations every poll interval until that
  /// cycle's join settles, then moves on to whatever the join dispatched.
  /// Reported percentages never decrease. A completed workflow always ends
  /// on 100; a cancelled one stops at the last value reached.
  #[instrument(name = "workflow_monitor", skip(self, workflow), fields(task_id = %workflow.id()))]
  pub async fn monitor(
    &self,
    workflow: &TaskHandle,
    cycle_count: u32,
    concurrent_count: u32,
  ) -> Result<MonitorReport, WorkflowError> {
    let ctx = WorkflowContext::new(cycle_count, concurrent_count)?;
    let total = ctx.total_intervals();

    let mut aggregator = ProgressAggregator::new();
    let mut last: Option<Progress> = None;
    let mut prior = 0u64;
    let mut cycles = 0u32;
    let mut next_build = Some(workflow.id().to_string());
    let mut outcome = MonitorOutcome::Cancelled;
    let mut cancelled = false;

    while let Some(build_id) = next_build.take() {
      let Some(cycle) = self.resolve_cycle(&build_id).await? else {
        break;
      };
      cycles += 1;

      loop {
        let snapshots = self.snapshot(&cycle.operations).await?;
        self.report(aggregator.compute(&snapshots, prior, total), &mut last);
        if self.queue.status(&cycle.continuation).await?.is_terminal() {
          break;
        }
        tokio::time::sleep(self.config.poll_interval()).await;
      }

      let continuation: Continuation = match self.queue.await_result(&cycle.continuation).await {
        Ok(value) => from_result(&cycle.continuation, value)?,
        Err(QueueError::TaskAborted { .. }) => break,
        Err(e) => return Err(e.into()),
      };
      if self.queue.status(&cycle.continuation).await? == TaskStatus::Aborted {
        info!(cycle_index = cycle.context.cycle_index, "workflow_cancelled");
        cancelled = true;
      } else {
        prior = prior.saturating_add(cycle.context.cycle_intervals()).min(total);
      }

      match continuation {
        Continuation::NextCycle { task_id } => next_build = Some(task_id),
        Continuation::Cleanup { task_id } => match self.queue.await_result(&task_id).await {
          Ok(_) if !cancelled => {
            self.report(aggregator.compute(&[], prior, total), &mut last);
            outcome = MonitorOutcome::Completed;
          }
          Ok(_) | Err(QueueError::TaskAborted { .. }) => {
            info!(task_id = %task_id, "cleanup_after_cancel")
          }
          Err(e) => return Err(e.into()),
        },
      }
    }

    let report = MonitorReport {
      outcome,
      cycles,
      percentage: last.map(|p| p.percentage).unwrap_or(0),
    };
    info!(outcome = ?report.outcome, cycles, percentage = report.percentage, "monitor_finished");
    Ok(report)
  }

  /// Abort every running, reserved and scheduled task, then purge the backlog.
  pub async fn cancel_all(&self) -> Result<CancelReport, WorkflowError> {
    CancellationController::new(self.queue.clone()).cancel_all().await
  }

  /// Wait for a `create_cycle` task. `None` when it was aborted before it
  /// dispatched a cycle.
  async fn resolve_cycle(&self, build_id: &str) -> Result<Option<CycleResult>, WorkflowError> {
    match self.queue.await_result(build_id).await {
      Ok(value) => {
        if let Ok(Continuation::Cleanup { task_id }) = serde_json::from_value(value.clone()) {
          warn!(task_id = %build_id, cleanup = %task_id, "cycle_build_cancelled");
          return Ok(None);
        }
        from_result(build_id, value).map(Some)
      }
      Err(QueueError::TaskAborted { .. }) => {
        warn!(task_id = %build_id, "cycle_build_cancelled");
        Ok(None)
      }
      Err(e) => Err(e.into()),
    }
  }

  async fn snapshot(&self, operations: &[String]) -> Result<Vec<OperationSnapshot>, QueueError> {
    try_join_all(
      operations
        .iter()
        .map(|id| OperationSnapshot::capture(self.queue.as_ref(), id)),
    )
    .await
  }

  /// Emit `progress` when it moves past the last reported value.
  fn report(&self, progress: Progress, last: &mut Option<Progress>) {
    if last.is_some_and(|l| progress.percentage <= l.percentage) {
      return;
    }
    info!(
      percentage = progress.percentage,
      current_interval = progress.current_interval,
      "workflow_progress"
    );
    self.notifier.notify(ExecutionEvent::Progress {
      percentage: progress.percentage,
      current_interval: progress.current_interval,
    });
    *last = Some(progress);
  }
}
