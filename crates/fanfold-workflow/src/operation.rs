//! The operation unit: one leaf of a cycle's fan-out.
//!
//! Each attempt walks [`TOTAL_INTERVALS`] steps, publishing a PROGRESS state
//! before every step and checking for an abort request in between. Any step
//! failure asks the queue to re-deliver the whole operation after the retry
//! countdown.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use async_trait::async_trait;
use fanfold_queue::{TaskContext, TaskError, TaskHandler, TaskStatus};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};

use crate::context::WorkflowContext;
use crate::error::{WorkflowError, to_args};
use crate::events::ExecutionEvent;
use crate::units::UnitServices;
use crate::workload::WorkError;

/// Progress intervals one operation walks through.
pub const TOTAL_INTERVALS: u32 = 10;

/// Arguments of an operation task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationArgs {
  pub local_index: u32,
  pub ctx: WorkflowContext,
}

/// The payload attached to PROGRESS and ABORTED states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressPayload {
  pub progress: u32,
  pub total: u32,
  pub index: u32,
}

impl ProgressPayload {
  pub fn to_value(&self) -> serde_json::Value {
    json!({
      "progress": self.progress,
      "total": self.total,
      "index": self.index,
    })
  }
}

/// Per-attempt state of one operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRecord {
  pub cycle_index: u32,
  pub local_index: u32,
  pub global_index: u32,
  pub retry_count: u32,
  /// Step the attempt has reached, 0..=TOTAL_INTERVALS.
  pub progress: u32,
  pub state: TaskStatus,
}

impl OperationRecord {
  pub fn new(args: &OperationArgs, retry_count: u32) -> Self {
    Self {
      cycle_index: args.ctx.cycle_index,
      local_index: args.local_index,
      global_index: args.ctx.global_index(args.local_index),
      retry_count,
      progress: 0,
      state: TaskStatus::Started,
    }
  }

  fn payload(&self) -> ProgressPayload {
    ProgressPayload {
      progress: self.progress,
      total: TOTAL_INTERVALS,
      index: self.global_index,
    }
  }
}

/// The value an operation returns. Echoes its arguments for the join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationOutput {
  pub local_index: u32,
  pub ctx: WorkflowContext,
  pub record: OperationRecord,
}

/// Handler for [`fanfold_config::UnitKind::Operation`].
pub struct OperationUnit {
  services: Arc<UnitServices>,
}

impl OperationUnit {
  pub fn new(services: Arc<UnitServices>) -> Self {
    Self { services }
  }

  /// Walk the steps of one attempt. Ends with state ABORTED when an abort is
  /// observed between steps or during the final step.
  async fn run_steps(
    &self,
    record: &mut OperationRecord,
    task: &TaskContext,
  ) -> Result<(), WorkflowError> {
    let time_unit = self.services.config.time_unit();

    for step in 0..TOTAL_INTERVALS {
      record.progress = step;

      if task.is_aborted() {
        record.state = TaskStatus::Aborted;
        task
          .update_state(TaskStatus::Aborted, Some(record.payload().to_value()))
          .await?;
        warn!(
          task_id = %task.task_id(),
          global_index = record.global_index,
          progress = step,
          "operation_aborted"
        );
        return Ok(());
      }

      record.state = TaskStatus::Progress;
      task
        .update_state(TaskStatus::Progress, Some(record.payload().to_value()))
        .await?;

      self.perform_step(record)?;

      tokio::select! {
          _ = tokio::time::sleep(time_unit) => {}
          _ = task.abort_token().cancelled() => {}
      }
    }

    if task.is_aborted() {
      record.state = TaskStatus::Aborted;
      task
        .update_state(TaskStatus::Aborted, Some(record.payload().to_value()))
        .await?;
      warn!(
        task_id = %task.task_id(),
        global_index = record.global_index,
        progress = record.progress,
        "operation_aborted"
      );
      return Ok(());
    }

    record.progress = TOTAL_INTERVALS;
    record.state = TaskStatus::Success;
    Ok(())
  }

  /// Run one step of the workload. A panic counts as a failed step.
  fn perform_step(&self, record: &OperationRecord) -> Result<(), WorkError> {
    let workload = &self.services.workload;
    match panic::catch_unwind(AssertUnwindSafe(|| workload.perform_step(record))) {
      Ok(result) => result,
      Err(cause) => {
        let message = cause
          .downcast_ref::<&str>()
          .map(|m| m.to_string())
          .or_else(|| cause.downcast_ref::<String>().cloned())
          .unwrap_or_else(|| "unknown panic".to_string());
        Err(WorkError::new(format!(
          "step {} panicked: {}",
          record.progress, message
        )))
      }
    }
  }

  fn finished(&self, record: &OperationRecord) {
    self.services.notifier.notify(ExecutionEvent::OperationFinished {
      cycle_index: record.cycle_index,
      local_index: record.local_index,
      global_index: record.global_index,
      state: record.state,
      retries: record.retry_count,
    });
  }
}

#[async_trait]
impl TaskHandler for OperationUnit {
  async fn run(&self, task: &TaskContext) -> Result<serde_json::Value, TaskError> {
    let args: OperationArgs = task.args()?;
    let mut record = OperationRecord::new(&args, task.retries());

    info!(
      task_id = %task.task_id(),
      cycle_index = record.cycle_index,
      local_index = record.local_index,
      global_index = record.global_index,
      retries = record.retry_count,
      "operation_started"
    );

    match self.run_steps(&mut record, task).await {
      Ok(()) => {
        info!(
          task_id = %task.task_id(),
          global_index = record.global_index,
          state = %record.state,
          "operation_finished"
        );
        self.finished(&record);
        let output = OperationOutput {
          local_index: args.local_index,
          ctx: args.ctx,
          record,
        };
        Ok(to_args(&output)?)
      }
      Err(e) => {
        let retry = &self.services.config.retry;
        error!(
          task_id = %task.task_id(),
          global_index = record.global_index,
          progress = record.progress,
          retries = record.retry_count,
          error = %e,
          "operation_step_failed"
        );

        if record.retry_count < retry.max_retries {
          self.services.notifier.notify(ExecutionEvent::OperationRetrying {
            cycle_index: record.cycle_index,
            global_index: record.global_index,
            retries: record.retry_count + 1,
            error: e.to_string(),
          });
        } else {
          record.state = TaskStatus::Failure;
          self.finished(&record);
        }

        Err(TaskError::Retry {
          reason: e.to_string(),
          countdown: self.services.config.retry_countdown(),
          max_retries: retry.max_retries,
        })
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicU32, Ordering};
  use std::time::Duration;

  use fanfold_config::{OrchestratorConfig, UnitKind};
  use fanfold_queue::{InMemoryQueue, TaskQueue, TaskRegistry, TaskRequest};
  use tokio_util::sync::CancellationToken;

  use super::*;
  use crate::workload::Workload;

  struct FailingAt {
    step: u32,
    calls: AtomicU32,
  }

  #[async_trait]
  impl Workload for FailingAt {
    fn perform_step(&self, record: &OperationRecord) -> Result<(), WorkError> {
      self.calls.fetch_add(1, Ordering::SeqCst);
      if record.progress == self.step {
        return Err(WorkError::new("disk on fire"));
      }
      Ok(())
    }
  }

  fn test_config() -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.time_unit_ms = 1;
    config.retry.countdown_units = 5;
    config
  }

  async fn task_for(
    queue: &Arc<dyn TaskQueue>,
    local_index: u32,
    cycle_index: u32,
  ) -> (String, serde_json::Value) {
    let mut ctx = WorkflowContext::new(3, 2).unwrap();
    ctx.cycle_index = cycle_index;
    let args = to_args(&OperationArgs { local_index, ctx }).unwrap();
    let task_id = queue
      .submit(TaskRequest::new(UnitKind::Operation.name(), args.clone()))
      .await
      .unwrap();
    (task_id, args)
  }

  #[tokio::test]
  async fn test_operation_walks_every_step() {
    let queue: Arc<dyn TaskQueue> = Arc::new(InMemoryQueue::new(TaskRegistry::new()));
    let (task_id, args) = task_for(&queue, 1, 2).await;
    let unit = OperationUnit::new(Arc::new(UnitServices::new(test_config())));

    let ctx = TaskContext::new(&task_id, UnitKind::Operation.name(), args, queue.clone());
    let value = unit.run(&ctx).await.unwrap();
    let output: OperationOutput = serde_json::from_value(value).unwrap();

    assert_eq!(output.local_index, 1);
    assert_eq!(output.record.global_index, 2);
    assert_eq!(output.record.progress, TOTAL_INTERVALS);
    assert_eq!(output.record.state, TaskStatus::Success);

    assert_eq!(queue.status(&task_id).await.unwrap(), TaskStatus::Progress);
    let payload = queue.last_status_payload(&task_id).await.unwrap().unwrap();
    assert_eq!(payload["progress"], 9);
    assert_eq!(payload["total"], 10);
    assert_eq!(payload["index"], 2);
  }

  #[tokio::test]
  async fn test_operation_observes_abort_before_first_step() {
    let queue: Arc<dyn TaskQueue> = Arc::new(InMemoryQueue::new(TaskRegistry::new()));
    let (task_id, args) = task_for(&queue, 0, 1).await;
    let unit = OperationUnit::new(Arc::new(UnitServices::new(test_config())));

    let abort = CancellationToken::new();
    abort.cancel();
    let ctx =
      TaskContext::new(&task_id, UnitKind::Operation.name(), args, queue.clone()).with_abort(abort);

    let started = tokio::time::Instant::now();
    let value = unit.run(&ctx).await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(1));

    let output: OperationOutput = serde_json::from_value(value).unwrap();
    assert_eq!(output.record.state, TaskStatus::Aborted);
    assert_eq!(output.record.progress, 0);
    assert_eq!(queue.status(&task_id).await.unwrap(), TaskStatus::Aborted);
  }

  #[tokio::test]
  async fn test_step_failure_requests_retry() {
    let queue: Arc<dyn TaskQueue> = Arc::new(InMemoryQueue::new(TaskRegistry::new()));
    let (task_id, args) = task_for(&queue, 0, 1).await;
    let workload = Arc::new(FailingAt {
      step: 4,
      calls: AtomicU32::new(0),
    });
    let services = UnitServices::new(test_config()).with_workload(workload.clone());
    let unit = OperationUnit::new(Arc::new(services));

    let ctx = TaskContext::new(&task_id, UnitKind::Operation.name(), args, queue.clone());
    let err = unit.run(&ctx).await.unwrap_err();

    match err {
      TaskError::Retry {
        reason,
        countdown,
        max_retries,
      } => {
        assert_eq!(reason, "disk on fire");
        assert_eq!(countdown, Duration::from_millis(5));
        assert_eq!(max_retries, 3);
      }
      other => panic!("expected retry, got {other:?}"),
    }
    assert_eq!(workload.calls.load(Ordering::SeqCst), 5);
    let payload = queue.last_status_payload(&task_id).await.unwrap().unwrap();
    assert_eq!(payload["progress"], 4);
  }

  /// Requests an abort of its own task while doing the last step.
  struct AbortOnLastStep {
    abort: CancellationToken,
  }

  #[async_trait]
  impl Workload for AbortOnLastStep {
    fn perform_step(&self, record: &OperationRecord) -> Result<(), WorkError> {
      if record.progress == TOTAL_INTERVALS - 1 {
        self.abort.cancel();
      }
      Ok(())
    }
  }

  struct Panicking;

  #[async_trait]
  impl Workload for Panicking {
    fn perform_step(&self, _record: &OperationRecord) -> Result<(), WorkError> {
      panic!("sensor array offline");
    }
  }

  #[tokio::test]
  async fn test_abort_during_last_step_is_not_success() {
    let queue: Arc<dyn TaskQueue> = Arc::new(InMemoryQueue::new(TaskRegistry::new()));
    let (task_id, args) = task_for(&queue, 0, 1).await;
    let abort = CancellationToken::new();
    let services = UnitServices::new(test_config()).with_workload(Arc::new(AbortOnLastStep {
      abort: abort.clone(),
    }));
    let unit = OperationUnit::new(Arc::new(services));

    let ctx =
      TaskContext::new(&task_id, UnitKind::Operation.name(), args, queue.clone()).with_abort(abort);
    let value = unit.run(&ctx).await.unwrap();
    let output: OperationOutput = serde_json::from_value(value).unwrap();

    assert_eq!(output.record.state, TaskStatus::Aborted);
    assert_eq!(output.record.progress, TOTAL_INTERVALS - 1);
    assert_eq!(queue.status(&task_id).await.unwrap(), TaskStatus::Aborted);
  }

  #[tokio::test]
  async fn test_panicking_step_requests_retry() {
    let queue: Arc<dyn TaskQueue> = Arc::new(InMemoryQueue::new(TaskRegistry::new()));
    let (task_id, args) = task_for(&queue, 0, 1).await;
    let services = UnitServices::new(test_config()).with_workload(Arc::new(Panicking));
    let unit = OperationUnit::new(Arc::new(services));

    let ctx = TaskContext::new(&task_id, UnitKind::Operation.name(), args, queue);
    match unit.run(&ctx).await {
      Err(TaskError::Retry { reason, .. }) => {
        assert_eq!(reason, "step 0 panicked: sensor array offline")
      }
      other => panic!("expected retry, got {other:?}"),
    }
  }

  #[tokio::test]
  async fn test_malformed_args_are_rejected() {
    let queue: Arc<dyn TaskQueue> = Arc::new(InMemoryQueue::new(TaskRegistry::new()));
    let unit = OperationUnit::new(Arc::new(UnitServices::new(test_config())));
    let ctx = TaskContext::new(
      "op-1",
      UnitKind::Operation.name(),
      json!({"local_index": "zero"}),
      queue,
    );

    assert!(matches!(
      unit.run(&ctx).await,
      Err(TaskError::InvalidArgs { .. })
    ));
  }
}
