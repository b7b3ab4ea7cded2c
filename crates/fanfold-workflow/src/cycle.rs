//! Building one cycle of the workflow and joining it.
//!
//! A cycle is a group of N operation tasks followed by a join. The join
//! waits for every operation to settle, logs a summary, and then either
//! dispatches the next cycle or hands off to cleanup. Recursion happens by
//! task submission: each join enqueues the next `create_cycle`, so no call
//! stack grows with the cycle count.

use std::sync::Arc;

use async_trait::async_trait;
use fanfold_config::UnitKind;
use fanfold_queue::{TaskContext, TaskError, TaskHandler, TaskQueue, TaskRequest, TaskStatus};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::context::WorkflowContext;
use crate::error::{WorkflowError, to_args};
use crate::events::ExecutionEvent;
use crate::operation::OperationArgs;
use crate::units::{CleanupArgs, UnitServices};

/// Arguments of a `create_cycle` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateCycleArgs {
  pub ctx: WorkflowContext,
}

/// Arguments of a `cycle_join` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinArgs {
  pub ctx: WorkflowContext,
  pub operations: Vec<String>,
}

/// What a `create_cycle` task returns: the dispatched group and its join.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleResult {
  pub context: WorkflowContext,
  /// Operation task ids, ordered by local index.
  pub operations: Vec<String>,
  /// Task id of the join that runs once every operation has settled.
  pub continuation: String,
}

/// What a join returns: where the chain goes next.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Continuation {
  /// Another cycle was dispatched as `create_cycle` task `task_id`.
  NextCycle { task_id: String },
  /// The workflow is over; cleanup runs as task `task_id`.
  Cleanup { task_id: String },
}

/// Task id of the `create_cycle` task that follows `completed_cycles` cycles.
pub fn cycle_task_id(completed_cycles: u32) -> String {
  format!("workflow_{}_{}", completed_cycles, Uuid::new_v4())
}

/// Dispatch one cycle: N operations and the join that waits on them.
///
/// Advances `ctx.cycle_index` before dispatch. The operations are submitted
/// first and the join last, so the join's arguments carry every id.
#[instrument(name = "build_cycle", skip_all, fields(cycle_count = ctx.cycle_count, concurrent_count = ctx.concurrent_count))]
pub async fn build_cycle(
  queue: &Arc<dyn TaskQueue>,
  mut ctx: WorkflowContext,
) -> Result<CycleResult, WorkflowError> {
  ctx.validate()?;
  let cycle_index = ctx.advance();

  info!(cycle_index, "creating_workflow_cycle");

  let mut operations = Vec::with_capacity(ctx.concurrent_count as usize);
  for local_index in 0..ctx.concurrent_count {
    let args = to_args(&OperationArgs { local_index, ctx })?;
    let task_id = queue
      .submit(TaskRequest::new(UnitKind::Operation.name(), args))
      .await?;
    operations.push(task_id);
  }

  let join_args = to_args(&JoinArgs {
    ctx,
    operations: operations.clone(),
  })?;
  let continuation = queue
    .submit(TaskRequest::new(UnitKind::CycleJoin.name(), join_args))
    .await?;

  info!(
    cycle_index,
    operations = operations.len(),
    continuation = %continuation,
    "workflow_cycle_dispatched"
  );

  Ok(CycleResult {
    context: ctx,
    operations,
    continuation,
  })
}

/// Submit the cleanup task that ends the chain.
async fn dispatch_cleanup(
  queue: &Arc<dyn TaskQueue>,
  ctx: WorkflowContext,
) -> Result<Continuation, WorkflowError> {
  let request = TaskRequest::new(UnitKind::Cleanup.name(), to_args(&CleanupArgs { ctx })?);
  let task_id = queue.submit(request).await?;
  info!(cycle_index = ctx.cycle_index, cleanup = %task_id, "cleanup_dispatched");
  Ok(Continuation::Cleanup { task_id })
}

/// Handler for [`UnitKind::CreateCycle`].
///
/// Returns a [`CycleResult`], or a [`Continuation::Cleanup`] when the task
/// was aborted before the cycle was dispatched.
pub struct CycleBuilder {
  services: Arc<UnitServices>,
}

impl CycleBuilder {
  pub fn new(services: Arc<UnitServices>) -> Self {
    Self { services }
  }
}

#[async_trait]
impl TaskHandler for CycleBuilder {
  async fn run(&self, task: &TaskContext) -> Result<serde_json::Value, TaskError> {
    let args: CreateCycleArgs = task.args()?;
    if task.is_aborted() {
      warn!(
        task_id = %task.task_id(),
        cycle_index = args.ctx.cycle_index,
        "cycle build aborted, skipping fan-out"
      );
      let continuation = dispatch_cleanup(task.queue(), args.ctx).await?;
      return Ok(to_args(&continuation)?);
    }

    let cycle = build_cycle(task.queue(), args.ctx).await?;

    self.services.notifier.notify(ExecutionEvent::CycleBuilt {
      cycle_index: cycle.context.cycle_index,
      operation_ids: cycle.operations.clone(),
      continuation_id: cycle.continuation.clone(),
    });

    Ok(to_args(&cycle)?)
  }
}

/// Handler for [`UnitKind::CycleJoin`]: the barrier, the summary and the
/// recursion decision.
pub struct CycleJoin {
  services: Arc<UnitServices>,
}

impl CycleJoin {
  pub fn new(services: Arc<UnitServices>) -> Self {
    Self { services }
  }

  /// Wait for every operation and log one line per result.
  async fn summarize(
    &self,
    queue: &Arc<dyn TaskQueue>,
    args: &JoinArgs,
  ) -> Result<Vec<TaskStatus>, WorkflowError> {
    let results = join_all(args.operations.iter().map(|id| queue.await_result(id))).await;

    let mut statuses = Vec::with_capacity(results.len());
    for (position, (task_id, result)) in args.operations.iter().zip(results).enumerate() {
      let index = position + 1;
      match result {
        Ok(value) => info!(index, task_id = %task_id, result = %value, "operation_result"),
        Err(e) => warn!(index, task_id = %task_id, error = %e, "operation_result"),
      }
      statuses.push(queue.status(task_id).await?);
    }

    Ok(statuses)
  }

  async fn dispatch_next(
    &self,
    queue: &Arc<dyn TaskQueue>,
    ctx: WorkflowContext,
    aborted: bool,
  ) -> Result<Continuation, WorkflowError> {
    if aborted {
      info!(
        cycle_index = ctx.cycle_index,
        "workflow is cancelled or aborted, stopping recursion"
      );
    }

    if !aborted && ctx.has_next_cycle() {
      let request = TaskRequest::new(UnitKind::CreateCycle.name(), to_args(&CreateCycleArgs { ctx })?)
        .with_task_id(cycle_task_id(ctx.cycle_index));
      let task_id = queue.submit(request).await?;
      info!(cycle_index = ctx.cycle_index, next = %task_id, "next_cycle_dispatched");
      return Ok(Continuation::NextCycle { task_id });
    }

    dispatch_cleanup(queue, ctx).await
  }
}

#[async_trait]
impl TaskHandler for CycleJoin {
  async fn run(&self, task: &TaskContext) -> Result<serde_json::Value, TaskError> {
    let args: JoinArgs = task.args()?;
    let queue = task.queue();

    let statuses = self.summarize(queue, &args).await?;
    info!(
      cycle_index = args.ctx.cycle_index,
      operations = statuses.len(),
      failed = statuses.iter().filter(|s| **s == TaskStatus::Failure).count(),
      aborted = statuses.iter().filter(|s| **s == TaskStatus::Aborted).count(),
      "cycle_summary"
    );
    self.services.notifier.notify(ExecutionEvent::CycleSummarized {
      cycle_index: args.ctx.cycle_index,
      statuses,
    });

    if !task.is_aborted() {
      tokio::select! {
          _ = tokio::time::sleep(self.services.config.time_unit()) => {}
          _ = task.abort_token().cancelled() => {}
      }
    }

    let continuation = self.dispatch_next(queue, args.ctx, task.is_aborted()).await?;
    Ok(to_args(&continuation)?)
  }
}
