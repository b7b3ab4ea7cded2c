//! In-process task queue.
//!
//! [`InMemoryQueue`] plays three roles at once: the broker (one FIFO backlog
//! per routed queue), the result backend (status, last payload and result per
//! task) and the worker pools that execute registered handlers. It gives the
//! orchestrator the same primitives a distributed queue would, inside a
//! single tokio runtime.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use fanfold_config::{QueueName, WorkerConfig, route_by_name};
use serde_json::json;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::error::QueueError;
use crate::handle::TaskRequest;
use crate::handler::{TaskContext, TaskError, TaskRegistry};
use crate::status::TaskStatus;
use crate::{Inventory, TaskQueue};

/// Where a task currently lives.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Placement {
  Backlog,
  Reserved { worker_id: String },
  Active { worker_id: String },
  Scheduled { worker_id: String },
  Done,
}

impl Placement {
  fn reserved_by(&self) -> Option<&str> {
    match self {
      Placement::Reserved { worker_id } => Some(worker_id.as_str()),
      _ => None,
    }
  }

  fn active_on(&self) -> Option<&str> {
    match self {
      Placement::Active { worker_id } => Some(worker_id.as_str()),
      _ => None,
    }
  }

  fn scheduled_on(&self) -> Option<&str> {
    match self {
      Placement::Scheduled { worker_id } => Some(worker_id.as_str()),
      _ => None,
    }
  }
}

struct TaskRecord {
  unit_name: String,
  queue: QueueName,
  args: serde_json::Value,
  status: TaskStatus,
  payload: Option<serde_json::Value>,
  result: Option<serde_json::Value>,
  error: Option<String>,
  retries: u32,
  placement: Placement,
  abort: CancellationToken,
  finished: watch::Sender<bool>,
}

impl TaskRecord {
  fn complete(&mut self, status: TaskStatus) {
    self.status = status;
    self.placement = Placement::Done;
    self.finished.send_replace(true);
  }
}

#[derive(Default)]
struct BrokerState {
  backlogs: HashMap<QueueName, VecDeque<String>>,
  records: HashMap<String, TaskRecord>,
  workers: Vec<String>,
}

struct Inner {
  registry: TaskRegistry,
  state: Mutex<BrokerState>,
  wakeups: HashMap<QueueName, Notify>,
}

/// Broker, result backend and worker pools in one process.
#[derive(Clone)]
pub struct InMemoryQueue {
  inner: Arc<Inner>,
}

impl InMemoryQueue {
  /// Create a queue that runs the handlers in `registry`.
  ///
  /// No work is executed until [`InMemoryQueue::start`] spawns the workers.
  pub fn new(registry: TaskRegistry) -> Self {
    let wakeups = QueueName::ALL
      .into_iter()
      .map(|queue| (queue, Notify::new()))
      .collect();

    Self {
      inner: Arc::new(Inner {
        registry,
        state: Mutex::new(BrokerState::default()),
        wakeups,
      }),
    }
  }

  /// Spawn the worker pools. Workers stop when `cancel` is triggered.
  pub fn start(&self, workers: &WorkerConfig, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    for queue in QueueName::ALL {
      for n in 1..=workers.concurrency(queue) {
        let worker_id = format!("{}@{}", queue, n);
        match self.lock() {
          Ok(mut state) => state.workers.push(worker_id.clone()),
          Err(e) => {
            error!(worker_id = %worker_id, error = %e, "worker_registration_failed");
            continue;
          }
        }

        let this = self.clone();
        let cancel = cancel.clone();
        handles.push(tokio::spawn(async move {
          this.worker_loop(queue, worker_id, cancel).await
        }));
      }
    }

    handles
  }

  fn lock(&self) -> Result<MutexGuard<'_, BrokerState>, QueueError> {
    self.inner.state.lock().map_err(|e| QueueError::Backend {
      message: format!("broker state lock poisoned: {}", e),
    })
  }

  fn wake(&self, queue: QueueName) {
    if let Some(notify) = self.inner.wakeups.get(&queue) {
      notify.notify_one();
    }
  }

  async fn worker_loop(self, queue: QueueName, worker_id: String, cancel: CancellationToken) {
    info!(worker_id = %worker_id, queue = %queue, "worker_started");

    loop {
      let claimed = tokio::select! {
          _ = cancel.cancelled() => break,
          claimed = self.claim(queue, &worker_id) => claimed,
      };

      match claimed {
        Ok(task_id) => self.execute(&worker_id, &task_id, &cancel).await,
        Err(e) => {
          error!(worker_id = %worker_id, error = %e, "worker_claim_failed");
          break;
        }
      }
    }

    info!(worker_id = %worker_id, "worker_stopped");
  }

  /// Wait for the next message on `queue` and reserve it for `worker_id`.
  async fn claim(&self, queue: QueueName, worker_id: &str) -> Result<String, QueueError> {
    let notify = self
      .inner
      .wakeups
      .get(&queue)
      .ok_or_else(|| QueueError::Backend {
        message: format!("no wakeup channel for queue '{}'", queue),
      })?;

    loop {
      if let Some(task_id) = self.try_claim(queue, worker_id)? {
        return Ok(task_id);
      }
      notify.notified().await;
    }
  }

  fn try_claim(&self, queue: QueueName, worker_id: &str) -> Result<Option<String>, QueueError> {
    let mut guard = self.lock()?;
    let state = &mut *guard;

    let Some(task_id) = state.backlogs.get_mut(&queue).and_then(|b| b.pop_front()) else {
      return Ok(None);
    };

    if let Some(record) = state.records.get_mut(&task_id) {
      record.placement = Placement::Reserved {
        worker_id: worker_id.to_string(),
      };
      record.status = TaskStatus::Received;
      record.payload = None;
    }

    Ok(Some(task_id))
  }

  #[instrument(
    name = "task_execute",
    skip_all,
    fields(worker_id = %worker_id, task_id = %task_id)
  )]
  async fn execute(&self, worker_id: &str, task_id: &str, cancel: &CancellationToken) {
    let ctx = match self.begin(worker_id, task_id) {
      Ok(ctx) => ctx,
      Err(e) => {
        error!(task_id = %task_id, error = %e, "task_begin_failed");
        return;
      }
    };

    let outcome = match self.inner.registry.get(&ctx.unit_name) {
      Some(handler) => {
        // A panic surfaces here as a JoinError and fails the task.
        let task = ctx.clone();
        match tokio::spawn(async move { handler.run(&task).await }).await {
          Ok(outcome) => outcome,
          Err(e) => {
            error!(task_id = %task_id, error = %e, "task_handler_panicked");
            Err(TaskError::failed(format!("task handler panicked: {}", e)))
          }
        }
      }
      None => Err(TaskError::failed(format!(
        "unregistered task '{}'",
        ctx.unit_name
      ))),
    };

    if let Err(e) = self.finish(worker_id, &ctx, outcome, cancel) {
      error!(task_id = %task_id, error = %e, "task_finish_failed");
    }
  }

  fn begin(&self, worker_id: &str, task_id: &str) -> Result<TaskContext, QueueError> {
    let mut state = self.lock()?;
    let record = state
      .records
      .get_mut(task_id)
      .ok_or_else(|| QueueError::TaskNotFound {
        task_id: task_id.to_string(),
      })?;

    record.placement = Placement::Active {
      worker_id: worker_id.to_string(),
    };
    record.status = TaskStatus::Started;

    info!(
      task_id = %task_id,
      unit = %record.unit_name,
      retries = record.retries,
      "task_started"
    );

    Ok(TaskContext {
      task_id: task_id.to_string(),
      unit_name: record.unit_name.clone(),
      worker_id: worker_id.to_string(),
      args: record.args.clone(),
      retries: record.retries,
      abort: record.abort.clone(),
      queue: Arc::new(self.clone()),
    })
  }

  fn finish(
    &self,
    worker_id: &str,
    ctx: &TaskContext,
    outcome: Result<serde_json::Value, TaskError>,
    cancel: &CancellationToken,
  ) -> Result<(), QueueError> {
    let mut state = self.lock()?;
    let record = state
      .records
      .get_mut(&ctx.task_id)
      .ok_or_else(|| QueueError::TaskNotFound {
        task_id: ctx.task_id.clone(),
      })?;

    match outcome {
      Ok(value) => {
        record.result = Some(value);
        if record.abort.is_cancelled() {
          record.complete(TaskStatus::Aborted);
          info!(task_id = %ctx.task_id, unit = %record.unit_name, "task_aborted");
        } else {
          record.complete(TaskStatus::Success);
          info!(task_id = %ctx.task_id, unit = %record.unit_name, "task_succeeded");
        }
      }
      Err(TaskError::Retry {
        reason,
        countdown,
        max_retries,
      }) if record.retries < max_retries => {
        record.retries += 1;
        record.status = TaskStatus::Retry;
        record.payload = Some(json!({
          "reason": reason,
          "retries": record.retries,
          "countdown_ms": countdown.as_millis() as u64,
        }));
        record.placement = Placement::Scheduled {
          worker_id: worker_id.to_string(),
        };
        warn!(
          task_id = %ctx.task_id,
          unit = %record.unit_name,
          retries = record.retries,
          max_retries,
          reason = %reason,
          "task_retry"
        );
        drop(state);
        self.schedule_redelivery(ctx.task_id.clone(), countdown, cancel.clone());
      }
      Err(e) => {
        let message = match e {
          TaskError::Retry {
            reason,
            max_retries,
            ..
          } => format!("max retries ({}) exceeded: {}", max_retries, reason),
          other => other.to_string(),
        };
        error!(
          task_id = %ctx.task_id,
          unit = %record.unit_name,
          error = %message,
          "task_failed"
        );
        record.error = Some(message);
        record.complete(TaskStatus::Failure);
      }
    }

    Ok(())
  }

  /// Put a retried task back on its backlog once the countdown elapses.
  fn schedule_redelivery(&self, task_id: String, countdown: Duration, cancel: CancellationToken) {
    let this = self.clone();
    tokio::spawn(async move {
      tokio::select! {
          _ = cancel.cancelled() => return,
          _ = tokio::time::sleep(countdown) => {}
      }
      if let Err(e) = this.redeliver(&task_id) {
        error!(task_id = %task_id, error = %e, "task_redelivery_failed");
      }
    });
  }

  fn redeliver(&self, task_id: &str) -> Result<(), QueueError> {
    let queue = {
      let mut guard = self.lock()?;
      let state = &mut *guard;
      let record = state
        .records
        .get_mut(task_id)
        .ok_or_else(|| QueueError::TaskNotFound {
          task_id: task_id.to_string(),
        })?;

      if record.placement.scheduled_on().is_none() {
        return Ok(());
      }
      record.placement = Placement::Backlog;
      state
        .backlogs
        .entry(record.queue)
        .or_default()
        .push_back(task_id.to_string());
      record.queue
    };

    self.wake(queue);
    Ok(())
  }

  fn inventory(&self, select: fn(&Placement) -> Option<&str>) -> Result<Inventory, QueueError> {
    let state = self.lock()?;

    let mut inventory: Inventory = state
      .workers
      .iter()
      .map(|worker_id| (worker_id.clone(), Vec::new()))
      .collect();

    for (task_id, record) in &state.records {
      if let Some(worker_id) = select(&record.placement) {
        inventory
          .entry(worker_id.to_string())
          .or_default()
          .push(task_id.clone());
      }
    }

    for task_ids in inventory.values_mut() {
      task_ids.sort();
    }

    Ok(inventory)
  }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
  async fn submit(&self, request: TaskRequest) -> Result<String, QueueError> {
    let task_id = request
      .task_id
      .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
    let queue = route_by_name(&request.unit_name);

    {
      let mut guard = self.lock()?;
      let state = &mut *guard;

      if state.records.contains_key(&task_id) {
        return Err(QueueError::DuplicateTask { task_id });
      }

      let (finished, _) = watch::channel(false);
      state.records.insert(
        task_id.clone(),
        TaskRecord {
          unit_name: request.unit_name.clone(),
          queue,
          args: request.args,
          status: TaskStatus::Pending,
          payload: None,
          result: None,
          error: None,
          retries: 0,
          placement: Placement::Backlog,
          abort: CancellationToken::new(),
          finished,
        },
      );
      state
        .backlogs
        .entry(queue)
        .or_default()
        .push_back(task_id.clone());
    }

    info!(
      task_id = %task_id,
      unit = %request.unit_name,
      queue = %queue,
      "task_submitted"
    );
    self.wake(queue);

    Ok(task_id)
  }

  async fn status(&self, task_id: &str) -> Result<TaskStatus, QueueError> {
    let state = self.lock()?;
    Ok(
      state
        .records
        .get(task_id)
        .map(|record| record.status)
        .unwrap_or(TaskStatus::Pending),
    )
  }

  async fn last_status_payload(
    &self,
    task_id: &str,
  ) -> Result<Option<serde_json::Value>, QueueError> {
    let state = self.lock()?;
    Ok(
      state
        .records
        .get(task_id)
        .and_then(|record| record.payload.clone()),
    )
  }

  async fn await_result(&self, task_id: &str) -> Result<serde_json::Value, QueueError> {
    let mut finished = {
      let state = self.lock()?;
      state
        .records
        .get(task_id)
        .ok_or_else(|| QueueError::TaskNotFound {
          task_id: task_id.to_string(),
        })?
        .finished
        .subscribe()
    };

    finished
      .wait_for(|done| *done)
      .await
      .map(|_| ())
      .map_err(|_| QueueError::Backend {
        message: format!("result channel for task '{}' closed", task_id),
      })?;

    let state = self.lock()?;
    let record = state
      .records
      .get(task_id)
      .ok_or_else(|| QueueError::TaskNotFound {
        task_id: task_id.to_string(),
      })?;

    match (record.status, &record.result) {
      (TaskStatus::Success | TaskStatus::Aborted, Some(value)) => Ok(value.clone()),
      (TaskStatus::Aborted, None) => Err(QueueError::TaskAborted {
        task_id: task_id.to_string(),
      }),
      (TaskStatus::Failure, _) => Err(QueueError::TaskFailed {
        task_id: task_id.to_string(),
        message: record.error.clone().unwrap_or_default(),
      }),
      (status, _) => Err(QueueError::Backend {
        message: format!("task '{}' finished in state {}", task_id, status),
      }),
    }
  }

  async fn update_state(
    &self,
    task_id: &str,
    status: TaskStatus,
    payload: Option<serde_json::Value>,
  ) -> Result<(), QueueError> {
    let mut state = self.lock()?;
    let record = state
      .records
      .get_mut(task_id)
      .ok_or_else(|| QueueError::TaskNotFound {
        task_id: task_id.to_string(),
      })?;

    if record.placement == Placement::Done {
      return Err(QueueError::AlreadyFinished {
        task_id: task_id.to_string(),
      });
    }

    record.status = status;
    record.payload = payload;
    Ok(())
  }

  async fn inspect_active(&self) -> Result<Inventory, QueueError> {
    self.inventory(Placement::active_on)
  }

  async fn inspect_reserved(&self) -> Result<Inventory, QueueError> {
    self.inventory(Placement::reserved_by)
  }

  async fn inspect_scheduled(&self) -> Result<Inventory, QueueError> {
    self.inventory(Placement::scheduled_on)
  }

  async fn abort(&self, task_id: &str) -> Result<(), QueueError> {
    let woken = {
      let mut guard = self.lock()?;
      let state = &mut *guard;
      let record = state
        .records
        .get_mut(task_id)
        .ok_or_else(|| QueueError::TaskNotFound {
          task_id: task_id.to_string(),
        })?;

      if record.placement == Placement::Done {
        return Err(QueueError::AlreadyFinished {
          task_id: task_id.to_string(),
        });
      }

      record.abort.cancel();
      info!(task_id = %task_id, unit = %record.unit_name, "task_abort_requested");

      // A retry waiting out its countdown is re-queued now so it can observe the abort.
      if record.placement.scheduled_on().is_some() {
        record.placement = Placement::Backlog;
        state
          .backlogs
          .entry(record.queue)
          .or_default()
          .push_back(task_id.to_string());
        Some(record.queue)
      } else {
        None
      }
    };

    if let Some(queue) = woken {
      self.wake(queue);
    }
    Ok(())
  }

  async fn purge_backlog(&self) -> Result<usize, QueueError> {
    let mut guard = self.lock()?;
    let state = &mut *guard;
    let mut purged = 0;

    for backlog in state.backlogs.values_mut() {
      for task_id in backlog.drain(..) {
        // Purged messages never run; finalize them so nothing waits forever.
        if let Some(record) = state.records.get_mut(&task_id) {
          record.abort.cancel();
          record.error = Some("purged from backlog".to_string());
          record.complete(TaskStatus::Aborted);
          purged += 1;
        }
      }
    }

    info!(purged, "backlog_purged");
    Ok(purged)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::handler::TaskHandler;
  use std::sync::atomic::{AtomicU32, Ordering};

  struct Echo;

  #[async_trait]
  impl TaskHandler for Echo {
    async fn run(&self, ctx: &TaskContext) -> Result<serde_json::Value, TaskError> {
      Ok(ctx.args.clone())
    }
  }

  /// Requests a retry until it has been attempted `succeed_on` times.
  struct Flaky {
    attempts: Arc<AtomicU32>,
    succeed_on: u32,
    countdown: Duration,
  }

  #[async_trait]
  impl TaskHandler for Flaky {
    async fn run(&self, ctx: &TaskContext) -> Result<serde_json::Value, TaskError> {
      let attempt = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
      if attempt < self.succeed_on {
        return Err(TaskError::Retry {
          reason: format!("attempt {} failed", attempt),
          countdown: self.countdown,
          max_retries: 3,
        });
      }
      Ok(json!({ "attempt": attempt, "retries": ctx.retries() }))
    }
  }

  /// Runs until aborted, publishing progress once.
  struct Sleeper;

  #[async_trait]
  impl TaskHandler for Sleeper {
    async fn run(&self, ctx: &TaskContext) -> Result<serde_json::Value, TaskError> {
      ctx
        .update_state(TaskStatus::Progress, Some(json!({ "progress": 3 })))
        .await?;
      for _ in 0..400 {
        if ctx.is_aborted() {
          return Ok(json!({ "aborted": true }));
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
      Ok(json!({ "aborted": false }))
    }
  }

  struct Exploding;

  #[async_trait]
  impl TaskHandler for Exploding {
    async fn run(&self, _ctx: &TaskContext) -> Result<serde_json::Value, TaskError> {
      panic!("handler blew up");
    }
  }

  fn workers(operation: usize) -> WorkerConfig {
    WorkerConfig {
      ingest: 1,
      operation,
      default: 1,
    }
  }

  fn started_queue(registry: TaskRegistry) -> (InMemoryQueue, CancellationToken) {
    let queue = InMemoryQueue::new(registry);
    let cancel = CancellationToken::new();
    queue.start(&workers(2), cancel.clone());
    (queue, cancel)
  }

  async fn wait_for_status(queue: &InMemoryQueue, task_id: &str, expected: TaskStatus) {
    for _ in 0..400 {
      if queue.status(task_id).await.unwrap() == expected {
        return;
      }
      tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("task {} never reached {}", task_id, expected);
  }

  #[tokio::test]
  async fn test_submit_and_await_result() {
    let mut registry = TaskRegistry::new();
    registry.register("echo", Arc::new(Echo));
    let (queue, cancel) = started_queue(registry);

    let task_id = queue
      .submit(TaskRequest::new("echo", json!({ "value": 42 })))
      .await
      .unwrap();

    let value = queue.await_result(&task_id).await.unwrap();
    assert_eq!(value["value"], 42);
    assert_eq!(queue.status(&task_id).await.unwrap(), TaskStatus::Success);

    cancel.cancel();
  }

  #[tokio::test]
  async fn test_explicit_task_id_and_duplicates() {
    let queue = InMemoryQueue::new(TaskRegistry::new());

    let task_id = queue
      .submit(TaskRequest::new("echo", json!({})).with_task_id("workflow_0_abc"))
      .await
      .unwrap();
    assert_eq!(task_id, "workflow_0_abc");

    let err = queue
      .submit(TaskRequest::new("echo", json!({})).with_task_id("workflow_0_abc"))
      .await
      .unwrap_err();
    assert!(matches!(err, QueueError::DuplicateTask { .. }));
  }

  #[tokio::test]
  async fn test_unknown_task_reads_as_pending() {
    let queue = InMemoryQueue::new(TaskRegistry::new());
    assert_eq!(queue.status("missing").await.unwrap(), TaskStatus::Pending);
    assert!(queue.last_status_payload("missing").await.unwrap().is_none());
  }

  #[tokio::test]
  async fn test_retry_then_success() {
    let attempts = Arc::new(AtomicU32::new(0));
    let mut registry = TaskRegistry::new();
    registry.register(
      "operation",
      Arc::new(Flaky {
        attempts: attempts.clone(),
        succeed_on: 2,
        countdown: Duration::from_millis(5),
      }),
    );
    let (queue, cancel) = started_queue(registry);

    let task_id = queue
      .submit(TaskRequest::new("operation", json!({})))
      .await
      .unwrap();
    let value = queue.await_result(&task_id).await.unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(value["retries"], 1);
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_abort_pulls_scheduled_retry_forward() {
    let attempts = Arc::new(AtomicU32::new(0));
    let mut registry = TaskRegistry::new();
    registry.register(
      "operation",
      Arc::new(Flaky {
        attempts: attempts.clone(),
        succeed_on: 2,
        countdown: Duration::from_secs(60),
      }),
    );
    let (queue, cancel) = started_queue(registry);

    let task_id = queue
      .submit(TaskRequest::new("operation", json!({})))
      .await
      .unwrap();
    while queue.status(&task_id).await.unwrap() != TaskStatus::Retry {
      tokio::time::sleep(Duration::from_millis(1)).await;
    }
    let scheduled = queue.inspect_scheduled().await.unwrap();
    assert!(scheduled.values().flatten().any(|id| *id == task_id));

    queue.abort(&task_id).await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), queue.await_result(&task_id)).await;

    assert!(outcome.is_ok(), "aborted retry still waited out its countdown");
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(queue.status(&task_id).await.unwrap(), TaskStatus::Aborted);
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_retry_exhaustion_fails() {
    let attempts = Arc::new(AtomicU32::new(0));
    let mut registry = TaskRegistry::new();
    registry.register(
      "operation",
      Arc::new(Flaky {
        attempts: attempts.clone(),
        succeed_on: u32::MAX,
        countdown: Duration::from_millis(5),
      }),
    );
    let (queue, cancel) = started_queue(registry);

    let task_id = queue
      .submit(TaskRequest::new("operation", json!({})))
      .await
      .unwrap();
    let err = queue.await_result(&task_id).await.unwrap_err();

    assert!(matches!(err, QueueError::TaskFailed { .. }));
    assert!(err.to_string().contains("max retries (3) exceeded"));
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert_eq!(queue.status(&task_id).await.unwrap(), TaskStatus::Failure);
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_progress_is_published_and_abort_finishes_as_aborted() {
    let mut registry = TaskRegistry::new();
    registry.register("operation", Arc::new(Sleeper));
    let (queue, cancel) = started_queue(registry);

    let task_id = queue
      .submit(TaskRequest::new("operation", json!({})))
      .await
      .unwrap();
    wait_for_status(&queue, &task_id, TaskStatus::Progress).await;

    let payload = queue.last_status_payload(&task_id).await.unwrap().unwrap();
    assert_eq!(payload["progress"], 3);

    let active = queue.inspect_active().await.unwrap();
    let holders: Vec<_> = active
      .iter()
      .filter(|(_, ids)| ids.contains(&task_id))
      .map(|(worker_id, _)| worker_id.clone())
      .collect();
    assert_eq!(holders.len(), 1);
    assert!(holders[0].starts_with("operation@"));

    queue.abort(&task_id).await.unwrap();
    let value = queue.await_result(&task_id).await.unwrap();
    assert_eq!(value["aborted"], true);
    assert_eq!(queue.status(&task_id).await.unwrap(), TaskStatus::Aborted);

    cancel.cancel();
  }

  #[tokio::test]
  async fn test_abort_finished_task_errors() {
    let mut registry = TaskRegistry::new();
    registry.register("echo", Arc::new(Echo));
    let (queue, cancel) = started_queue(registry);

    let task_id = queue
      .submit(TaskRequest::new("echo", json!({})))
      .await
      .unwrap();
    queue.await_result(&task_id).await.unwrap();

    let err = queue.abort(&task_id).await.unwrap_err();
    assert!(matches!(err, QueueError::AlreadyFinished { .. }));

    let err = queue.abort("missing").await.unwrap_err();
    assert!(matches!(err, QueueError::TaskNotFound { .. }));
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_purge_backlog_finalizes_pending_tasks() {
    // No workers started: everything stays in the backlog.
    let queue = InMemoryQueue::new(TaskRegistry::new());
    let mut ids = Vec::new();
    for unit in ["operation", "operation", "cleanup"] {
      ids.push(
        queue
          .submit(TaskRequest::new(unit, json!({})))
          .await
          .unwrap(),
      );
    }

    assert!(queue.inspect_active().await.unwrap().is_empty());
    assert_eq!(queue.purge_backlog().await.unwrap(), 3);
    assert_eq!(queue.purge_backlog().await.unwrap(), 0);

    for task_id in &ids {
      assert_eq!(queue.status(task_id).await.unwrap(), TaskStatus::Aborted);
      let err = queue.await_result(task_id).await.unwrap_err();
      assert!(matches!(err, QueueError::TaskAborted { .. }));
    }
  }

  #[tokio::test]
  async fn test_panicking_handler_fails_and_worker_survives() {
    let mut registry = TaskRegistry::new();
    registry.register("operation", Arc::new(Exploding));
    registry.register("echo", Arc::new(Echo));
    let queue = InMemoryQueue::new(registry);
    let cancel = CancellationToken::new();
    queue.start(&workers(1), cancel.clone());

    let exploding = queue
      .submit(TaskRequest::new("operation", json!({})))
      .await
      .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), queue.await_result(&exploding))
      .await
      .expect("panicked task never finished");

    match outcome {
      Err(QueueError::TaskFailed { message, .. }) => assert!(message.contains("panicked")),
      other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(queue.status(&exploding).await.unwrap(), TaskStatus::Failure);
    assert!(queue.inspect_active().await.unwrap()["operation@1"].is_empty());

    // The same single worker keeps serving its queue.
    let next = queue
      .submit(TaskRequest::new("operation", json!({})))
      .await
      .unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), queue.await_result(&next)).await;
    assert!(matches!(outcome, Ok(Err(QueueError::TaskFailed { .. }))));
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_unregistered_task_fails() {
    let (queue, cancel) = started_queue(TaskRegistry::new());

    let task_id = queue
      .submit(TaskRequest::new("nobody_home", json!({})))
      .await
      .unwrap();
    let err = queue.await_result(&task_id).await.unwrap_err();
    assert!(err.to_string().contains("unregistered task"));
    cancel.cancel();
  }

  #[tokio::test]
  async fn test_inventory_lists_every_worker() {
    let (queue, cancel) = started_queue(TaskRegistry::new());

    let reserved = queue.inspect_reserved().await.unwrap();
    let workers: Vec<_> = reserved.keys().cloned().collect();
    assert_eq!(
      workers,
      vec!["default@1", "ingest@1", "operation@1", "operation@2"]
    );
    assert!(reserved.values().all(|ids| ids.is_empty()));
    cancel.cancel();
  }
}
