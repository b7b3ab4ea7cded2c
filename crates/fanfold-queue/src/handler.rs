//! Task handlers and the context they run in.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;

use crate::TaskQueue;
use crate::error::QueueError;
use crate::status::TaskStatus;

/// Errors a handler can return to the worker.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
  /// Re-deliver the same message after `countdown`, at most `max_retries` times.
  #[error("retry requested: {reason}")]
  Retry {
    reason: String,
    countdown: Duration,
    max_retries: u32,
  },

  /// The arguments could not be decoded.
  #[error("invalid task arguments: {message}")]
  InvalidArgs { message: String },

  /// A queue call made by the handler failed.
  #[error(transparent)]
  Queue(#[from] QueueError),

  /// The handler failed and must not be retried.
  #[error("{message}")]
  Failed { message: String },
}

impl TaskError {
  pub fn failed(message: impl Into<String>) -> Self {
    TaskError::Failed {
      message: message.into(),
    }
  }
}

/// A unit of work registered under a task name.
#[async_trait]
pub trait TaskHandler: Send + Sync {
  /// Run one attempt of the task.
  async fn run(&self, ctx: &TaskContext) -> Result<serde_json::Value, TaskError>;
}

/// Handlers keyed by task name.
#[derive(Default, Clone)]
pub struct TaskRegistry {
  handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
  pub fn new() -> Self {
    Self::default()
  }

  /// Register a handler, replacing any previous one with the same name.
  pub fn register(&mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) {
    self.handlers.insert(name.into(), handler);
  }

  pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
    self.handlers.get(name).cloned()
  }

  pub fn contains(&self, name: &str) -> bool {
    self.handlers.contains_key(name)
  }
}

/// Everything a running task can see about itself.
#[derive(Clone)]
pub struct TaskContext {
  pub(crate) task_id: String,
  pub(crate) unit_name: String,
  pub(crate) worker_id: String,
  pub(crate) args: serde_json::Value,
  pub(crate) retries: u32,
  pub(crate) abort: CancellationToken,
  pub(crate) queue: Arc<dyn TaskQueue>,
}

impl TaskContext {
  /// Build a context by hand, for running a handler outside a worker.
  pub fn new(
    task_id: impl Into<String>,
    unit_name: impl Into<String>,
    args: serde_json::Value,
    queue: Arc<dyn TaskQueue>,
  ) -> Self {
    Self {
      task_id: task_id.into(),
      unit_name: unit_name.into(),
      worker_id: "local".to_string(),
      args,
      retries: 0,
      abort: CancellationToken::new(),
      queue,
    }
  }

  pub fn with_retries(mut self, retries: u32) -> Self {
    self.retries = retries;
    self
  }

  pub fn with_abort(mut self, abort: CancellationToken) -> Self {
    self.abort = abort;
    self
  }

  pub fn task_id(&self) -> &str {
    &self.task_id
  }

  pub fn unit_name(&self) -> &str {
    &self.unit_name
  }

  pub fn worker_id(&self) -> &str {
    &self.worker_id
  }

  /// Number of retries already performed for this task.
  pub fn retries(&self) -> u32 {
    self.retries
  }

  /// Decode the task arguments.
  pub fn args<T: DeserializeOwned>(&self) -> Result<T, TaskError> {
    serde_json::from_value(self.args.clone()).map_err(|e| TaskError::InvalidArgs {
      message: e.to_string(),
    })
  }

  /// Whether an abort has been requested for this task.
  pub fn is_aborted(&self) -> bool {
    self.abort.is_cancelled()
  }

  pub fn abort_token(&self) -> &CancellationToken {
    &self.abort
  }

  /// The queue this task runs on, for submitting follow-up work.
  pub fn queue(&self) -> &Arc<dyn TaskQueue> {
    &self.queue
  }

  /// Publish a state transition for this task.
  pub async fn update_state(
    &self,
    status: TaskStatus,
    payload: Option<serde_json::Value>,
  ) -> Result<(), QueueError> {
    self.queue.update_state(&self.task_id, status, payload).await
  }
}
