//! Task handles and submission requests.

use std::sync::Arc;

use crate::TaskQueue;
use crate::error::QueueError;
use crate::status::TaskStatus;

/// A request to run a named unit with JSON arguments.
#[derive(Debug, Clone)]
pub struct TaskRequest {
  pub unit_name: String,
  pub args: serde_json::Value,
  /// Explicit task id; a uuid is generated when absent.
  pub task_id: Option<String>,
}

impl TaskRequest {
  pub fn new(unit_name: impl Into<String>, args: serde_json::Value) -> Self {
    Self {
      unit_name: unit_name.into(),
      args,
      task_id: None,
    }
  }

  pub fn with_task_id(mut self, task_id: impl Into<String>) -> Self {
    self.task_id = Some(task_id.into());
    self
  }
}

/// A reference to a submitted task on a specific queue.
#[derive(Clone)]
pub struct TaskHandle {
  task_id: String,
  queue: Arc<dyn TaskQueue>,
}

impl std::fmt::Debug for TaskHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("TaskHandle")
      .field("task_id", &self.task_id)
      .finish()
  }
}

impl TaskHandle {
  /// Wrap an existing task id.
  pub fn new(queue: Arc<dyn TaskQueue>, task_id: impl Into<String>) -> Self {
    Self {
      task_id: task_id.into(),
      queue,
    }
  }

  /// Submit a request and return a handle to the new task.
  pub async fn submit(queue: &Arc<dyn TaskQueue>, request: TaskRequest) -> Result<Self, QueueError> {
    let task_id = queue.submit(request).await?;
    Ok(Self::new(queue.clone(), task_id))
  }

  pub fn id(&self) -> &str {
    &self.task_id
  }

  pub fn queue(&self) -> &Arc<dyn TaskQueue> {
    &self.queue
  }

  pub async fn status(&self) -> Result<TaskStatus, QueueError> {
    self.queue.status(&self.task_id).await
  }

  pub async fn last_status_payload(&self) -> Result<Option<serde_json::Value>, QueueError> {
    self.queue.last_status_payload(&self.task_id).await
  }

  pub async fn await_result(&self) -> Result<serde_json::Value, QueueError> {
    self.queue.await_result(&self.task_id).await
  }

  pub async fn abort(&self) -> Result<(), QueueError> {
    self.queue.abort(&self.task_id).await
  }
}
