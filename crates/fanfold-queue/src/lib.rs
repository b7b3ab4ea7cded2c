//! Fanfold Queue
//!
//! This crate defines the task-queue primitives the orchestrator is layered
//! on: submit a task, get its result, poll its status, abort it, inspect the
//! live inventory and purge the backlog.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        TaskQueue                            │
//! │  - submit(request) → task id                                │
//! │  - status / last_status_payload / await_result              │
//! │  - inspect_active / inspect_reserved / inspect_scheduled    │
//! │  - abort(task id), purge_backlog()                          │
//! └─────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      InMemoryQueue                          │
//! │  - broker: one backlog per routed queue                     │
//! │  - result backend: status, payload, result per task         │
//! │  - worker pools running registered TaskHandlers             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! let mut registry = TaskRegistry::new();
//! registry.register("operation", Arc::new(MyHandler));
//!
//! let queue = InMemoryQueue::new(registry);
//! let workers = queue.start(&config.workers, cancel.clone());
//!
//! let queue: Arc<dyn TaskQueue> = Arc::new(queue);
//! let handle = TaskHandle::submit(&queue, TaskRequest::new("operation", args)).await?;
//! let value = handle.await_result().await?;
//! ```

mod error;
mod handle;
mod handler;
mod memory;
mod status;

use std::collections::BTreeMap;

use async_trait::async_trait;

pub use error::QueueError;
pub use handle::{TaskHandle, TaskRequest};
pub use handler::{TaskContext, TaskError, TaskHandler, TaskRegistry};
pub use memory::InMemoryQueue;
pub use status::TaskStatus;

/// Live task ids grouped by worker id.
pub type Inventory = BTreeMap<String, Vec<String>>;

/// The task-queue collaborator: broker, result backend and worker control.
#[async_trait]
pub trait TaskQueue: Send + Sync {
  /// Enqueue a task and return its id.
  async fn submit(&self, request: TaskRequest) -> Result<String, QueueError>;

  /// Current status of a task. Unknown ids read as PENDING.
  async fn status(&self, task_id: &str) -> Result<TaskStatus, QueueError>;

  /// Payload attached to the most recent status update, if any.
  async fn last_status_payload(&self, task_id: &str)
  -> Result<Option<serde_json::Value>, QueueError>;

  /// Wait until the task has finished and return its value.
  ///
  /// Resolves with the returned value for SUCCESS and for tasks that finished
  /// normally after being aborted. Fails for FAILURE and for tasks aborted
  /// before they ever ran.
  async fn await_result(&self, task_id: &str) -> Result<serde_json::Value, QueueError>;

  /// Publish a state transition for a running task.
  async fn update_state(
    &self,
    task_id: &str,
    status: TaskStatus,
    payload: Option<serde_json::Value>,
  ) -> Result<(), QueueError>;

  /// Tasks currently executing.
  async fn inspect_active(&self) -> Result<Inventory, QueueError>;

  /// Tasks claimed by a worker but not yet started.
  async fn inspect_reserved(&self) -> Result<Inventory, QueueError>;

  /// Tasks held by a worker until a future ETA.
  async fn inspect_scheduled(&self) -> Result<Inventory, QueueError>;

  /// Set the cooperative abort flag of a task.
  async fn abort(&self, task_id: &str) -> Result<(), QueueError>;

  /// Drop every message still waiting in the backlog. Returns how many.
  async fn purge_backlog(&self) -> Result<usize, QueueError>;
}
