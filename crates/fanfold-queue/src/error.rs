//! Queue error types.

/// Errors returned by queue operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
  /// No record exists for the task id.
  #[error("task '{task_id}' not found")]
  TaskNotFound { task_id: String },

  /// The task already reached a terminal state.
  #[error("task '{task_id}' already finished")]
  AlreadyFinished { task_id: String },

  /// A task with this id was submitted before.
  #[error("task '{task_id}' already exists")]
  DuplicateTask { task_id: String },

  /// The task finished with FAILURE.
  #[error("task '{task_id}' failed: {message}")]
  TaskFailed { task_id: String, message: String },

  /// The task was aborted before it produced a value.
  #[error("task '{task_id}' was aborted")]
  TaskAborted { task_id: String },

  /// The broker or result backend is unusable.
  #[error("queue backend error: {message}")]
  Backend { message: String },
}
