//! Workflow error types.

use fanfold_queue::{QueueError, TaskError};

use crate::workload::WorkError;

/// Errors that can occur while building, running or observing a workflow.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
  /// The workflow parameters are unusable. Raised before anything is dispatched.
  #[error("invalid workflow: {message}")]
  Validation { message: String },

  /// The pre-flight validation unit failed; no cycle was started.
  #[error("pre-flight validation failed")]
  Preflight {
    #[source]
    source: QueueError,
  },

  /// A task produced a value that does not decode as expected.
  #[error("malformed result from task '{task_id}': {message}")]
  MalformedResult { task_id: String, message: String },

  /// Task arguments could not be encoded.
  #[error("failed to encode task arguments: {message}")]
  Serialization { message: String },

  /// The simulated work of an operation step failed.
  #[error(transparent)]
  Work(#[from] WorkError),

  /// A queue primitive failed.
  #[error(transparent)]
  Queue(#[from] QueueError),
}

impl From<WorkflowError> for TaskError {
  fn from(e: WorkflowError) -> Self {
    match e {
      WorkflowError::Queue(source) => TaskError::Queue(source),
      other => TaskError::failed(other.to_string()),
    }
  }
}

/// Encode task arguments as JSON.
pub(crate) fn to_args<T: serde::Serialize>(value: &T) -> Result<serde_json::Value, WorkflowError> {
  serde_json::to_value(value).map_err(|e| WorkflowError::Serialization {
    message: e.to_string(),
  })
}

/// Decode the value a task returned.
pub(crate) fn from_result<T: serde::de::DeserializeOwned>(
  task_id: &str,
  value: serde_json::Value,
) -> Result<T, WorkflowError> {
  serde_json::from_value(value).map_err(|e| WorkflowError::MalformedResult {
    task_id: task_id.to_string(),
    message: e.to_string(),
  })
}
