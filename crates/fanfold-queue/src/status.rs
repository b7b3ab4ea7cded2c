use serde::{Deserialize, Serialize};

/// Lifecycle state of a task as recorded by the result backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
  /// Submitted, not yet claimed by a worker (or unknown to the backend).
  Pending,
  /// Claimed by a worker, not started.
  Received,
  Started,
  /// Custom in-flight state published by the task itself.
  Progress,
  /// Failed an attempt and waiting for its countdown before re-delivery.
  Retry,
  Success,
  Failure,
  Aborted,
}

impl TaskStatus {
  /// Whether no further transitions will happen.
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      TaskStatus::Success | TaskStatus::Failure | TaskStatus::Aborted
    )
  }

  pub fn as_str(self) -> &'static str {
    match self {
      TaskStatus::Pending => "PENDING",
      TaskStatus::Received => "RECEIVED",
      TaskStatus::Started => "STARTED",
      TaskStatus::Progress => "PROGRESS",
      TaskStatus::Retry => "RETRY",
      TaskStatus::Success => "SUCCESS",
      TaskStatus::Failure => "FAILURE",
      TaskStatus::Aborted => "ABORTED",
    }
  }
}

impl std::fmt::Display for TaskStatus {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}
