//! Workflow events and notifiers for observability.
//!
//! Units and the monitor emit events as the chain advances so consumers can
//! render progress, assert ordering in tests, or forward them elsewhere.

use std::sync::Arc;

use fanfold_queue::TaskStatus;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Events emitted while a workflow runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExecutionEvent {
  /// The pre-flight validation unit finished successfully.
  ValidationCompleted { task_id: String },

  /// A cycle's operations and join were dispatched.
  CycleBuilt {
    cycle_index: u32,
    operation_ids: Vec<String>,
    continuation_id: String,
  },

  /// An operation attempt failed and will be re-delivered.
  OperationRetrying {
    cycle_index: u32,
    global_index: u32,
    retries: u32,
    error: String,
  },

  /// An operation reached a final state.
  OperationFinished {
    cycle_index: u32,
    local_index: u32,
    global_index: u32,
    state: TaskStatus,
    retries: u32,
  },

  /// The join observed every operation of a cycle.
  CycleSummarized {
    cycle_index: u32,
    statuses: Vec<TaskStatus>,
  },

  /// The cleanup unit ran after the last cycle.
  CleanupCompleted { cycle_index: u32 },

  /// The monitor computed a new overall percentage.
  Progress {
    percentage: u32,
    current_interval: u64,
  },
}

/// Trait for receiving workflow events.
///
/// Units and the monitor call `notify` for each event; implementations
/// decide what to do with them.
pub trait ExecutionNotifier: Send + Sync {
  fn notify(&self, event: ExecutionEvent);
}

impl<N: ExecutionNotifier + ?Sized> ExecutionNotifier for Arc<N> {
  fn notify(&self, event: ExecutionEvent) {
    (**self).notify(event)
  }
}

/// A no-op notifier that discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl ExecutionNotifier for NoopNotifier {
  fn notify(&self, _event: ExecutionEvent) {}
}

/// A notifier that sends events to an unbounded channel.
///
/// Event volume is a handful per operation, so the channel is left unbounded
/// and never blocks a worker.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<ExecutionEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<ExecutionEvent>) -> Self {
    Self { sender }
  }
}

impl ExecutionNotifier for ChannelNotifier {
  fn notify(&self, event: ExecutionEvent) {
    // Receiver may have been dropped
    let _ = self.sender.send(event);
  }
}
