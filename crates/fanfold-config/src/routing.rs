//! Static task routing.
//!
//! Every unit kind is bound to exactly one queue. Routing is a pure lookup so
//! the broker, the workers and the client all agree on placement without
//! sharing any state.

use serde::{Deserialize, Serialize};

/// The kinds of work unit the orchestrator dispatches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitKind {
  /// Blocking pre-flight check run before the first cycle.
  ValidateSystem,
  /// Builds one cycle: fans out operations and attaches the join.
  CreateCycle,
  /// A single concurrently executed operation.
  Operation,
  /// Barrier + summary that decides between recursion and cleanup.
  CycleJoin,
  /// Terminal step of the chain.
  Cleanup,
}

impl UnitKind {
  pub const ALL: [UnitKind; 5] = [
    UnitKind::ValidateSystem,
    UnitKind::CreateCycle,
    UnitKind::Operation,
    UnitKind::CycleJoin,
    UnitKind::Cleanup,
  ];

  /// The registered task name for this unit kind.
  pub const fn name(self) -> &'static str {
    match self {
      UnitKind::ValidateSystem => "validate_system",
      UnitKind::CreateCycle => "create_cycle",
      UnitKind::Operation => "operation",
      UnitKind::CycleJoin => "cycle_join",
      UnitKind::Cleanup => "cleanup",
    }
  }

  /// Look a unit kind up by its registered task name.
  pub fn from_name(name: &str) -> Option<Self> {
    Self::ALL.into_iter().find(|kind| kind.name() == name)
  }
}

/// Queues served by the worker pools.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueName {
  Ingest,
  Operation,
  Default,
}

impl QueueName {
  pub const ALL: [QueueName; 3] = [QueueName::Ingest, QueueName::Operation, QueueName::Default];

  pub const fn as_str(self) -> &'static str {
    match self {
      QueueName::Ingest => "ingest",
      QueueName::Operation => "operation",
      QueueName::Default => "default",
    }
  }
}

impl std::fmt::Display for QueueName {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(self.as_str())
  }
}

/// The queue a unit kind is routed to.
pub const fn route_for(kind: UnitKind) -> QueueName {
  match kind {
    UnitKind::ValidateSystem => QueueName::Ingest,
    UnitKind::Operation => QueueName::Operation,
    UnitKind::CreateCycle | UnitKind::CycleJoin | UnitKind::Cleanup => QueueName::Default,
  }
}

/// Route by task name. Unknown names land on the default queue.
pub fn route_by_name(name: &str) -> QueueName {
  UnitKind::from_name(name)
    .map(route_for)
    .unwrap_or(QueueName::Default)
}
