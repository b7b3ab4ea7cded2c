//! Recursive fan-out/join workflows on a task queue.
//!
//! A workflow runs `cycle_count` cycles. Each cycle fans out
//! `concurrent_count` operation tasks and joins them with a continuation
//! task that either dispatches the next cycle or hands off to cleanup:
//!
//! ```text
//! validate_system ─► create_cycle ─┬─► operation 0 ─┐
//!                                  ├─► operation 1 ─┼─► cycle_join ─► create_cycle ─► ... ─► cleanup
//!                                  └─► operation N ─┘
//! ```
//!
//! Every arrow is a task submitted to a [`fanfold_queue::TaskQueue`]; the
//! [`Orchestrator`] submits the first cycle, follows the chain to report
//! progress, and can cancel everything in flight.

pub mod cancel;
pub mod client;
pub mod context;
pub mod cycle;
pub mod error;
pub mod events;
pub mod operation;
pub mod progress;
pub mod units;
pub mod workload;

pub use cancel::{CancelReport, CancellationController, CancellationTarget};
pub use client::{MonitorOutcome, MonitorReport, Orchestrator};
pub use context::WorkflowContext;
pub use cycle::{Continuation, CycleBuilder, CycleJoin, CycleResult, build_cycle};
pub use error::WorkflowError;
pub use events::{ChannelNotifier, ExecutionEvent, ExecutionNotifier, NoopNotifier};
pub use operation::{
  OperationArgs, OperationOutput, OperationRecord, OperationUnit, ProgressPayload, TOTAL_INTERVALS,
};
pub use progress::{OperationSnapshot, Progress, ProgressAggregator, compute_progress};
pub use units::{CleanupUnit, UnitServices, ValidateSystemUnit, register_units};
pub use workload::{SimulatedWorkload, WorkError, Workload};
