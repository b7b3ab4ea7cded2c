//! The work an operation performs on each step.

use std::hint::black_box;

use async_trait::async_trait;

use crate::operation::OperationRecord;

/// A failed unit of simulated work.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct WorkError {
  pub message: String,
}

impl WorkError {
  pub fn new(message: impl Into<String>) -> Self {
    Self {
      message: message.into(),
    }
  }
}

/// The pluggable body of the validation and operation units.
///
/// The orchestrator only cares about the shape of the chain; what each
/// step actually computes is supplied here.
#[async_trait]
pub trait Workload: Send + Sync {
  /// Pre-flight check run before the first cycle is dispatched.
  async fn validate_system(&self) -> Result<(), WorkError> {
    Ok(())
  }

  /// One bounded step of an operation. `record.progress` is the step number.
  fn perform_step(&self, record: &OperationRecord) -> Result<(), WorkError>;
}

/// Default workload: a short arithmetic loop per step that never fails.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedWorkload {
  iterations: u64,
}

impl SimulatedWorkload {
  pub fn new(iterations: u64) -> Self {
    Self { iterations }
  }
}

impl Default for SimulatedWorkload {
  fn default() -> Self {
    Self::new(10_000)
  }
}

#[async_trait]
impl Workload for SimulatedWorkload {
  fn perform_step(&self, record: &OperationRecord) -> Result<(), WorkError> {
    let seed = u64::from(record.global_index) + u64::from(record.progress);
    let mut acc = 0u64;
    for i in 0..self.iterations {
      acc = acc.wrapping_add(black_box(i ^ seed));
    }
    black_box(acc);
    Ok(())
  }
}
