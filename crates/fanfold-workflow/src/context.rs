//! The state carried from one cycle to the next.

use serde::{Deserialize, Serialize};

use crate::error::WorkflowError;
use crate::operation::TOTAL_INTERVALS;

/// Workflow state handed from each cycle's continuation to the next cycle.
///
/// Passed by value through task arguments, so exactly one continuation owns
/// it at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowContext {
  /// Number of cycles the workflow runs.
  pub cycle_count: u32,
  /// Number of operations fanned out per cycle.
  pub concurrent_count: u32,
  /// 1-based index of the current cycle; 0 before the first cycle is built.
  #[serde(default)]
  pub cycle_index: u32,
}

impl WorkflowContext {
  /// Create a fresh context, rejecting non-positive counts.
  pub fn new(cycle_count: u32, concurrent_count: u32) -> Result<Self, WorkflowError> {
    let ctx = Self {
      cycle_count,
      concurrent_count,
      cycle_index: 0,
    };
    ctx.validate()?;
    Ok(ctx)
  }

  pub fn validate(&self) -> Result<(), WorkflowError> {
    if self.cycle_count == 0 {
      return Err(WorkflowError::Validation {
        message: "cycle_count has to be bigger than 0".to_string(),
      });
    }
    if self.concurrent_count == 0 {
      return Err(WorkflowError::Validation {
        message: "concurrent_count has to be bigger than 0".to_string(),
      });
    }
    Ok(())
  }

  /// Move to the next cycle. Returns the new cycle index.
  pub fn advance(&mut self) -> u32 {
    self.cycle_index = self.cycle_index.saturating_add(1);
    self.cycle_index
  }

  /// Whether another cycle follows the current one.
  pub fn has_next_cycle(&self) -> bool {
    self.cycle_index < self.cycle_count
  }

  /// Cycle-spanning ordinal of an operation in the current cycle. Saturates
  /// at `u32::MAX`.
  pub fn global_index(&self, local_index: u32) -> u32 {
    self.cycle_index.saturating_sub(1).saturating_add(local_index)
  }

  /// Progress intervals contributed by one cycle.
  pub fn cycle_intervals(&self) -> u64 {
    u64::from(self.concurrent_count).saturating_mul(u64::from(TOTAL_INTERVALS))
  }

  /// Progress intervals across the whole workflow. Saturates at `u64::MAX`.
  pub fn total_intervals(&self) -> u64 {
    u64::from(self.cycle_count).saturating_mul(self.cycle_intervals())
  }
}
