use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::routing::QueueName;

/// Top-level orchestrator configuration.
///
/// All durations are expressed in "time units" so the same workflow can be
/// run at human pace (one unit = one second) or compressed for tests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
  /// Length of one time unit in milliseconds.
  pub time_unit_ms: u64,
  /// Monitor polling interval, in time units.
  pub poll_interval_units: u64,
  /// Retry policy applied to operation units.
  pub retry: RetryPolicy,
  /// Worker pool sizes per queue.
  pub workers: WorkerConfig,
}

impl Default for OrchestratorConfig {
  fn default() -> Self {
    Self {
      time_unit_ms: 1000,
      poll_interval_units: 1,
      retry: RetryPolicy::default(),
      workers: WorkerConfig::default(),
    }
  }
}

impl OrchestratorConfig {
  /// Parse a configuration from a JSON string.
  pub fn from_json(content: &str) -> Result<Self, ConfigError> {
    let config: Self =
      serde_json::from_str(content).map_err(|source| ConfigError::Parse { source })?;
    config.validate()?;
    Ok(config)
  }

  /// Load a configuration from a JSON file.
  pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
      path: path.to_path_buf(),
      source,
    })?;
    Self::from_json(&content)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.time_unit_ms == 0 {
      return Err(ConfigError::Invalid {
        message: "time_unit_ms must be bigger than 0".to_string(),
      });
    }
    if self.poll_interval_units == 0 {
      return Err(ConfigError::Invalid {
        message: "poll_interval_units must be bigger than 0".to_string(),
      });
    }
    for queue in QueueName::ALL {
      if self.workers.concurrency(queue) == 0 {
        return Err(ConfigError::Invalid {
          message: format!("queue '{}' needs at least one worker", queue),
        });
      }
    }
    Ok(())
  }

  /// Duration of a single time unit.
  pub fn time_unit(&self) -> Duration {
    Duration::from_millis(self.time_unit_ms)
  }

  /// Scale a number of time units to a duration.
  pub fn units(&self, count: u64) -> Duration {
    Duration::from_millis(self.time_unit_ms.saturating_mul(count))
  }

  pub fn poll_interval(&self) -> Duration {
    self.units(self.poll_interval_units)
  }

  /// Delay before a failed operation is re-delivered.
  pub fn retry_countdown(&self) -> Duration {
    self.units(self.retry.countdown_units)
  }
}

/// Bounded retry with a fixed countdown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
  /// Retries allowed after the first attempt.
  pub max_retries: u32,
  /// Countdown before each retry, in time units.
  pub countdown_units: u64,
}

impl Default for RetryPolicy {
  fn default() -> Self {
    Self {
      max_retries: 3,
      countdown_units: 60,
    }
  }
}

/// Number of workers serving each queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
  pub ingest: usize,
  pub operation: usize,
  pub default: usize,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    // Operations are the only CPU-bound queue; everything else is a single
    // sequential worker.
    let cpus = std::thread::available_parallelism()
      .map(|n| n.get())
      .unwrap_or(1);
    Self {
      ingest: 1,
      operation: cpus,
      default: 1,
    }
  }
}

impl WorkerConfig {
  pub fn concurrency(&self, queue: QueueName) -> usize {
    match queue {
      QueueName::Ingest => self.ingest,
      QueueName::Operation => self.operation,
      QueueName::Default => self.default,
    }
  }
}
