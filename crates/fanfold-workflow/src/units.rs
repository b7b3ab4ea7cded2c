//! Unit registration and the bookend units of a workflow.
//!
//! Besides the per-cycle units in [`crate::cycle`] and [`crate::operation`],
//! a workflow starts with a pre-flight `validate_system` unit and ends with
//! a `cleanup` unit.

use std::sync::Arc;

use async_trait::async_trait;
use fanfold_config::{OrchestratorConfig, UnitKind};
use fanfold_queue::{TaskContext, TaskError, TaskHandler, TaskRegistry};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info};

use crate::context::WorkflowContext;
use crate::cycle::{CycleBuilder, CycleJoin};
use crate::error::to_args;
use crate::events::{ExecutionEvent, ExecutionNotifier, NoopNotifier};
use crate::operation::OperationUnit;
use crate::workload::{SimulatedWorkload, Workload};

/// Shared dependencies of every unit handler.
pub struct UnitServices {
  pub config: OrchestratorConfig,
  pub workload: Arc<dyn Workload>,
  pub notifier: Arc<dyn ExecutionNotifier>,
}

impl UnitServices {
  /// Services with the simulated workload and no event consumer.
  pub fn new(config: OrchestratorConfig) -> Self {
    Self {
      config,
      workload: Arc::new(SimulatedWorkload::default()),
      notifier: Arc::new(NoopNotifier),
    }
  }

  pub fn with_workload(mut self, workload: Arc<dyn Workload>) -> Self {
    self.workload = workload;
    self
  }

  pub fn with_notifier(mut self, notifier: Arc<dyn ExecutionNotifier>) -> Self {
    self.notifier = notifier;
    self
  }
}

/// Register a handler for every [`UnitKind`].
pub fn register_units(registry: &mut TaskRegistry, services: Arc<UnitServices>) {
  for kind in UnitKind::ALL {
    let handler: Arc<dyn TaskHandler> = match kind {
      UnitKind::ValidateSystem => Arc::new(ValidateSystemUnit::new(services.clone())),
      UnitKind::CreateCycle => Arc::new(CycleBuilder::new(services.clone())),
      UnitKind::Operation => Arc::new(OperationUnit::new(services.clone())),
      UnitKind::CycleJoin => Arc::new(CycleJoin::new(services.clone())),
      UnitKind::Cleanup => Arc::new(CleanupUnit::new(services.clone())),
    };
    registry.register(kind.name(), handler);
  }
}

/// Handler for [`UnitKind::ValidateSystem`].
pub struct ValidateSystemUnit {
  services: Arc<UnitServices>,
}

impl ValidateSystemUnit {
  pub fn new(services: Arc<UnitServices>) -> Self {
    Self { services }
  }
}

#[async_trait]
impl TaskHandler for ValidateSystemUnit {
  async fn run(&self, task: &TaskContext) -> Result<serde_json::Value, TaskError> {
    info!(task_id = %task.task_id(), "system_validation_started");
    tokio::time::sleep(self.services.config.time_unit()).await;

    if let Err(e) = self.services.workload.validate_system().await {
      error!(task_id = %task.task_id(), error = %e, "system_validation_failed");
      return Err(TaskError::failed(e.to_string()));
    }

    info!(task_id = %task.task_id(), "system_validation_done");
    self.services.notifier.notify(ExecutionEvent::ValidationCompleted {
      task_id: task.task_id().to_string(),
    });
    Ok(json!({ "valid": true }))
  }
}

/// Arguments of a `cleanup` task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CleanupArgs {
  pub ctx: WorkflowContext,
}

/// Handler for [`UnitKind::Cleanup`].
pub struct CleanupUnit {
  services: Arc<UnitServices>,
}

impl CleanupUnit {
  pub fn new(services: Arc<UnitServices>) -> Self {
    Self { services }
  }
}

#[async_trait]
impl TaskHandler for CleanupUnit {
  async fn run(&self, task: &TaskContext) -> Result<serde_json::Value, TaskError> {
    let args: CleanupArgs = task.args()?;
    info!(task_id = %task.task_id(), cycle_index = args.ctx.cycle_index, "cleanup_started");

    tokio::time::sleep(self.services.config.time_unit()).await;

    info!(task_id = %task.task_id(), "cleanup_done");
    self.services.notifier.notify(ExecutionEvent::CleanupCompleted {
      cycle_index: args.ctx.cycle_index,
    });
    Ok(to_args(&args.ctx)?)
  }
}
