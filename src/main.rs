use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use fanfold_config::OrchestratorConfig;
use fanfold_queue::{InMemoryQueue, TaskQueue, TaskRegistry};
use fanfold_workflow::{
  CancelReport, ExecutionEvent, ExecutionNotifier, MonitorOutcome, Orchestrator, UnitServices,
  register_units,
};

/// Fanfold - recursive fan-out/join workflows on a task queue
#[derive(Parser)]
#[command(name = "fanfold")]
#[command(version, about, long_about = None)]
struct Cli {
  /// Path to an orchestrator config file (JSON)
  #[arg(long)]
  config: Option<PathBuf>,

  /// Number of cycles to run
  #[arg(long, default_value_t = 1)]
  cycle_count: u32,

  /// Number of operations fanned out per cycle
  #[arg(long, default_value_t = 1)]
  operation_concurrent: u32,

  /// Abort and purge this process's in-process queue, then exit
  ///
  /// The queue lives inside this process and is empty at startup, so this
  /// only sweeps tasks this process enqueued. To cancel a running workflow,
  /// press Ctrl-C while it runs.
  #[arg(long)]
  purge: bool,

  /// Print overall progress while the workflow runs
  #[arg(long)]
  monitor: bool,
}

/// Prints progress percentages to stdout.
struct ConsoleNotifier {
  enabled: bool,
}

impl ExecutionNotifier for ConsoleNotifier {
  fn notify(&self, event: ExecutionEvent) {
    if !self.enabled {
      return;
    }
    if let ExecutionEvent::Progress { percentage, .. } = event {
      println!("Progress: {}%", percentage);
    }
  }
}

fn main() -> Result<()> {
  let cli = Cli::parse();

  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
    .with_writer(std::io::stderr)
    .with_target(false)
    .init();

  let config = match &cli.config {
    Some(path) => OrchestratorConfig::from_file(path)
      .with_context(|| format!("failed to load config: {}", path.display()))?,
    None => OrchestratorConfig::default(),
  };
  config.validate().context("invalid orchestrator config")?;

  let rt = tokio::runtime::Runtime::new()?;
  rt.block_on(async { run(cli, config).await })
}

async fn run(cli: Cli, config: OrchestratorConfig) -> Result<()> {
  let mut registry = TaskRegistry::new();
  register_units(&mut registry, Arc::new(UnitServices::new(config.clone())));

  let queue = InMemoryQueue::new(registry);
  let shutdown = CancellationToken::new();
  let workers = queue.start(&config.workers, shutdown.clone());
  info!(workers = workers.len(), "workers_started");

  let queue: Arc<dyn TaskQueue> = Arc::new(queue);
  let orchestrator = Orchestrator::with_notifier(
    queue,
    config,
    ConsoleNotifier {
      enabled: cli.monitor,
    },
  );

  let result = if cli.purge {
    let report = orchestrator
      .cancel_all()
      .await
      .context("failed to cancel workflows")?;
    print_cancel_report(&report);
    Ok(())
  } else {
    run_workflow(&orchestrator, cli.cycle_count, cli.operation_concurrent).await
  };

  shutdown.cancel();
  futures::future::join_all(workers).await;
  result
}

async fn run_workflow(
  orchestrator: &Orchestrator<ConsoleNotifier>,
  cycle_count: u32,
  concurrent_count: u32,
) -> Result<()> {
  let handle = orchestrator
    .submit(cycle_count, concurrent_count)
    .await
    .context("failed to submit workflow")?;
  eprintln!("Submitted workflow: {}", handle.id());

  let monitor = orchestrator.monitor(&handle, cycle_count, concurrent_count);
  tokio::pin!(monitor);

  let outcome = tokio::select! {
      report = &mut monitor => report,
      _ = tokio::signal::ctrl_c() => {
        warn!("interrupted, canceling all tasks");
        let cancel = orchestrator
          .cancel_all()
          .await
          .context("failed to cancel workflows")?;
        print_cancel_report(&cancel);
        monitor.await
      }
  };
  let report = outcome.context("failed to monitor workflow")?;

  match report.outcome {
    MonitorOutcome::Completed => eprintln!("Workflow completed after {} cycles", report.cycles),
    MonitorOutcome::Cancelled => eprintln!(
      "Workflow cancelled after {} cycles at {}%",
      report.cycles, report.percentage
    ),
  }

  Ok(())
}

fn print_cancel_report(report: &CancelReport) {
  for target in &report.targets {
    eprintln!("Canceling task {} on {}", target.task_id, target.worker_id);
  }
  eprintln!(
    "Aborted {} tasks ({} failed), purged {} queued tasks",
    report.aborted, report.failed, report.purged
  );
}

#[cfg(test)]
mod tests {
  use clap::CommandFactory;

  use super::*;

  #[test]
  fn test_cli_definition_is_valid() {
    Cli::command().debug_assert();
  }

  #[test]
  fn test_purge_help_names_its_scope() {
    let command = Cli::command();
    let purge = command
      .get_arguments()
      .find(|arg| arg.get_id() == "purge")
      .unwrap();

    let help = purge.get_help().unwrap().to_string();
    assert!(help.contains("in-process"), "help was: {help}");
    let long_help = purge.get_long_help().unwrap().to_string();
    assert!(long_help.contains("Ctrl-C"), "long help was: {long_help}");
  }

  #[test]
  fn test_purge_flag_parses() {
    let cli = Cli::try_parse_from(["fanfold", "--purge"]).unwrap();
    assert!(cli.purge);
    assert_eq!(cli.cycle_count, 1);
  }
}
