//! Fanfold Config
//!
//! Configuration types for the fanfold orchestrator and the static routing
//! table that maps unit kinds to queues.
//!
//! Configuration can be loaded from a JSON file (via the CLI with
//! `--config=fanfold.json`). Every field is optional and falls back to its
//! default, so an empty object `{}` is a valid configuration.

mod error;
mod orchestrator;
mod routing;

pub use error::ConfigError;
pub use orchestrator::{OrchestratorConfig, RetryPolicy, WorkerConfig};
pub use routing::{QueueName, UnitKind, route_by_name, route_for};
