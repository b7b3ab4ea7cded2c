use std::path::PathBuf;

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
  /// The configuration file could not be read.
  #[error("failed to read config file {path:?}")]
  Io {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  /// The configuration is not valid JSON or has the wrong shape.
  #[error("failed to parse config: {source}")]
  Parse {
    #[source]
    source: serde_json::Error,
  },

  /// The configuration parsed but holds an unusable value.
  #[error("invalid config: {message}")]
  Invalid { message: String },
}
