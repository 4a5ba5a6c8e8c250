//! Error types shared across kiln crates.

use thiserror::Error;

/// Result type alias for backend operations.
pub type BuildResult<T> = Result<T, BuildError>;

/// Errors a backend can return from `build`, `cancel` or `prune_cache`.
#[derive(Debug, Error)]
pub enum BuildError {
    #[error("build canceled")]
    Canceled,

    #[error("no build context provided")]
    MissingContext,

    #[error("invalid build context: {0}")]
    InvalidContext(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("failed to read build context: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to write progress: {0}")]
    Progress(std::io::Error),

    #[error("{0}")]
    Failed(String),
}

impl BuildError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, BuildError::Canceled)
    }
}

/// Errors loading the daemon configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
