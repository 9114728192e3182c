//! Error types for the sampler and its collaborators.

use std::path::PathBuf;

/// Failure to capture raw stats for one tick.
#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    /// A procfs (or other OS) file could not be read.
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A value read from the OS did not have the expected shape.
    #[error("failed to parse {path}: {detail}")]
    Parse { path: String, detail: String },

    /// Provider-specific failure that does not fit the variants above.
    #[error("{0}")]
    Other(String),
}

/// Errors surfaced by [`crate::Sampler`] lifecycle calls.
#[derive(Debug, thiserror::Error)]
pub enum SamplerError {
    /// `start()` was called outside a tokio runtime.
    #[error("sampler must be started from within a tokio runtime")]
    NoRuntime,
}

/// Invalid or unreadable configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid config: {0}")]
    Invalid(String),
}
