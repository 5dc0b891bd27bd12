//! Error types for service definition loading.

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for configuration operations.
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Errors raised while loading or validating a service definition.
///
/// Every variant is fatal at startup: the supervisor refuses to run with a
/// health check it cannot interpret.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse service definition: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("failed to render service definition: {0}")]
    Render(#[from] toml::ser::Error),

    #[error("invalid duration for `{field}`: {value:?}")]
    InvalidDuration { field: &'static str, value: String },

    #[error("invalid health check url {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("invalid port mapping {0:?} (expected HOST:CONTAINER)")]
    InvalidPort(String),

    #[error("invalid volume mount {0:?} (expected HOST:CONTAINER[:ro|rw])")]
    InvalidVolume(String),

    #[error("unknown restart policy {0:?}")]
    UnknownRestartPolicy(String),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}
