//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    // ─────────────────────────────────────────────────────────────────────────
    // Validation
    // ─────────────────────────────────────────────────────────────────────────
    #[error("unsupported schema version {version}, expected 1")]
    UnsupportedSchemaVersion { version: u32 },

    /// The registration topic name is blank.
    #[error("registry.topic must not be empty")]
    EmptyRegistryTopic,

    /// A count that must be positive is zero.
    #[error("{field} must be greater than zero")]
    ZeroValue { field: &'static str },

    /// A timeout or interval is zero.
    #[error("{field} must be a positive duration")]
    ZeroDuration { field: &'static str },

    /// The sweep interval exceeds the response timeout.
    #[error(
        "correlation.sweep_interval ({sweep_ms}ms) must not exceed correlation.response_timeout ({timeout_ms}ms)"
    )]
    SweepIntervalTooLarge { sweep_ms: u128, timeout_ms: u128 },

    /// `${VAR}` without a default and `VAR` unset.
    #[error("environment variable '{var}' is referenced but not set")]
    MissingEnvVar { var: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Reading the file
    // ─────────────────────────────────────────────────────────────────────────
    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_saphyr::Error),

    #[error("cannot read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// No file at the explicit path, or at any default location.
    #[error("no configuration file at {searched:?}")]
    ConfigFileNotFound { searched: Vec<PathBuf> },

    #[error("configuration file is empty")]
    EmptyConfigFile,
}
