//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading, resolving or validating configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {message}")]
    Parse { path: PathBuf, message: String },

    #[error("invalid value for '{key}': expected {expected}")]
    InvalidValue { key: String, expected: &'static str },

    #[error("invalid environment override: {0}")]
    Environment(String),

    #[error("vault SSH sign path could not be determined{}", host_suffix(.host))]
    MissingSignPath { host: Option<String> },

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

fn host_suffix(host: &Option<String>) -> String {
    host.as_ref()
        .map(|h| format!(" for host {h}"))
        .unwrap_or_default()
}
