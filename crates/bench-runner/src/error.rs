use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, BenchError>;

/// Errors that stop the matrix. A run whose output lacks the success marker is
/// not an error; it is reported as a failed outcome and the loop continues.
/// `Spawn` is returned by executors and recorded by the run loop the same way.
#[derive(Debug, Error)]
pub enum BenchError {
    #[error("config error ({key}): {message}")]
    Config { key: String, message: String },

    #[error("failed to parse config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error(
        "override for mode={mode} sf={scale} has {len} entries but query {query} sits at index {index}"
    )]
    MissingOverride {
        mode: String,
        scale: u32,
        query: String,
        index: usize,
        len: usize,
    },

    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to relay output of {program}: {source}")]
    Relay {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl BenchError {
    pub fn config(key: impl Into<String>, message: impl Into<String>) -> Self {
        BenchError::Config {
            key: key.into(),
            message: message.into(),
        }
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BenchError::Io {
            path: path.into(),
            source,
        }
    }

    /// Configuration problems are detected before any combination runs.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            BenchError::Config { .. }
                | BenchError::ConfigParse { .. }
                | BenchError::MissingOverride { .. }
        )
    }

    pub fn code(&self) -> &'static str {
        match self {
            BenchError::Config { .. } | BenchError::ConfigParse { .. } => "config_error",
            BenchError::MissingOverride { .. } => "missing_override",
            BenchError::Io { .. } => "io_error",
            BenchError::Spawn { .. } => "spawn_failed",
            BenchError::Relay { .. } => "relay_failed",
        }
    }
}
