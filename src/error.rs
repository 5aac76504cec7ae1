use std::fmt;

use thiserror::Error;

/// Build output of a program for one device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildLog {
    pub device: String,
    pub log: String,
}

impl fmt::Display for BuildLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.device, self.log)
    }
}

#[derive(Debug, Error)]
pub enum Error {
    /// Invalid platform index, or no usable device left on the platform.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Device code failed to build on at least one device.
    #[error("failed to build program `{program}` ({} device logs)", logs.len())]
    Compile { program: String, logs: Vec<BuildLog> },

    /// The caller broke an operation's contract; raised before any device work.
    #[error("usage error: {0}")]
    Usage(String),

    /// Failure surfaced by the compute runtime while executing commands.
    #[error("device runtime error: {0}")]
    DeviceRuntime(String),

    /// Singular or ill-conditioned system, or a degenerate variogram fit.
    #[error("numerical instability: {0}")]
    NumericalInstability(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl From<rayon::ThreadPoolBuildError> for Error {
    fn from(value: rayon::ThreadPoolBuildError) -> Self {
        Error::DeviceRuntime(format!("unable to build worker pool: {}", value))
    }
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(value: std::sync::PoisonError<T>) -> Self {
        Error::DeviceRuntime(format!("lock poisoned: {}", value))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
