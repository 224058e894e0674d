use std::path::PathBuf;
use thiserror::Error;

/// Failures of a single remote operation (connect, stat, mkdir, upload).
#[derive(Error, Debug)]
pub enum TransferError {
    #[error("SSH error: {0}")]
    Ssh(#[from] ssh2::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("authentication failed for {username}@{host}: {reason}")]
    Authentication {
        host: String,
        username: String,
        reason: String,
    },

    #[error("private key file not found: {}", .0.display())]
    KeyFileMissing(PathBuf),

    #[error("no live session")]
    NotConnected,

    #[error("{0}")]
    Remote(String),
}

/// Why a single sync attempt did not succeed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttemptError {
    #[error("source path does not exist: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("could not connect to {0}")]
    Connect(String),

    #[error("sync incomplete: {failed} of {total} files failed")]
    FilesFailed { failed: usize, total: usize },

    #[error("attempt aborted: {0}")]
    Panicked(String),
}

impl AttemptError {
    /// Transient failures are worth another attempt; local precondition
    /// failures are not.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, AttemptError::SourceMissing(_))
    }
}

/// Errors that end an execution before any attempt is made.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ExecutionError {
    #[error("task not configured: {0}")]
    TaskNotFound(String),

    #[error("target server not configured: {server} (task {task})")]
    ServerNotFound { task: String, server: String },

    #[error("invalid credential for server {server}: {reason}")]
    Credential { server: String, reason: String },

    #[error("task {0} is already running")]
    AlreadyRunning(String),

    #[error("task {0} allows no attempts (retry_times is 0)")]
    NoAttempts(String),
}

/// Schedule expression parse failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScheduleError {
    #[error("empty schedule expression")]
    Empty,

    #[error("unsupported schedule expression: {0}")]
    Unsupported(String),

    #[error("invalid minute interval: {0}")]
    InvalidInterval(String),

    #[error("invalid time of day: {0}")]
    InvalidTime(String),

    #[error("invalid weekday (expected 0-6): {0}")]
    InvalidWeekday(String),

    #[error("invalid hour window: {0}")]
    InvalidWindow(String),
}
