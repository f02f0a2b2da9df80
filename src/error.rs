//! Per-object error taxonomy.
//!
//! Every remote or parsing step of an object's load returns
//! `Result<_, LoadError>`. The variant says whether the fan-out driver may
//! retry the step ([`LoadError::Retryable`]) or must give up on the object
//! ([`LoadError::Fatal`]). Run-level failures (bad config, unreachable
//! warehouse at startup) stay in `anyhow` at the command layer.

use std::fmt;

use thiserror::Error;

/// The pipeline step an error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    List,
    Size,
    Fetch,
    Infer,
    Provision,
    Copy,
    Stamp,
    Record,
    Archive,
    Report,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Step::List => "list",
            Step::Size => "size",
            Step::Fetch => "fetch",
            Step::Infer => "infer",
            Step::Provision => "provision",
            Step::Copy => "copy",
            Step::Stamp => "stamp",
            Step::Record => "record",
            Step::Archive => "archive",
            Step::Report => "report",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Error)]
pub enum LoadError {
    /// Transient failure: network, timeout, throttling, server error, busy database.
    #[error("{step} step failed (retryable): {message}")]
    Retryable { step: Step, message: String },

    /// Permanent failure for this object: malformed content, rejected SQL, auth.
    #[error("{step} step failed: {message}")]
    Fatal { step: Step, message: String },
}

impl LoadError {
    pub fn retryable(step: Step, message: impl Into<String>) -> Self {
        Self::Retryable {
            step,
            message: message.into(),
        }
    }

    pub fn fatal(step: Step, message: impl Into<String>) -> Self {
        Self::Fatal {
            step,
            message: message.into(),
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    pub fn step(&self) -> Step {
        match self {
            Self::Retryable { step, .. } | Self::Fatal { step, .. } => *step,
        }
    }

    /// Classify an HTTP status returned by S3 or the warehouse API.
    ///
    /// 408, 429 and 5xx are retryable; every other status is fatal.
    pub fn from_status(step: Step, status: reqwest::StatusCode, body: &str) -> Self {
        let message = format!(
            "HTTP {}: {}",
            status,
            body.chars().take(500).collect::<String>()
        );
        if status.as_u16() == 408 || status.as_u16() == 429 || status.is_server_error() {
            Self::retryable(step, message)
        } else {
            Self::fatal(step, message)
        }
    }

    /// Classify a transport-level `reqwest` error.
    pub fn from_reqwest(step: Step, err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() || err.is_request() {
            Self::retryable(step, err.to_string())
        } else {
            Self::fatal(step, err.to_string())
        }
    }

    /// Classify a `sqlx` error. SQLite busy/locked conditions are retryable.
    pub fn from_sqlx(step: Step, err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => {
                Self::retryable(step, err.to_string())
            }
            sqlx::Error::Database(db) => {
                let msg = db.message().to_ascii_lowercase();
                if msg.contains("database is locked") || msg.contains("busy") {
                    Self::retryable(step, err.to_string())
                } else {
                    Self::fatal(step, err.to_string())
                }
            }
            _ => Self::fatal(step, err.to_string()),
        }
    }

    /// Classify a local I/O error (filesystem backend).
    pub fn from_io(step: Step, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::Interrupted
            | std::io::ErrorKind::TimedOut
            | std::io::ErrorKind::WouldBlock => Self::retryable(step, err.to_string()),
            _ => Self::fatal(step, err.to_string()),
        }
    }
}
