use thiserror::Error;

use crate::transcribe::{EngineError, NormalizeError};

#[derive(Error, Debug)]
pub enum JobError {
    #[error("Database error: {0}")]
    Db(#[from] sqlx::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Normalize(#[from] NormalizeError),
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("Audio file {0} not found")]
    NotFound(i64),
    #[error("Transcription already running for audio file {0}")]
    AlreadyRunning(i64),
    #[error("Invalid job options: {0}")]
    InvalidOptions(String),
    #[error("Progress regression rejected: stored {stored:.4}, attempted {attempted:.4}")]
    ProgressRegression { stored: f64, attempted: f64 },
    #[error("Job run was superseded (cleared, cancelled or taken over)")]
    Superseded,
    #[error("Corrupt checkpoint: {0}")]
    CorruptCheckpoint(String),
    #[error("Worker task failed: {0}")]
    Worker(String),
}

/// How a failed attempt is treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad input; the job fails immediately and is not retried
    Input,
    /// Infrastructure trouble; retried within the recovery budget
    Transient,
    /// Checkpoint unusable; counts as a recovery attempt and restarts from zero
    CorruptCheckpoint,
    /// Another actor owns the record now; the worker just stops
    Superseded,
}

impl JobError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            JobError::Normalize(NormalizeError::Io(_)) => ErrorKind::Transient,
            JobError::Normalize(_) => ErrorKind::Input,
            JobError::Engine(EngineError::Unavailable(_)) => ErrorKind::Input,
            JobError::Engine(_) => ErrorKind::Transient,
            JobError::NotFound(_)
            | JobError::AlreadyRunning(_)
            | JobError::InvalidOptions(_)
            | JobError::ProgressRegression { .. } => ErrorKind::Input,
            JobError::Superseded => ErrorKind::Superseded,
            JobError::CorruptCheckpoint(_) => ErrorKind::CorruptCheckpoint,
            JobError::Db(_) | JobError::Io(_) | JobError::Json(_) | JobError::Worker(_) => {
                ErrorKind::Transient
            }
        }
    }
}

impl From<tokio::task::JoinError> for JobError {
    fn from(e: tokio::task::JoinError) -> Self {
        JobError::Worker(e.to_string())
    }
}
