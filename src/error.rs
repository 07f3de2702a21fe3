use crate::job::JobStatus;
use crate::priority::PriorityError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BatchworkError {
    #[error("Job id exists: {id}")]
    DuplicateJob { id: String },

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("Cannot {action} job {id} in status {status}")]
    InvalidState {
        id: String,
        status: JobStatus,
        action: &'static str,
    },

    #[error("Can only requeue terminal job: {id} is {status}")]
    NotTerminal { id: String, status: JobStatus },

    #[error("Invalid job definition: {message}")]
    InvalidDefinition { message: String },

    #[error("Invalid priority: {0}")]
    InvalidPriority(#[from] PriorityError),

    #[error("Lock held: {key}")]
    LockHeld { key: String },

    #[error("Lease token mismatch for {key}")]
    LeaseMismatch { key: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Persistence error: {message}")]
    Persistence { message: String },

    #[error("Metrics error: {message}")]
    Metrics { message: String },

    #[error("Processing error: {0}")]
    Processing(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl BatchworkError {
    /// The text recorded as a job's `failure_reason` when a work action
    /// returns this error.
    pub fn failure_reason(&self) -> String {
        match self {
            BatchworkError::Processing(message) => message.clone(),
            other => other.to_string(),
        }
    }
}

impl From<toml::de::Error> for BatchworkError {
    fn from(err: toml::de::Error) -> Self {
        BatchworkError::Config(format!("TOML deserialization error: {}", err))
    }
}

impl From<toml::ser::Error> for BatchworkError {
    fn from(err: toml::ser::Error) -> Self {
        BatchworkError::Config(format!("TOML serialization error: {}", err))
    }
}
