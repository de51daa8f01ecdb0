//! Error taxonomy for the execution engine.
//!
//! Each failure is caught at the smallest unit it concerns and recorded as
//! state (on an execution record or a job); these types describe it.

use thiserror::Error;
use uuid::Uuid;

use crate::model::{CapturedResponse, ExecutionStatus};
use crate::queue::{JobKind, QueueName};

/// A job payload rejected before dispatch.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("malformed job payload: {0}")]
    Malformed(String),
    #[error("job kind '{kind}' is not handled by queue '{queue}'")]
    WrongQueue { kind: JobKind, queue: QueueName },
    #[error("unknown queue '{0}'")]
    UnknownQueue(String),
    #[error("test id must not be empty")]
    EmptyTestId,
    #[error("{field} must not be empty")]
    EmptyField { field: &'static str },
}

/// A failed outbound call.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// The call exceeded its configured deadline.
    #[error("request timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },
    /// Any other transport or protocol failure.
    #[error("{message}")]
    Transport {
        message: String,
        code: String,
        /// Whatever part of the response arrived before the failure.
        partial: Option<Box<CapturedResponse>>,
    },
}

impl NetworkError {
    /// An HTTP status of 400 or above, keeping the response that carried it.
    pub fn from_status(response: CapturedResponse) -> Self {
        NetworkError::Transport {
            message: format!("request failed with status code {}", response.status_code),
            code: format!("HTTP_{}", response.status_code),
            partial: Some(Box::new(response)),
        }
    }

    pub fn code(&self) -> &str {
        match self {
            NetworkError::Timeout { .. } => "TIMEOUT",
            NetworkError::Transport { code, .. } => code,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue '{0}' does not exist")]
    UnknownQueue(QueueName),
    #[error("queue '{0}' already exists")]
    QueueExists(QueueName),
    #[error("job {id} not found in queue '{queue}'")]
    JobNotFound { queue: QueueName, id: Uuid },
    #[error("job {id} in queue '{queue}' is active and cannot be removed")]
    JobActive { queue: QueueName, id: Uuid },
    #[error("queue manager is shut down")]
    ShutDown,
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// A periodic task tick that returned an error or panicked.
#[derive(Debug, Error)]
#[error("periodic task '{task}' failed: {reason}")]
pub struct SchedulerTaskError {
    pub task: String,
    pub reason: String,
}

/// Subscriber handshake rejected.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum NotifierAuthError {
    #[error("no credential presented")]
    MissingToken,
    #[error("malformed credential: {0}")]
    Malformed(String),
    #[error("credential signature is invalid")]
    BadSignature,
    #[error("credential expired")]
    Expired,
}

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("execution {execution_id} is already finalized as {status}")]
    AlreadyFinalized {
        execution_id: Uuid,
        status: ExecutionStatus,
    },
    #[error("execution {execution_id} cannot be finalized as running")]
    NotTerminal { execution_id: Uuid },
}
