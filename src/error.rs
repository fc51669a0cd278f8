use std::time::Duration;
use thiserror::Error;

/// Failures of the serial byte channel.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("no complete line within {0:?}")]
    Timeout(Duration),
    #[error("port is not open")]
    Closed,
    #[error("unsupported baud rate {0}")]
    BaudRate(u32),
    #[error("serial io: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures talking to the reference time daemon.
#[derive(Debug, Error)]
pub enum SourceError {
    #[error("command `{command}` failed: {message}")]
    Command { command: String, message: String },
    #[error("peer {0} is not listed by the reference daemon")]
    PeerNotListed(String),
    #[error("peer {peer}: field `{field}` missing or unparsable")]
    Field { peer: String, field: &'static str },
}

impl SourceError {
    pub fn command(command: impl Into<String>, message: impl ToString) -> Self {
        Self::Command {
            command: command.into(),
            message: message.to_string(),
        }
    }
}

/// Failures of the persisted sync state file.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("state file io: {0}")]
    Io(#[from] std::io::Error),
    #[error("state file is corrupt: {0}")]
    Json(#[from] serde_json::Error),
}

/// Failures while applying a frequency trim.
#[derive(Debug, Error)]
pub enum CompensatorError {
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    State(#[from] StateError),
}

/// Outcome of the health state machine that the caller has to act on.
///
/// Only `Fatal` is meant to end the process; the other variants are
/// infrastructure failures the outer loop may retry.
#[derive(Debug, Error)]
pub enum RecoveryError {
    #[error("recovery budget exhausted: {0}")]
    Fatal(String),
    #[error(transparent)]
    Link(#[from] LinkError),
    #[error(transparent)]
    Source(#[from] SourceError),
    #[error(transparent)]
    Compensator(#[from] CompensatorError),
    #[error(transparent)]
    State(#[from] StateError),
}

impl RecoveryError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, RecoveryError::Fatal(_))
    }
}
