//! Error types for the session engine
//!
//! Every fallible public operation returns [`SessionResult`]. Errors are
//! classified into four kinds via [`SessionError::kind`]; none of them is
//! fatal to the process.

use crate::profile::PersistenceError;
use crate::session::ConnectionState;
use std::time::Duration;
use thiserror::Error;

/// Main error type for registry and session operations
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Cannot {operation} while {state}")]
    InvalidState {
        operation: &'static str,
        state: ConnectionState,
    },

    #[error("Already subscribed to {topic}")]
    DuplicateSubscription { topic: String },

    #[error("Not subscribed to {topic}")]
    UnknownSubscription { topic: String },

    #[error("Invalid topic {topic:?}: {reason}")]
    InvalidTopic { topic: String, reason: String },

    #[error("Profile {id} already exists")]
    DuplicateProfile { id: String },

    #[error("No profile with id {id}")]
    NotFound { id: String },

    #[error("Persistence error: {0}")]
    Persistence(#[from] PersistenceError),

    #[error("Session worker is no longer running")]
    WorkerUnavailable,

    #[error("Timed out after {timeout:?} waiting for {expected} (currently {state})")]
    Timeout {
        expected: ConnectionState,
        state: ConnectionState,
        timeout: Duration,
    },
}

/// Coarse classification used by callers to decide how to surface an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Command rejected synchronously with no side effect
    PreconditionViolation,
    NotFound,
    Persistence,
    /// Network-level failure surfaced through the worker
    TransportFailure,
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::InvalidState { .. }
            | SessionError::DuplicateSubscription { .. }
            | SessionError::UnknownSubscription { .. }
            | SessionError::InvalidTopic { .. }
            | SessionError::DuplicateProfile { .. } => ErrorKind::PreconditionViolation,
            SessionError::NotFound { .. } => ErrorKind::NotFound,
            SessionError::Persistence(_) => ErrorKind::Persistence,
            SessionError::WorkerUnavailable | SessionError::Timeout { .. } => {
                ErrorKind::TransportFailure
            }
        }
    }

    /// Create invalid state error
    pub fn invalid_state(operation: &'static str, state: ConnectionState) -> Self {
        Self::InvalidState { operation, state }
    }

    /// Create invalid topic error
    pub fn invalid_topic<S: Into<String>, R: ToString>(topic: S, reason: R) -> Self {
        Self::InvalidTopic {
            topic: topic.into(),
            reason: reason.to_string(),
        }
    }

    /// Create not found error
    pub fn not_found<S: Into<String>>(id: S) -> Self {
        Self::NotFound { id: id.into() }
    }
}

/// Result type for session engine operations
pub type SessionResult<T> = Result<T, SessionError>;
