//! Link error types
//!
//! Protocol-time failures surfaced to callers of the [`Link`](crate::Link)
//! operations. Handler failures during dispatch never show up here; those are
//! reported through a [`DispatchReporter`](crate::DispatchReporter).

use thiserror::Error;

use crate::state_machine::{LinkState, Operation};

/// Errors returned by link operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum LinkError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Authority error: {0}")]
    Authority(String),

    #[error("{operation} not permitted while {state}")]
    InvalidState { operation: Operation, state: LinkState },

    #[error("Vehicle rejected {operation}: {reason}")]
    Rejected { operation: Operation, reason: String },

    #[error("Transport error: {0}")]
    Transport(String),
}

/// Coarse classification of a [`LinkError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Connection,
    Authority,
    /// Operation attempted in the wrong link state, or refused by the vehicle
    State,
    Transport,
}

impl LinkError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            LinkError::Connection(_) => ErrorKind::Connection,
            LinkError::Authority(_) => ErrorKind::Authority,
            LinkError::InvalidState { .. } | LinkError::Rejected { .. } => ErrorKind::State,
            LinkError::Transport(_) => ErrorKind::Transport,
        }
    }

    pub fn is_state_error(&self) -> bool {
        self.kind() == ErrorKind::State
    }

    pub fn rejected(operation: Operation, reason: impl Into<String>) -> Self {
        LinkError::Rejected {
            operation,
            reason: reason.into(),
        }
    }
}
