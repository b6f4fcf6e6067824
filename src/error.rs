use thiserror::Error;
use wa_transport::TransportError;

use crate::flow::execution::ExecutionStatus;
use crate::node::NodeError;

/// Errors surfaced by the persistence traits in [`crate::store`].
#[derive(Debug, Clone, Error, PartialEq)]
pub enum StoreError {
    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound { entity, id: id.into() }
    }
}

#[derive(Debug, Error)]
pub enum FlowError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Node(#[from] NodeError),

    #[error("invalid execution transition from {from} to {to}")]
    InvalidTransition { from: ExecutionStatus, to: ExecutionStatus },

    #[error("{entity} `{id}` not found")]
    NotFound { entity: &'static str, id: String },

    #[error("step limit of {0} nodes exceeded in a single walk")]
    StepLimit(usize),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl FlowError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        FlowError::NotFound { entity, id: id.into() }
    }
}
