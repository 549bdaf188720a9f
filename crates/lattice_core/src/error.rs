use std::time::Duration;

use thiserror::Error;

use crate::types::{DocUrl, ObjectId};

/// Unified error type for lattice core operations
#[derive(Debug, Error)]
pub enum LatticeError {
    // Document lifecycle errors
    #[error("document unavailable: {url}")]
    DocumentUnavailable { url: DocUrl },

    #[error("timed out loading document {url}")]
    LoadTimeout { url: DocUrl },

    #[error("document was deleted: {url}")]
    DocumentDeleted { url: DocUrl },

    #[error("document is not ready")]
    NotReady,

    #[error("space root document is not loaded")]
    RootNotLoaded,

    // Cancellation
    #[error("operation cancelled: scope disposed")]
    Cancelled,

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    // Registry errors
    #[error("object {0} is already registered")]
    DuplicateObject(ObjectId),

    #[error("object {0} is already attached to a document")]
    AlreadyAttached(ObjectId),

    #[error("object {0} has no initialized state")]
    ObjectNotInitialized(ObjectId),

    #[error("object {0} not found")]
    ObjectNotFound(ObjectId),

    // Engine errors
    #[error("storage error: {0}")]
    Storage(String),

    #[error("failed to decode CRDT payload: {0}")]
    Decode(String),

    #[error("relay transport error: {0}")]
    Transport(String),
}

/// Result type alias for lattice core operations
pub type Result<T> = std::result::Result<T, LatticeError>;
