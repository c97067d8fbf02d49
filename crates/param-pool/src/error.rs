//! Error types for parameter pools

use thiserror::Error;

/// Parameter pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    /// Filesystem failure in the persistence layer
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A persisted entry could not be encoded or decoded
    #[error("Invalid entry format: {0}")]
    InvalidFormat(String),

    /// The pool queue has no producers left
    #[error("Pool closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, PoolError>;
