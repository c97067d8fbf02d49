//! Error types for DKG execution

use crate::group::MemberIndex;
use crate::tss::TssError;
use thiserror::Error;

/// Result type alias for DKG operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort a DKG session.
///
/// Nothing inside a session is retried; retrying a whole attempt is up to the
/// caller.
#[derive(Debug, Error)]
pub enum Error {
    /// No pre-parameters could be obtained for the session
    #[error("failed fetching pre-params: [{0}]")]
    PreParamsUnavailable(String),

    /// Session parameters are unusable
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// A round did not produce its output before the round deadline
    #[error("{0}")]
    Timeout(String),

    /// An inbound message failed validation
    #[error("{0}")]
    InvalidMessage(String),

    /// Some members did not deliver a required message
    #[error("inactive members detected")]
    InactiveMembers { members: Vec<MemberIndex> },

    /// The result signer failed
    #[error("failed to sign DKG result [{0}]")]
    Signing(String),

    /// The result submitter failed
    #[error("failed to submit DKG result [{0}]")]
    Submission(String),

    /// The TSS keygen party rejected an input
    #[error("{context}: [{source}]")]
    Tss {
        context: String,
        #[source]
        source: TssError,
    },

    /// Cryptographic operation failed
    #[error("Cryptographic error: {0}")]
    Crypto(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Deserialization error
    #[error("Deserialization error: {0}")]
    Deserialization(String),

    /// Broadcast channel failure
    #[error("Channel error: {0}")]
    Channel(String),

    /// Pre-parameters pool failure
    #[error("Pool error: {0}")]
    Pool(#[from] param_pool::PoolError),

    /// Block counter failure
    #[error("Block counter error: {0}")]
    BlockCounter(String),

    /// The state machine stopped somewhere other than the final DKG state
    #[error("execution ended on state: {0}")]
    UnexpectedFinalState(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub(crate) fn tss(context: impl Into<String>, source: TssError) -> Self {
        Error::Tss {
            context: context.into(),
            source,
        }
    }
}

impl From<bincode::error::EncodeError> for Error {
    fn from(e: bincode::error::EncodeError) -> Self {
        Error::Serialization(e.to_string())
    }
}

impl From<bincode::error::DecodeError> for Error {
    fn from(e: bincode::error::DecodeError) -> Self {
        Error::Deserialization(e.to_string())
    }
}
