use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

/// Unified error type for the lease agent.
///
/// Every failure surfaced by the lifecycle manager, the RPC client or the
/// dispatcher is one of these variants. The first seven map one-to-one onto
/// the coded outcomes reported back to remote callers; the remaining variants
/// are local plumbing failures and are reported as [`ErrorKind::Unexpected`].
#[derive(Debug, Error)]
pub enum AgentError {
    /// A request carried a missing or malformed parameter
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Admission control refused a new lease
    #[error("Cluster not ready: {0}")]
    NotReady(String),

    /// A lease for the resource id is already registered
    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    /// No lease is registered for the resource id
    #[error("Resource does not exist: {0}")]
    NotExists(String),

    /// An operation did not complete within its bound
    #[error("Timeout error: {0}")]
    Timeout(String),

    /// The remote side of an RPC call answered with an error payload
    #[error("Remote call error {code}: {message}")]
    CallError { code: i64, message: String },

    /// Errors with the underlying RPC transport
    #[error("Transport error: {0}")]
    Transport(String),

    /// Errors related to configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Errors related to IO operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Errors related to serialization/deserialization
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Anything that does not fit the categories above
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

impl AgentError {
    /// Classify this error into the closed set of reportable kinds.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidParams(_) => ErrorKind::InvalidParams,
            Self::NotReady(_) => ErrorKind::NotReady,
            Self::AlreadyExists(_) => ErrorKind::AlreadyExists,
            Self::NotExists(_) => ErrorKind::NotExists,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::CallError { .. } => ErrorKind::CallError,
            Self::Transport(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Serialization(_)
            | Self::Unexpected(_) => ErrorKind::Unexpected,
        }
    }

    /// Numeric code reported to the response sink
    pub fn code(&self) -> u16 {
        self.kind().code()
    }
}

/// Closed set of error kinds that can be reported to a remote caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    InvalidParams,
    NotReady,
    AlreadyExists,
    NotExists,
    Timeout,
    CallError,
    Unexpected,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 7] = [
        ErrorKind::InvalidParams,
        ErrorKind::NotReady,
        ErrorKind::AlreadyExists,
        ErrorKind::NotExists,
        ErrorKind::Timeout,
        ErrorKind::CallError,
        ErrorKind::Unexpected,
    ];

    /// Wire code for this kind
    pub fn code(&self) -> u16 {
        match self {
            Self::CallError => 7,
            Self::NotExists => 510,
            Self::InvalidParams => 530,
            Self::NotReady => 540,
            Self::AlreadyExists => 550,
            Self::Timeout => 560,
            Self::Unexpected => 600,
        }
    }

    /// User-facing message for this kind
    pub fn message(&self) -> &'static str {
        match self {
            Self::CallError => "failed to call remote method",
            Self::NotExists => "resource does not exist",
            Self::InvalidParams => "invalid parameter",
            Self::NotReady => "cluster is not ready",
            Self::AlreadyExists => "resource already exists",
            Self::Timeout => "operation timed out",
            Self::Unexpected => "unexpected error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message(), self.code())
    }
}

/// Result type alias for operations that can result in an AgentError
pub type AgentResult<T> = Result<T, AgentError>;
