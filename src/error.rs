//! # Fabric Error Taxonomy
//!
//! Every failure the fabric can surface to user code is an explicit variant
//! of [`FabricError`]. Blocking operations return `Err`; the non-throwing
//! `try_*` forms log the error and report failure through their return value
//! instead. Worker threads (directory publisher, subscriber refresh, callback
//! loops) never propagate: they log and continue.

use crate::serialization::CodecError;
use thiserror::Error;

/// Result alias used throughout the fabric.
pub type FabricResult<T> = std::result::Result<T, FabricError>;

/// Errors raised by the fabric core.
#[derive(Debug, Error)]
pub enum FabricError {
    /// Deadline exceeded on a push/pop/send/receive.
    #[error("{name}: unable to {operation} within timeout period ({timeout_ms} ms)")]
    TimeoutExpired {
        name: String,
        operation: &'static str,
        timeout_ms: u128,
    },

    /// No preconfigured nor directory match for a connection lookup.
    #[error("connection with uid {uid} and data type {data_type} not found")]
    ConnectionNotFound { uid: String, data_type: String },

    /// Multiple matches where exactly one peer is required.
    #[error("multiple instances of name {0} exist")]
    NameCollision(String),

    /// A typed handle or queue was requested with the wrong element type.
    #[error("requested {name} as type '{requested}' but it is bound to type '{bound}'")]
    TypeMismatch {
        name: String,
        requested: String,
        bound: String,
    },

    /// Direct receive on a receiver that has an active callback.
    #[error("receiver for {0} is equipped with a callback; direct receive is not allowed")]
    CallbackConflict(String),

    /// A queue declared for one session was requested from another.
    #[error("queue {queue} belongs to session '{queue_session}' but was requested from session '{caller_session}'")]
    CrossSession {
        queue: String,
        queue_session: String,
        caller_session: String,
    },

    /// Double configure of a process-wide singleton.
    #[error("{0} has already been configured")]
    AlreadyConfigured(&'static str),

    /// Directory lookup failed (HTTP error or unreachable server).
    #[error("failed to look up {uid_regex} at {target}: {reason}")]
    LookupFailed {
        uid_regex: String,
        target: String,
        reason: String,
    },

    /// Directory publish failed.
    #[error("failed to publish connections: {0}")]
    PublishFailed(String),

    /// Directory retract failed.
    #[error("failed to retract {what}: {reason}")]
    RetractFailed { what: String, reason: String },

    /// A queue catalog entry carries an unknown variant tag.
    #[error("queue type \"{0}\" is unknown")]
    QueueTypeUnknown(String),

    /// Requested queue is not in the catalog.
    #[error("requested queue \"{name}\" of type '{data_type}' could not be found")]
    QueueNotFound { name: String, data_type: String },

    /// A handle exists but its backing transport instance does not (yet).
    #[error("connection instance not found for name {0}")]
    InstanceNotFound(String),

    /// A required environment variable is not set.
    #[error("environment variable {0} is not set")]
    EnvNotFound(&'static str),

    /// Serialization gate: encoding/decoding failed or the type is not
    /// serializable at all.
    #[error(transparent)]
    Codec(#[from] CodecError),

    /// Catch-all for internal invariant violations surfaced to the caller.
    #[error("{0}")]
    OperationFailed(String),
}

// Transport errors that reach the caller without the models' explicit
// timeout handling are connect/configuration failures.
impl From<crate::network::transport::TransportError> for FabricError {
    fn from(e: crate::network::transport::TransportError) -> Self {
        FabricError::OperationFailed(e.to_string())
    }
}

impl FabricError {
    /// Convenience constructor for the common timeout case.
    pub fn timeout(name: impl Into<String>, operation: &'static str, timeout_ms: u128) -> Self {
        FabricError::TimeoutExpired {
            name: name.into(),
            operation,
            timeout_ms,
        }
    }

    /// True when the error is a deadline expiry (any layer).
    pub fn is_timeout(&self) -> bool {
        matches!(self, FabricError::TimeoutExpired { .. })
    }
}
