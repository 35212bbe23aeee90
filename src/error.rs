use std::time::Duration;

use thiserror::Error;

use crate::dataset::{Axis, DatasetId};
use crate::plane::PlaneKey;

/// Errors classified at the remote server boundary.
///
/// `Unauthorized` and `Expired` never leave the session manager: it either
/// recovers from them or reports a [`RemoteError::Session`] instead.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RemoteError {
    /// Credentials were rejected during login
    #[error("authentication rejected: {0}")]
    Unauthorized(String),

    /// The session token is no longer accepted by the server
    #[error("session token expired")]
    Expired,

    /// Object does not exist on the server
    #[error("not found: {0}")]
    NotFound(String),

    /// Object exists but the session may not read it
    #[error("permission denied: {0}")]
    Forbidden(String),

    /// Network, timeout or server-side failure worth retrying
    #[error("transient error: {0}")]
    Transient(String),

    /// Response could not be decoded or had the wrong size
    #[error("malformed response: {0}")]
    Malformed(String),

    /// No pooled connection became available in time
    #[error("no connection available after waiting {waited:?}")]
    PoolTimeout { waited: Duration },

    /// The session could not be established or re-established
    #[error("session failure: {0}")]
    Session(String),
}

impl RemoteError {
    /// Whether a retry of the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, RemoteError::Transient(_))
    }
}

/// Errors surfaced to users of the array bridge.
#[derive(Debug, Clone, Error)]
pub enum BridgeError {
    /// Authentication or connection failure after the session manager's retry
    #[error("session error: {0}")]
    Session(String),

    /// The image does not exist or the session lacks permission to read it
    #[error("dataset not found: {0}")]
    DatasetNotFound(DatasetId),

    /// The server described an image with inconsistent geometry
    #[error("invalid metadata: {0}")]
    Metadata(String),

    /// A plane could not be fetched within the retry budget
    #[error("failed to fetch {key}: {source}")]
    Fetch {
        key: PlaneKey,
        #[source]
        source: RemoteError,
    },

    /// A bounded wait expired
    #[error("timed out after {waited:?} waiting for {operation}")]
    Timeout {
        operation: &'static str,
        waited: Duration,
    },

    /// Index outside the extent of an axis
    #[error("index {index} is out of bounds for axis {axis} with size {bound}")]
    Index { axis: Axis, index: i64, bound: usize },

    /// More indices than the array has axes
    #[error("too many indices: {given} given for an array of {ndim} dimensions")]
    TooManyIndices { given: usize, ndim: usize },

    /// Indexing form the array view does not implement
    #[error("unsupported index: {0}")]
    UnsupportedIndex(String),

    /// The dataset was released; its views no longer read
    #[error("dataset {0} has been closed")]
    Closed(DatasetId),
}

impl BridgeError {
    /// Whether this error reports misuse of the array interface.
    pub fn is_index_error(&self) -> bool {
        matches!(
            self,
            BridgeError::Index { .. } | BridgeError::TooManyIndices { .. }
        )
    }
}
