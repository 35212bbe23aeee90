//! Authenticated access to the remote server.
//!
//! All remote traffic of the bridge flows through one [`RemoteSession`]:
//!
//! ```text
//!   fetcher / resolver
//!          │ execute(RemoteCall)
//!          ▼
//!   ┌───────────────────────────────┐
//!   │        SessionManager         │
//!   │  pool permits (FIFO, bounded) │
//!   │  token + generation           │
//!   │  expiry → re-auth → retry ×1  │
//!   └───────────────┬───────────────┘
//!                   │ RemoteServer calls
//!                   ▼
//!            HttpRemote / mocks
//! ```
//!
//! Callers never see the token directly: they either hand a [`RemoteCall`]
//! to [`RemoteSession::execute`], or hold a [`SessionGuard`] while they need
//! a pooled connection.

mod manager;

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::dataset::DatasetId;
use crate::error::RemoteError;
use crate::plane::PlaneKey;
use crate::remote::{Credentials, MetadataResponse};

pub use manager::{SessionGuard, SessionManager};

/// Default number of concurrent remote calls.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Default time a caller waits for a pooled connection.
pub const DEFAULT_POOL_WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on a single remote call.
pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Default idle time after which the session is re-established.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);

/// A request the session can run against the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCall {
    Metadata(DatasetId),
    Plane(PlaneKey),
}

/// Result of a [`RemoteCall`].
#[derive(Debug, Clone)]
pub enum CallOutput {
    Metadata(MetadataResponse),
    Plane(Bytes),
}

impl CallOutput {
    pub fn into_plane(self) -> Result<Bytes, RemoteError> {
        match self {
            CallOutput::Plane(data) => Ok(data),
            CallOutput::Metadata(_) => Err(RemoteError::Malformed(
                "expected plane data, got metadata".to_string(),
            )),
        }
    }

    pub fn into_metadata(self) -> Result<MetadataResponse, RemoteError> {
        match self {
            CallOutput::Metadata(metadata) => Ok(metadata),
            CallOutput::Plane(_) => Err(RemoteError::Malformed(
                "expected metadata, got plane data".to_string(),
            )),
        }
    }
}

/// Lifecycle state of the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    /// No token; the next call logs in
    Disconnected,
    /// A login is in progress
    Connecting,
    /// A token is held and believed valid
    Authenticated,
    /// The server rejected the token, or the session sat idle too long
    Expired,
}

/// Session and pool settings.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub credentials: Credentials,

    /// Maximum concurrent remote calls
    pub pool_size: usize,

    /// Longest wait for a pooled connection
    pub pool_wait_timeout: Duration,

    /// Bound on every remote call, login included
    pub call_timeout: Duration,

    /// Re-authenticate after this long without use
    pub idle_timeout: Option<Duration>,
}

impl SessionConfig {
    /// Settings with default pool and timeout values.
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            pool_size: DEFAULT_POOL_SIZE,
            pool_wait_timeout: DEFAULT_POOL_WAIT_TIMEOUT,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            idle_timeout: Some(DEFAULT_IDLE_TIMEOUT),
        }
    }
}

/// Authenticated, pooled access to a remote server.
///
/// This is the seam the fetcher and resolver depend on, so they can be
/// driven by scripted sessions in tests.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// Take a pooled connection, logging in first if needed.
    async fn acquire(&self) -> Result<SessionGuard, RemoteError>;

    /// Run one call on a pooled connection.
    ///
    /// An expired token is refreshed and the call retried once; anything
    /// else the session cannot recover from is returned as
    /// [`RemoteError::Session`].
    async fn execute(&self, call: RemoteCall) -> Result<CallOutput, RemoteError>;

    /// Return a pooled connection. Dropping the guard does the same.
    fn release(&self, guard: SessionGuard) {
        drop(guard);
    }

    /// Close the session. Safe to call repeatedly or before any login.
    async fn logout(&self);

    fn status(&self) -> SessionStatus;
}
