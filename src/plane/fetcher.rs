//! Plane fetcher with bounded exponential backoff.
//!
//! The fetcher turns a [`PlaneKey`] into exactly one remote call per attempt.
//! It never caches: the same key always asks the server for the same region,
//! which is what lets the [`PlaneCache`](super::PlaneCache) share and retry
//! fetches freely.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::dataset::ImageMetadata;
use crate::error::{BridgeError, RemoteError};
use crate::session::{RemoteCall, RemoteSession};

use super::PlaneKey;

/// Default number of attempts per plane, including the first.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 4;

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Default upper bound on the delay between retries.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(2);

/// Retry schedule for transient failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,

    /// Delay before the first retry
    pub initial_backoff: Duration,

    /// Cap on the doubling delay
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// A policy that tries once and never waits.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay before retry number `retry` (1 for the first retry).
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(31);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

/// Fetches single planes or tiles of one image through a session.
///
/// Cloning is cheap; clones share the session and metadata.
#[derive(Clone)]
pub struct PlaneFetcher {
    session: Arc<dyn RemoteSession>,
    metadata: Arc<ImageMetadata>,
    retry: RetryPolicy,
}

impl PlaneFetcher {
    pub fn new(
        session: Arc<dyn RemoteSession>,
        metadata: Arc<ImageMetadata>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            session,
            metadata,
            retry,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Fetch the pixels for `key`.
    ///
    /// Returns a dense buffer of `height * width * bytes_per_pixel` bytes.
    /// Transient failures are retried per the [`RetryPolicy`]; the last
    /// failure is reported as [`BridgeError::Fetch`].
    pub async fn fetch(&self, key: &PlaneKey) -> Result<Bytes, BridgeError> {
        let expected = self.metadata.expected_bytes(key)?;
        let attempts = self.retry.max_attempts.max(1);
        let mut attempt = 1;

        loop {
            debug!("Fetching {} (attempt {}/{})", key, attempt, attempts);

            let result = self
                .session
                .execute(RemoteCall::Plane(*key))
                .await
                .and_then(|output| output.into_plane());

            let err = match result {
                Ok(data) if data.len() == expected => return Ok(data),
                Ok(data) => RemoteError::Malformed(format!(
                    "expected {expected} bytes, got {}",
                    data.len()
                )),
                Err(err) => err,
            };

            if !err.is_transient() || attempt >= attempts {
                return Err(classify_failure(*key, err));
            }

            let delay = self.retry.backoff(attempt);
            warn!(
                "Transient failure fetching {}: {} (retrying in {:?})",
                key, err, delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

fn classify_failure(key: PlaneKey, err: RemoteError) -> BridgeError {
    match err {
        RemoteError::Session(message) => BridgeError::Session(message),
        RemoteError::Unauthorized(message) => BridgeError::Session(message),
        RemoteError::PoolTimeout { waited } => BridgeError::Timeout {
            operation: "a pooled connection",
            waited,
        },
        source => BridgeError::Fetch { key, source },
    }
}

// =============================================================================
// Tests
// =============================================================================
