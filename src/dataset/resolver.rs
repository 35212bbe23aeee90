use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::{BridgeError, RemoteError};
use crate::session::{RemoteCall, RemoteSession};

use super::{DatasetId, ImageMetadata};

type MetadataCell = Arc<OnceCell<Arc<ImageMetadata>>>;

/// Fetches and memoizes image metadata.
///
/// Each id is resolved at most once per resolver while it succeeds:
/// concurrent first calls wait on the same cell and share one remote call.
/// Failures are not memoized, so a later call tries again.
pub struct MetadataResolver {
    session: Arc<dyn RemoteSession>,
    resolved: Mutex<HashMap<DatasetId, MetadataCell>>,
}

impl MetadataResolver {
    pub fn new(session: Arc<dyn RemoteSession>) -> Self {
        Self {
            session,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Return the validated metadata of `id`, fetching it on first use.
    ///
    /// # Errors
    ///
    /// - [`BridgeError::DatasetNotFound`] if the image is missing or not readable
    /// - [`BridgeError::Metadata`] if the server describes inconsistent geometry
    /// - [`BridgeError::Session`] / [`BridgeError::Timeout`] if the session
    ///   cannot carry the call
    pub async fn resolve(&self, id: DatasetId) -> Result<Arc<ImageMetadata>, BridgeError> {
        let cell = self.resolved.lock().entry(id).or_default().clone();

        cell.get_or_try_init(|| async {
            debug!("Resolving metadata of {}", id);
            let response = self
                .session
                .execute(RemoteCall::Metadata(id))
                .await
                .and_then(|output| output.into_metadata())
                .map_err(|err| classify_failure(id, err))?;

            let metadata = ImageMetadata::from_response(id, response)?;
            info!(
                "Resolved {} ({:?}): shape {:?}, {}, {} level(s)",
                id,
                metadata.name,
                metadata.shape(),
                metadata.pixel_type,
                metadata.level_count()
            );
            Ok::<_, BridgeError>(Arc::new(metadata))
        })
        .await
        .cloned()
    }

    /// Return memoized metadata without contacting the server.
    pub fn cached(&self, id: DatasetId) -> Option<Arc<ImageMetadata>> {
        self.resolved
            .lock()
            .get(&id)
            .and_then(|cell| cell.get().cloned())
    }

    /// Drop the memoized metadata of `id`.
    pub fn forget(&self, id: DatasetId) -> bool {
        self.resolved.lock().remove(&id).is_some()
    }

    pub fn session(&self) -> &Arc<dyn RemoteSession> {
        &self.session
    }
}

fn classify_failure(id: DatasetId, err: RemoteError) -> BridgeError {
    match err {
        RemoteError::NotFound(_) | RemoteError::Forbidden(_) => BridgeError::DatasetNotFound(id),
        RemoteError::Malformed(message) => BridgeError::Metadata(message),
        RemoteError::PoolTimeout { waited } => BridgeError::Timeout {
            operation: "a pooled connection",
            waited,
        },
        RemoteError::Expired => BridgeError::Session("session expired".to_string()),
        RemoteError::Unauthorized(message)
        | RemoteError::Transient(message)
        | RemoteError::Session(message) => BridgeError::Session(message),
    }
}
