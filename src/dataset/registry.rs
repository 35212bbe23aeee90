//! Registry of open datasets.
//!
//! The registry provides:
//! - LRU retention of open [`DatasetHandle`]s, bounded by a handle count
//! - Single-flight opens, so concurrent first accesses resolve metadata once
//! - Teardown of a handle's cached planes when the viewer releases it
//!
//! # Example
//!
//! ```ignore
//! use omero_bridge::dataset::{DatasetId, DatasetRegistry, HandleConfig};
//!
//! let registry = DatasetRegistry::new(session, HandleConfig::default());
//!
//! // Opens and resolves metadata on first access
//! let handle = registry.get(DatasetId::new(42)).await?;
//! let plane = handle.level(0).unwrap().get(&[0.into(), 0.into(), 2.into()]).await?;
//!
//! // Layer closed in the viewer
//! registry.release(DatasetId::new(42));
//! ```

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::OnceCell;
use tracing::{debug, info};

use crate::error::BridgeError;
use crate::session::RemoteSession;

use super::{DatasetHandle, DatasetId, HandleConfig, MetadataResolver};

/// Default number of datasets kept open.
pub const DEFAULT_MAX_OPEN_DATASETS: usize = 16;

type OpeningCell = Arc<OnceCell<Arc<DatasetHandle>>>;

/// Opens, retains and releases [`DatasetHandle`]s over one session.
pub struct DatasetRegistry {
    session: Arc<dyn RemoteSession>,
    resolver: MetadataResolver,
    config: HandleConfig,

    /// Open handles, least recently used first out
    handles: Mutex<LruCache<DatasetId, Arc<DatasetHandle>>>,

    /// Opens in progress
    opening: Mutex<HashMap<DatasetId, OpeningCell>>,
}

impl DatasetRegistry {
    pub fn new(session: Arc<dyn RemoteSession>, config: HandleConfig) -> Self {
        Self::with_capacity(session, config, DEFAULT_MAX_OPEN_DATASETS)
    }

    /// Create a registry keeping at most `max_open` handles.
    pub fn with_capacity(
        session: Arc<dyn RemoteSession>,
        config: HandleConfig,
        max_open: usize,
    ) -> Self {
        let capacity = NonZeroUsize::new(max_open).unwrap_or(NonZeroUsize::MIN);
        Self {
            resolver: MetadataResolver::new(session.clone()),
            session,
            config,
            handles: Mutex::new(LruCache::new(capacity)),
            opening: Mutex::new(HashMap::new()),
        }
    }

    /// Get the handle of `id`, opening it on first access.
    ///
    /// Concurrent callers share one open. If `id` is released while the
    /// open is in progress, the new handle is returned torn down and is not
    /// retained.
    pub async fn get(&self, id: DatasetId) -> Result<Arc<DatasetHandle>, BridgeError> {
        // Lock order: opening, then handles
        let cell = {
            let mut opening = self.opening.lock();
            if let Some(handle) = self.handles.lock().get(&id) {
                return Ok(handle.clone());
            }
            opening.entry(id).or_default().clone()
        };

        let result = cell
            .get_or_try_init(|| async {
                DatasetHandle::open(id, &self.resolver, &self.config)
                    .await
                    .map(Arc::new)
            })
            .await
            .cloned();

        let mut opening = self.opening.lock();
        let registered = opening.get(&id).is_some_and(|c| Arc::ptr_eq(c, &cell));

        let handle = match result {
            Ok(handle) => handle,
            Err(err) => {
                if registered {
                    opening.remove(&id);
                }
                return Err(err);
            }
        };

        if !registered {
            let published = self
                .handles
                .lock()
                .peek(&id)
                .is_some_and(|h| Arc::ptr_eq(h, &handle));
            drop(opening);

            if !published && !handle.is_torn_down() {
                debug!("Dataset {} was released while opening", id);
                self.resolver.forget(id);
                handle.teardown();
            }
            return Ok(handle);
        }

        let evicted = self.handles.lock().push(id, handle.clone());
        opening.remove(&id);
        drop(opening);

        if let Some((evicted_id, evicted)) = evicted {
            if !Arc::ptr_eq(&evicted, &handle) {
                debug!("Evicting {} from open datasets", evicted_id);
                self.resolver.forget(evicted_id);
                evicted.teardown();
            }
        }

        Ok(handle)
    }

    /// Whether `id` is currently open.
    pub fn contains(&self, id: DatasetId) -> bool {
        self.handles.lock().contains(&id)
    }

    /// Number of open datasets.
    pub fn open_count(&self) -> usize {
        self.handles.lock().len()
    }

    /// Close `id`: drop its handle, cached planes and memoized metadata.
    ///
    /// An open still in progress is abandoned. Returns `false` if `id` was
    /// neither open nor opening.
    pub fn release(&self, id: DatasetId) -> bool {
        let (handle, was_opening) = {
            let mut opening = self.opening.lock();
            let handle = self.handles.lock().pop(&id);
            (handle, opening.remove(&id).is_some())
        };
        self.resolver.forget(id);

        match handle {
            Some(handle) => {
                handle.teardown();
                true
            }
            None => was_opening,
        }
    }

    /// Release every dataset and log out of the session.
    pub async fn close(&self) {
        let handles: Vec<(DatasetId, Arc<DatasetHandle>)> = {
            let mut opening = self.opening.lock();
            let mut handles = self.handles.lock();
            let mut drained = Vec::with_capacity(handles.len());
            while let Some(entry) = handles.pop_lru() {
                drained.push(entry);
            }
            opening.clear();
            drained
        };

        info!("Closing {} open dataset(s)", handles.len());
        for (id, handle) in handles {
            self.resolver.forget(id);
            handle.teardown();
        }

        self.session.logout().await;
    }

    pub fn resolver(&self) -> &MetadataResolver {
        &self.resolver
    }

    pub fn session(&self) -> &Arc<dyn RemoteSession> {
        &self.session
    }
}
