use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info};

use crate::error::BridgeError;
use crate::plane::{CacheConfig, PlaneCache, PlaneFetcher, RetryPolicy};
use crate::session::RemoteSession;
use crate::view::{AxisIndex, LazyArrayView, PyramidSelector};

use super::{Axis, DatasetId, ImageMetadata, MetadataResolver, PyramidLevel};

/// Settings applied to every handle a registry opens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandleConfig {
    pub cache: CacheConfig,
    pub retry: RetryPolicy,
}

/// How one channel should be presented as a viewer layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelLayer {
    pub index: usize,
    pub name: String,

    /// RGB color the colormap ramps to from black
    pub color: [u8; 3],

    pub visible: bool,

    /// Rendering window (start, end)
    pub contrast_limits: Option<(f64, f64)>,

    /// Range the window may be moved within (min, max)
    pub contrast_range: Option<(f64, f64)>,
}

/// One open remote image: its metadata, plane cache and per-level views.
///
/// The handle owns its cache, so tearing it down releases that image's
/// planes without touching other images. Views of a torn-down handle refuse
/// to read. Dropping the handle tears it down.
pub struct DatasetHandle {
    metadata: Arc<ImageMetadata>,
    cache: PlaneCache,
    selector: PyramidSelector,
    levels: Vec<LazyArrayView>,
    torn_down: Arc<AtomicBool>,
}

impl DatasetHandle {
    /// Resolve the metadata of `id` and build its views.
    pub async fn open(
        id: DatasetId,
        resolver: &MetadataResolver,
        config: &HandleConfig,
    ) -> Result<Self, BridgeError> {
        let metadata = resolver.resolve(id).await?;
        Self::from_metadata(metadata, resolver.session().clone(), config)
    }

    /// Build a handle around already resolved metadata.
    pub fn from_metadata(
        metadata: Arc<ImageMetadata>,
        session: Arc<dyn RemoteSession>,
        config: &HandleConfig,
    ) -> Result<Self, BridgeError> {
        let cache = PlaneCache::new(config.cache);
        let fetcher = PlaneFetcher::new(session, metadata.clone(), config.retry);
        let torn_down = Arc::new(AtomicBool::new(false));

        let levels = (0..metadata.level_count())
            .map(|level| {
                LazyArrayView::new(metadata.clone(), level, cache.clone(), fetcher.clone())
                    .map(|view| view.with_closed_flag(torn_down.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;

        info!(
            "Opened {} with {} level(s), cache budget {} bytes",
            metadata.id,
            levels.len(),
            cache.budget()
        );

        Ok(Self {
            selector: PyramidSelector::new(metadata.clone()),
            metadata,
            cache,
            levels,
            torn_down,
        })
    }

    pub fn id(&self) -> DatasetId {
        self.metadata.id
    }

    pub fn metadata(&self) -> &Arc<ImageMetadata> {
        &self.metadata
    }

    pub fn cache(&self) -> &PlaneCache {
        &self.cache
    }

    /// Views of every level, full resolution first.
    pub fn levels(&self) -> &[LazyArrayView] {
        &self.levels
    }

    pub fn level(&self, index: usize) -> Option<&LazyArrayView> {
        self.levels.get(index)
    }

    pub fn select_level(&self, factor: f64) -> &PyramidLevel {
        self.selector.select_level(factor)
    }

    /// View of the level a viewer should read at downsample `factor`.
    pub fn view_for_scale(&self, factor: f64) -> &LazyArrayView {
        let index = self.selector.select_level(factor).index;
        // every metadata level has a view
        &self.levels[index]
    }

    /// Load every (T, Z) plane of channel `c` at `level` into the cache.
    ///
    /// Returns the number of planes or tiles requested.
    pub async fn prefetch_channel(&self, level: usize, c: usize) -> Result<usize, BridgeError> {
        let view = self.level(level).ok_or_else(|| {
            BridgeError::UnsupportedIndex(format!(
                "pyramid level {level} does not exist ({} levels)",
                self.levels.len()
            ))
        })?;

        let count = view
            .prefetch(&[AxisIndex::Full, AxisIndex::Scalar(c as i64)])
            .await?;
        debug!(
            "Prefetched channel {} of {} at level {} ({} keys)",
            c,
            self.id(),
            level,
            count
        );
        Ok(count)
    }

    /// Labels of the slider axes a viewer shows: T and Z, when not singleton.
    pub fn dims_labels(&self) -> Vec<Axis> {
        let mut labels = Vec::new();
        if self.metadata.size_t > 1 {
            labels.push(Axis::T);
        }
        if self.metadata.size_z > 1 {
            labels.push(Axis::Z);
        }
        labels
    }

    /// Initial slider positions, matching [`dims_labels`](Self::dims_labels).
    pub fn dims_defaults(&self) -> Vec<usize> {
        let mut defaults = Vec::new();
        if self.metadata.size_t > 1 {
            defaults.push(self.metadata.default_t);
        }
        if self.metadata.size_z > 1 {
            defaults.push(self.metadata.default_z);
        }
        defaults
    }

    /// Layer settings for every channel, from the server's rendering settings.
    pub fn channel_layers(&self) -> Vec<ChannelLayer> {
        self.metadata
            .channels
            .iter()
            .enumerate()
            .map(|(index, channel)| ChannelLayer {
                index,
                name: channel.label.clone(),
                color: channel.color,
                visible: channel.active,
                contrast_limits: channel.window.map(|w| (w.start, w.end)),
                contrast_range: channel.window.map(|w| (w.min, w.max)),
            })
            .collect()
    }

    /// Release the cached planes of this image.
    ///
    /// Returns the number of planes dropped; later calls return 0.
    pub fn teardown(&self) -> usize {
        if self.torn_down.swap(true, Ordering::SeqCst) {
            return 0;
        }

        let released = self.cache.invalidate(self.id());
        info!("Closed {} ({} cached planes released)", self.id(), released);
        released
    }

    pub fn is_torn_down(&self) -> bool {
        self.torn_down.load(Ordering::SeqCst)
    }
}

impl Drop for DatasetHandle {
    fn drop(&mut self) {
        self.teardown();
    }
}
