//! Lazy array view over one pyramid level of a remote image.
//!
//! # Request flow
//!
//! ```text
//!   get([t, c, z, y, x])
//!        │
//!        ▼
//!   resolve indices ──► selections per axis
//!        │
//!        ▼
//!   plan: for each (t, c, z) in T, C, Z order
//!           cover the Y/X window with the level's tile grid
//!        │
//!        ▼
//!   fetch every key concurrently through the PlaneCache
//!        │
//!        ▼
//!   copy the overlapping rows of each tile into the output buffer
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{FuturesUnordered, StreamExt};
use tracing::debug;

use crate::dataset::{Axis, ImageMetadata, PixelType, PyramidLevel, AXES};
use crate::error::BridgeError;
use crate::plane::{PlaneCache, PlaneFetcher, PlaneKey, TileRegion};

use super::index::{resolve_all, AxisIndex, AxisSelection};

// =============================================================================
// ArraySource Trait
// =============================================================================

/// Array-like data source consumed by viewers.
///
/// Axes are always (T, C, Z, Y, X). Indexing with fewer than five indices
/// selects the remaining trailing axes whole.
#[async_trait]
pub trait ArraySource: Send + Sync {
    /// Extent of each axis.
    fn shape(&self) -> [usize; 5];

    /// Element type.
    fn dtype(&self) -> PixelType;

    fn axes(&self) -> [Axis; 5] {
        AXES
    }

    fn ndim(&self) -> usize {
        AXES.len()
    }

    /// Read the selected region.
    ///
    /// Scalar indices drop their axis from the result; ranges keep it.
    async fn get(&self, indices: &[AxisIndex]) -> Result<ArrayChunk, BridgeError>;
}

// =============================================================================
// ArrayChunk
// =============================================================================

/// Dense, C-ordered result of an array read.
#[derive(Debug, Clone, PartialEq)]
pub struct ArrayChunk {
    shape: Vec<usize>,
    axes: Vec<Axis>,
    dtype: PixelType,
    data: Bytes,
}

impl ArrayChunk {
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Axes kept in the result, in order.
    pub fn axes(&self) -> &[Axis] {
        &self.axes
    }

    pub fn dtype(&self) -> PixelType {
        self.dtype
    }

    /// Raw little-endian element bytes.
    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Element at a position given in result coordinates, as `f64`.
    pub fn value(&self, position: &[usize]) -> Option<f64> {
        if position.len() != self.shape.len() {
            return None;
        }

        let mut offset = 0;
        for (&p, &extent) in position.iter().zip(&self.shape) {
            if p >= extent {
                return None;
            }
            offset = offset * extent + p;
        }

        let bpp = self.dtype.bytes_per_pixel();
        let bytes = self.data.get(offset * bpp..(offset + 1) * bpp)?;
        Some(self.dtype.read_f64(bytes))
    }

    /// Smallest and largest element, or `None` when empty.
    pub fn min_max(&self) -> Option<(f64, f64)> {
        self.data
            .chunks_exact(self.dtype.bytes_per_pixel())
            .map(|pixel| self.dtype.read_f64(pixel))
            .fold(None, |acc, v| match acc {
                None => Some((v, v)),
                Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
            })
    }
}

// =============================================================================
// Read Planning
// =============================================================================

/// One fetch and the part of it that lands in the output.
#[derive(Debug, Clone, Copy)]
struct TileCopy {
    key: PlaneKey,

    /// Position of the (t, c, z) plane in the output
    plane: usize,

    /// Region the fetched buffer covers, in level coordinates
    region: TileRegion,
}

#[derive(Debug)]
struct ReadPlan {
    selections: [AxisSelection; 5],
    copies: Vec<TileCopy>,
}

impl ReadPlan {
    fn plane_count(&self) -> usize {
        self.selections[..3].iter().map(|s| s.len).product()
    }

    fn window(&self) -> (AxisSelection, AxisSelection) {
        (self.selections[3], self.selections[4])
    }

    fn result_shape(&self) -> (Vec<usize>, Vec<Axis>) {
        self.selections
            .iter()
            .zip(AXES)
            .filter(|(s, _)| s.keep)
            .map(|(s, axis)| (s.len, axis))
            .unzip()
    }
}

// =============================================================================
// LazyArrayView
// =============================================================================

/// Array view of one pyramid level, fetching planes only when read.
///
/// Cloning is cheap; clones share the cache and session.
#[derive(Clone)]
pub struct LazyArrayView {
    metadata: Arc<ImageMetadata>,
    level: PyramidLevel,
    cache: PlaneCache,
    fetcher: PlaneFetcher,
    closed: Arc<AtomicBool>,
}

impl LazyArrayView {
    /// Create a view of `level`.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::UnsupportedIndex`] if the level does not exist.
    pub fn new(
        metadata: Arc<ImageMetadata>,
        level: usize,
        cache: PlaneCache,
        fetcher: PlaneFetcher,
    ) -> Result<Self, BridgeError> {
        let level = *metadata.level(level).ok_or_else(|| {
            BridgeError::UnsupportedIndex(format!(
                "pyramid level {level} does not exist ({} levels)",
                metadata.level_count()
            ))
        })?;

        Ok(Self {
            metadata,
            level,
            cache,
            fetcher,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Share `closed` with the owner; once it is set, reads and prefetches
    /// fail with [`BridgeError::Closed`].
    pub(crate) fn with_closed_flag(mut self, closed: Arc<AtomicBool>) -> Self {
        self.closed = closed;
        self
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), BridgeError> {
        if self.is_closed() {
            return Err(BridgeError::Closed(self.metadata.id));
        }
        Ok(())
    }

    pub fn level(&self) -> &PyramidLevel {
        &self.level
    }

    pub fn metadata(&self) -> &Arc<ImageMetadata> {
        &self.metadata
    }

    pub fn cache(&self) -> &PlaneCache {
        &self.cache
    }

    /// Keys fetched by a read of `indices`, in fetch-plan order.
    ///
    /// Planes are ordered by T, then C, then Z; tiles within a plane in
    /// row-major order. The result depends only on the indices and the
    /// level geometry.
    pub fn decompose(&self, indices: &[AxisIndex]) -> Result<Vec<PlaneKey>, BridgeError> {
        Ok(self.plan(indices)?.copies.into_iter().map(|c| c.key).collect())
    }

    fn plan(&self, indices: &[AxisIndex]) -> Result<ReadPlan, BridgeError> {
        let selections = resolve_all(indices, self.shape())?;
        let [t, c, z, y, x] = selections;

        let mut copies = Vec::new();
        if selections.iter().any(AxisSelection::is_empty) {
            return Ok(ReadPlan { selections, copies });
        }

        let level = &self.level;
        let untiled = level.is_untiled();
        let first_row = y.start / level.tile_height * level.tile_height;
        let first_col = x.start / level.tile_width * level.tile_width;

        let mut plane = 0;
        for ti in t.start..t.end() {
            for ci in c.start..c.end() {
                for zi in z.start..z.end() {
                    for ty in (first_row..y.end()).step_by(level.tile_height) {
                        for tx in (first_col..x.end()).step_by(level.tile_width) {
                            let region = TileRegion::new(
                                ty,
                                tx,
                                level.tile_height.min(level.size_y - ty),
                                level.tile_width.min(level.size_x - tx),
                            );
                            let key = if untiled {
                                PlaneKey::plane(self.metadata.id, level.index, ti, ci, zi)
                            } else {
                                PlaneKey::tile(self.metadata.id, level.index, ti, ci, zi, region)
                            };
                            copies.push(TileCopy { key, plane, region });
                        }
                    }
                    plane += 1;
                }
            }
        }

        Ok(ReadPlan { selections, copies })
    }

    /// Fetch a read's planes into the cache without assembling them.
    ///
    /// Returns the number of keys requested.
    pub async fn prefetch(&self, indices: &[AxisIndex]) -> Result<usize, BridgeError> {
        self.ensure_open()?;
        let plan = self.plan(indices)?;
        let count = plan.copies.len();

        let mut pending: FuturesUnordered<_> = plan
            .copies
            .iter()
            .map(|copy| self.fetch_cached(copy.key))
            .collect();
        while let Some(result) = pending.next().await {
            result?;
        }

        debug!("Prefetched {} keys of {}", count, self.metadata.id);
        Ok(count)
    }

    async fn fetch_cached(&self, key: PlaneKey) -> Result<Bytes, BridgeError> {
        let fetcher = self.fetcher.clone();
        self.cache
            .get_or_fetch(key, move |key| async move { fetcher.fetch(&key).await })
            .await
    }

    async fn read(&self, indices: &[AxisIndex]) -> Result<ArrayChunk, BridgeError> {
        self.ensure_open()?;
        let plan = self.plan(indices)?;
        let (shape, axes) = plan.result_shape();
        let dtype = self.dtype();
        let bpp = dtype.bytes_per_pixel();

        let (y, x) = plan.window();
        let row_bytes = x.len * bpp;
        let plane_bytes = y.len * row_bytes;
        let mut output = vec![0u8; plan.plane_count() * plane_bytes];

        let mut pending: FuturesUnordered<_> = plan
            .copies
            .iter()
            .map(|copy| async move { self.fetch_cached(copy.key).await.map(|data| (copy, data)) })
            .collect();

        while let Some(result) = pending.next().await {
            let (copy, data) = result?;
            let region = copy.region;

            let rows = region.y.max(y.start)..(region.y + region.height).min(y.end());
            let cols = region.x.max(x.start)..(region.x + region.width).min(x.end());
            let span = (cols.end - cols.start) * bpp;

            for row in rows {
                let src = ((row - region.y) * region.width + (cols.start - region.x)) * bpp;
                let dst = copy.plane * plane_bytes
                    + (row - y.start) * row_bytes
                    + (cols.start - x.start) * bpp;
                output[dst..dst + span].copy_from_slice(&data[src..src + span]);
            }
        }

        Ok(ArrayChunk {
            shape,
            axes,
            dtype,
            data: Bytes::from(output),
        })
    }
}

#[async_trait]
impl ArraySource for LazyArrayView {
    fn shape(&self) -> [usize; 5] {
        [
            self.metadata.size_t,
            self.metadata.size_c,
            self.metadata.size_z,
            self.level.size_y,
            self.level.size_x,
        ]
    }

    fn dtype(&self) -> PixelType {
        self.metadata.pixel_type
    }

    async fn get(&self, indices: &[AxisIndex]) -> Result<ArrayChunk, BridgeError> {
        self.read(indices).await
    }
}

// =============================================================================
// Blocking Facade
// =============================================================================

/// Synchronous access to an [`ArraySource`] for threads outside the runtime.
///
/// `get_blocking` must not be called from within an asynchronous context;
/// it blocks the calling thread on the runtime handle.
pub struct BlockingArrayView<A: ArraySource> {
    view: A,
    runtime: tokio::runtime::Handle,
}

impl<A: ArraySource> BlockingArrayView<A> {
    pub fn new(view: A, runtime: tokio::runtime::Handle) -> Self {
        Self { view, runtime }
    }

    pub fn shape(&self) -> [usize; 5] {
        self.view.shape()
    }

    pub fn dtype(&self) -> PixelType {
        self.view.dtype()
    }

    pub fn get_blocking(&self, indices: &[AxisIndex]) -> Result<ArrayChunk, BridgeError> {
        self.runtime.block_on(self.view.get(indices))
    }

    pub fn inner(&self) -> &A {
        &self.view
    }
}

// =============================================================================
// Tests
// =============================================================================
