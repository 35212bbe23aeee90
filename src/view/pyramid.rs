use std::sync::Arc;

use crate::dataset::{ImageMetadata, PyramidLevel};

/// Relative tolerance absorbing float noise, so 1.9999999 still selects a
/// level of 2.0 while 1.999 does not.
const DOWNSAMPLE_TOLERANCE: f64 = 1e-6;

/// Picks the resolution level a viewer should read at a given zoom.
#[derive(Debug, Clone)]
pub struct PyramidSelector {
    metadata: Arc<ImageMetadata>,
}

impl PyramidSelector {
    pub fn new(metadata: Arc<ImageMetadata>) -> Self {
        Self { metadata }
    }

    /// All levels, full resolution first.
    pub fn levels(&self) -> &[PyramidLevel] {
        &self.metadata.levels
    }

    /// Find the level for a requested downsample factor.
    ///
    /// Returns the coarsest level whose downsample is at most `factor`, so the
    /// viewer never reads a level with less detail than it displays. Factors
    /// below 1, or not finite, select level 0.
    pub fn select_level(&self, factor: f64) -> &PyramidLevel {
        let base = self.metadata.base_level();
        if !factor.is_finite() || factor < 1.0 {
            return base;
        }

        self.levels()
            .iter()
            .rev()
            .find(|level| level.downsample <= factor * (1.0 + DOWNSAMPLE_TOLERANCE))
            .unwrap_or(base)
    }
}
