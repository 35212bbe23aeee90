use std::fmt;

use crate::dataset::DatasetId;

/// Sub-rectangle of a plane in level pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileRegion {
    pub y: usize,
    pub x: usize,
    pub height: usize,
    pub width: usize,
}

impl TileRegion {
    pub fn new(y: usize, x: usize, height: usize, width: usize) -> Self {
        Self {
            y,
            x,
            height,
            width,
        }
    }
}

/// Cache key identifying one plane, or one tile of a plane.
///
/// The derived ordering compares dataset, level, T, C, Z and tile in that
/// order, which gives eviction a reproducible tie-break.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PlaneKey {
    pub dataset: DatasetId,

    /// Pyramid level (0 = full resolution)
    pub level: usize,

    pub t: usize,
    pub c: usize,
    pub z: usize,

    /// Region of the plane, or `None` for the whole plane
    pub tile: Option<TileRegion>,
}

impl PlaneKey {
    /// Key for a whole plane.
    pub fn plane(dataset: DatasetId, level: usize, t: usize, c: usize, z: usize) -> Self {
        Self {
            dataset,
            level,
            t,
            c,
            z,
            tile: None,
        }
    }

    /// Key for one tile of a plane.
    pub fn tile(
        dataset: DatasetId,
        level: usize,
        t: usize,
        c: usize,
        z: usize,
        tile: TileRegion,
    ) -> Self {
        Self {
            dataset,
            level,
            t,
            c,
            z,
            tile: Some(tile),
        }
    }
}

impl fmt::Display for PlaneKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} level {} (t={}, c={}, z={})",
            self.dataset, self.level, self.t, self.c, self.z
        )?;
        if let Some(tile) = self.tile {
            write!(
                f,
                " tile y={} x={} {}x{}",
                tile.y, tile.x, tile.height, tile.width
            )?;
        }
        Ok(())
    }
}
