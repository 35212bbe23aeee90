//! Index normalization for array views.
//!
//! Indices follow the conventions viewers expect from in-memory arrays:
//! negative positions count from the end, scalar indices drop their axis
//! from the result, and slice bounds are clamped to the axis extent.

use std::ops::{Range, RangeFrom, RangeFull, RangeInclusive, RangeTo};

use crate::dataset::{Axis, AXES};
use crate::error::BridgeError;

/// Index applied to one axis of a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AxisIndex {
    /// A single position; the axis is dropped from the result
    Scalar(i64),

    /// A half-open slice; omitted bounds extend to the axis ends
    Range {
        start: Option<i64>,
        stop: Option<i64>,
        step: i64,
    },

    /// The whole axis
    Full,
}

impl AxisIndex {
    /// Slice `start..stop` with unit step.
    pub fn range(start: i64, stop: i64) -> Self {
        AxisIndex::Range {
            start: Some(start),
            stop: Some(stop),
            step: 1,
        }
    }
}

impl From<i64> for AxisIndex {
    fn from(index: i64) -> Self {
        AxisIndex::Scalar(index)
    }
}

impl From<Range<i64>> for AxisIndex {
    fn from(range: Range<i64>) -> Self {
        AxisIndex::range(range.start, range.end)
    }
}

impl From<RangeInclusive<i64>> for AxisIndex {
    fn from(range: RangeInclusive<i64>) -> Self {
        AxisIndex::range(*range.start(), range.end().saturating_add(1))
    }
}

impl From<RangeFrom<i64>> for AxisIndex {
    fn from(range: RangeFrom<i64>) -> Self {
        AxisIndex::Range {
            start: Some(range.start),
            stop: None,
            step: 1,
        }
    }
}

impl From<RangeTo<i64>> for AxisIndex {
    fn from(range: RangeTo<i64>) -> Self {
        AxisIndex::Range {
            start: None,
            stop: Some(range.end),
            step: 1,
        }
    }
}

impl From<RangeFull> for AxisIndex {
    fn from(_: RangeFull) -> Self {
        AxisIndex::Full
    }
}

/// A resolved, in-bounds selection on one axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AxisSelection {
    /// First selected position
    pub start: usize,

    /// Number of selected positions (may be zero)
    pub len: usize,

    /// Whether the axis appears in the result shape
    pub keep: bool,
}

impl AxisSelection {
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Resolve one index against an axis of extent `size`.
pub fn resolve(axis: Axis, index: &AxisIndex, size: usize) -> Result<AxisSelection, BridgeError> {
    let extent = size as i64;

    match *index {
        AxisIndex::Scalar(i) => {
            let position = if i < 0 { i + extent } else { i };
            if position < 0 || position >= extent {
                return Err(BridgeError::Index {
                    axis,
                    index: i,
                    bound: size,
                });
            }
            Ok(AxisSelection {
                start: position as usize,
                len: 1,
                keep: false,
            })
        }
        AxisIndex::Range { start, stop, step } => {
            if step != 1 {
                return Err(BridgeError::UnsupportedIndex(format!(
                    "slice step {step} on axis {axis}; only step 1 is supported"
                )));
            }

            let clamp = |bound: i64| {
                let bound = if bound < 0 { bound + extent } else { bound };
                bound.clamp(0, extent)
            };
            let start = start.map_or(0, clamp);
            let stop = stop.map_or(extent, clamp);

            Ok(AxisSelection {
                start: start as usize,
                len: (stop - start).max(0) as usize,
                keep: true,
            })
        }
        AxisIndex::Full => Ok(AxisSelection {
            start: 0,
            len: size,
            keep: true,
        }),
    }
}

/// Resolve up to five indices against a (T, C, Z, Y, X) shape.
///
/// Missing trailing indices select their whole axis.
pub fn resolve_all(
    indices: &[AxisIndex],
    shape: [usize; 5],
) -> Result<[AxisSelection; 5], BridgeError> {
    if indices.len() > AXES.len() {
        return Err(BridgeError::TooManyIndices {
            given: indices.len(),
            ndim: AXES.len(),
        });
    }

    let mut selections = [AxisSelection {
        start: 0,
        len: 0,
        keep: true,
    }; 5];

    for (position, axis) in AXES.iter().enumerate() {
        let index = indices.get(position).unwrap_or(&AxisIndex::Full);
        selections[position] = resolve(*axis, index, shape[position])?;
    }

    Ok(selections)
}
