//! Viewer-facing array interface.
//!
//! - [`index`]: normalization of per-axis indices
//! - [`LazyArrayView`]: one pyramid level as an [`ArraySource`]
//! - [`PyramidSelector`]: level choice for a requested zoom

mod array;
pub mod index;
mod pyramid;

pub use array::{ArrayChunk, ArraySource, BlockingArrayView, LazyArrayView};
pub use index::{AxisIndex, AxisSelection};
pub use pyramid::PyramidSelector;
