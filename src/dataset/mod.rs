//! Remote images as datasets.
//!
//! - [`DatasetId`]: which image
//! - [`ImageMetadata`]: its validated geometry and channel settings
//! - [`MetadataResolver`]: fetch-once metadata access
//! - [`DatasetHandle`]: one open image with its cache and level views
//! - [`DatasetRegistry`]: open handles, keyed by id

mod handle;
mod id;
mod metadata;
mod registry;
mod resolver;

pub use handle::{ChannelLayer, DatasetHandle, HandleConfig};
pub use id::{DatasetId, ParseDatasetIdError};
pub use metadata::{
    Axis, ChannelInfo, DisplayWindow, ImageMetadata, PixelType, PyramidLevel, AXES,
};
pub use registry::{DatasetRegistry, DEFAULT_MAX_OPEN_DATASETS};
pub use resolver::MetadataResolver;
