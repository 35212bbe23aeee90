//! # OMERO Bridge
//!
//! Lazy array access to multidimensional images held by a remote OMERO-style
//! image server.
//!
//! An image is exposed as a 5D (T, C, Z, Y, X) array per pyramid level. Nothing
//! is transferred when an image is opened except its metadata; pixel planes are
//! fetched on first access, shared between concurrent readers, and kept in a
//! byte-bounded LRU cache so that moving a viewer's sliders back and forth does
//! not go back to the server.
//!
//! ## Features
//!
//! - **Lazy planes**: Only the (T, C, Z) planes, or tiles of them, a read touches are fetched
//! - **Single-flight fetching**: Concurrent readers of one plane share one remote call
//! - **Bounded caching**: Planes are evicted least recently used first under a byte budget
//! - **Managed sessions**: Lazy login, a bounded connection pool, transparent re-authentication
//! - **Multiscale**: Pyramid levels are exposed as separate arrays with a zoom-based level picker
//!
//! ## Architecture
//!
//! The library is organized into several modules:
//!
//! - [`remote`] - Server protocol: credentials, wire types and the HTTP client
//! - [`session`] - Authenticated, pooled, self-healing access to the server
//! - [`plane`] - Plane keys, retrying fetcher and the plane cache
//! - [`dataset`] - Image metadata, open handles and the registry
//! - [`view`] - Index normalization, pyramid selection and the lazy array view
//! - [`config`] - CLI and configuration types
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! use omero_bridge::{
//!     ArraySource, AxisIndex, Credentials, DatasetId, DatasetRegistry, HandleConfig,
//!     HttpRemote, SessionConfig, SessionManager,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let remote = HttpRemote::new("https://omero.example.org", Duration::from_secs(30))?;
//!     let session = Arc::new(SessionManager::new(
//!         Arc::new(remote),
//!         SessionConfig::new(Credentials::new("alice", "secret")),
//!     ));
//!     let registry = DatasetRegistry::new(session, HandleConfig::default());
//!
//!     let handle = registry.get(DatasetId::new(42)).await?;
//!     if let Some(view) = handle.level(0) {
//!         // First timepoint, first channel, third z-section
//!         let plane = view
//!             .get(&[AxisIndex::Scalar(0), AxisIndex::Scalar(0), AxisIndex::Scalar(2)])
//!             .await?;
//!         println!("plane shape: {:?}", plane.shape());
//!     }
//!
//!     registry.close().await;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod dataset;
pub mod error;
pub mod plane;
pub mod remote;
pub mod session;
pub mod view;

// Re-export commonly used types
pub use config::{CheckConfig, Cli, Command, ConnectionConfig, ViewConfig};
pub use dataset::{
    Axis, ChannelInfo, ChannelLayer, DatasetHandle, DatasetId, DatasetRegistry, DisplayWindow,
    HandleConfig, ImageMetadata, MetadataResolver, PixelType, PyramidLevel, AXES,
    DEFAULT_MAX_OPEN_DATASETS,
};
pub use error::{BridgeError, RemoteError};
pub use plane::{
    CacheConfig, CacheStats, PlaneCache, PlaneFetcher, PlaneKey, RetryPolicy, TileRegion,
    DEFAULT_PLANE_CACHE_BUDGET,
};
pub use remote::{Credentials, HttpRemote, RemoteServer, SessionToken};
pub use session::{
    CallOutput, RemoteCall, RemoteSession, SessionConfig, SessionGuard, SessionManager,
    SessionStatus,
};
pub use view::{
    ArrayChunk, ArraySource, AxisIndex, AxisSelection, BlockingArrayView, LazyArrayView,
    PyramidSelector,
};
