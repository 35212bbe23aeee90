//! Remote image server boundary.
//!
//! Everything above this module talks to the server through the
//! [`RemoteServer`] trait, so sessions, fetchers and caches can be exercised
//! against in-memory servers in tests and against [`HttpRemote`] in
//! production.
//!
//! # Wire model
//!
//! The server exposes four operations:
//!
//! - authenticate with a username and password, receiving a session token
//! - fetch the metadata of an image (shape, pixel type, pyramid, channels)
//! - fetch one plane, or one tile of a plane, as raw little-endian pixels
//! - log out, invalidating the token

mod http;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::dataset::DatasetId;
use crate::error::RemoteError;
use crate::plane::PlaneKey;

pub use http::{HttpRemote, SESSION_TOKEN_HEADER};

// =============================================================================
// Credentials and Tokens
// =============================================================================

/// Username and password used to open a session.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Opaque token identifying an authenticated session.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionToken(String);

impl SessionToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionToken(<redacted>)")
    }
}

// =============================================================================
// RemoteServer Trait
// =============================================================================

/// Operations offered by a remote image server.
///
/// Implementations classify every failure into a [`RemoteError`] variant;
/// retry and re-authentication policy lives above this trait.
#[async_trait]
pub trait RemoteServer: Send + Sync {
    /// Open a session, returning its token.
    async fn authenticate(&self, credentials: &Credentials) -> Result<SessionToken, RemoteError>;

    /// Fetch the raw metadata document of an image.
    async fn fetch_metadata(
        &self,
        token: &SessionToken,
        dataset: DatasetId,
    ) -> Result<MetadataResponse, RemoteError>;

    /// Fetch the pixels of one plane or tile as little-endian bytes in
    /// row-major (Y, X) order.
    async fn fetch_plane(&self, token: &SessionToken, key: &PlaneKey)
        -> Result<Bytes, RemoteError>;

    /// Invalidate a session token.
    async fn logout(&self, token: &SessionToken) -> Result<(), RemoteError>;

    /// Identifier of the server, for logging.
    fn identifier(&self) -> &str;
}

// =============================================================================
// Wire Types
// =============================================================================

/// Metadata document returned by the server for one image.
///
/// This is the unvalidated wire form; see
/// [`ImageMetadata::from_response`](crate::dataset::ImageMetadata::from_response).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetadataResponse {
    pub id: u64,

    #[serde(default)]
    pub name: String,

    pub size: SizeResponse,

    /// Pixel type name, e.g. `uint16` or `float`
    pub pixel_type: String,

    /// Resolution levels, full resolution first. Empty for images without a
    /// pyramid.
    #[serde(default)]
    pub levels: Vec<LevelResponse>,

    #[serde(default)]
    pub channels: Vec<ChannelResponse>,

    #[serde(default)]
    pub default_z: Option<usize>,

    #[serde(default)]
    pub default_t: Option<usize>,
}

/// Extent of each axis at full resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizeResponse {
    pub t: usize,
    pub c: usize,
    pub z: usize,
    pub y: usize,
    pub x: usize,
}

/// One pyramid level as described by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LevelResponse {
    pub downsample: f64,
    pub size_y: usize,
    pub size_x: usize,

    /// Native tile height; the whole plane when absent
    #[serde(default)]
    pub tile_height: Option<usize>,

    /// Native tile width; the whole plane when absent
    #[serde(default)]
    pub tile_width: Option<usize>,
}

/// Display settings of one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelResponse {
    #[serde(default)]
    pub label: Option<String>,

    /// RGB color
    #[serde(default)]
    pub color: Option<[u8; 3]>,

    #[serde(default)]
    pub window: Option<WindowResponse>,

    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

/// Rendering window of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowResponse {
    pub start: f64,
    pub end: f64,
    pub min: f64,
    pub max: f64,
}

/// Request body of the login call.
#[derive(Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

/// Response body of the login call.
#[derive(Debug, Serialize, Deserialize)]
pub struct LoginResponse {
    pub token: String,
}
