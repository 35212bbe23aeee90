//! Test utilities for integration tests.
//!
//! This module provides a scripted in-memory image server and helpers for
//! wiring it into a session manager and dataset registry.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use omero_bridge::dataset::{DatasetId, DatasetRegistry, HandleConfig};
use omero_bridge::error::RemoteError;
use omero_bridge::plane::{CacheConfig, PlaneKey, RetryPolicy};
use omero_bridge::remote::{
    Credentials, LevelResponse, MetadataResponse, RemoteServer, SessionToken, SizeResponse,
};
use omero_bridge::session::{SessionConfig, SessionManager};

pub const USERNAME: &str = "alice";
pub const PASSWORD: &str = "secret";

// =============================================================================
// Pixel Pattern
// =============================================================================

/// Deterministic uint16 value of a pixel at any level.
pub fn pixel_value(level: usize, t: usize, c: usize, z: usize, y: usize, x: usize) -> u16 {
    ((level * 1009 + t * 211 + c * 101 + z * 31 + y * 7 + x) % 65_536) as u16
}

/// Read the little-endian uint16 at flat element `index` of `data`.
pub fn u16_at(data: &[u8], index: usize) -> u16 {
    u16::from_le_bytes([data[index * 2], data[index * 2 + 1]])
}

// =============================================================================
// Mock Image Server
// =============================================================================

/// In-memory [`RemoteServer`] serving uint16 images with tracked calls.
///
/// Tokens carry a generation; [`expire_sessions`](Self::expire_sessions)
/// invalidates every token issued so far, as a server-side timeout would.
pub struct MockRemote {
    images: HashMap<u64, MetadataResponse>,
    latency: Duration,

    token_generation: AtomicUsize,
    transient_failures: AtomicUsize,

    logins: AtomicUsize,
    logouts: AtomicUsize,
    metadata_calls: AtomicUsize,
    plane_calls: AtomicUsize,
    plane_requests: Mutex<Vec<PlaneKey>>,
    active_planes: AtomicUsize,
    peak_active_planes: AtomicUsize,
}

impl MockRemote {
    pub fn new() -> Self {
        Self {
            images: HashMap::new(),
            latency: Duration::ZERO,
            token_generation: AtomicUsize::new(1),
            transient_failures: AtomicUsize::new(0),
            logins: AtomicUsize::new(0),
            logouts: AtomicUsize::new(0),
            metadata_calls: AtomicUsize::new(0),
            plane_calls: AtomicUsize::new(0),
            plane_requests: Mutex::new(Vec::new()),
            active_planes: AtomicUsize::new(0),
            peak_active_planes: AtomicUsize::new(0),
        }
    }

    /// Add a uint16 image without a pyramid.
    pub fn with_image(mut self, id: u64, t: usize, c: usize, z: usize, y: usize, x: usize) -> Self {
        self.images.insert(
            id,
            MetadataResponse {
                id,
                name: format!("image-{}", id),
                size: SizeResponse { t, c, z, y, x },
                pixel_type: "uint16".to_string(),
                levels: vec![],
                channels: vec![],
                default_z: Some(z / 2),
                default_t: Some(0),
            },
        );
        self
    }

    /// Add a single-plane uint16 pyramid: `base`x`base`, halving per level,
    /// tiled by `tile`.
    pub fn with_pyramid(mut self, id: u64, base: usize, level_count: usize, tile: usize) -> Self {
        let levels = (0..level_count)
            .map(|i| LevelResponse {
                downsample: (1u32 << i) as f64,
                size_y: base >> i,
                size_x: base >> i,
                tile_height: Some(tile),
                tile_width: Some(tile),
            })
            .collect();

        self.images.insert(
            id,
            MetadataResponse {
                id,
                name: format!("pyramid-{}", id),
                size: SizeResponse {
                    t: 1,
                    c: 1,
                    z: 1,
                    y: base,
                    x: base,
                },
                pixel_type: "uint16".to_string(),
                levels,
                channels: vec![],
                default_z: None,
                default_t: None,
            },
        );
        self
    }

    /// Delay every call by `latency`.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Invalidate every token issued so far.
    pub fn expire_sessions(&self) {
        self.token_generation.fetch_add(1, Ordering::SeqCst);
    }

    /// Fail the next `count` plane fetches with a transient error.
    pub fn fail_next_planes(&self, count: usize) {
        self.transient_failures.store(count, Ordering::SeqCst);
    }

    pub fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    pub fn logouts(&self) -> usize {
        self.logouts.load(Ordering::SeqCst)
    }

    pub fn metadata_calls(&self) -> usize {
        self.metadata_calls.load(Ordering::SeqCst)
    }

    pub fn plane_calls(&self) -> usize {
        self.plane_calls.load(Ordering::SeqCst)
    }

    pub fn plane_requests(&self) -> Vec<PlaneKey> {
        self.plane_requests.lock().clone()
    }

    /// Highest number of plane fetches observed running at once.
    pub fn peak_active_planes(&self) -> usize {
        self.peak_active_planes.load(Ordering::SeqCst)
    }

    fn check_token(&self, token: &SessionToken) -> Result<(), RemoteError> {
        let current = self.token_generation.load(Ordering::SeqCst);
        if token.as_str() == format!("token-{}", current) {
            Ok(())
        } else {
            Err(RemoteError::Expired)
        }
    }

    fn take_failure(&self) -> bool {
        self.transient_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    async fn delay(&self) {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }
}

impl Default for MockRemote {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RemoteServer for MockRemote {
    async fn authenticate(&self, credentials: &Credentials) -> Result<SessionToken, RemoteError> {
        self.delay().await;
        self.logins.fetch_add(1, Ordering::SeqCst);

        if credentials.username != USERNAME || credentials.password != PASSWORD {
            return Err(RemoteError::Unauthorized("bad credentials".to_string()));
        }

        let generation = self.token_generation.load(Ordering::SeqCst);
        Ok(SessionToken::new(format!("token-{}", generation)))
    }

    async fn fetch_metadata(
        &self,
        token: &SessionToken,
        dataset: DatasetId,
    ) -> Result<MetadataResponse, RemoteError> {
        self.delay().await;
        self.check_token(token)?;
        self.metadata_calls.fetch_add(1, Ordering::SeqCst);

        self.images
            .get(&dataset.get())
            .cloned()
            .ok_or_else(|| RemoteError::NotFound(dataset.to_string()))
    }

    async fn fetch_plane(&self, token: &SessionToken, key: &PlaneKey) -> Result<Bytes, RemoteError> {
        let active = self.active_planes.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_active_planes.fetch_max(active, Ordering::SeqCst);
        self.delay().await;
        self.active_planes.fetch_sub(1, Ordering::SeqCst);
        self.check_token(token)?;
        self.plane_calls.fetch_add(1, Ordering::SeqCst);
        self.plane_requests.lock().push(*key);

        if self.take_failure() {
            return Err(RemoteError::Transient("503 Service Unavailable".to_string()));
        }

        let image = self
            .images
            .get(&key.dataset.get())
            .ok_or_else(|| RemoteError::NotFound(key.dataset.to_string()))?;

        let (size_y, size_x) = match image.levels.get(key.level) {
            Some(level) => (level.size_y, level.size_x),
            None if key.level == 0 => (image.size.y, image.size.x),
            None => return Err(RemoteError::NotFound(format!("level {}", key.level))),
        };

        let (y0, x0, height, width) = match key.tile {
            Some(tile) => (tile.y, tile.x, tile.height, tile.width),
            None => (0, 0, size_y, size_x),
        };
        if y0 + height > size_y || x0 + width > size_x {
            return Err(RemoteError::NotFound(format!("tile outside level: {}", key)));
        }

        let mut data = Vec::with_capacity(height * width * 2);
        for y in y0..y0 + height {
            for x in x0..x0 + width {
                let value = pixel_value(key.level, key.t, key.c, key.z, y, x);
                data.extend_from_slice(&value.to_le_bytes());
            }
        }
        Ok(Bytes::from(data))
    }

    async fn logout(&self, _token: &SessionToken) -> Result<(), RemoteError> {
        self.logouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn identifier(&self) -> &str {
        "mock://omero"
    }
}

// =============================================================================
// Wiring Helpers
// =============================================================================

pub fn session_config() -> SessionConfig {
    let mut config = SessionConfig::new(Credentials::new(USERNAME, PASSWORD));
    config.pool_size = 4;
    config.pool_wait_timeout = Duration::from_secs(5);
    config.call_timeout = Duration::from_secs(5);
    config
}

/// Handle settings with a plane cache of `budget_bytes` and fast retries.
pub fn handle_config(budget_bytes: usize) -> HandleConfig {
    HandleConfig {
        cache: CacheConfig {
            budget_bytes,
            wait_timeout: None,
        },
        retry: RetryPolicy {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        },
    }
}

/// A session manager over `remote` and a registry on top of it.
pub fn registry(
    remote: MockRemote,
    config: HandleConfig,
) -> (
    Arc<MockRemote>,
    Arc<SessionManager<MockRemote>>,
    Arc<DatasetRegistry>,
) {
    registry_with_session(remote, session_config(), config)
}

/// Like [`registry`], with explicit session settings.
pub fn registry_with_session(
    remote: MockRemote,
    session: SessionConfig,
    config: HandleConfig,
) -> (
    Arc<MockRemote>,
    Arc<SessionManager<MockRemote>>,
    Arc<DatasetRegistry>,
) {
    let remote = Arc::new(remote);
    let session = Arc::new(SessionManager::new(remote.clone(), session));
    let registry = Arc::new(DatasetRegistry::new(session.clone(), config));
    (remote, session, registry)
}
