//! Byte-bounded plane cache with single-flight fetches.
//!
//! # Eviction
//!
//! Every hit or insert stamps the entry with the next value of a cache-wide
//! access sequence. When the total size exceeds the byte budget, entries are
//! evicted in ascending order of `(last access, larger size first, key)`.
//!
//! # Single-flight
//!
//! The first caller to miss on a key becomes the leader: it registers the key
//! as in flight and spawns the fetch as its own task. Every caller, leader
//! included, then waits on a `watch` channel for the published result. The
//! spawned task inserts the result and clears the in-flight entry under the
//! same lock acquisition, so a key is always either cached, in flight, or
//! absent. Because the fetch is a separate task, callers that give up (or are
//! dropped) never abort it, and its result still lands in the cache.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tracing::debug;

use crate::dataset::DatasetId;
use crate::error::{BridgeError, RemoteError};

use super::PlaneKey;

/// Default cache budget: 256MB
pub const DEFAULT_PLANE_CACHE_BUDGET: usize = 256 * 1024 * 1024;

/// Cache sizing and waiting behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    /// Maximum total size of cached planes in bytes
    pub budget_bytes: usize,

    /// Longest time a caller waits for an in-flight fetch
    pub wait_timeout: Option<Duration>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            budget_bytes: DEFAULT_PLANE_CACHE_BUDGET,
            wait_timeout: None,
        }
    }
}

/// Counters describing cache effectiveness.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub evictions: u64,
}

type FlightResult = Option<Result<Bytes, BridgeError>>;

/// A cached plane and its bookkeeping.
struct CachedPlane {
    data: Bytes,
    last_access: u64,
}

impl CachedPlane {
    fn rank(&self, key: PlaneKey) -> EvictionRank {
        (self.last_access, Reverse(self.data.len()), key)
    }
}

/// Eviction order: oldest access first, then larger planes, then key order.
type EvictionRank = (u64, Reverse<usize>, PlaneKey);

struct InFlight {
    id: u64,
    result: watch::Receiver<FlightResult>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<PlaneKey, CachedPlane>,
    eviction: BTreeSet<EvictionRank>,
    in_flight: HashMap<PlaneKey, InFlight>,
    /// Bumped by `invalidate` so fetches started earlier are not inserted
    generations: HashMap<DatasetId, u64>,
    total_bytes: usize,
    next_access: u64,
    next_flight: u64,
    stats: CacheStats,
}

impl CacheState {
    fn next_access(&mut self) -> u64 {
        self.next_access += 1;
        self.next_access
    }

    fn generation(&self, dataset: DatasetId) -> u64 {
        self.generations.get(&dataset).copied().unwrap_or(0)
    }

    /// Return a cached plane, marking it most recently used.
    fn touch(&mut self, key: &PlaneKey) -> Option<Bytes> {
        let access = self.next_access();
        let entry = self.entries.get_mut(key)?;
        self.eviction.remove(&entry.rank(*key));
        entry.last_access = access;
        self.eviction.insert(entry.rank(*key));
        Some(entry.data.clone())
    }

    fn remove(&mut self, key: &PlaneKey) -> Option<CachedPlane> {
        let entry = self.entries.remove(key)?;
        self.eviction.remove(&entry.rank(*key));
        self.total_bytes -= entry.data.len();
        Some(entry)
    }

    fn insert(&mut self, key: PlaneKey, data: Bytes, budget: usize) {
        let size = data.len();
        if size > budget {
            debug!(
                "Not caching {}: {} bytes exceeds the {} byte budget",
                key, size, budget
            );
            return;
        }

        self.remove(&key);

        let entry = CachedPlane {
            data,
            last_access: self.next_access(),
        };
        self.eviction.insert(entry.rank(key));
        self.entries.insert(key, entry);
        self.total_bytes += size;
        self.stats.inserts += 1;

        while self.total_bytes > budget {
            let Some((_, _, victim)) = self.eviction.pop_first() else {
                break;
            };
            if let Some(evicted) = self.entries.remove(&victim) {
                self.total_bytes -= evicted.data.len();
                self.stats.evictions += 1;
                debug!("Evicted {} ({} bytes)", victim, evicted.data.len());
            }
        }
    }
}

struct Shared {
    state: Mutex<CacheState>,
    budget: usize,
    wait_timeout: Option<Duration>,
}

impl Shared {
    /// Publish a finished fetch: cache it and retire the in-flight entry.
    fn complete(
        &self,
        key: PlaneKey,
        flight: u64,
        generation: u64,
        result: &Result<Bytes, BridgeError>,
    ) {
        let mut state = self.state.lock();

        if state.in_flight.get(&key).map(|f| f.id) == Some(flight) {
            state.in_flight.remove(&key);
        }

        if let Ok(data) = result {
            if state.generation(key.dataset) == generation {
                state.insert(key, data.clone(), self.budget);
            } else {
                debug!("Discarding {}: dataset was invalidated during fetch", key);
            }
        }
    }

    /// Drop the in-flight entry of a fetch task that ended without publishing.
    fn abandon(&self, key: &PlaneKey, flight: u64) {
        let mut state = self.state.lock();
        if state.in_flight.get(key).map(|f| f.id) == Some(flight) {
            state.in_flight.remove(key);
        }
    }
}

// =============================================================================
// Plane Cache
// =============================================================================

/// Bounded, key-addressed store of fetched planes.
///
/// Cloning is cheap and clones share the same storage. Returned buffers are
/// [`Bytes`], immutable views that callers cannot use to alter the cache.
///
/// One lock guards all bookkeeping; it is never held across a fetch or an
/// await point.
///
/// # Example
///
/// ```
/// use bytes::Bytes;
/// use omero_bridge::dataset::DatasetId;
/// use omero_bridge::plane::{CacheConfig, PlaneCache, PlaneKey};
///
/// #[tokio::main]
/// async fn main() {
///     let cache = PlaneCache::new(CacheConfig::default());
///     let key = PlaneKey::plane(DatasetId::new(1), 0, 0, 0, 0);
///
///     let data = cache
///         .get_or_fetch(key, |_key| async { Ok(Bytes::from(vec![0u8; 16])) })
///         .await
///         .unwrap();
///
///     assert_eq!(data.len(), 16);
///     assert!(cache.contains(&key));
/// }
/// ```
#[derive(Clone)]
pub struct PlaneCache {
    shared: Arc<Shared>,
}

impl PlaneCache {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(CacheState::default()),
                budget: config.budget_bytes,
                wait_timeout: config.wait_timeout,
            }),
        }
    }

    /// Create a cache holding at most `budget_bytes` bytes.
    pub fn with_budget(budget_bytes: usize) -> Self {
        Self::new(CacheConfig {
            budget_bytes,
            wait_timeout: None,
        })
    }

    /// Return the cached plane for `key`, fetching it on a miss.
    ///
    /// Concurrent misses on the same key share one call to `fetch`. Errors
    /// are shared the same way and are not cached.
    ///
    /// # Errors
    ///
    /// Returns the fetch error, or [`BridgeError::Timeout`] when the wait
    /// for an in-flight fetch exceeds the configured wait timeout.
    pub async fn get_or_fetch<F, Fut>(&self, key: PlaneKey, fetch: F) -> Result<Bytes, BridgeError>
    where
        F: FnOnce(PlaneKey) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Bytes, BridgeError>> + Send + 'static,
    {
        let mut fetch = Some(fetch);

        loop {
            let (flight, mut result) = {
                let mut state = self.shared.state.lock();

                if let Some(data) = state.touch(&key) {
                    state.stats.hits += 1;
                    debug!("Cache hit for {}", key);
                    return Ok(data);
                }

                match state.in_flight.get(&key) {
                    Some(in_flight) => (in_flight.id, in_flight.result.clone()),
                    None => {
                        let Some(fetch) = fetch.take() else {
                            return Err(BridgeError::Fetch {
                                key,
                                source: RemoteError::Transient(
                                    "fetch task ended without a result".to_string(),
                                ),
                            });
                        };

                        state.stats.misses += 1;
                        state.next_flight += 1;
                        let flight = state.next_flight;
                        let generation = state.generation(key.dataset);
                        let (tx, rx) = watch::channel(None);
                        state.in_flight.insert(
                            key,
                            InFlight {
                                id: flight,
                                result: rx.clone(),
                            },
                        );
                        debug!("Cache miss for {}, fetching", key);

                        let shared = self.shared.clone();
                        tokio::spawn(async move {
                            let result = fetch(key).await;
                            shared.complete(key, flight, generation, &result);
                            let _ = tx.send(Some(result));
                        });

                        (flight, rx)
                    }
                }
            };

            let outcome = {
                let ready = result.wait_for(|slot| slot.is_some());
                match self.shared.wait_timeout {
                    Some(limit) => match tokio::time::timeout(limit, ready).await {
                        Ok(outcome) => outcome.map(|slot| (*slot).clone()),
                        Err(_) => {
                            return Err(BridgeError::Timeout {
                                operation: "an in-flight plane fetch",
                                waited: limit,
                            })
                        }
                    },
                    None => ready.await.map(|slot| (*slot).clone()),
                }
            };

            match outcome {
                Ok(Some(result)) => return result,
                // The fetch task went away without publishing, e.g. it panicked.
                _ => self.shared.abandon(&key, flight),
            }
        }
    }

    /// Return a cached plane without fetching, marking it recently used.
    pub fn get(&self, key: &PlaneKey) -> Option<Bytes> {
        let mut state = self.shared.state.lock();
        let data = state.touch(key);
        if data.is_some() {
            state.stats.hits += 1;
        }
        data
    }

    /// Check whether a plane is cached without updating its access order.
    pub fn contains(&self, key: &PlaneKey) -> bool {
        self.shared.state.lock().entries.contains_key(key)
    }

    /// Remove every entry of `dataset`, returning how many were removed.
    ///
    /// Fetches for `dataset` that are still in flight complete for their
    /// waiters but are not inserted. Other datasets are untouched.
    pub fn invalidate(&self, dataset: DatasetId) -> usize {
        let mut state = self.shared.state.lock();
        *state.generations.entry(dataset).or_insert(0) += 1;

        let keys: Vec<PlaneKey> = state
            .entries
            .keys()
            .filter(|k| k.dataset == dataset)
            .copied()
            .collect();
        for key in &keys {
            state.remove(key);
        }

        if !keys.is_empty() {
            debug!("Invalidated {} cached planes of {}", keys.len(), dataset);
        }
        keys.len()
    }

    /// Remove every entry.
    ///
    /// Fetches still in flight complete for their waiters but are not
    /// inserted, as with [`invalidate`](Self::invalidate).
    pub fn clear(&self) {
        let mut state = self.shared.state.lock();
        let datasets: HashSet<DatasetId> = state
            .entries
            .keys()
            .chain(state.in_flight.keys())
            .map(|k| k.dataset)
            .collect();
        for dataset in datasets {
            *state.generations.entry(dataset).or_insert(0) += 1;
        }
        state.entries.clear();
        state.eviction.clear();
        state.total_bytes = 0;
    }

    /// Number of cached planes.
    pub fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total size of cached planes in bytes.
    pub fn size(&self) -> usize {
        self.shared.state.lock().total_bytes
    }

    /// Maximum total size in bytes.
    pub fn budget(&self) -> usize {
        self.shared.budget
    }

    /// Number of fetches currently in flight.
    pub fn in_flight(&self) -> usize {
        self.shared.state.lock().in_flight.len()
    }

    pub fn stats(&self) -> CacheStats {
        self.shared.state.lock().stats
    }
}

impl Default for PlaneCache {
    fn default() -> Self {
        Self::new(CacheConfig::default())
    }
}

// =============================================================================
// Tests
// =============================================================================
