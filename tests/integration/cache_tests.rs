//! Plane cache integration tests.
//!
//! Tests verify:
//! - A plane is fetched once and served from the cache afterwards
//! - The byte budget evicts the least recently used plane
//! - Concurrent readers of one plane share a single fetch
//! - Misses on distinct planes are fetched in parallel
//! - Transient failures are retried below the cache
//! - Releasing a dataset drops its cached planes
//! - Views of a released dataset stop reading

use std::sync::Arc;
use std::time::{Duration, Instant};

use omero_bridge::dataset::DatasetId;
use omero_bridge::error::BridgeError;
use omero_bridge::view::{ArraySource, AxisIndex};

use super::test_utils::{handle_config, pixel_value, registry, u16_at, MockRemote};

const PLANE_BYTES: usize = 512 * 512 * 2;

fn plane(t: i64, c: i64, z: i64) -> [AxisIndex; 3] {
    [AxisIndex::Scalar(t), AxisIndex::Scalar(c), AxisIndex::Scalar(z)]
}

// =============================================================================
// Cache Effectiveness
// =============================================================================

#[tokio::test]
async fn test_single_plane_fetched_once() {
    let remote = MockRemote::new().with_image(1, 2, 1, 5, 512, 512);
    let (remote, _session, registry) = registry(remote, handle_config(64 * PLANE_BYTES));

    let handle = registry.get(DatasetId::new(1)).await.unwrap();
    let view = handle.level(0).unwrap();
    assert_eq!(view.shape(), [2, 1, 5, 512, 512]);

    let first = view.get(&plane(0, 0, 2)).await.unwrap();
    assert_eq!(first.shape(), &[512, 512]);
    assert_eq!(remote.plane_calls(), 1);
    assert_eq!(u16_at(first.data(), 0), pixel_value(0, 0, 0, 2, 0, 0));
    assert_eq!(
        u16_at(first.data(), 511 * 512 + 3),
        pixel_value(0, 0, 0, 2, 511, 3)
    );

    let second = view.get(&plane(0, 0, 2)).await.unwrap();
    assert_eq!(second, first);
    assert_eq!(remote.plane_calls(), 1);

    let stats = handle.cache().stats();
    assert_eq!(stats.misses, 1);
    assert_eq!(stats.hits, 1);
}

#[tokio::test]
async fn test_budget_evicts_least_recently_used() {
    let remote = MockRemote::new().with_image(1, 1, 1, 3, 512, 512);
    let (remote, _session, registry) = registry(remote, handle_config(2 * PLANE_BYTES));

    let handle = registry.get(DatasetId::new(1)).await.unwrap();
    let view = handle.level(0).unwrap();

    // A, B, then C pushes A out
    view.get(&plane(0, 0, 0)).await.unwrap();
    view.get(&plane(0, 0, 1)).await.unwrap();
    view.get(&plane(0, 0, 2)).await.unwrap();
    assert_eq!(remote.plane_calls(), 3);
    assert_eq!(handle.cache().len(), 2);
    assert!(handle.cache().size() <= 2 * PLANE_BYTES);

    // C is still cached
    view.get(&plane(0, 0, 2)).await.unwrap();
    assert_eq!(remote.plane_calls(), 3);

    // A was evicted and is fetched again, pushing out B
    view.get(&plane(0, 0, 0)).await.unwrap();
    assert_eq!(remote.plane_calls(), 4);
    assert_eq!(handle.cache().stats().evictions, 2);

    view.get(&plane(0, 0, 1)).await.unwrap();
    assert_eq!(remote.plane_calls(), 5);
}

#[tokio::test]
async fn test_concurrent_readers_share_fetch() {
    let remote = MockRemote::new()
        .with_image(1, 1, 1, 1, 256, 256)
        .with_latency(Duration::from_millis(30));
    let (remote, _session, registry) = registry(remote, handle_config(64 * PLANE_BYTES));

    let handle = registry.get(DatasetId::new(1)).await.unwrap();

    let mut tasks = Vec::new();
    for _ in 0..16 {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            handle.level(0).unwrap().get(&plane(0, 0, 0)).await
        }));
    }

    let chunks: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    assert!(chunks.iter().all(|chunk| chunk == &chunks[0]));
    assert_eq!(remote.plane_calls(), 1);
}

#[tokio::test]
async fn test_distinct_planes_fetched_in_parallel() {
    let latency = Duration::from_millis(50);
    let remote = MockRemote::new()
        .with_image(1, 1, 1, 4, 128, 128)
        .with_latency(latency);
    let (remote, _session, registry) = registry(remote, handle_config(64 * PLANE_BYTES));

    let handle = registry.get(DatasetId::new(1)).await.unwrap();
    let view = handle.level(0).unwrap();

    // One read spanning four uncached z-planes
    let start = Instant::now();
    let chunk = view
        .get(&[AxisIndex::Scalar(0), AxisIndex::Scalar(0)])
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(chunk.shape(), &[4, 128, 128]);
    assert_eq!(remote.plane_calls(), 4);
    assert_eq!(remote.peak_active_planes(), 4);
    assert!(elapsed < latency * 3, "took {:?}", elapsed);
}

#[tokio::test]
async fn test_transient_failures_retried() {
    let remote = MockRemote::new().with_image(1, 1, 1, 1, 64, 64);
    let (remote, _session, registry) = registry(remote, handle_config(64 * PLANE_BYTES));

    let handle = registry.get(DatasetId::new(1)).await.unwrap();
    remote.fail_next_planes(2);

    let chunk = handle.level(0).unwrap().get(&plane(0, 0, 0)).await.unwrap();
    assert_eq!(chunk.shape(), &[64, 64]);
    assert_eq!(remote.plane_calls(), 3);
}

#[tokio::test]
async fn test_exhausted_retries_not_cached() {
    let remote = MockRemote::new().with_image(1, 1, 1, 1, 64, 64);
    let (remote, _session, registry) = registry(remote, handle_config(64 * PLANE_BYTES));

    let handle = registry.get(DatasetId::new(1)).await.unwrap();
    let view = handle.level(0).unwrap();
    remote.fail_next_planes(3);

    let result = view.get(&plane(0, 0, 0)).await;
    assert!(matches!(result, Err(BridgeError::Fetch { .. })));
    assert!(handle.cache().is_empty());

    // The next read starts a fresh fetch and succeeds
    view.get(&plane(0, 0, 0)).await.unwrap();
    assert_eq!(remote.plane_calls(), 4);
}

#[tokio::test]
async fn test_release_drops_cached_planes() {
    let remote = MockRemote::new()
        .with_image(1, 1, 1, 2, 64, 64)
        .with_image(2, 1, 1, 2, 64, 64);
    let (remote, _session, registry) = registry(remote, handle_config(64 * PLANE_BYTES));

    let first = registry.get(DatasetId::new(1)).await.unwrap();
    let second = registry.get(DatasetId::new(2)).await.unwrap();
    first.level(0).unwrap().get(&[]).await.unwrap();
    second.level(0).unwrap().get(&[]).await.unwrap();
    assert_eq!(first.cache().len(), 2);
    assert_eq!(second.cache().len(), 2);

    assert!(registry.release(DatasetId::new(1)));
    assert!(first.cache().is_empty());
    assert_eq!(second.cache().len(), 2);

    // Reopening starts from an empty cache
    let reopened = registry.get(DatasetId::new(1)).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &reopened));
    reopened.level(0).unwrap().get(&plane(0, 0, 0)).await.unwrap();
    assert_eq!(remote.plane_calls(), 5);
}

#[tokio::test]
async fn test_released_view_does_not_refill_cache() {
    let remote = MockRemote::new().with_image(1, 1, 1, 2, 64, 64);
    let (remote, _session, registry) = registry(remote, handle_config(64 * PLANE_BYTES));

    let handle = registry.get(DatasetId::new(1)).await.unwrap();
    let view = handle.level(0).unwrap();
    view.get(&plane(0, 0, 0)).await.unwrap();

    assert!(registry.release(DatasetId::new(1)));

    let result = view.get(&plane(0, 0, 1)).await;
    assert!(matches!(
        result,
        Err(BridgeError::Closed(id)) if id == DatasetId::new(1)
    ));
    assert!(matches!(
        view.prefetch(&[]).await,
        Err(BridgeError::Closed(_))
    ));
    assert!(handle.cache().is_empty());
    assert_eq!(remote.plane_calls(), 1);
}
