//! Array view integration tests.
//!
//! Tests verify:
//! - Slicing semantics: scalars drop axes, ranges keep them, negatives wrap
//! - Reads spanning several planes and tiles assemble the right pixels
//! - Pyramid levels are exposed as separate arrays
//! - Invalid indices fail before any fetch
//! - The blocking facade works from synchronous code

use omero_bridge::dataset::{Axis, DatasetId};
use omero_bridge::error::BridgeError;
use omero_bridge::view::{ArraySource, AxisIndex, BlockingArrayView};

use super::test_utils::{handle_config, pixel_value, registry, u16_at, MockRemote};

const BUDGET: usize = 64 * 1024 * 1024;

// =============================================================================
// Slicing
// =============================================================================

#[tokio::test]
async fn test_range_over_z_keeps_axis() {
    let remote = MockRemote::new().with_image(1, 2, 2, 5, 32, 48);
    let (remote, _session, registry) = registry(remote, handle_config(BUDGET));

    let handle = registry.get(DatasetId::new(1)).await.unwrap();
    let chunk = handle
        .level(0)
        .unwrap()
        .get(&[
            AxisIndex::Scalar(1),
            AxisIndex::Scalar(1),
            AxisIndex::range(1, 4),
        ])
        .await
        .unwrap();

    assert_eq!(chunk.shape(), &[3, 32, 48]);
    assert_eq!(chunk.axes(), &[Axis::Z, Axis::Y, Axis::X]);
    assert_eq!(remote.plane_calls(), 3);

    for (i, z) in (1..4).enumerate() {
        let base = i * 32 * 48;
        assert_eq!(u16_at(chunk.data(), base), pixel_value(0, 1, 1, z, 0, 0));
        assert_eq!(
            u16_at(chunk.data(), base + 10 * 48 + 7),
            pixel_value(0, 1, 1, z, 10, 7)
        );
    }
}

#[tokio::test]
async fn test_full_read_fetches_every_plane() {
    let remote = MockRemote::new().with_image(1, 2, 1, 5, 16, 16);
    let (remote, _session, registry) = registry(remote, handle_config(BUDGET));

    let handle = registry.get(DatasetId::new(1)).await.unwrap();
    let chunk = handle.level(0).unwrap().get(&[]).await.unwrap();

    assert_eq!(chunk.shape(), &[2, 1, 5, 16, 16]);
    assert_eq!(chunk.len(), 2 * 5 * 16 * 16 * 2);
    assert_eq!(remote.plane_calls(), 10);
    assert_eq!(
        chunk.value(&[1, 0, 4, 15, 15]),
        Some(pixel_value(0, 1, 0, 4, 15, 15) as f64)
    );
}

#[tokio::test]
async fn test_negative_indices_wrap() {
    let remote = MockRemote::new().with_image(1, 3, 1, 4, 16, 16);
    let (_remote, _session, registry) = registry(remote, handle_config(BUDGET));

    let handle = registry.get(DatasetId::new(1)).await.unwrap();
    let view = handle.level(0).unwrap();

    let wrapped = view
        .get(&[AxisIndex::Scalar(-1), AxisIndex::Scalar(0), AxisIndex::Scalar(-2)])
        .await
        .unwrap();
    let explicit = view
        .get(&[AxisIndex::Scalar(2), AxisIndex::Scalar(0), AxisIndex::Scalar(2)])
        .await
        .unwrap();

    assert_eq!(wrapped, explicit);
}

#[tokio::test]
async fn test_yx_window_crops_plane() {
    let remote = MockRemote::new().with_image(1, 1, 1, 1, 64, 64);
    let (remote, _session, registry) = registry(remote, handle_config(BUDGET));

    let handle = registry.get(DatasetId::new(1)).await.unwrap();
    let chunk = handle
        .level(0)
        .unwrap()
        .get(&[
            AxisIndex::Scalar(0),
            AxisIndex::Scalar(0),
            AxisIndex::Scalar(0),
            AxisIndex::range(10, 20),
            AxisIndex::range(30, 34),
        ])
        .await
        .unwrap();

    assert_eq!(chunk.shape(), &[10, 4]);
    assert_eq!(chunk.value(&[0, 0]), Some(pixel_value(0, 0, 0, 0, 10, 30) as f64));
    assert_eq!(chunk.value(&[9, 3]), Some(pixel_value(0, 0, 0, 0, 19, 33) as f64));
    assert_eq!(remote.plane_calls(), 1);
}

#[tokio::test]
async fn test_empty_range_fetches_nothing() {
    let remote = MockRemote::new().with_image(1, 1, 1, 5, 16, 16);
    let (remote, _session, registry) = registry(remote, handle_config(BUDGET));

    let handle = registry.get(DatasetId::new(1)).await.unwrap();
    let chunk = handle
        .level(0)
        .unwrap()
        .get(&[
            AxisIndex::Scalar(0),
            AxisIndex::Scalar(0),
            AxisIndex::range(3, 3),
        ])
        .await
        .unwrap();

    assert_eq!(chunk.shape(), &[0, 16, 16]);
    assert!(chunk.is_empty());
    assert_eq!(remote.plane_calls(), 0);
}

// =============================================================================
// Invalid Indices
// =============================================================================

#[tokio::test]
async fn test_out_of_range_index_fails_without_fetch() {
    let remote = MockRemote::new().with_image(1, 2, 1, 5, 16, 16);
    let (remote, _session, registry) = registry(remote, handle_config(BUDGET));

    let handle = registry.get(DatasetId::new(1)).await.unwrap();
    let view = handle.level(0).unwrap();

    let err = view
        .get(&[AxisIndex::Scalar(0), AxisIndex::Scalar(0), AxisIndex::Scalar(5)])
        .await
        .unwrap_err();
    assert!(err.is_index_error());
    assert!(matches!(
        err,
        BridgeError::Index {
            axis: Axis::Z,
            index: 5,
            bound: 5
        }
    ));

    let err = view
        .get(&[AxisIndex::Scalar(-3)])
        .await
        .unwrap_err();
    assert!(err.is_index_error());

    let err = view
        .get(&[AxisIndex::Full; 6])
        .await
        .unwrap_err();
    assert!(matches!(err, BridgeError::TooManyIndices { given: 6, ndim: 5 }));

    assert_eq!(remote.plane_calls(), 0);
}

// =============================================================================
// Pyramids and Tiles
// =============================================================================

#[tokio::test]
async fn test_tiled_region_assembles_tiles() {
    let remote = MockRemote::new().with_pyramid(7, 512, 3, 128);
    let (remote, _session, registry) = registry(remote, handle_config(BUDGET));

    let handle = registry.get(DatasetId::new(7)).await.unwrap();
    let view = handle.level(0).unwrap();
    let chunk = view
        .get(&[
            AxisIndex::Scalar(0),
            AxisIndex::Scalar(0),
            AxisIndex::Scalar(0),
            AxisIndex::range(100, 300),
            AxisIndex::range(120, 140),
        ])
        .await
        .unwrap();

    assert_eq!(chunk.shape(), &[200, 20]);
    // Rows 100..300 touch tile rows 0, 1 and 2; columns 120..140 tile columns 0 and 1
    assert_eq!(remote.plane_calls(), 6);
    assert!(remote.plane_requests().iter().all(|key| key.tile.is_some()));

    for (row, col) in [(0, 0), (27, 7), (28, 8), (199, 19)] {
        assert_eq!(
            chunk.value(&[row, col]),
            Some(pixel_value(0, 0, 0, 0, 100 + row, 120 + col) as f64)
        );
    }
}

#[tokio::test]
async fn test_levels_are_separate_arrays() {
    let remote = MockRemote::new().with_pyramid(7, 512, 3, 128);
    let (remote, _session, registry) = registry(remote, handle_config(BUDGET));

    let handle = registry.get(DatasetId::new(7)).await.unwrap();
    assert_eq!(handle.levels().len(), 3);
    assert_eq!(handle.level(1).unwrap().shape(), [1, 1, 1, 256, 256]);

    let coarse = handle.view_for_scale(4.0);
    assert_eq!(coarse.level().index, 2);
    assert_eq!(coarse.shape(), [1, 1, 1, 128, 128]);

    // The coarsest level fits in one tile, so it is fetched as a whole plane
    let chunk = coarse.get(&[]).await.unwrap();
    assert_eq!(chunk.shape(), &[1, 1, 1, 128, 128]);
    assert_eq!(remote.plane_calls(), 1);
    assert_eq!(remote.plane_requests()[0].level, 2);
    assert_eq!(remote.plane_requests()[0].tile, None);
    assert_eq!(
        chunk.value(&[0, 0, 0, 127, 127]),
        Some(pixel_value(2, 0, 0, 0, 127, 127) as f64)
    );

    assert_eq!(handle.view_for_scale(1.5).level().index, 0);
    assert_eq!(handle.view_for_scale(2.5).level().index, 1);
    assert_eq!(handle.view_for_scale(100.0).level().index, 2);
}

#[tokio::test]
async fn test_prefetch_warms_cache() {
    let remote = MockRemote::new().with_image(1, 2, 3, 4, 16, 16);
    let (remote, _session, registry) = registry(remote, handle_config(BUDGET));

    let handle = registry.get(DatasetId::new(1)).await.unwrap();
    let count = handle.prefetch_channel(0, 1).await.unwrap();
    assert_eq!(count, 8);
    assert_eq!(remote.plane_calls(), 8);

    // Every plane of channel 1 is served from the cache
    handle
        .level(0)
        .unwrap()
        .get(&[AxisIndex::Full, AxisIndex::Scalar(1)])
        .await
        .unwrap();
    assert_eq!(remote.plane_calls(), 8);

    assert!(handle.prefetch_channel(5, 0).await.is_err());
}

// =============================================================================
// Blocking Facade
// =============================================================================

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_blocking_view_from_sync_code() {
    let remote = MockRemote::new().with_image(1, 1, 1, 3, 32, 32);
    let (remote, _session, registry) = registry(remote, handle_config(BUDGET));

    let handle = registry.get(DatasetId::new(1)).await.unwrap();
    let view = BlockingArrayView::new(
        handle.level(0).unwrap().clone(),
        tokio::runtime::Handle::current(),
    );
    assert_eq!(view.shape(), [1, 1, 3, 32, 32]);

    let chunk = tokio::task::spawn_blocking(move || {
        view.get_blocking(&[AxisIndex::Scalar(0), AxisIndex::Scalar(0), AxisIndex::Scalar(1)])
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(chunk.shape(), &[32, 32]);
    assert_eq!(remote.plane_calls(), 1);
}
