//! Session lifecycle integration tests.
//!
//! Tests verify:
//! - Login happens on first use, not at construction
//! - An expired session is re-established once and the call succeeds
//! - Concurrent callers hitting an expired session share one re-login
//! - Remote calls in flight never exceed the pool size
//! - Rejected credentials surface as session errors
//! - Closing the registry logs out

use std::time::Duration;

use omero_bridge::dataset::DatasetId;
use omero_bridge::error::BridgeError;
use omero_bridge::remote::Credentials;
use omero_bridge::session::{RemoteSession, SessionStatus};
use omero_bridge::view::{ArraySource, AxisIndex};
use omero_bridge::{DatasetRegistry, SessionManager};

use super::test_utils::{
    handle_config, registry, registry_with_session, session_config, MockRemote,
};

const BUDGET: usize = 64 * 1024 * 1024;

fn plane(z: i64) -> [AxisIndex; 3] {
    [AxisIndex::Scalar(0), AxisIndex::Scalar(0), AxisIndex::Scalar(z)]
}

#[tokio::test]
async fn test_login_is_lazy() {
    let remote = MockRemote::new().with_image(1, 1, 1, 1, 16, 16);
    let (remote, session, registry) = registry(remote, handle_config(BUDGET));

    assert_eq!(remote.logins(), 0);
    assert_eq!(session.status(), SessionStatus::Disconnected);

    registry.get(DatasetId::new(1)).await.unwrap();
    assert_eq!(remote.logins(), 1);
    assert_eq!(session.status(), SessionStatus::Authenticated);
}

#[tokio::test]
async fn test_expiry_mid_session_reauthenticates_once() {
    let remote = MockRemote::new().with_image(1, 1, 1, 3, 64, 64);
    let (remote, _session, registry) = registry(remote, handle_config(BUDGET));

    let handle = registry.get(DatasetId::new(1)).await.unwrap();
    let view = handle.level(0).unwrap();
    view.get(&plane(0)).await.unwrap();
    assert_eq!(remote.logins(), 1);

    remote.expire_sessions();

    let chunk = view.get(&plane(1)).await.unwrap();
    assert_eq!(chunk.shape(), &[64, 64]);
    assert_eq!(remote.logins(), 2);

    // The refreshed session keeps working
    view.get(&plane(2)).await.unwrap();
    assert_eq!(remote.logins(), 2);
}

#[tokio::test]
async fn test_concurrent_expiry_shares_one_login() {
    let remote = MockRemote::new()
        .with_image(1, 1, 1, 8, 32, 32)
        .with_latency(Duration::from_millis(10));
    let (remote, _session, registry) = registry(remote, handle_config(BUDGET));

    let handle = registry.get(DatasetId::new(1)).await.unwrap();
    assert_eq!(remote.logins(), 1);
    remote.expire_sessions();

    let mut tasks = Vec::new();
    for z in 0..8 {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            handle.level(0).unwrap().get(&plane(z)).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(remote.logins(), 2);
    assert_eq!(remote.plane_calls(), 8);
}

#[tokio::test]
async fn test_plane_fetches_bounded_by_pool_size() {
    let remote = MockRemote::new()
        .with_image(1, 1, 1, 8, 32, 32)
        .with_latency(Duration::from_millis(20));
    let mut config = session_config();
    config.pool_size = 2;
    let (remote, _session, registry) =
        registry_with_session(remote, config, handle_config(BUDGET));

    let handle = registry.get(DatasetId::new(1)).await.unwrap();

    let mut tasks = Vec::new();
    for z in 0..8 {
        let handle = handle.clone();
        tasks.push(tokio::spawn(async move {
            handle.level(0).unwrap().get(&plane(z)).await
        }));
    }
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    assert_eq!(remote.plane_calls(), 8);
    assert_eq!(remote.peak_active_planes(), 2);
}

#[tokio::test]
async fn test_rejected_credentials() {
    let remote = std::sync::Arc::new(MockRemote::new().with_image(1, 1, 1, 1, 16, 16));
    let mut config = session_config();
    config.credentials = Credentials::new("alice", "wrong");
    let session = std::sync::Arc::new(SessionManager::new(remote.clone(), config));
    let registry = DatasetRegistry::new(session.clone(), handle_config(BUDGET));

    let result = registry.get(DatasetId::new(1)).await;
    assert!(matches!(result, Err(BridgeError::Session(_))));
    assert_eq!(session.status(), SessionStatus::Disconnected);
    assert_eq!(remote.metadata_calls(), 0);
}

#[tokio::test]
async fn test_close_logs_out_once() {
    let remote = MockRemote::new().with_image(1, 1, 1, 1, 16, 16);
    let (remote, session, registry) = registry(remote, handle_config(BUDGET));

    let handle = registry.get(DatasetId::new(1)).await.unwrap();
    registry.close().await;

    assert!(handle.is_torn_down());
    assert_eq!(remote.logouts(), 1);
    assert_eq!(session.status(), SessionStatus::Disconnected);

    // A second logout has no session to close
    session.logout().await;
    assert_eq!(remote.logouts(), 1);
}

#[tokio::test]
async fn test_session_usable_after_close() {
    let remote = MockRemote::new().with_image(1, 1, 1, 1, 16, 16);
    let (remote, _session, registry) = registry(remote, handle_config(BUDGET));

    registry.get(DatasetId::new(1)).await.unwrap();
    registry.close().await;

    // Closing leaves the registry reusable; the next access logs in again
    let handle = registry.get(DatasetId::new(1)).await.unwrap();
    handle.level(0).unwrap().get(&plane(0)).await.unwrap();
    assert_eq!(remote.logins(), 2);
}
