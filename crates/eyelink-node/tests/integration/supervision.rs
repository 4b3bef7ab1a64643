//! Heartbeat supervision and departure across the control channel.

use std::time::Duration;

use eyelink_node::eye::Departure;
use eyelink_node::heartbeat::HeartbeatFailure;

use crate::harness::{TestServerBuilder, TestVision};

/// An eye that stops acknowledging pings is dropped from the registry.
#[tokio::test]
async fn test_silent_eye_is_deregistered() {
    let server = TestServerBuilder::new(46401).build().await.unwrap();
    let eye = server.spawn_eye("cam1", TestVision::with_payload(b"")).await.unwrap();
    let registered = server.wait_registered("cam1", Duration::from_secs(2)).await.unwrap();

    eye.client.heartbeat().dispose();

    let reason = tokio::time::timeout(Duration::from_secs(3), registered.departed())
        .await
        .unwrap();
    assert_eq!(reason, Departure::HeartbeatFailed(HeartbeatFailure::AckTimeout));
    server.wait_deregistered("cam1", Duration::from_secs(2)).await.unwrap();

    server.shutdown().await;
}

/// The eye notices when the server side goes away.
#[tokio::test]
async fn test_eye_notices_lost_server() {
    let server = TestServerBuilder::new(46501).build().await.unwrap();
    let eye = server.spawn_eye("cam1", TestVision::with_payload(b"")).await.unwrap();
    server.wait_registered("cam1", Duration::from_secs(2)).await.unwrap();

    server.server.registry().deregister("cam1").await.unwrap();

    tokio::time::timeout(Duration::from_secs(3), eye.client.disconnected())
        .await
        .expect("eye never noticed the server was gone");

    server.shutdown().await;
}

/// DEREGISTER_EYE from the eye removes it without waiting for heartbeat.
#[tokio::test]
async fn test_shutdown_deregisters() {
    let server = TestServerBuilder::new(46601).build().await.unwrap();
    let eye = server.spawn_eye("cam1", TestVision::with_payload(b"")).await.unwrap();
    let registered = server.wait_registered("cam1", Duration::from_secs(2)).await.unwrap();

    eye.client.shutdown().await;

    let reason = tokio::time::timeout(Duration::from_secs(2), registered.departed())
        .await
        .unwrap();
    assert_eq!(reason, Departure::Deregistered);
    server.wait_deregistered("cam1", Duration::from_secs(2)).await.unwrap();

    server.shutdown().await;
}

/// Server shutdown closes every eye.
#[tokio::test]
async fn test_server_shutdown_closes_eyes() {
    let server = TestServerBuilder::new(46701).build().await.unwrap();
    let cam1 = server.spawn_eye("cam1", TestVision::with_payload(b"")).await.unwrap();
    let cam2 = server.spawn_eye("cam2", TestVision::with_payload(b"")).await.unwrap();
    server.wait_registered("cam2", Duration::from_secs(2)).await.unwrap();

    server.shutdown().await;

    for eye in [&cam1, &cam2] {
        tokio::time::timeout(Duration::from_secs(3), eye.client.disconnected())
            .await
            .expect("eye outlived the server");
    }
}
