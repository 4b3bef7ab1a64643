//! Discovery and registration over loopback.

use std::time::Duration;

use eyelink_node::client::discover;
use eyelink_node::eye::EyeEvent;
use eyelink_node::heartbeat::HeartbeatState;
use tokio_util::sync::CancellationToken;

use crate::harness::{TestServerBuilder, TestVision};

/// First eye gets the first control port and the data port above it, and
/// both ends start beating.
#[tokio::test]
async fn test_first_eye_gets_first_port_pair() {
    let server = TestServerBuilder::new(8001).build().await.unwrap();
    let eye = server.spawn_eye("cam1", TestVision::with_payload(b"")).await.unwrap();

    assert_eq!(eye.client.server_addr().port(), 8001);
    assert_eq!(eye.client.data_addr().port(), 8002);

    let registered = server.wait_registered("cam1", Duration::from_secs(2)).await.unwrap();
    assert_eq!(registered.control_port(), 8001);
    assert_eq!(registered.data_port(), 8002);

    let mut events = registered.subscribe();
    let pulse = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(EyeEvent::Pulse) = events.recv().await {
                return;
            }
        }
    })
    .await;
    assert!(pulse.is_ok(), "server never saw a heartbeat round-trip");

    let active = |s: &HeartbeatState| s.is_active();
    assert!(registered.heartbeat().wait_for_state(Duration::from_secs(2), active).await);
    assert!(eye.client.heartbeat().wait_for_state(Duration::from_secs(2), active).await);

    eye.client.shutdown().await;
    server.shutdown().await;
}

#[tokio::test]
async fn test_eyes_get_consecutive_pairs() {
    let server = TestServerBuilder::new(46101).build().await.unwrap();
    let cam1 = server.spawn_eye("cam1", TestVision::with_payload(b"")).await.unwrap();
    let cam2 = server.spawn_eye("cam2", TestVision::with_payload(b"")).await.unwrap();

    assert_eq!(cam1.client.server_addr().port(), 46101);
    assert_eq!(cam2.client.server_addr().port(), 46103);
    server.wait_registered("cam2", Duration::from_secs(2)).await.unwrap();
    assert_eq!(server.server.registry().names().await, vec!["cam1", "cam2"]);

    server.shutdown().await;
}

/// A second REGISTER_EYE for a live name gets no ack and changes nothing.
#[tokio::test]
async fn test_duplicate_name_is_ignored() {
    let server = TestServerBuilder::new(46201).build().await.unwrap();
    let _cam1 = server.spawn_eye("cam1", TestVision::with_payload(b"")).await.unwrap();
    let original = server.wait_registered("cam1", Duration::from_secs(2)).await.unwrap();

    let mut config = server.client_config("cam1").discovery;
    config.retry_count = 2;
    let reply = discover("cam1", &config, &CancellationToken::new()).await.unwrap();
    assert!(reply.is_none());

    assert_eq!(server.server.registry().len().await, 1);
    let current = server.server.registry().lookup("cam1").await.unwrap();
    assert_eq!(current.control_port(), original.control_port());

    server.shutdown().await;
}

/// Ports are never handed out twice, even after the eye that held them left.
#[tokio::test]
async fn test_reregistration_gets_fresh_port() {
    let server = TestServerBuilder::new(46301).build().await.unwrap();
    let first = server.spawn_eye("cam1", TestVision::with_payload(b"")).await.unwrap();
    server.wait_registered("cam1", Duration::from_secs(2)).await.unwrap();

    first.client.shutdown().await;
    server.wait_deregistered("cam1", Duration::from_secs(2)).await.unwrap();

    let second = server.spawn_eye("cam1", TestVision::with_payload(b"")).await.unwrap();
    assert_eq!(second.client.server_addr().port(), 46303);

    server.shutdown().await;
}
