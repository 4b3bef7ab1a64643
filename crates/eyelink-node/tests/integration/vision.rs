//! Vision requests from server to eye, and media on the data port.

use std::time::Duration;

use eyelink_node::eye::EyeEvent;
use eyelink_node::server::ThumbnailPolling;
use eyelink_node::vision::VisionRequest;
use eyelink_protocol::{VisionRequestType, PROFILE_0};

use crate::harness::{eventually, TestServerBuilder, TestVision};

#[tokio::test]
async fn test_picture_request_reports_ready() {
    let server = TestServerBuilder::new(46801).build().await.unwrap();
    let eye = server.spawn_eye("cam1", TestVision::with_payload(b"jpeg")).await.unwrap();
    let registered = server.wait_registered("cam1", Duration::from_secs(2)).await.unwrap();

    let mut events = registered.subscribe();
    registered.request_picture(800, 450).await.unwrap();

    let ready = tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            if let Ok(EyeEvent::VisionReady(kind)) = events.recv().await {
                return kind;
            }
        }
    })
    .await
    .unwrap();
    assert_eq!(ready, VisionRequestType::Picture);

    let vision = eye.vision.clone();
    eventually(Duration::from_secs(2), || {
        let vision = vision.clone();
        async move { !vision.requests().is_empty() }
    })
    .await
    .unwrap();
    match &eye.vision.requests()[0] {
        VisionRequest::Picture(req) => {
            assert_eq!((req.picture_width, req.picture_height), (800, 450));
            assert_eq!(req.port, registered.data_port());
        }
        other => panic!("unexpected request {other:?}"),
    }

    server.shutdown().await;
}

#[tokio::test]
async fn test_fetch_picture_end_to_end() {
    let server = TestServerBuilder::new(46901).build().await.unwrap();
    let _eye = server
        .spawn_eye("cam1", TestVision::with_payload(b"\xff\xd8 jpeg body \xff\xd9"))
        .await
        .unwrap();
    let registered = server.wait_registered("cam1", Duration::from_secs(2)).await.unwrap();

    let picture = registered
        .fetch_picture(320, 180, Duration::from_secs(3))
        .await
        .unwrap();
    assert_eq!(picture, b"\xff\xd8 jpeg body \xff\xd9");
    assert!(!registered.is_busy());

    server.shutdown().await;
}

#[tokio::test]
async fn test_stream_request_reaches_provider() {
    let server = TestServerBuilder::new(47001).build().await.unwrap();
    let eye = server.spawn_eye("cam1", TestVision::with_payload(b"h264")).await.unwrap();
    let registered = server.wait_registered("cam1", Duration::from_secs(2)).await.unwrap();

    registered.request_stream(5.0).await.unwrap();
    let mut data = registered
        .accept_vision_stream(Duration::from_secs(2))
        .await
        .unwrap();
    let mut received = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut data, &mut received)
        .await
        .unwrap();
    assert_eq!(received, b"h264");

    match &eye.vision.requests()[0] {
        VisionRequest::Stream(req) => {
            assert_eq!(req.stream_length, 5.0);
            assert_eq!(req.port, registered.data_port());
        }
        other => panic!("unexpected request {other:?}"),
    }

    server.shutdown().await;
}

/// The server polls idle eyes for thumbnails at the configured size.
#[tokio::test]
async fn test_thumbnail_polling() {
    let server = TestServerBuilder::new(47101)
        .thumbnails(ThumbnailPolling::every(
            Duration::from_millis(200),
            Duration::from_secs(2),
        ))
        .build()
        .await
        .unwrap();
    let eye = server.spawn_eye("cam1", TestVision::with_payload(b"thumb")).await.unwrap();

    let vision = eye.vision.clone();
    eventually(Duration::from_secs(3), || {
        let vision = vision.clone();
        async move { !vision.requests().is_empty() }
    })
    .await
    .unwrap();
    match &eye.vision.requests()[0] {
        VisionRequest::Picture(req) => {
            assert_eq!(req.picture_width, PROFILE_0.thumbnail_width);
            assert_eq!(req.picture_height, PROFILE_0.thumbnail_height);
        }
        other => panic!("unexpected request {other:?}"),
    }

    server.shutdown().await;
}
