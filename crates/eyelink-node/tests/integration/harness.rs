//! Test harness for in-process eyelink integration tests.
//!
//! Provides TestServer (server on loopback with fast heartbeats), TestEye
//! (an eye client discovered through that server) and TestVision (a vision
//! provider that writes a fixed payload to the data port).

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use eyelink_node::channel::ChannelConfig;
use eyelink_node::client::{DiscoveryConfig, EyeClient, EyeClientConfig};
use eyelink_node::discovery::DiscoverySettings;
use eyelink_node::eye::{Eye, EyeSettings};
use eyelink_node::heartbeat::HeartbeatConfig;
use eyelink_node::server::{Server, ThumbnailPolling};
use eyelink_node::vision::{VisionError, VisionProvider, VisionRequest};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

pub fn fast_heartbeat() -> HeartbeatConfig {
    HeartbeatConfig {
        timeout: Duration::from_millis(300),
        interval: Duration::from_millis(100),
        grace: Duration::from_millis(50),
    }
}

pub fn fast_channel() -> ChannelConfig {
    ChannelConfig {
        write_timeout: Duration::from_millis(500),
        reconnect_delay: Duration::from_millis(50),
        connect_timeout: Duration::from_millis(500),
        ..ChannelConfig::default()
    }
}

/// Poll `check` every 20ms until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> anyhow::Result<()>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check().await {
            return Ok(());
        }
        if tokio::time::Instant::now() > deadline {
            anyhow::bail!("condition not met within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Writes `payload` to whatever data address it is handed.
#[derive(Default)]
pub struct TestVision {
    pub payload: Vec<u8>,
    requests: Mutex<Vec<VisionRequest>>,
}

#[allow(dead_code)]
impl TestVision {
    pub fn with_payload(payload: &[u8]) -> Arc<Self> {
        Arc::new(Self {
            payload: payload.to_vec(),
            requests: Mutex::default(),
        })
    }

    pub fn requests(&self) -> Vec<VisionRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl VisionProvider for TestVision {
    async fn capture(
        &self,
        request: VisionRequest,
        data_addr: SocketAddr,
    ) -> Result<(), VisionError> {
        self.requests.lock().unwrap().push(request);
        let mut stream = TcpStream::connect(data_addr).await?;
        stream.write_all(&self.payload).await?;
        stream.shutdown().await?;
        Ok(())
    }
}

pub struct TestServerBuilder {
    first_control_port: u16,
    heartbeat: HeartbeatConfig,
    thumbnails: Option<ThumbnailPolling>,
}

#[allow(dead_code)]
impl TestServerBuilder {
    pub fn new(first_control_port: u16) -> Self {
        Self {
            first_control_port,
            heartbeat: fast_heartbeat(),
            thumbnails: None,
        }
    }

    pub fn heartbeat(mut self, heartbeat: HeartbeatConfig) -> Self {
        self.heartbeat = heartbeat;
        self
    }

    pub fn thumbnails(mut self, polling: ThumbnailPolling) -> Self {
        self.thumbnails = Some(polling);
        self
    }

    pub async fn build(self) -> anyhow::Result<TestServer> {
        let settings = DiscoverySettings {
            bind: "127.0.0.1:0".parse()?,
            first_control_port: self.first_control_port,
            advertise_ip: "127.0.0.1".parse()?,
            eye: EyeSettings {
                bind_ip: "127.0.0.1".parse()?,
                channel: fast_channel(),
                heartbeat: self.heartbeat,
                vision_timeout: Duration::from_secs(2),
            },
        };
        let server = Server::start(settings, self.thumbnails).await?;
        let discovery_addr = server
            .discovery_addr()
            .await
            .ok_or_else(|| anyhow::anyhow!("discovery not listening"))?;
        Ok(TestServer {
            server,
            discovery_addr,
        })
    }
}

/// A running server bound to loopback.
pub struct TestServer {
    pub server: Server,
    pub discovery_addr: SocketAddr,
}

#[allow(dead_code)]
impl TestServer {
    /// Wait for `name` to appear in the registry.
    pub async fn wait_registered(&self, name: &str, timeout: Duration) -> anyhow::Result<Arc<Eye>> {
        let registry = self.server.registry().clone();
        eventually(timeout, || {
            let registry = registry.clone();
            async move { registry.contains(name).await }
        })
        .await?;
        self.server
            .registry()
            .lookup(name)
            .await
            .ok_or_else(|| anyhow::anyhow!("{name} vanished"))
    }

    /// Wait for `name` to leave the registry.
    pub async fn wait_deregistered(&self, name: &str, timeout: Duration) -> anyhow::Result<()> {
        let registry = self.server.registry().clone();
        eventually(timeout, || {
            let registry = registry.clone();
            async move { !registry.contains(name).await }
        })
        .await
    }

    pub fn client_config(&self, name: &str) -> EyeClientConfig {
        EyeClientConfig {
            name: name.into(),
            discovery: DiscoveryConfig {
                target: self.discovery_addr,
                retry_count: 5,
                recv_timeout: Duration::from_millis(300),
                error_backoff: Duration::from_millis(100),
            },
            channel: fast_channel(),
            heartbeat: fast_heartbeat(),
        }
    }

    /// Discover and connect an eye named `name`.
    pub async fn spawn_eye(&self, name: &str, vision: Arc<TestVision>) -> anyhow::Result<TestEye> {
        let config = self.client_config(name);
        let client = EyeClient::connect(config, vision.clone(), CancellationToken::new())
            .await?
            .ok_or_else(|| anyhow::anyhow!("{name}: no server answered"))?;
        Ok(TestEye { client, vision })
    }

    pub async fn shutdown(self) {
        self.server.shutdown().await;
    }
}

pub struct TestEye {
    pub client: EyeClient,
    pub vision: Arc<TestVision>,
}
