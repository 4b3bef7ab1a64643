//! Server assembly: registry, discovery service and thumbnail polling.

use std::net::SocketAddr;
use std::time::Duration;

use eyelink_protocol::PROFILE_0;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::discovery::{DiscoveryError, DiscoveryService, DiscoverySettings};
use crate::eye::EyeError;
use crate::registry::EyeRegistry;

#[derive(Debug, Clone)]
pub struct ThumbnailPolling {
    pub interval: Duration,
    pub width: u32,
    pub height: u32,
    /// Bound on one eye's request-to-last-byte round.
    pub timeout: Duration,
}

impl ThumbnailPolling {
    pub fn every(interval: Duration, timeout: Duration) -> Self {
        Self {
            interval,
            width: PROFILE_0.thumbnail_width,
            height: PROFILE_0.thumbnail_height,
            timeout,
        }
    }
}

pub struct Server {
    registry: EyeRegistry,
    discovery: DiscoveryService,
    cancel: CancellationToken,
    poller: Option<JoinHandle<()>>,
}

impl Server {
    /// Start discovery and, if configured, thumbnail polling.
    pub async fn start(
        settings: DiscoverySettings,
        thumbnails: Option<ThumbnailPolling>,
    ) -> Result<Self, DiscoveryError> {
        let registry = EyeRegistry::new();
        let discovery = DiscoveryService::new(settings, registry.clone());
        discovery.start().await?;

        let cancel = CancellationToken::new();
        let poller = thumbnails.map(|polling| {
            tokio::spawn(poll_thumbnails(registry.clone(), polling, cancel.clone()))
        });

        Ok(Self {
            registry,
            discovery,
            cancel,
            poller,
        })
    }

    pub fn registry(&self) -> &EyeRegistry {
        &self.registry
    }

    pub fn discovery(&self) -> &DiscoveryService {
        &self.discovery
    }

    pub async fn discovery_addr(&self) -> Option<SocketAddr> {
        self.discovery.local_addr().await
    }

    /// Stop discovery and polling, then close every eye.
    pub async fn shutdown(mut self) {
        self.cancel.cancel();
        if let Some(poller) = self.poller.take() {
            let _ = poller.await;
        }
        self.discovery.stop().await;
        self.registry.clear().await;
        tracing::info!("server: shut down");
    }
}

/// Ask every idle eye for a thumbnail each interval.
async fn poll_thumbnails(
    registry: EyeRegistry,
    polling: ThumbnailPolling,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(polling.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let eyes = registry.eyes().await;
        let rounds = eyes.into_iter().filter(|eye| !eye.is_busy()).map(|eye| {
            let polling = polling.clone();
            async move {
                match eye
                    .fetch_picture(polling.width, polling.height, polling.timeout)
                    .await
                {
                    Ok(picture) => tracing::info!(
                        eye = %eye.name(),
                        bytes = picture.len(),
                        "server: thumbnail received"
                    ),
                    Err(EyeError::VisionBusy { .. }) => {}
                    Err(e) => tracing::warn!(eye = %eye.name(), "server: thumbnail failed: {e}"),
                }
            }
        });
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = futures_util::future::join_all(rounds) => {}
        }
    }
}
