//! Eye client -- the eye side of discovery, the control channel and vision.
//!
//! Lifecycle:
//!   1. Broadcast REGISTER_EYE until a REGISTER_EYE_ACK arrives (or give up).
//!   2. Connect the control channel to the acked address and start heartbeat.
//!   3. Serve REQUEST_STREAM / REQUEST_PICTURE: answer VISION_READY, then let
//!      the vision provider deliver media to the server's data port.
//!   4. Resolve `disconnected()` when heartbeat fails or the channel closes.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use eyelink_protocol::{
    encode, DeregisterEye, Message, RegisterEye, RegisterEyeAck, RequestPicture, RequestStream,
    VisionReady, MAX_FRAME_BYTES, PROFILE_0,
};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::channel::{ChannelConfig, ChannelHandle, PeerChannel};
use crate::discovery::{backoff, DiscoveryError};
use crate::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatSupervisor};
use crate::vision::{VisionProvider, VisionRequest};

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Where REGISTER_EYE goes; normally the broadcast address.
    pub target: SocketAddr,
    pub retry_count: u32,
    /// How long to wait for an ack after each broadcast.
    pub recv_timeout: Duration,
    /// Pause after a socket error before the next attempt.
    pub error_backoff: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            target: SocketAddr::from(([255, 255, 255, 255], PROFILE_0.discovery_port)),
            retry_count: PROFILE_0.discovery_retry_count,
            recv_timeout: Duration::from_secs(PROFILE_0.discovery_recv_timeout_secs),
            error_backoff: Duration::from_secs(PROFILE_0.discovery_error_backoff_secs),
        }
    }
}

/// Broadcast REGISTER_EYE for `name` until the server answers.
///
/// Ok(None) when every attempt went unanswered or `cancel` fired. A reply
/// that is not a well-formed REGISTER_EYE_ACK is an error: retries are for
/// missing replies, not garbled ones.
pub async fn discover(
    name: &str,
    config: &DiscoveryConfig,
    cancel: &CancellationToken,
) -> Result<Option<RegisterEyeAck>, DiscoveryError> {
    let unspecified = match config.target {
        SocketAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        SocketAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let socket = UdpSocket::bind(SocketAddr::new(unspecified, 0)).await?;
    socket.set_broadcast(true)?;

    let request = encode(&Message::RegisterEye(RegisterEye {
        eye_name: name.to_string(),
    }))?;
    let mut buf = vec![0u8; MAX_FRAME_BYTES];

    for attempt in 1..=config.retry_count {
        tracing::debug!(
            eye = %name,
            attempt,
            target = %config.target,
            "discovery: sending REGISTER_EYE"
        );

        if let Err(e) = socket.send_to(&request, config.target).await {
            tracing::warn!(eye = %name, attempt, "discovery: send failed: {e}");
            if !backoff(config.error_backoff, cancel).await {
                return Ok(None);
            }
            continue;
        }

        let received = tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            r = tokio::time::timeout(config.recv_timeout, socket.recv_from(&mut buf)) => r,
        };
        match received {
            Err(_) => {
                tracing::debug!(eye = %name, attempt, "discovery: no reply");
            }
            Ok(Err(e)) => {
                tracing::warn!(eye = %name, attempt, "discovery: receive failed: {e}");
                if !backoff(config.error_backoff, cancel).await {
                    return Ok(None);
                }
            }
            Ok(Ok((len, from))) => {
                let reply = Message::decode(&buf[..len]).map_err(DiscoveryError::MalformedAck)?;
                return match reply {
                    Message::RegisterEyeAck(ack) => {
                        tracing::info!(
                            eye = %name,
                            %from,
                            port = ack.port,
                            ip = %ack.ip,
                            "discovery: registered"
                        );
                        Ok(Some(ack))
                    }
                    other => Err(DiscoveryError::UnexpectedReply(other.code())),
                };
            }
        }
    }

    tracing::warn!(eye = %name, attempts = config.retry_count, "discovery: no server answered");
    Ok(None)
}

#[derive(Debug, Clone)]
pub struct EyeClientConfig {
    pub name: String,
    pub discovery: DiscoveryConfig,
    pub channel: ChannelConfig,
    pub heartbeat: HeartbeatConfig,
}

pub struct EyeClient {
    name: String,
    server: SocketAddr,
    data_port: u16,
    write_timeout: Duration,
    channel: PeerChannel,
    heartbeat: Arc<HeartbeatSupervisor>,
    lost: CancellationToken,
}

impl EyeClient {
    /// Discover the server and connect to it.
    ///
    /// Ok(None) when discovery ran out of attempts or `cancel` fired.
    pub async fn connect<P: VisionProvider>(
        config: EyeClientConfig,
        provider: Arc<P>,
        cancel: CancellationToken,
    ) -> Result<Option<Self>, DiscoveryError> {
        let Some(ack) = discover(&config.name, &config.discovery, &cancel).await? else {
            return Ok(None);
        };
        let ip: IpAddr = ack
            .ip
            .parse()
            .map_err(|_| DiscoveryError::BadAddress(ack.ip.clone()))?;
        let server = SocketAddr::new(ip, ack.port);
        Self::attach(config, server, provider).await.map(Some)
    }

    /// Connect to a server whose control address is already known.
    pub async fn attach<P: VisionProvider>(
        config: EyeClientConfig,
        server: SocketAddr,
        provider: Arc<P>,
    ) -> Result<Self, DiscoveryError> {
        let data_port = PROFILE_0
            .checked_data_port(server.port())
            .ok_or_else(|| DiscoveryError::BadAddress(server.to_string()))?;
        let channel = PeerChannel::connect(server, config.channel.clone()).await?;

        let (jobs_tx, jobs_rx) = mpsc::unbounded_channel();
        {
            let jobs = jobs_tx.clone();
            channel.router().subscribe::<RequestStream, _>(move |req| {
                let _ = jobs.send(VisionRequest::Stream(req.clone()));
                Ok(())
            });
        }
        channel.router().subscribe::<RequestPicture, _>(move |req| {
            let _ = jobs_tx.send(VisionRequest::Picture(req.clone()));
            Ok(())
        });
        tokio::spawn(serve_vision(
            config.name.clone(),
            channel.handle(),
            server.ip(),
            provider,
            jobs_rx,
        ));

        let (heartbeat, events) = channel.attach_heartbeat(config.heartbeat.clone());
        let lost = channel.handle().child_token();
        tokio::spawn(watch_heartbeat(config.name.clone(), events, lost.clone()));
        heartbeat.start();

        tracing::info!(eye = %config.name, %server, "eye: control channel connected");
        Ok(Self {
            name: config.name,
            server,
            data_port,
            write_timeout: config.channel.write_timeout,
            channel,
            heartbeat,
            lost,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Server control address.
    pub fn server_addr(&self) -> SocketAddr {
        self.server
    }

    /// Server data address vision goes to by default.
    pub fn data_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server.ip(), self.data_port)
    }

    pub fn channel(&self) -> &PeerChannel {
        &self.channel
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatSupervisor> {
        &self.heartbeat
    }

    /// Resolves when the heartbeat fails or the channel closes.
    pub async fn disconnected(&self) {
        self.lost.cancelled().await
    }

    /// Tell the server we are leaving, then close the channel.
    pub async fn shutdown(self) {
        let goodbye = DeregisterEye {
            eye_name: self.name.clone(),
        };
        if let Err(e) = self.channel.send_within(goodbye, self.write_timeout).await {
            tracing::debug!(eye = %self.name, "eye: deregistration not delivered: {e}");
        }
        self.channel.close().await;
        tracing::info!(eye = %self.name, "eye: shut down");
    }
}

async fn watch_heartbeat(
    eye: String,
    mut events: mpsc::UnboundedReceiver<HeartbeatEvent>,
    lost: CancellationToken,
) {
    while let Some(event) = events.recv().await {
        match event {
            HeartbeatEvent::Beat { rtt } => tracing::trace!(%eye, ?rtt, "eye: heartbeat"),
            HeartbeatEvent::Failed(failure) => {
                tracing::warn!(%eye, ?failure, "eye: server stopped responding");
                lost.cancel();
                return;
            }
        }
    }
}

/// Answer vision requests one at a time, in arrival order.
async fn serve_vision<P: VisionProvider>(
    eye: String,
    channel: ChannelHandle,
    server_ip: IpAddr,
    provider: Arc<P>,
    mut jobs: mpsc::UnboundedReceiver<VisionRequest>,
) {
    loop {
        let request = tokio::select! {
            _ = channel.closed() => return,
            job = jobs.recv() => match job {
                Some(request) => request,
                None => return,
            },
        };
        let kind = request.kind();
        tracing::info!(%eye, request = kind.name(), port = request.port(), "eye: vision requested");

        let ready = channel.send(VisionReady { request_type: kind }).wait().await;
        if let Err(e) = ready {
            tracing::warn!(%eye, "eye: VISION_READY not delivered: {e}");
            continue;
        }

        let data_addr = SocketAddr::new(server_ip, request.port());
        tokio::select! {
            _ = channel.closed() => return,
            result = provider.capture(request, data_addr) => match result {
                Ok(()) => tracing::debug!(%eye, request = kind.name(), "eye: vision delivered"),
                Err(e) => tracing::warn!(%eye, request = kind.name(), "eye: vision failed: {e}"),
            },
        }
    }
}
