//! Discovery service (server role).
//!
//! Listens for REGISTER_EYE datagrams on the discovery port. For each new
//! name it allocates the next control/data port pair, stands up the eye,
//! registers it and answers the sender with REGISTER_EYE_ACK. Duplicate
//! names get no answer at all.
//!
//! State machine: Stopped -> Listening -> Stopped, both transitions
//! idempotent. The port counter survives a restart.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eyelink_protocol::{
    encode, Message, MessageCode, ProtocolError, RegisterEye, RegisterEyeAck, MAX_FRAME_BYTES,
    PROFILE_0,
};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelError;
use crate::eye::{Eye, EyeError, EyeSettings};
use crate::registry::{EyeRegistry, RegistryError};

/// Pause after a failed receive on the discovery socket.
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(200);

/// Sleep for `delay` unless cancelled first. False when cancelled.
pub(crate) async fn backoff(delay: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = cancel.cancelled() => false,
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("malformed registration reply: {0}")]
    MalformedAck(#[source] ProtocolError),
    #[error("unexpected {} in reply to REGISTER_EYE", .0.name())]
    UnexpectedReply(MessageCode),
    #[error("server advertised an invalid address: {0}")]
    BadAddress(String),
    #[error("control ports exhausted")]
    PortsExhausted,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error("eye setup failed: {0}")]
    Eye(#[from] EyeError),
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryState {
    Stopped,
    Listening,
}

#[derive(Debug, Clone)]
pub struct DiscoverySettings {
    /// UDP address registrations arrive on.
    pub bind: SocketAddr,
    pub first_control_port: u16,
    /// IP placed in REGISTER_EYE_ACK.
    pub advertise_ip: IpAddr,
    pub eye: EyeSettings,
}

impl Default for DiscoverySettings {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([0, 0, 0, 0], PROFILE_0.discovery_port)),
            first_control_port: PROFILE_0.first_control_port,
            advertise_ip: IpAddr::from([127, 0, 0, 1]),
            eye: EyeSettings::default(),
        }
    }
}

struct Listening {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct DiscoveryService {
    settings: Arc<DiscoverySettings>,
    registry: EyeRegistry,
    next_port: Arc<AtomicU32>,
    running: Mutex<Option<Listening>>,
}

impl DiscoveryService {
    pub fn new(settings: DiscoverySettings, registry: EyeRegistry) -> Self {
        let next_port = Arc::new(AtomicU32::new(u32::from(settings.first_control_port)));
        Self {
            settings: Arc::new(settings),
            registry,
            next_port,
            running: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> &EyeRegistry {
        &self.registry
    }

    pub async fn state(&self) -> DiscoveryState {
        match &*self.running.lock().await {
            Some(_) => DiscoveryState::Listening,
            None => DiscoveryState::Stopped,
        }
    }

    /// Address the discovery socket is bound to, while listening.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|l| l.local_addr)
    }

    /// Bind the discovery socket and start the receive loop.
    /// Already listening is not an error.
    pub async fn start(&self) -> Result<SocketAddr, DiscoveryError> {
        let mut running = self.running.lock().await;
        if let Some(listening) = running.as_ref() {
            return Ok(listening.local_addr);
        }

        let socket = UdpSocket::bind(self.settings.bind).await?;
        let local_addr = socket.local_addr()?;
        let cancel = CancellationToken::new();
        let worker = RegistrationLoop {
            socket,
            settings: self.settings.clone(),
            registry: self.registry.clone(),
            next_port: self.next_port.clone(),
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(worker.run());

        tracing::info!(
            %local_addr,
            advertise_ip = %self.settings.advertise_ip,
            "discovery: listening"
        );
        *running = Some(Listening {
            local_addr,
            cancel,
            task,
        });
        Ok(local_addr)
    }

    /// Stop the receive loop and release the socket. Eyes stay registered.
    pub async fn stop(&self) {
        let Some(listening) = self.running.lock().await.take() else {
            return;
        };
        listening.cancel.cancel();
        if let Err(e) = listening.task.await {
            tracing::warn!("discovery: loop ended abnormally: {e}");
        }
        tracing::info!(local_addr = %listening.local_addr, "discovery: stopped");
    }
}

struct RegistrationLoop {
    socket: UdpSocket,
    settings: Arc<DiscoverySettings>,
    registry: EyeRegistry,
    next_port: Arc<AtomicU32>,
    cancel: CancellationToken,
}

impl RegistrationLoop {
    async fn run(self) {
        let mut buf = vec![0u8; MAX_FRAME_BYTES];
        loop {
            let received = tokio::select! {
                _ = self.cancel.cancelled() => break,
                r = self.socket.recv_from(&mut buf) => r,
            };
            let (len, from) = match received {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!("discovery: receive failed: {e}");
                    if !backoff(RECV_ERROR_BACKOFF, &self.cancel).await {
                        break;
                    }
                    continue;
                }
            };

            let message = match Message::decode(&buf[..len]) {
                Ok(message) => message,
                Err(e) => {
                    tracing::debug!(%from, "discovery: dropped datagram: {e}");
                    continue;
                }
            };
            let request = match message {
                Message::RegisterEye(request) => request,
                other => {
                    tracing::debug!(
                        %from,
                        code = other.code().name(),
                        "discovery: ignoring non-registration"
                    );
                    continue;
                }
            };

            if let Err(e) = self.handle_registration(request, from).await {
                tracing::warn!(%from, "discovery: registration failed: {e}");
            }
        }
    }

    async fn handle_registration(
        &self,
        request: RegisterEye,
        from: SocketAddr,
    ) -> Result<(), DiscoveryError> {
        let name = request.eye_name;
        tracing::info!(eye = %name, %from, "discovery: registration received");

        // Rejected before any ports are consumed
        if self.registry.contains(&name).await {
            return Err(RegistryError::Duplicate(name).into());
        }

        let control_port = self.allocate_port()?;
        let eye = Eye::open(name.clone(), from.ip(), control_port, &self.settings.eye).await?;
        if let Err(e) = self.registry.register(eye.clone()).await {
            eye.close().await;
            return Err(e.into());
        }
        self.registry.watch(eye.clone());

        let ack = Message::RegisterEyeAck(RegisterEyeAck {
            port: control_port,
            ip: self.settings.advertise_ip.to_string(),
        });
        let sent = match encode(&ack) {
            Ok(frame) => self
                .socket
                .send_to(&frame, from)
                .await
                .map(|_| ())
                .map_err(DiscoveryError::from),
            Err(e) => Err(DiscoveryError::from(e)),
        };
        if let Err(e) = sent {
            self.registry.deregister_instance(&eye).await;
            return Err(e);
        }

        tracing::info!(
            eye = %name,
            control_port,
            data_port = eye.data_port(),
            "discovery: eye registered, ack sent"
        );
        Ok(())
    }

    /// Next control port. Ports are never handed out twice.
    fn allocate_port(&self) -> Result<u16, DiscoveryError> {
        let stride = u32::from(PROFILE_0.port_stride);
        let port = self.next_port.fetch_add(stride, Ordering::SeqCst);
        // The data port (control + 1) must fit too
        match u16::try_from(port + 1) {
            Ok(_) => Ok(port as u16),
            Err(_) => Err(DiscoveryError::PortsExhausted),
        }
    }
}
