//! Server-side view of one registered eye.
//!
//! An eye owns its control channel (bound on the allocated control port),
//! the heartbeat supervisor on that channel, and the data-port listener the
//! vision provider connects to. Vision requests are one at a time: a new
//! request fails with `VisionBusy` until VISION_READY arrives or the
//! request times out.

use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use eyelink_protocol::{
    DeregisterEye, Message, RequestPicture, RequestStream, VisionReady, VisionRequestType,
    PROFILE_0,
};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::Instant;

use crate::channel::{ChannelConfig, ChannelError, PeerChannel, SendReceipt};
use crate::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatFailure, HeartbeatSupervisor};

/// Buffered events per subscriber before it starts lagging.
const EVENT_CAPACITY: usize = 64;

/// What the server needs to stand up an eye.
#[derive(Debug, Clone)]
pub struct EyeSettings {
    /// Address control and data ports are bound on.
    pub bind_ip: IpAddr,
    pub channel: ChannelConfig,
    pub heartbeat: HeartbeatConfig,
    /// How long an unanswered vision request keeps the eye busy.
    pub vision_timeout: Duration,
}

impl Default for EyeSettings {
    fn default() -> Self {
        Self {
            bind_ip: IpAddr::from([0, 0, 0, 0]),
            channel: ChannelConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            vision_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EyeEvent {
    /// Heartbeat round-trip succeeded.
    Pulse,
    /// The eye is about to deliver media on the data port.
    VisionReady(VisionRequestType),
    /// Heartbeat failed; the eye is about to be deregistered.
    Lost,
}

/// Why an eye left.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Departure {
    HeartbeatFailed(HeartbeatFailure),
    Deregistered,
    Closed,
}

#[derive(Debug, thiserror::Error)]
pub enum EyeError {
    #[error("eye {eye} is busy with a {} request", .pending.name())]
    VisionBusy {
        eye: String,
        pending: VisionRequestType,
    },
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("eye closed")]
    Closed,
    #[error("channel error: {0}")]
    Channel(#[from] ChannelError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy)]
struct PendingVision {
    kind: VisionRequestType,
    since: Instant,
}

pub struct Eye {
    name: String,
    ip: IpAddr,
    control_port: u16,
    data_port: u16,
    channel: PeerChannel,
    heartbeat: Arc<HeartbeatSupervisor>,
    data_listener: tokio::sync::Mutex<Option<TcpListener>>,
    events: broadcast::Sender<EyeEvent>,
    departure: Arc<watch::Sender<Option<Departure>>>,
    pending: Arc<Mutex<Option<PendingVision>>>,
    vision_timeout: Duration,
}

impl std::fmt::Debug for Eye {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Eye")
            .field("name", &self.name)
            .field("ip", &self.ip)
            .field("control_port", &self.control_port)
            .field("data_port", &self.data_port)
            .finish_non_exhaustive()
    }
}

impl Eye {
    /// Bind the eye's control and data ports and start supervising it.
    ///
    /// `ip` is where the registration came from; the eye is expected to
    /// connect its control channel to `control_port` shortly.
    pub async fn open(
        name: String,
        ip: IpAddr,
        control_port: u16,
        settings: &EyeSettings,
    ) -> Result<Arc<Self>, EyeError> {
        let data_port = PROFILE_0.data_port(control_port);
        let channel = PeerChannel::listen(
            SocketAddr::new(settings.bind_ip, control_port),
            settings.channel.clone(),
        )
        .await?;
        let data_listener =
            match TcpListener::bind(SocketAddr::new(settings.bind_ip, data_port)).await {
                Ok(listener) => listener,
                Err(e) => {
                    channel.close().await;
                    return Err(e.into());
                }
            };

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (departure, _) = watch::channel(None);
        let departure = Arc::new(departure);
        let pending: Arc<Mutex<Option<PendingVision>>> = Arc::new(Mutex::new(None));

        {
            let pending = pending.clone();
            let events = events.clone();
            let eye = name.clone();
            channel.router().subscribe::<VisionReady, _>(move |ready| {
                let cleared = pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                tracing::info!(
                    %eye,
                    request = ready.request_type.name(),
                    outstanding = cleared.is_some(),
                    "eye: vision ready"
                );
                let _ = events.send(EyeEvent::VisionReady(ready.request_type));
                Ok(())
            });
        }
        {
            let departure = departure.clone();
            let eye = name.clone();
            channel.router().subscribe::<DeregisterEye, _>(move |msg| {
                if msg.eye_name != eye {
                    tracing::debug!(
                        %eye,
                        named = %msg.eye_name,
                        "eye: deregistration names another eye"
                    );
                }
                tracing::info!(%eye, "eye: deregistration requested");
                depart(&departure, Departure::Deregistered);
                Ok(())
            });
        }

        let (heartbeat, heartbeat_events) = channel.attach_heartbeat(settings.heartbeat.clone());
        tokio::spawn(forward_heartbeat(
            name.clone(),
            heartbeat_events,
            events.clone(),
            departure.clone(),
        ));
        heartbeat.start();

        tracing::debug!(eye = %name, %ip, control_port, data_port, "eye: opened");
        Ok(Arc::new(Self {
            name,
            ip,
            control_port,
            data_port,
            channel,
            heartbeat,
            data_listener: tokio::sync::Mutex::new(Some(data_listener)),
            events,
            departure,
            pending,
            vision_timeout: settings.vision_timeout,
        }))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn ip(&self) -> IpAddr {
        self.ip
    }

    pub fn control_port(&self) -> u16 {
        self.control_port
    }

    pub fn data_port(&self) -> u16 {
        self.data_port
    }

    pub fn channel(&self) -> &PeerChannel {
        &self.channel
    }

    pub fn heartbeat(&self) -> &Arc<HeartbeatSupervisor> {
        &self.heartbeat
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EyeEvent> {
        self.events.subscribe()
    }

    /// Send an arbitrary control message to the eye.
    pub fn send(&self, message: impl Into<Message>) -> SendReceipt {
        self.channel.send(message)
    }

    /// The outstanding vision request, if it has not expired.
    pub fn pending_request(&self) -> Option<VisionRequestType> {
        let pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        pending
            .filter(|p| p.since.elapsed() < self.vision_timeout)
            .map(|p| p.kind)
    }

    pub fn is_busy(&self) -> bool {
        self.pending_request().is_some()
    }

    /// Ask the eye to stream video to the data port for `length_secs`.
    pub async fn request_stream(&self, length_secs: f32) -> Result<(), EyeError> {
        self.begin_vision(VisionRequestType::Stream)?;
        let request = RequestStream::new(length_secs, self.data_port);
        self.send_vision(request.into()).await
    }

    /// Ask the eye for a single picture delivered to the data port.
    pub async fn request_picture(&self, width: u32, height: u32) -> Result<(), EyeError> {
        self.begin_vision(VisionRequestType::Picture)?;
        let request = RequestPicture {
            port: self.data_port,
            picture_width: width,
            picture_height: height,
        };
        self.send_vision(request.into()).await
    }

    fn begin_vision(&self, kind: VisionRequestType) -> Result<(), EyeError> {
        let mut pending = self.pending.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = *pending {
            if current.since.elapsed() < self.vision_timeout {
                return Err(EyeError::VisionBusy {
                    eye: self.name.clone(),
                    pending: current.kind,
                });
            }
            tracing::debug!(
                eye = %self.name,
                request = current.kind.name(),
                "eye: vision request expired"
            );
        }
        *pending = Some(PendingVision {
            kind,
            since: Instant::now(),
        });
        Ok(())
    }

    async fn send_vision(&self, message: Message) -> Result<(), EyeError> {
        let code = message.code();
        match self.channel.send(message).wait().await {
            Ok(()) => {
                tracing::debug!(eye = %self.name, code = code.name(), "eye: vision request sent");
                Ok(())
            }
            Err(e) => {
                self.pending
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .take();
                Err(e.into())
            }
        }
    }

    /// Accept the vision provider's connection on the data port.
    pub async fn accept_vision_stream(&self, timeout: Duration) -> Result<TcpStream, EyeError> {
        let handle = self.channel.handle();
        let guard = self.data_listener.lock().await;
        let Some(listener) = guard.as_ref() else {
            return Err(EyeError::Closed);
        };

        tokio::select! {
            accepted = tokio::time::timeout(timeout, listener.accept()) => match accepted {
                Ok(Ok((stream, from))) => {
                    tracing::debug!(eye = %self.name, %from, "eye: vision stream accepted");
                    Ok(stream)
                }
                Ok(Err(e)) => Err(e.into()),
                Err(_) => Err(EyeError::Timeout("vision data connection")),
            },
            _ = handle.closed() => Err(EyeError::Closed),
        }
    }

    /// Request a picture and read it from the data port to completion.
    pub async fn fetch_picture(
        &self,
        width: u32,
        height: u32,
        timeout: Duration,
    ) -> Result<Vec<u8>, EyeError> {
        let deadline = Instant::now() + timeout;
        let mut events = self.subscribe();
        self.request_picture(width, height).await?;

        let ready = async {
            loop {
                match events.recv().await {
                    Ok(EyeEvent::VisionReady(VisionRequestType::Picture)) => return Ok(()),
                    Ok(EyeEvent::Lost) => return Err(EyeError::Closed),
                    Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                    Err(broadcast::error::RecvError::Closed) => return Err(EyeError::Closed),
                }
            }
        };
        match tokio::time::timeout_at(deadline, ready).await {
            Ok(result) => result?,
            Err(_) => return Err(EyeError::Timeout("VISION_READY")),
        }

        let remaining = deadline.saturating_duration_since(Instant::now());
        let mut stream = self.accept_vision_stream(remaining).await?;
        let mut picture = Vec::new();
        match tokio::time::timeout_at(deadline, stream.read_to_end(&mut picture)).await {
            Ok(result) => {
                result?;
            }
            Err(_) => return Err(EyeError::Timeout("picture data")),
        }
        tracing::debug!(eye = %self.name, bytes = picture.len(), "eye: picture received");
        Ok(picture)
    }

    /// Resolves once the eye asks to leave, its heartbeat fails, or it is
    /// closed.
    pub async fn departed(&self) -> Departure {
        let mut rx = self.departure.subscribe();
        let handle = self.channel.handle();
        tokio::select! {
            reason = rx.wait_for(Option::is_some) => match reason {
                Ok(reason) => reason.unwrap_or(Departure::Closed),
                Err(_) => Departure::Closed,
            },
            _ = handle.closed() => Departure::Closed,
        }
    }

    /// Close the control channel (and its heartbeat) and the data listener.
    pub async fn close(&self) {
        depart(&self.departure, Departure::Closed);
        self.channel.close().await;
        self.data_listener.lock().await.take();
        tracing::debug!(eye = %self.name, "eye: closed");
    }
}

fn depart(departure: &watch::Sender<Option<Departure>>, reason: Departure) {
    departure.send_if_modified(|current| {
        if current.is_none() {
            *current = Some(reason);
            true
        } else {
            false
        }
    });
}

async fn forward_heartbeat(
    eye: String,
    mut heartbeat: mpsc::UnboundedReceiver<HeartbeatEvent>,
    events: broadcast::Sender<EyeEvent>,
    departure: Arc<watch::Sender<Option<Departure>>>,
) {
    while let Some(event) = heartbeat.recv().await {
        match event {
            HeartbeatEvent::Beat { rtt } => {
                tracing::trace!(%eye, ?rtt, "eye: heartbeat pulse");
                let _ = events.send(EyeEvent::Pulse);
            }
            HeartbeatEvent::Failed(failure) => {
                tracing::warn!(%eye, ?failure, "eye: lost");
                let _ = events.send(EyeEvent::Lost);
                depart(&departure, Departure::HeartbeatFailed(failure));
            }
        }
    }
}
