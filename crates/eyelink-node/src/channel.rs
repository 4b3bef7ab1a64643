//! Peer channel -- one persistent, message-oriented TCP connection to one peer.
//!
//! Both roles share the same machinery:
//!   Listen  -- bind the control port, accept the peer (again, if it reconnects)
//!   Connect -- dial the peer, redial after a delay if the connection drops
//!
//! A single driver task per channel owns the transport and runs the receive
//! loop and the send loop side by side. Sends go through an unbounded FIFO
//! queue, so `send` never blocks; every queued message carries a deadline and
//! its sender learns whether the write made it out in time.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use eyelink_protocol::{
    encode, Frame, FrameCodec, Message, MessageCode, Payload, ProtocolError, PROFILE_0,
};
use futures_util::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use crate::heartbeat::{HeartbeatConfig, HeartbeatEvent, HeartbeatSupervisor};
use crate::router::{MessageRouter, SubscriptionId};

/// How long `close` waits for the driver task before giving up on it.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelRole {
    Listen,
    Connect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Open,
    Closing,
    Closed,
}

#[derive(Debug, Clone)]
pub struct ChannelConfig {
    /// Default deadline for queued messages.
    pub write_timeout: Duration,
    /// Connect role: pause between redial attempts.
    pub reconnect_delay: Duration,
    /// Connect role: bound on a single dial.
    pub connect_timeout: Duration,
    pub max_frame_bytes: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            write_timeout: Duration::from_secs(PROFILE_0.write_timeout_secs),
            reconnect_delay: Duration::from_secs(2),
            connect_timeout: Duration::from_secs(PROFILE_0.write_timeout_secs),
            max_frame_bytes: PROFILE_0.max_frame_bytes,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("send timed out")]
    SendTimeout,
    #[error("channel closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

struct Outgoing {
    frame: Bytes,
    code: MessageCode,
    deadline: Instant,
    done: oneshot::Sender<Result<(), ChannelError>>,
}

struct Shared {
    outbox: mpsc::UnboundedSender<Outgoing>,
    router: MessageRouter,
    cancel: CancellationToken,
    state: watch::Sender<ChannelState>,
    remote: watch::Sender<Option<SocketAddr>>,
    local_addr: SocketAddr,
    config: ChannelConfig,
}

/// Pending result of a [`ChannelHandle::send`].
///
/// Dropping it is fine; the message is still sent.
pub struct SendReceipt {
    rx: Result<oneshot::Receiver<Result<(), ChannelError>>, Option<ChannelError>>,
}

impl SendReceipt {
    fn failed(err: ChannelError) -> Self {
        Self { rx: Err(Some(err)) }
    }

    /// Wait until the message was written, or failed to be.
    pub async fn wait(self) -> Result<(), ChannelError> {
        match self.rx {
            Ok(rx) => rx.await.unwrap_or(Err(ChannelError::Closed)),
            Err(err) => Err(err.unwrap_or(ChannelError::Closed)),
        }
    }
}

/// Cloneable sending and subscribing half of a [`PeerChannel`].
#[derive(Clone)]
pub struct ChannelHandle {
    shared: Arc<Shared>,
}

/// Non-owning [`ChannelHandle`], for handlers registered on the channel's
/// own router.
#[derive(Clone)]
pub struct WeakChannelHandle {
    shared: Weak<Shared>,
}

impl WeakChannelHandle {
    pub fn upgrade(&self) -> Option<ChannelHandle> {
        self.shared.upgrade().map(|shared| ChannelHandle { shared })
    }
}

impl ChannelHandle {
    pub fn downgrade(&self) -> WeakChannelHandle {
        WeakChannelHandle {
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Queue a message with the default write deadline. Never blocks.
    pub fn send(&self, message: impl Into<Message>) -> SendReceipt {
        self.enqueue(message.into(), self.shared.config.write_timeout)
    }

    /// Queue a message and wait up to `timeout` for it to be written.
    pub async fn send_within(
        &self,
        message: impl Into<Message>,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        let receipt = self.enqueue(message.into(), timeout);
        match tokio::time::timeout(timeout, receipt.wait()).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::SendTimeout),
        }
    }

    fn enqueue(&self, message: Message, timeout: Duration) -> SendReceipt {
        if *self.shared.state.borrow() != ChannelState::Open {
            return SendReceipt::failed(ChannelError::Closed);
        }
        let frame = match encode(&message) {
            Ok(frame) => frame,
            Err(e) => return SendReceipt::failed(e.into()),
        };

        let (done, rx) = oneshot::channel();
        let outgoing = Outgoing {
            frame,
            code: message.code(),
            deadline: Instant::now() + timeout,
            done,
        };
        if self.shared.outbox.send(outgoing).is_err() {
            return SendReceipt::failed(ChannelError::Closed);
        }
        SendReceipt { rx: Ok(rx) }
    }

    pub fn router(&self) -> &MessageRouter {
        &self.shared.router
    }

    /// Shortcut for `router().subscribe`.
    pub fn subscribe<T, F>(&self, handler: F) -> SubscriptionId
    where
        T: Payload,
        F: Fn(&T) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared.router.subscribe(handler)
    }

    pub fn unsubscribe(&self, subscription: SubscriptionId) -> bool {
        self.shared.router.unsubscribe(subscription)
    }

    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.cancel.is_cancelled()
    }

    /// Resolves once the channel starts closing.
    pub async fn closed(&self) {
        self.shared.cancel.cancelled().await
    }

    /// Token cancelled when the channel closes, for loops tied to it.
    pub fn child_token(&self) -> CancellationToken {
        self.shared.cancel.child_token()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Address of the currently connected peer, if any.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        *self.shared.remote.borrow()
    }

    /// Wait until a peer is connected. False on timeout or close.
    pub async fn wait_connected(&self, timeout: Duration) -> bool {
        let mut rx = self.shared.remote.subscribe();
        tokio::select! {
            r = tokio::time::timeout(timeout, rx.wait_for(|addr| addr.is_some())) => {
                matches!(r, Ok(Ok(_)))
            }
            _ = self.shared.cancel.cancelled() => false,
        }
    }
}

/// Owner of a control connection and its heartbeat supervisor.
///
/// Closing (or dropping) the channel stops both loops, releases the socket
/// and disposes the supervisor.
pub struct PeerChannel {
    handle: ChannelHandle,
    role: ChannelRole,
    driver: Mutex<Option<JoinHandle<()>>>,
    heartbeat: Mutex<Option<Arc<HeartbeatSupervisor>>>,
}

impl PeerChannel {
    pub async fn open(
        addr: SocketAddr,
        role: ChannelRole,
        config: ChannelConfig,
    ) -> Result<Self, ChannelError> {
        match role {
            ChannelRole::Listen => Self::listen(addr, config).await,
            ChannelRole::Connect => Self::connect(addr, config).await,
        }
    }

    /// Bind `addr` and serve whichever peer connects to it.
    pub async fn listen(addr: SocketAddr, config: ChannelConfig) -> Result<Self, ChannelError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        tracing::debug!(%local_addr, "channel: listening");
        Ok(Self::spawn(
            ChannelRole::Listen,
            local_addr,
            Transport::Listener(listener),
            None,
            config,
        ))
    }

    /// Dial `addr`. Fails if the first dial does not succeed.
    pub async fn connect(addr: SocketAddr, config: ChannelConfig) -> Result<Self, ChannelError> {
        let stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
        {
            Ok(stream) => stream?,
            Err(_) => {
                return Err(ChannelError::Io(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    format!("connect to {addr} timed out"),
                )))
            }
        };
        let local_addr = stream.local_addr()?;
        tracing::debug!(%local_addr, remote = %addr, "channel: connected");
        Ok(Self::spawn(
            ChannelRole::Connect,
            local_addr,
            Transport::Dialer(addr),
            Some(stream),
            config,
        ))
    }

    fn spawn(
        role: ChannelRole,
        local_addr: SocketAddr,
        transport: Transport,
        first: Option<TcpStream>,
        config: ChannelConfig,
    ) -> Self {
        let (outbox_tx, outbox_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ChannelState::Open);
        let (remote, _) = watch::channel(None);
        let shared = Arc::new(Shared {
            outbox: outbox_tx,
            router: MessageRouter::new(),
            cancel: CancellationToken::new(),
            state,
            remote,
            local_addr,
            config,
        });

        let driver = tokio::spawn(run_driver(shared.clone(), transport, first, outbox_rx));

        Self {
            handle: ChannelHandle { shared },
            role,
            driver: Mutex::new(Some(driver)),
            heartbeat: Mutex::new(None),
        }
    }

    pub fn handle(&self) -> ChannelHandle {
        self.handle.clone()
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn send(&self, message: impl Into<Message>) -> SendReceipt {
        self.handle.send(message)
    }

    pub async fn send_within(
        &self,
        message: impl Into<Message>,
        timeout: Duration,
    ) -> Result<(), ChannelError> {
        self.handle.send_within(message, timeout).await
    }

    pub fn router(&self) -> &MessageRouter {
        self.handle.router()
    }

    pub fn state(&self) -> ChannelState {
        self.handle.state()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.handle.local_addr()
    }

    /// Create this channel's heartbeat supervisor (not started).
    ///
    /// A channel has at most one supervisor; attaching again disposes the
    /// previous one.
    pub fn attach_heartbeat(
        &self,
        config: HeartbeatConfig,
    ) -> (
        Arc<HeartbeatSupervisor>,
        mpsc::UnboundedReceiver<HeartbeatEvent>,
    ) {
        let (supervisor, events) = HeartbeatSupervisor::attach(self.handle.clone(), config);
        let previous = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(supervisor.clone());
        if let Some(previous) = previous {
            previous.dispose();
        }
        (supervisor, events)
    }

    pub fn heartbeat(&self) -> Option<Arc<HeartbeatSupervisor>> {
        self.heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop both loops, dispose the heartbeat supervisor and release the
    /// socket. Safe to call repeatedly and concurrently.
    pub async fn close(&self) {
        let first = self.handle.shared.state.send_if_modified(|state| {
            if *state == ChannelState::Open {
                *state = ChannelState::Closing;
                true
            } else {
                false
            }
        });
        if !first {
            let mut rx = self.handle.shared.state.subscribe();
            let closed = rx.wait_for(|s| *s == ChannelState::Closed);
            if tokio::time::timeout(CLOSE_TIMEOUT, closed).await.is_err() {
                tracing::warn!(local = %self.local_addr(), "channel: gave up waiting for close");
            }
            return;
        }

        self.shutdown_now();

        let driver = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(driver) = driver {
            if tokio::time::timeout(CLOSE_TIMEOUT, driver).await.is_err() {
                tracing::warn!(local = %self.local_addr(), "channel: driver did not stop in time");
            }
        }

        self.handle.shared.state.send_replace(ChannelState::Closed);
        tracing::debug!(local = %self.local_addr(), "channel: closed");
    }

    fn shutdown_now(&self) {
        let supervisor = self
            .heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(supervisor) = supervisor {
            supervisor.dispose();
        }
        self.handle.shared.cancel.cancel();
    }
}

impl Drop for PeerChannel {
    fn drop(&mut self) {
        if self.handle.state() == ChannelState::Open {
            self.handle
                .shared
                .state
                .send_replace(ChannelState::Closing);
        }
        self.shutdown_now();
    }
}

// ============================================================================
// Driver
// ============================================================================

enum Transport {
    Listener(TcpListener),
    Dialer(SocketAddr),
}

impl Transport {
    /// Next connection to serve, or None to try again.
    async fn next_stream(&self, config: &ChannelConfig) -> Option<TcpStream> {
        match self {
            Transport::Listener(listener) => match listener.accept().await {
                Ok((stream, remote)) => {
                    tracing::debug!(%remote, "channel: accepted peer");
                    Some(stream)
                }
                Err(e) => {
                    tracing::warn!("channel: accept failed: {e}");
                    tokio::time::sleep(config.reconnect_delay).await;
                    None
                }
            },
            Transport::Dialer(addr) => {
                tokio::time::sleep(config.reconnect_delay).await;
                match tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr)).await
                {
                    Ok(Ok(stream)) => {
                        tracing::info!(remote = %addr, "channel: reconnected");
                        Some(stream)
                    }
                    Ok(Err(e)) => {
                        tracing::debug!(remote = %addr, "channel: redial failed: {e}");
                        None
                    }
                    Err(_) => {
                        tracing::debug!(remote = %addr, "channel: redial timed out");
                        None
                    }
                }
            }
        }
    }
}

#[derive(Debug)]
enum SessionEnd {
    Cancelled,
    PeerClosed,
    ReadError(ProtocolError),
    WriteFailed,
    OutboxClosed,
}

async fn run_driver(
    shared: Arc<Shared>,
    transport: Transport,
    mut first: Option<TcpStream>,
    mut outbox: mpsc::UnboundedReceiver<Outgoing>,
) {
    loop {
        let stream = match first.take() {
            Some(stream) => stream,
            None => {
                let next = tokio::select! {
                    _ = shared.cancel.cancelled() => break,
                    next = transport.next_stream(&shared.config) => next,
                };
                match next {
                    Some(stream) => stream,
                    None => continue,
                }
            }
        };

        let remote = stream.peer_addr().ok();
        shared.remote.send_replace(remote);

        let end = run_session(&shared, stream, &mut outbox).await;

        shared.remote.send_replace(None);
        match &end {
            SessionEnd::Cancelled | SessionEnd::OutboxClosed => break,
            SessionEnd::PeerClosed => {
                tracing::info!(
                    local = %shared.local_addr,
                    remote = ?remote,
                    "channel: peer disconnected"
                );
            }
            SessionEnd::ReadError(e) => {
                tracing::warn!(
                    local = %shared.local_addr,
                    remote = ?remote,
                    "channel: read failed: {e}"
                );
            }
            SessionEnd::WriteFailed => {
                tracing::warn!(
                    local = %shared.local_addr,
                    remote = ?remote,
                    "channel: write failed, dropping connection"
                );
            }
        }
        if shared.cancel.is_cancelled() {
            break;
        }
    }

    // Fail whatever is still queued
    outbox.close();
    while let Ok(outgoing) = outbox.try_recv() {
        let _ = outgoing.done.send(Err(ChannelError::Closed));
    }
    shared.remote.send_replace(None);
    // Also covers a close() whose caller stopped waiting for us
    shared.state.send_replace(ChannelState::Closed);
    tracing::trace!(local = %shared.local_addr, "channel: driver stopped");
}

async fn run_session(
    shared: &Shared,
    stream: TcpStream,
    outbox: &mut mpsc::UnboundedReceiver<Outgoing>,
) -> SessionEnd {
    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("channel: set_nodelay failed: {e}");
    }
    let (read, write) = stream.into_split();
    let codec = FrameCodec::with_max_frame_bytes(shared.config.max_frame_bytes);
    let mut reader = FramedRead::new(read, codec.clone());
    let mut writer = FramedWrite::new(write, codec);

    tokio::select! {
        end = receive_loop(shared, &mut reader) => end,
        end = send_loop(outbox, &mut writer) => end,
        _ = shared.cancel.cancelled() => SessionEnd::Cancelled,
    }
}

async fn receive_loop(
    shared: &Shared,
    reader: &mut FramedRead<OwnedReadHalf, FrameCodec>,
) -> SessionEnd {
    loop {
        match reader.next().await {
            Some(Ok(body)) => handle_inbound(shared, body),
            Some(Err(e)) => return SessionEnd::ReadError(e),
            None => return SessionEnd::PeerClosed,
        }
    }
}

fn handle_inbound(shared: &Shared, body: Bytes) {
    let frame = match Frame::from_bytes(body) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::debug!(local = %shared.local_addr, "channel: dropped frame: {e}");
            return;
        }
    };
    tracing::trace!(local = %shared.local_addr, code = frame.code, "channel: frame received");
    if let Err(e) = shared.router.dispatch(&frame) {
        tracing::warn!(
            local = %shared.local_addr,
            code = frame.code,
            "channel: dispatch failed: {e}"
        );
    }
}

async fn send_loop(
    outbox: &mut mpsc::UnboundedReceiver<Outgoing>,
    writer: &mut FramedWrite<OwnedWriteHalf, FrameCodec>,
) -> SessionEnd {
    loop {
        let Some(outgoing) = outbox.recv().await else {
            return SessionEnd::OutboxClosed;
        };

        let now = Instant::now();
        if now >= outgoing.deadline {
            tracing::debug!(code = outgoing.code.name(), "channel: queued message expired");
            let _ = outgoing.done.send(Err(ChannelError::SendTimeout));
            continue;
        }

        let result =
            match tokio::time::timeout(outgoing.deadline - now, writer.send(outgoing.frame)).await
            {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(ChannelError::Protocol(e)),
                Err(_) => Err(ChannelError::SendTimeout),
            };

        let broken = result.is_err();
        tracing::trace!(code = outgoing.code.name(), ok = !broken, "channel: frame written");
        let _ = outgoing.done.send(result);
        if broken {
            // A partial write leaves the stream unframed
            return SessionEnd::WriteFailed;
        }
    }
}
