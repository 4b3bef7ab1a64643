//! Heartbeat supervisor: periodic liveness pings over a peer channel.
//!
//! State machine: Idle -> Running -> (Beating <-> WaitingAck) -> Failed | Stopped
//!
//! Heartbeating is symmetric. Each side may ping the other, and each side
//! answers the other's pings from the moment the supervisor is attached,
//! whatever its own ping loop is doing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use eyelink_protocol::{Heartbeat, HeartbeatAck, PROFILE_0};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::channel::ChannelHandle;
use crate::router::SubscriptionId;

#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Bound on sending a ping, and separately on waiting for its ack.
    pub timeout: Duration,
    /// Pause between a successful round-trip and the next ping.
    pub interval: Duration,
    /// Pause before the first ping.
    pub grace: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(PROFILE_0.heartbeat_timeout_secs),
            interval: Duration::from_secs(PROFILE_0.heartbeat_interval_secs),
            grace: Duration::from_secs(PROFILE_0.heartbeat_interval_secs),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatState {
    Idle,
    Running,
    Beating,
    WaitingAck,
    Failed,
    Stopped,
}

impl HeartbeatState {
    /// True while the ping loop is alive.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            HeartbeatState::Running | HeartbeatState::Beating | HeartbeatState::WaitingAck
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatFailure {
    /// The ping could not be written in time.
    SendTimeout,
    /// The peer did not acknowledge the ping in time.
    AckTimeout,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HeartbeatEvent {
    Beat { rtt: Duration },
    Failed(HeartbeatFailure),
}

#[derive(Default)]
struct Control {
    cancel: Option<CancellationToken>,
    ack_subscription: Option<SubscriptionId>,
    responder: Option<SubscriptionId>,
    disposed: bool,
}

/// Ping loop bookkeeping shared with the ack handler.
struct AckTracker {
    /// Seq of the ping currently waiting for an ack, 0 if none.
    outstanding: AtomicU64,
    /// Highest seq acknowledged so far.
    acked: watch::Sender<u64>,
}

impl AckTracker {
    fn record(&self, seq: u64) {
        // Peers that do not number their pings answer with seq 0
        let seq = if seq == 0 {
            self.outstanding.load(Ordering::Acquire)
        } else {
            seq
        };
        if seq == 0 {
            return;
        }
        self.acked.send_if_modified(|acked| {
            if seq > *acked {
                *acked = seq;
                true
            } else {
                false
            }
        });
    }
}

pub struct HeartbeatSupervisor {
    channel: ChannelHandle,
    config: HeartbeatConfig,
    state: Arc<watch::Sender<HeartbeatState>>,
    events: mpsc::UnboundedSender<HeartbeatEvent>,
    tracker: Arc<AckTracker>,
    control: Arc<Mutex<Control>>,
}

impl HeartbeatSupervisor {
    /// Attach a supervisor to `channel` and start answering the peer's pings.
    ///
    /// The ping loop itself does not run until [`start`](Self::start).
    pub fn attach(
        channel: ChannelHandle,
        config: HeartbeatConfig,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<HeartbeatEvent>) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(HeartbeatState::Idle);
        let (acked, _) = watch::channel(0);

        // Weak handle: the responder lives in the channel's own router
        let weak = channel.downgrade();
        let responder = channel.subscribe::<Heartbeat, _>(move |ping| {
            if let Some(channel) = weak.upgrade() {
                tracing::trace!(seq = ping.seq, "heartbeat: answering ping");
                channel.send(HeartbeatAck { seq: ping.seq });
            }
            Ok(())
        });

        let supervisor = Arc::new(Self {
            channel,
            config,
            state: Arc::new(state),
            events: events_tx,
            tracker: Arc::new(AckTracker {
                outstanding: AtomicU64::new(0),
                acked,
            }),
            control: Arc::new(Mutex::new(Control {
                responder: Some(responder),
                ..Control::default()
            })),
        });
        (supervisor, events_rx)
    }

    pub fn state(&self) -> HeartbeatState {
        *self.state.borrow()
    }

    /// Wait until the state satisfies `pred`. False on timeout.
    pub async fn wait_for_state(
        &self,
        timeout: Duration,
        pred: impl FnMut(&HeartbeatState) -> bool,
    ) -> bool {
        let mut rx = self.state.subscribe();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(pred)).await,
            Ok(Ok(_))
        );
        reached
    }

    /// Start pinging. Only an Idle supervisor starts; anything else is a
    /// no-op and returns false.
    pub fn start(&self) -> bool {
        let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        if control.disposed || self.state() != HeartbeatState::Idle {
            return false;
        }

        let tracker = self.tracker.clone();
        let subscription = self.channel.subscribe::<HeartbeatAck, _>(move |ack| {
            tracker.record(ack.seq);
            Ok(())
        });

        let cancel = self.channel.child_token();
        control.cancel = Some(cancel.clone());
        control.ack_subscription = Some(subscription);
        self.state.send_replace(HeartbeatState::Running);

        let ping = PingLoop {
            channel: self.channel.clone(),
            config: self.config.clone(),
            state: self.state.clone(),
            events: self.events.clone(),
            tracker: self.tracker.clone(),
            control: self.control.clone(),
            cancel,
        };
        tokio::spawn(ping.run());
        tracing::debug!(local = %self.channel.local_addr(), "heartbeat: started");
        true
    }

    /// Stop pinging. Returns false when the loop was not running.
    pub fn stop(&self) -> bool {
        let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        if !self.state().is_active() {
            return false;
        }
        self.state.send_replace(HeartbeatState::Stopped);
        if let Some(cancel) = control.cancel.take() {
            cancel.cancel();
        }
        if let Some(subscription) = control.ack_subscription.take() {
            self.channel.unsubscribe(subscription);
        }
        tracing::debug!(local = %self.channel.local_addr(), "heartbeat: stopped");
        true
    }

    /// Stop pinging and stop answering pings. Final.
    pub fn dispose(&self) {
        self.stop();
        let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
        control.disposed = true;
        if let Some(responder) = control.responder.take() {
            self.channel.unsubscribe(responder);
        }
    }
}

struct PingLoop {
    channel: ChannelHandle,
    config: HeartbeatConfig,
    state: Arc<watch::Sender<HeartbeatState>>,
    events: mpsc::UnboundedSender<HeartbeatEvent>,
    tracker: Arc<AckTracker>,
    control: Arc<Mutex<Control>>,
    cancel: CancellationToken,
}

impl PingLoop {
    async fn run(self) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.grace) => {}
            _ = self.cancel.cancelled() => return,
        }

        let mut seq: u64 = 0;
        loop {
            seq += 1;
            match self.round_trip(seq).await {
                Some(Ok(rtt)) => {
                    tracing::trace!(seq, ?rtt, "heartbeat: beat");
                    self.set_state(HeartbeatState::Running);
                    let _ = self.events.send(HeartbeatEvent::Beat { rtt });
                }
                Some(Err(failure)) => {
                    self.fail(failure);
                    return;
                }
                None => return,
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.interval) => {}
                _ = self.cancel.cancelled() => return,
            }
        }
    }

    /// One ping and its ack. None when cancelled.
    async fn round_trip(&self, seq: u64) -> Option<Result<Duration, HeartbeatFailure>> {
        self.tracker.outstanding.store(seq, Ordering::Release);
        self.set_state(HeartbeatState::Beating);
        let sent_at = Instant::now();

        let sent = tokio::select! {
            r = self.channel.send_within(Heartbeat { seq }, self.config.timeout) => r,
            _ = self.cancel.cancelled() => return None,
        };
        if let Err(e) = sent {
            tracing::debug!(seq, "heartbeat: ping not sent: {e}");
            return Some(Err(HeartbeatFailure::SendTimeout));
        }

        self.set_state(HeartbeatState::WaitingAck);
        let mut acked = self.tracker.acked.subscribe();
        let waited = tokio::select! {
            r = tokio::time::timeout(self.config.timeout, acked.wait_for(|a| *a >= seq)) => r,
            _ = self.cancel.cancelled() => return None,
        };
        match waited {
            Ok(Ok(_)) => Some(Ok(sent_at.elapsed())),
            _ => Some(Err(HeartbeatFailure::AckTimeout)),
        }
    }

    fn set_state(&self, state: HeartbeatState) {
        // A concurrent stop wins; never overwrite Stopped
        self.state.send_if_modified(|current| {
            if current.is_active() && *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
    }

    fn fail(&self, failure: HeartbeatFailure) {
        {
            let mut control = self.control.lock().unwrap_or_else(PoisonError::into_inner);
            if self.cancel.is_cancelled() {
                return;
            }
            self.state.send_replace(HeartbeatState::Failed);
            control.cancel = None;
            if let Some(subscription) = control.ack_subscription.take() {
                self.channel.unsubscribe(subscription);
            }
        }
        tracing::warn!(
            local = %self.channel.local_addr(),
            remote = ?self.channel.peer_addr(),
            ?failure,
            "heartbeat: peer failed to respond"
        );
        let _ = self.events.send(HeartbeatEvent::Failed(failure));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::{ChannelConfig, PeerChannel};
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicUsize;

    fn fast() -> HeartbeatConfig {
        HeartbeatConfig {
            timeout: Duration::from_millis(200),
            interval: Duration::from_millis(50),
            grace: Duration::from_millis(10),
        }
    }

    fn channel_config() -> ChannelConfig {
        ChannelConfig {
            write_timeout: Duration::from_millis(500),
            reconnect_delay: Duration::from_millis(50),
            connect_timeout: Duration::from_millis(500),
            ..ChannelConfig::default()
        }
    }

    async fn pair() -> (PeerChannel, PeerChannel) {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let server = PeerChannel::listen(addr, channel_config()).await.unwrap();
        let client = PeerChannel::connect(server.local_addr(), channel_config())
            .await
            .unwrap();
        assert!(server.handle().wait_connected(Duration::from_secs(2)).await);
        (server, client)
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<HeartbeatEvent>) -> HeartbeatEvent {
        tokio::time::timeout(Duration::from_secs(3), rx.recv())
            .await
            .expect("no heartbeat event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_beats_while_peer_answers() {
        let (server, client) = pair().await;
        let (_peer, _peer_events) = server.attach_heartbeat(fast());
        let (hb, mut events) = client.attach_heartbeat(fast());

        assert!(hb.start());
        for _ in 0..3 {
            assert!(matches!(
                next_event(&mut events).await,
                HeartbeatEvent::Beat { .. }
            ));
        }
        assert!(hb.state().is_active());
    }

    #[tokio::test]
    async fn test_fails_once_without_ack() {
        let (server, client) = pair().await;
        // No supervisor on the server side: pings go unanswered
        let pings = Arc::new(AtomicUsize::new(0));
        let counter = pings.clone();
        server.router().subscribe::<Heartbeat, _>(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let (hb, mut events) = client.attach_heartbeat(fast());
        assert!(hb.start());

        assert_eq!(
            next_event(&mut events).await,
            HeartbeatEvent::Failed(HeartbeatFailure::AckTimeout)
        );
        assert_eq!(hb.state(), HeartbeatState::Failed);

        // No further pings or events after the failure
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(pings.load(Ordering::SeqCst), 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_unnumbered_ack_matches_outstanding_ping() {
        let (server, client) = pair().await;
        // Peer that answers with an empty payload, like older eyes
        let weak = server.handle().downgrade();
        server.router().subscribe::<Heartbeat, _>(move |_| {
            if let Some(ch) = weak.upgrade() {
                ch.send(HeartbeatAck::default());
            }
            Ok(())
        });

        let (hb, mut events) = client.attach_heartbeat(fast());
        hb.start();
        assert!(matches!(
            next_event(&mut events).await,
            HeartbeatEvent::Beat { .. }
        ));
    }

    #[tokio::test]
    async fn test_start_and_stop_are_idempotent() {
        let (server, client) = pair().await;
        let (_peer, _peer_events) = server.attach_heartbeat(fast());
        let (hb, _events) = client.attach_heartbeat(fast());

        assert_eq!(hb.state(), HeartbeatState::Idle);
        assert!(hb.start());
        assert!(!hb.start());
        assert!(hb.state().is_active());

        assert!(hb.stop());
        assert!(!hb.stop());
        assert_eq!(hb.state(), HeartbeatState::Stopped);

        // A stopped supervisor does not restart
        assert!(!hb.start());
        assert_eq!(hb.state(), HeartbeatState::Stopped);
    }

    #[tokio::test]
    async fn test_stop_does_not_fire_failure() {
        let (_server, client) = pair().await;
        let (hb, mut events) = client.attach_heartbeat(HeartbeatConfig {
            grace: Duration::ZERO,
            ..fast()
        });
        hb.start();
        assert!(
            hb.wait_for_state(Duration::from_secs(1), |s| *s == HeartbeatState::WaitingAck)
                .await
        );
        hb.stop();

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(hb.state(), HeartbeatState::Stopped);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stopped_supervisor_still_answers_pings() {
        let (server, client) = pair().await;
        let (server_hb, _server_events) = server.attach_heartbeat(fast());
        server_hb.start();
        server_hb.stop();

        let (hb, mut events) = client.attach_heartbeat(fast());
        hb.start();
        assert!(matches!(
            next_event(&mut events).await,
            HeartbeatEvent::Beat { .. }
        ));
    }

    #[tokio::test]
    async fn test_dispose_removes_responder() {
        let (server, client) = pair().await;
        let (server_hb, _server_events) = server.attach_heartbeat(fast());
        server_hb.dispose();
        assert!(!server_hb.start());

        let (hb, mut events) = client.attach_heartbeat(fast());
        hb.start();
        assert_eq!(
            next_event(&mut events).await,
            HeartbeatEvent::Failed(HeartbeatFailure::AckTimeout)
        );
    }

    #[tokio::test]
    async fn test_channel_close_stops_ping_loop() {
        let (server, client) = pair().await;
        let (_peer, _peer_events) = server.attach_heartbeat(fast());
        let (hb, mut events) = client.attach_heartbeat(fast());
        hb.start();
        assert!(matches!(
            next_event(&mut events).await,
            HeartbeatEvent::Beat { .. }
        ));

        client.close().await;
        assert_eq!(hb.state(), HeartbeatState::Stopped);
    }
}
