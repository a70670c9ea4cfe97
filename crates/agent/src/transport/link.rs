//! Supervised bidirectional link to the control plane.
//!
//! A [`LinkDriver`] owns one connection attempt: connect, announce itself,
//! then shuttle [`LinkMessage`]s until the connection drops. The supervisor
//! started by [`LinkClient::start`] reruns the driver with exponential
//! backoff until shutdown.

use std::time::Duration;

use protocol::{ChannelResponse, ChannelStream, LinkMessage};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use super::{
    Inbound, ResponseSender, TerminalEvent, TransportError, TransportFuture, TransportSender,
};
use crate::config::TransportConfig;

/// Capacity of the outgoing message queue.
const OUTGOING_CAPACITY: usize = 256;

/// Backoff multiplier between reconnection attempts.
const BACKOFF_MULTIPLIER: u32 = 2;

/// Exponential reconnection delay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    /// Start at `initial`, never exceeding `max`.
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max,
            current: initial,
        }
    }

    /// Backoff bounds from the transport section.
    pub fn from_config(config: &TransportConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
    }

    /// The delay to wait now. Doubles the next one, up to the maximum.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = std::cmp::min(self.current * BACKOFF_MULTIPLIER, self.max);
        delay
    }

    /// Back to the initial delay, after a successful connection.
    pub fn reset(&mut self) {
        self.current = self.initial;
    }
}

/// State a driver works with during one connection attempt.
pub struct LinkSession {
    room_id: String,
    outgoing: mpsc::Receiver<LinkMessage>,
    inbound: mpsc::Sender<Inbound>,
    connected: watch::Sender<bool>,
}

impl LinkSession {
    /// Room to join after connecting.
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    /// Called by the driver once the peer accepted the connection. Until
    /// then pushes fail fast with [`TransportError::NotConnected`].
    pub fn mark_connected(&self) {
        self.connected.send_replace(true);
    }

    /// Next message to write to the wire. `None` once every client handle
    /// is gone.
    pub async fn next_outgoing(&mut self) -> Option<LinkMessage> {
        self.outgoing.recv().await
    }

    /// Handle a message read from the wire. Returns a reply the driver must
    /// write back, if any.
    pub async fn dispatch(&self, message: LinkMessage) -> Option<LinkMessage> {
        match message {
            LinkMessage::Ping { timestamp } => return Some(LinkMessage::Pong { timestamp }),
            LinkMessage::Error { message } => {
                tracing::warn!(room_id = %self.room_id, "Control plane error: {}", message);
                return None;
            }
            _ => {}
        }

        if let Some(inbound) = Inbound::from_link(message) {
            if self.inbound.send(inbound).await.is_err() {
                tracing::debug!("Inbound receiver dropped");
            }
        }
        None
    }

    /// Drop messages queued for a connection that no longer exists.
    fn drain_outgoing(&mut self) -> usize {
        let mut dropped = 0;
        while self.outgoing.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }
}

/// One way of reaching the control plane.
pub trait LinkDriver: Send + Sync + 'static {
    /// Human-readable endpoint for logs.
    fn describe(&self) -> String;

    /// Run a single connection until it closes. `Ok(())` means the peer
    /// closed it cleanly.
    fn run<'a>(&'a self, link: &'a mut LinkSession) -> TransportFuture<'a, ()>;
}

/// Handle to a supervised link.
#[derive(Clone)]
pub struct LinkClient {
    outgoing: mpsc::Sender<LinkMessage>,
    connected: watch::Receiver<bool>,
    room_id: String,
    confirmations: bool,
}

impl LinkClient {
    /// Spawn the supervisor and return a handle to it.
    pub fn start<D: LinkDriver>(
        driver: D,
        room_id: String,
        backoff: Backoff,
        confirmations: bool,
        inbound: mpsc::Sender<Inbound>,
        shutdown: CancellationToken,
    ) -> Self {
        let (outgoing_tx, outgoing_rx) = mpsc::channel(OUTGOING_CAPACITY);
        let (connected_tx, connected_rx) = watch::channel(false);

        let session = LinkSession {
            room_id: room_id.clone(),
            outgoing: outgoing_rx,
            inbound,
            connected: connected_tx,
        };
        tokio::spawn(supervise(driver, session, backoff, shutdown));

        Self {
            outgoing: outgoing_tx,
            connected: connected_rx,
            room_id,
            confirmations,
        }
    }

    /// Whether a connection is currently up.
    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Wait until the link reports connected. Returns `false` if the
    /// supervisor stopped first.
    pub async fn wait_connected(&self) -> bool {
        let mut connected = self.connected.clone();
        let up = connected.wait_for(|up| *up).await.is_ok();
        up
    }

    /// Queue a message for the live connection. Fails fast while
    /// disconnected.
    pub async fn send(&self, message: LinkMessage) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.outgoing
            .send(message)
            .await
            .map_err(|_| TransportError::Closed)
    }
}

impl TransportSender for LinkClient {
    fn push<'a>(
        &'a self,
        session_id: &'a str,
        event: &'a TerminalEvent,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            let stream = ChannelStream {
                event_id: event.event_id(session_id).to_string(),
                room_id: self.room_id.clone(),
                data: event.payload()?,
            };
            self.send(LinkMessage::ChannelStream(stream)).await
        })
    }

    fn supports_confirmation(&self) -> bool {
        self.confirmations
    }
}

impl ResponseSender for LinkClient {
    fn respond(&self, response: ChannelResponse) -> TransportFuture<'_, ()> {
        Box::pin(async move { self.send(LinkMessage::ChannelResponse(response)).await })
    }
}

async fn supervise<D: LinkDriver>(
    driver: D,
    mut link: LinkSession,
    mut backoff: Backoff,
    shutdown: CancellationToken,
) {
    let endpoint = driver.describe();

    loop {
        tracing::info!(%endpoint, room_id = %link.room_id, "Connecting link");

        let result = tokio::select! {
            _ = shutdown.cancelled() => break,
            result = driver.run(&mut link) => result,
        };

        if link.connected.send_replace(false) {
            backoff.reset();
        }
        let dropped = link.drain_outgoing();
        if dropped > 0 {
            tracing::debug!(dropped, "Discarded messages queued for the lost link");
        }

        match result {
            Ok(()) => tracing::info!(%endpoint, "Link closed by peer"),
            Err(e) => tracing::warn!(%endpoint, error = %e, "Link failed"),
        }

        let delay = backoff.next_delay();
        tracing::info!("reconnecting in {:?}", delay);
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    link.connected.send_replace(false);
    tracing::info!(%endpoint, "Link supervisor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{ChannelRequest, CloseReason, ClosePush};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// Fails the first `failures` attempts, then connects and bridges the
    /// session to test channels.
    struct ScriptedDriver {
        failures: usize,
        attempts: Arc<AtomicUsize>,
        wire_out: mpsc::UnboundedSender<LinkMessage>,
        wire_in: Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<LinkMessage>>>,
        replies: Arc<Mutex<Vec<LinkMessage>>>,
    }

    impl LinkDriver for ScriptedDriver {
        fn describe(&self) -> String {
            "scripted".to_string()
        }

        fn run<'a>(&'a self, link: &'a mut LinkSession) -> TransportFuture<'a, ()> {
            Box::pin(async move {
                let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
                if attempt < self.failures {
                    return Err(TransportError::NotConnected);
                }
                link.mark_connected();
                let mut wire_in = self.wire_in.lock().await;
                loop {
                    tokio::select! {
                        outgoing = link.next_outgoing() => match outgoing {
                            Some(message) => { let _ = self.wire_out.send(message); }
                            None => return Ok(()),
                        },
                        incoming = wire_in.recv() => match incoming {
                            Some(message) => {
                                if let Some(reply) = link.dispatch(message).await {
                                    self.replies.lock().unwrap().push(reply);
                                }
                            }
                            None => return Ok(()),
                        },
                    }
                }
            })
        }
    }

    struct Harness {
        client: LinkClient,
        attempts: Arc<AtomicUsize>,
        wire_out: mpsc::UnboundedReceiver<LinkMessage>,
        wire_in: mpsc::UnboundedSender<LinkMessage>,
        inbound: mpsc::Receiver<Inbound>,
        replies: Arc<Mutex<Vec<LinkMessage>>>,
        shutdown: CancellationToken,
    }

    fn harness(failures: usize) -> Harness {
        let (out_tx, wire_out) = mpsc::unbounded_channel();
        let (wire_in, in_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::channel(16);
        let attempts = Arc::new(AtomicUsize::new(0));
        let replies = Arc::new(Mutex::new(Vec::new()));
        let shutdown = CancellationToken::new();

        let driver = ScriptedDriver {
            failures,
            attempts: attempts.clone(),
            wire_out: out_tx,
            wire_in: Arc::new(tokio::sync::Mutex::new(in_rx)),
            replies: replies.clone(),
        };
        let client = LinkClient::start(
            driver,
            "client-1".to_string(),
            Backoff::new(Duration::from_millis(5), Duration::from_millis(20)),
            true,
            inbound_tx,
            shutdown.clone(),
        );

        Harness {
            client,
            attempts,
            wire_out,
            wire_in,
            inbound,
            replies,
            shutdown,
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(100), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
        assert_eq!(backoff.next_delay(), Duration::from_millis(200));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));
        assert_eq!(backoff.next_delay(), Duration::from_millis(350));

        backoff.reset();
        assert_eq!(backoff.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_from_config() {
        let config = TransportConfig::default();
        let mut backoff = Backoff::from_config(&config);
        assert_eq!(
            backoff.next_delay(),
            Duration::from_millis(config.initial_backoff_ms)
        );
    }

    #[tokio::test]
    async fn test_reconnects_after_failures() {
        let h = harness(2);
        assert!(h.client.wait_connected().await);
        assert_eq!(h.attempts.load(Ordering::SeqCst), 3);
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_send_before_connect_fails() {
        let h = harness(usize::MAX);
        let err = h
            .client
            .send(LinkMessage::Ping { timestamp: 1 })
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::NotConnected));
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_push_wraps_in_channel_stream() {
        let mut h = harness(0);
        assert!(h.client.wait_connected().await);

        let event = TerminalEvent::Closed(ClosePush {
            reason: CloseReason::Exit,
            exit_code: Some(0),
        });
        h.client.push("s1", &event).await.unwrap();

        let sent = h.wire_out.recv().await.unwrap();
        match sent {
            LinkMessage::ChannelStream(stream) => {
                assert_eq!(stream.event_id, "terminal:s1:close");
                assert_eq!(stream.room_id, "client-1");
                assert_eq!(stream.data, json!({"reason": "exit", "exitCode": 0}));
            }
            other => panic!("unexpected message: {:?}", other),
        }
        assert!(h.client.supports_confirmation());
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_respond_sends_channel_response() {
        let mut h = harness(0);
        assert!(h.client.wait_connected().await);

        h.client
            .respond(ChannelResponse::ok("r1", json!({"id": "s1"})))
            .await
            .unwrap();
        assert!(matches!(
            h.wire_out.recv().await.unwrap(),
            LinkMessage::ChannelResponse(response) if response.request_id == "r1"
        ));
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_incoming_request_and_ping() {
        let mut h = harness(0);
        assert!(h.client.wait_connected().await);

        let request = ChannelRequest {
            id: "r1".to_string(),
            scope: "terminal".to_string(),
            options: json!({"type": "handshake"}),
        };
        h.wire_in.send(LinkMessage::Ping { timestamp: 9 }).unwrap();
        h.wire_in
            .send(LinkMessage::ChannelRequest(request.clone()))
            .unwrap();

        assert_eq!(h.inbound.recv().await, Some(Inbound::Request(request)));
        assert_eq!(
            h.replies.lock().unwrap().as_slice(),
            &[LinkMessage::Pong { timestamp: 9 }]
        );
        h.shutdown.cancel();
    }

    #[tokio::test]
    async fn test_shutdown_marks_disconnected() {
        let h = harness(0);
        assert!(h.client.wait_connected().await);

        h.shutdown.cancel();
        let mut connected = h.client.connected.clone();
        tokio::time::timeout(Duration::from_secs(1), connected.wait_for(|up| !*up))
            .await
            .unwrap()
            .unwrap();
        assert!(!h.client.is_connected());
    }
}
