//! In-process transport.
//!
//! Everything the agent sends lands on channels owned by a [`MemoryPeer`],
//! and the peer injects [`Inbound`] items directly. Used to embed the agent
//! and to drive it in tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use protocol::ChannelResponse;
use tokio::sync::mpsc;

use super::{
    Inbound, ResponseSender, TerminalEvent, TransportError, TransportFuture, TransportLink,
    TransportSender, INBOUND_CAPACITY,
};
use crate::session::SessionId;

/// One push observed by the peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pushed {
    pub session_id: SessionId,
    pub event: TerminalEvent,
}

pub struct MemoryTransport {
    pushes: mpsc::UnboundedSender<Pushed>,
    responses: mpsc::UnboundedSender<ChannelResponse>,
    confirmations: bool,
    failures: AtomicUsize,
}

impl MemoryTransport {
    /// Make the next `count` pushes fail with [`TransportError::NotConnected`].
    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl TransportSender for MemoryTransport {
    fn push<'a>(
        &'a self,
        session_id: &'a str,
        event: &'a TerminalEvent,
    ) -> TransportFuture<'a, ()> {
        Box::pin(async move {
            if self.take_failure() {
                return Err(TransportError::NotConnected);
            }
            self.pushes
                .send(Pushed {
                    session_id: session_id.to_string(),
                    event: event.clone(),
                })
                .map_err(|_| TransportError::Closed)
        })
    }

    fn supports_confirmation(&self) -> bool {
        self.confirmations
    }
}

impl ResponseSender for MemoryTransport {
    fn respond(&self, response: ChannelResponse) -> TransportFuture<'_, ()> {
        Box::pin(async move {
            self.responses
                .send(response)
                .map_err(|_| TransportError::Closed)
        })
    }
}

/// The other end of a memory transport.
pub struct MemoryPeer {
    pub transport: Arc<MemoryTransport>,
    pushes: mpsc::UnboundedReceiver<Pushed>,
    responses: mpsc::UnboundedReceiver<ChannelResponse>,
    inbound: mpsc::Sender<Inbound>,
}

impl MemoryPeer {
    /// Deliver an item to the agent.
    pub async fn send(&self, inbound: Inbound) -> Result<(), TransportError> {
        self.inbound
            .send(inbound)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Next push, or `None` if nothing arrives within `within`.
    pub async fn next_push(&mut self, within: Duration) -> Option<Pushed> {
        tokio::time::timeout(within, self.pushes.recv())
            .await
            .ok()
            .flatten()
    }

    /// Next response, or `None` if nothing arrives within `within`.
    pub async fn next_response(&mut self, within: Duration) -> Option<ChannelResponse> {
        tokio::time::timeout(within, self.responses.recv())
            .await
            .ok()
            .flatten()
    }

    /// Pushes already delivered, without waiting.
    pub fn drain_pushes(&mut self) -> Vec<Pushed> {
        let mut pushed = Vec::new();
        while let Ok(push) = self.pushes.try_recv() {
            pushed.push(push);
        }
        pushed
    }

    pub fn inbound_sender(&self) -> mpsc::Sender<Inbound> {
        self.inbound.clone()
    }
}

/// Create a connected transport/peer pair.
pub fn memory_transport(confirmations: bool) -> (TransportLink, MemoryPeer) {
    let (push_tx, push_rx) = mpsc::unbounded_channel();
    let (response_tx, response_rx) = mpsc::unbounded_channel();
    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);

    let transport = Arc::new(MemoryTransport {
        pushes: push_tx,
        responses: response_tx,
        confirmations,
        failures: AtomicUsize::new(0),
    });

    let link = TransportLink {
        sender: transport.clone(),
        responder: transport.clone(),
        inbound: inbound_rx,
        link: None,
    };
    let peer = MemoryPeer {
        transport,
        pushes: push_rx,
        responses: response_rx,
        inbound: inbound_tx,
    };
    (link, peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use protocol::{CloseReason, ClosePush};
    use serde_json::json;

    fn closed() -> TerminalEvent {
        TerminalEvent::Closed(ClosePush {
            reason: CloseReason::Shutdown,
            exit_code: None,
        })
    }

    #[tokio::test]
    async fn test_push_reaches_peer() {
        let (link, mut peer) = memory_transport(true);
        assert!(link.sender.supports_confirmation());

        link.sender.push("s1", &closed()).await.unwrap();
        let pushed = peer.next_push(Duration::from_secs(1)).await.unwrap();
        assert_eq!(pushed.session_id, "s1");
        assert_eq!(pushed.event, closed());
    }

    #[tokio::test]
    async fn test_fail_next() {
        let (link, mut peer) = memory_transport(false);
        peer.transport.fail_next(2);

        assert!(link.sender.push("s1", &closed()).await.is_err());
        assert!(link.sender.push("s1", &closed()).await.is_err());
        assert!(link.sender.push("s1", &closed()).await.is_ok());
        assert_eq!(peer.drain_pushes().len(), 1);
    }

    #[tokio::test]
    async fn test_responses_and_inbound() {
        let (mut link, mut peer) = memory_transport(false);

        link.responder
            .respond(ChannelResponse::ok("r1", json!(null)))
            .await
            .unwrap();
        assert_eq!(
            peer.next_response(Duration::from_secs(1)).await,
            Some(ChannelResponse::ok("r1", json!(null)))
        );

        peer.send(Inbound::ConsumeConfirm {
            session_id: "s1".to_string(),
            sequence: 3,
        })
        .await
        .unwrap();
        assert!(matches!(
            link.inbound.recv().await,
            Some(Inbound::ConsumeConfirm { sequence: 3, .. })
        ));
    }

    #[tokio::test]
    async fn test_next_push_times_out() {
        let (_link, mut peer) = memory_transport(false);
        assert!(peer.next_push(Duration::from_millis(20)).await.is_none());
    }
}
