//! Per-session ordering in both directions.
//!
//! Inbound: `data` calls carry a 1-based sequence and may arrive out of
//! order. Each call waits on an [`InboundGate`] until every earlier sequence
//! of the same connect cycle has been applied.
//!
//! Outbound: output chunks are numbered by the engine and handed to a
//! [`Delivery`] worker. With a confirming transport a chunk is retransmitted
//! every interval until the peer confirms it; otherwise it is pushed once,
//! with failed pushes retried in order.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use protocol::OutputPush;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::SessionId;
use crate::transport::{TerminalEvent, TransportSender};

// ============================================================================
// Inbound
// ============================================================================

/// Snapshot of inbound progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundCursor {
    pub cycle: u64,
    pub applied: u64,
    pub closed: bool,
}

/// What a waiting `data` call should do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Turn {
    /// Every earlier sequence is applied; go ahead.
    Ready,
    /// This sequence was already applied.
    Duplicate { applied: u64 },
    /// A newer connect reset the counters.
    CycleReset,
    /// The session was destroyed.
    Closed,
}

impl InboundCursor {
    /// `None` means keep waiting.
    pub fn turn(&self, cycle: u64, sequence: u64) -> Option<Turn> {
        if self.closed {
            return Some(Turn::Closed);
        }
        if self.cycle != cycle {
            return Some(Turn::CycleReset);
        }
        if sequence <= self.applied {
            return Some(Turn::Duplicate {
                applied: self.applied,
            });
        }
        (sequence == self.applied + 1).then_some(Turn::Ready)
    }
}

/// Broadcasts inbound progress to waiting `data` calls.
#[derive(Debug)]
pub struct InboundGate {
    tx: watch::Sender<InboundCursor>,
}

impl Default for InboundGate {
    fn default() -> Self {
        Self::new()
    }
}

impl InboundGate {
    /// A gate at cycle zero with nothing applied.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(InboundCursor {
            cycle: 0,
            applied: 0,
            closed: false,
        });
        Self { tx }
    }

    /// Current position.
    pub fn cursor(&self) -> InboundCursor {
        *self.tx.borrow()
    }

    /// Receiver that wakes whenever the position changes.
    pub fn subscribe(&self) -> watch::Receiver<InboundCursor> {
        self.tx.subscribe()
    }

    /// Start a new connect cycle at sequence zero. Waiters of older cycles
    /// observe [`Turn::CycleReset`].
    pub fn reset(&self, cycle: u64) {
        self.tx.send_modify(|cursor| {
            cursor.cycle = cycle;
            cursor.applied = 0;
        });
    }

    /// Record `sequence` as applied and wake the next waiter.
    pub fn advance(&self, sequence: u64) {
        self.tx.send_modify(|cursor| cursor.applied = sequence);
    }

    /// Wake every waiter with [`Turn::Closed`].
    pub fn close(&self) {
        self.tx.send_modify(|cursor| cursor.closed = true);
    }
}

/// Wait until `sequence` may be applied in `cycle`.
pub async fn wait_for_turn(
    mut rx: watch::Receiver<InboundCursor>,
    cycle: u64,
    sequence: u64,
) -> Turn {
    loop {
        if let Some(turn) = rx.borrow_and_update().turn(cycle, sequence) {
            return turn;
        }
        if rx.changed().await.is_err() {
            return Turn::Closed;
        }
    }
}

// ============================================================================
// Outbound
// ============================================================================

#[derive(Debug)]
enum DeliveryCommand {
    Chunk { sequence: u64, content: String },
    Confirm(u64),
}

#[derive(Debug)]
struct PendingChunk {
    content: String,
    /// `None` until the first push attempt.
    last_attempt: Option<Instant>,
}

impl PendingChunk {
    fn due_at(&self, interval: Duration) -> Instant {
        match self.last_attempt {
            Some(attempt) => attempt + interval,
            None => Instant::now(),
        }
    }

    fn is_due(&self, now: Instant, interval: Duration) -> bool {
        self.last_attempt
            .map_or(true, |attempt| attempt + interval <= now)
    }
}

/// Handle to the per-cycle delivery worker.
#[derive(Debug, Clone)]
pub struct Delivery {
    tx: mpsc::UnboundedSender<DeliveryCommand>,
}

impl Delivery {
    /// Start a worker that pushes through `sender` until `cancel` fires.
    pub fn spawn(
        session_id: SessionId,
        sender: Arc<dyn TransportSender>,
        retransmit_interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = DeliveryWorker {
            session_id,
            confirmations: sender.supports_confirmation(),
            sender,
            retransmit_interval,
            pending: BTreeMap::new(),
        };
        tokio::spawn(worker.run(rx, cancel));
        Self { tx }
    }

    /// Hand a numbered chunk to the worker.
    pub fn enqueue(&self, sequence: u64, content: String) {
        let _ = self.tx.send(DeliveryCommand::Chunk { sequence, content });
    }

    /// Stop retransmitting `sequence`.
    pub fn confirm(&self, sequence: u64) {
        let _ = self.tx.send(DeliveryCommand::Confirm(sequence));
    }

    /// Whether the worker has stopped.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

struct DeliveryWorker {
    session_id: SessionId,
    sender: Arc<dyn TransportSender>,
    confirmations: bool,
    retransmit_interval: Duration,
    pending: BTreeMap<u64, PendingChunk>,
}

impl DeliveryWorker {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<DeliveryCommand>, cancel: CancellationToken) {
        loop {
            let wake_at = self.next_wake();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                command = rx.recv() => match command {
                    Some(DeliveryCommand::Chunk { sequence, content }) => {
                        self.pending.insert(sequence, PendingChunk { content, last_attempt: None });
                        self.flush(&cancel).await;
                    }
                    Some(DeliveryCommand::Confirm(sequence)) => {
                        if self.pending.remove(&sequence).is_some() {
                            tracing::trace!(session_id = %self.session_id, sequence, "Chunk confirmed");
                        }
                    }
                    None => break,
                },
                _ = sleep_until(wake_at) => self.flush(&cancel).await,
            }
        }

        if !self.pending.is_empty() {
            tracing::debug!(
                session_id = %self.session_id,
                pending = self.pending.len(),
                "Delivery stopped with undelivered chunks"
            );
        }
    }

    /// When the next push or retransmission is due.
    fn next_wake(&self) -> Option<Instant> {
        let interval = self.retransmit_interval;
        if self.confirmations {
            self.pending.values().map(|chunk| chunk.due_at(interval)).min()
        } else {
            // Fire-and-forget keeps only chunks not yet pushed; the oldest gates the rest.
            self.pending.values().next().map(|chunk| chunk.due_at(interval))
        }
    }

    /// Push everything that is due, in sequence order.
    async fn flush(&mut self, cancel: &CancellationToken) {
        let now = Instant::now();
        let interval = self.retransmit_interval;
        let due: Vec<u64> = if self.confirmations {
            self.pending
                .iter()
                .filter(|(_, chunk)| chunk.is_due(now, interval))
                .map(|(sequence, _)| *sequence)
                .collect()
        } else {
            self.pending
                .iter()
                .take_while(|(_, chunk)| chunk.is_due(now, interval))
                .map(|(sequence, _)| *sequence)
                .collect()
        };

        for sequence in due {
            let Some(content) = self.pending.get(&sequence).map(|chunk| chunk.content.clone()) else {
                continue;
            };
            let event = TerminalEvent::Output(OutputPush { content, sequence });

            let result = tokio::select! {
                _ = cancel.cancelled() => return,
                result = self.sender.push(&self.session_id, &event) => result,
            };

            match result {
                Ok(()) if !self.confirmations => {
                    self.pending.remove(&sequence);
                }
                Ok(()) => {
                    if let Some(chunk) = self.pending.get_mut(&sequence) {
                        chunk.last_attempt = Some(Instant::now());
                    }
                }
                Err(e) => {
                    tracing::debug!(session_id = %self.session_id, sequence, error = %e, "Output push failed");
                    if let Some(chunk) = self.pending.get_mut(&sequence) {
                        chunk.last_attempt = Some(Instant::now());
                    }
                    if !self.confirmations {
                        // Later chunks wait behind this one.
                        return;
                    }
                }
            }
        }
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
