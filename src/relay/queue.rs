//! Bounded, lossy per-subscription event queue
//!
//! The relay's dispatcher pushes without ever waiting; when the queue is full
//! the oldest message is discarded and the next delivery is flagged lossy.
//! A single worker pops.

use crate::relay::message::{Delivery, InboundMessage};
use parking_lot::Mutex;
use std::collections::VecDeque;
use tokio::sync::Notify;

/// What happened to a pushed message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    /// Buffered without loss
    Accepted,
    /// Buffered after evicting the oldest message
    DroppedOldest,
    /// Queue is closed; message discarded
    Closed,
}

/// Why a queue was closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Owner unsubscribed; buffered messages are discarded
    Unsubscribed,
    /// Broker-side subscription was lost; buffered messages still drain
    BrokerLost(String),
    /// Relay shut down
    Shutdown,
}

#[derive(Debug)]
struct QueueState {
    buffer: VecDeque<InboundMessage>,
    dropped_since_delivery: u64,
    dropped_total: u64,
    delivered: u64,
    closed: Option<CloseReason>,
}

/// Event queue for one subscription
#[derive(Debug)]
pub struct EventQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    capacity: usize,
}

impl EventQueue {
    /// Create a queue holding at most `capacity` messages
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                buffer: VecDeque::with_capacity(capacity.min(1024)),
                dropped_since_delivery: 0,
                dropped_total: 0,
                delivered: 0,
                closed: None,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Configured bound
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages currently buffered
    pub fn len(&self) -> usize {
        self.state.lock().buffer.len()
    }

    /// Whether nothing is buffered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total messages evicted over the queue's lifetime
    pub fn dropped_total(&self) -> u64 {
        self.state.lock().dropped_total
    }

    /// Close reason, if closed
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.state.lock().closed.clone()
    }

    /// Append a message, evicting the oldest when full
    pub fn push(&self, message: InboundMessage) -> PushOutcome {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed.is_some() {
                return PushOutcome::Closed;
            }
            let outcome = if state.buffer.len() >= self.capacity {
                state.buffer.pop_front();
                state.dropped_since_delivery += 1;
                state.dropped_total += 1;
                PushOutcome::DroppedOldest
            } else {
                PushOutcome::Accepted
            };
            state.buffer.push_back(message);
            outcome
        };
        self.notify.notify_one();
        outcome
    }

    /// Pop without waiting
    pub fn try_pop(&self) -> Option<Delivery> {
        let mut state = self.state.lock();
        let message = state.buffer.pop_front()?;
        state.delivered += 1;
        let dropped = std::mem::take(&mut state.dropped_since_delivery);
        Some(Delivery {
            message,
            sequence: state.delivered,
            lossy: dropped > 0,
            dropped,
        })
    }

    /// Wait for the next message; `None` once closed and drained
    pub async fn pop(&self) -> Option<Delivery> {
        loop {
            let notified = self.notify.notified();
            if let Some(delivery) = self.try_pop() {
                return Some(delivery);
            }
            if self.state.lock().closed.is_some() {
                return None;
            }
            notified.await;
        }
    }

    /// Close the queue; later pushes are discarded
    pub fn close(&self, reason: CloseReason) {
        {
            let mut state = self.state.lock();
            if state.closed.is_some() {
                return;
            }
            if !matches!(reason, CloseReason::BrokerLost(_)) {
                state.buffer.clear();
            }
            state.closed = Some(reason);
        }
        self.notify.notify_waiters();
        self.notify.notify_one();
    }
}
