//! Per-queue counters and failure events for external monitoring.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::broadcast;

/// Something a monitoring system should hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerEvent {
    /// Receives kept failing for `attempts` consecutive polls.
    PollFailed {
        queue_url: Arc<str>,
        attempts: u32,
        error: String,
    },
    /// A handler returned an error, panicked or timed out.
    HandlerFailed {
        queue_url: Arc<str>,
        message_id: String,
        error: String,
    },
    /// A delete or visibility change failed.
    AcknowledgementFailed {
        queue_url: Arc<str>,
        message_id: String,
        error: String,
    },
    /// Draining did not finish before the shutdown deadline.
    DrainTimedOut {
        queue_url: Arc<str>,
        in_flight: usize,
    },
}

/// Live counters of one dispatcher.
#[derive(Debug, Default)]
pub struct QueueStats {
    received: AtomicU64,
    processed: AtomicU64,
    handler_failures: AtomicU64,
    acknowledged: AtomicU64,
    ack_failures: AtomicU64,
    transport_failures: AtomicU64,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
}

/// Point-in-time copy of [`QueueStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatsSnapshot {
    pub received: u64,
    pub processed: u64,
    pub handler_failures: u64,
    pub acknowledged: u64,
    pub ack_failures: u64,
    pub transport_failures: u64,
    pub in_flight: usize,
    pub peak_in_flight: usize,
}

impl QueueStats {
    pub(crate) fn record_received(&self, count: usize) {
        self.received.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_handler_failure(&self) {
        self.handler_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_acknowledged(&self) {
        self.acknowledged.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_ack_failure(&self) {
        self.ack_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_transport_failure(&self) {
        self.transport_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn enter_handler(&self) -> usize {
        let current = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak_in_flight.fetch_max(current, Ordering::AcqRel);
        current
    }

    pub(crate) fn exit_handler(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> QueueStatsSnapshot {
        QueueStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            handler_failures: self.handler_failures.load(Ordering::Relaxed),
            acknowledged: self.acknowledged.load(Ordering::Relaxed),
            ack_failures: self.ack_failures.load(Ordering::Relaxed),
            transport_failures: self.transport_failures.load(Ordering::Relaxed),
            in_flight: self.in_flight.load(Ordering::Acquire),
            peak_in_flight: self.peak_in_flight.load(Ordering::Acquire),
        }
    }
}

/// Publishes events; a send with no subscribers is dropped silently.
#[derive(Debug, Clone)]
pub(crate) struct EventSink {
    sender: broadcast::Sender<ListenerEvent>,
}

impl EventSink {
    pub(crate) fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        EventSink { sender }
    }

    pub(crate) fn publish(&self, event: ListenerEvent) {
        let _ = self.sender.send(event);
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<ListenerEvent> {
        self.sender.subscribe()
    }
}
