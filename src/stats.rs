//! Statistics counters for aggregation events.
//!
//! Counters are plain atomic increments; aggregation and export of the
//! values is up to the embedding runtime.

use std::sync::atomic::{AtomicU64, Ordering};

#[inline]
fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Counters for the single-core [`Aggregator`](crate::Aggregator).
#[derive(Debug, Default)]
pub struct AggregatorStats {
    /// Messages accepted by `aggregate()`.
    pub messages_aggregated: AtomicU64,
    /// Messages sent directly because aggregation is disabled.
    pub messages_immediate: AtomicU64,
    /// Flushes forced because the next message did not fit.
    pub capacity_flushes: AtomicU64,
    /// Flushes forced by the autoflush timeout sweep.
    pub timeout_flushes: AtomicU64,
    /// Flushes performed by `idle_flush_poll()` drains.
    pub idle_flushes: AtomicU64,
    /// Explicitly requested flushes.
    pub requested_flushes: AtomicU64,
    /// `poll()` invocations.
    pub polls: AtomicU64,
    /// `poll()` invocations that performed useful work.
    pub useful_polls: AtomicU64,
    /// Batch buffers received from the transport.
    pub batches_received: AtomicU64,
    /// Records dispatched to local handlers during deaggregation.
    pub messages_deaggregated: AtomicU64,
    /// Records re-aggregated toward a different destination.
    pub messages_forwarded: AtomicU64,
}

impl AggregatorStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn record_aggregate(&self) {
        bump(&self.messages_aggregated);
    }

    #[inline]
    pub(crate) fn record_immediate(&self) {
        bump(&self.messages_immediate);
    }

    #[inline]
    pub(crate) fn record_capacity_flush(&self) {
        bump(&self.capacity_flushes);
    }

    #[inline]
    pub(crate) fn record_timeout_flush(&self) {
        bump(&self.timeout_flushes);
    }

    #[inline]
    pub(crate) fn record_idle_flush(&self) {
        bump(&self.idle_flushes);
    }

    #[inline]
    pub(crate) fn record_requested_flush(&self) {
        bump(&self.requested_flushes);
    }

    #[inline]
    pub(crate) fn record_poll(&self, useful: bool) {
        bump(&self.polls);
        if useful {
            bump(&self.useful_polls);
        }
    }

    #[inline]
    pub(crate) fn record_batch_received(&self) {
        bump(&self.batches_received);
    }

    #[inline]
    pub(crate) fn record_deaggregated(&self) {
        bump(&self.messages_deaggregated);
    }

    #[inline]
    pub(crate) fn record_forwarded(&self) {
        bump(&self.messages_forwarded);
    }

    /// Take a consistent-enough snapshot for reporting.
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            messages_aggregated: self.messages_aggregated.load(Ordering::Relaxed),
            messages_immediate: self.messages_immediate.load(Ordering::Relaxed),
            capacity_flushes: self.capacity_flushes.load(Ordering::Relaxed),
            timeout_flushes: self.timeout_flushes.load(Ordering::Relaxed),
            idle_flushes: self.idle_flushes.load(Ordering::Relaxed),
            requested_flushes: self.requested_flushes.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
            useful_polls: self.useful_polls.load(Ordering::Relaxed),
            batches_received: self.batches_received.load(Ordering::Relaxed),
            messages_deaggregated: self.messages_deaggregated.load(Ordering::Relaxed),
            messages_forwarded: self.messages_forwarded.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value snapshot of [`AggregatorStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub messages_aggregated: u64,
    pub messages_immediate: u64,
    pub capacity_flushes: u64,
    pub timeout_flushes: u64,
    pub idle_flushes: u64,
    pub requested_flushes: u64,
    pub polls: u64,
    pub useful_polls: u64,
    pub batches_received: u64,
    pub messages_deaggregated: u64,
    pub messages_forwarded: u64,
}

/// Counters for the multi-core [`RdmaAggregator`](crate::rdma::RdmaAggregator).
#[derive(Debug, Default)]
pub struct RdmaStats {
    /// Messages enqueued onto shared per-core lists.
    pub enqueues: AtomicU64,
    /// CAS attempts spent stitching messages into the shared lists.
    pub enqueue_cas: AtomicU64,
    /// Messages sent through the immediate path.
    pub immediate_sends: AtomicU64,
    /// Explicitly requested flushes.
    pub requested_flushes: AtomicU64,
    /// `poll()` invocations.
    pub polls: AtomicU64,
    /// Send-side poll probes / successes.
    pub poll_sends: AtomicU64,
    pub poll_send_successes: AtomicU64,
    /// Receive-side poll probes / successes.
    pub poll_receives: AtomicU64,
    pub poll_receive_successes: AtomicU64,
    /// Messages delivered without touching the network.
    pub local_deliveries: AtomicU64,
    /// Network buffers handed to the transport.
    pub buffers_sent: AtomicU64,
    /// Network buffers accepted from the transport.
    pub buffers_received: AtomicU64,
    /// Messages serialized into network buffers.
    pub messages_serialized: AtomicU64,
}

impl RdmaStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        bump(counter);
    }

    pub fn snapshot(&self) -> RdmaStatsSnapshot {
        RdmaStatsSnapshot {
            enqueues: self.enqueues.load(Ordering::Relaxed),
            enqueue_cas: self.enqueue_cas.load(Ordering::Relaxed),
            immediate_sends: self.immediate_sends.load(Ordering::Relaxed),
            requested_flushes: self.requested_flushes.load(Ordering::Relaxed),
            polls: self.polls.load(Ordering::Relaxed),
            poll_sends: self.poll_sends.load(Ordering::Relaxed),
            poll_send_successes: self.poll_send_successes.load(Ordering::Relaxed),
            poll_receives: self.poll_receives.load(Ordering::Relaxed),
            poll_receive_successes: self.poll_receive_successes.load(Ordering::Relaxed),
            local_deliveries: self.local_deliveries.load(Ordering::Relaxed),
            buffers_sent: self.buffers_sent.load(Ordering::Relaxed),
            buffers_received: self.buffers_received.load(Ordering::Relaxed),
            messages_serialized: self.messages_serialized.load(Ordering::Relaxed),
        }
    }
}

/// Plain-value snapshot of [`RdmaStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RdmaStatsSnapshot {
    pub enqueues: u64,
    pub enqueue_cas: u64,
    pub immediate_sends: u64,
    pub requested_flushes: u64,
    pub polls: u64,
    pub poll_sends: u64,
    pub poll_send_successes: u64,
    pub poll_receives: u64,
    pub poll_receive_successes: u64,
    pub local_deliveries: u64,
    pub buffers_sent: u64,
    pub buffers_received: u64,
    pub messages_serialized: u64,
}
