//! Single-core active-message aggregator.
//!
//! Batches outgoing records per destination, flushes on capacity or
//! timeout, and deaggregates arriving batches. One instance serves one
//! core; construction is explicit and dependency-injected, there is no
//! process-wide singleton.
//!
//! `poll()` is the tick function. It must run frequently (idle loops,
//! blocking waits) to guarantee eventual delivery when no new traffic
//! arrives.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::sync::Arc;

use tracing::trace;

use crate::buffer::AggregatorBuffer;
use crate::config::AggregatorConfig;
use crate::handler::{HandlerId, HandlerTable};
use crate::lrqueue::LrQueue;
use crate::record::{self, record_size, RecordWalker, RECORD_HEADER_SIZE};
use crate::stats::AggregatorStats;
use crate::ticks::TickSource;
use crate::transport::{Communicator, IncomingBatch};
use crate::Core;

/// Active-message aggregation for one core.
pub struct Aggregator<C: Communicator> {
    comm: C,
    config: AggregatorConfig,
    handlers: Arc<HandlerTable>,
    ticks: Arc<dyn TickSource>,
    /// One staging buffer per reachable target.
    buffers: RefCell<Vec<AggregatorBuffer>>,
    /// Routing indirection for hierarchical aggregation.
    route_map: RefCell<Vec<Core>>,
    /// Targets with unflushed data, ordered by first touch.
    least_recently_sent: RefCell<LrQueue>,
    previous_timestamp: Cell<u64>,
    /// Arrived batches awaiting deaggregation.
    received: RefCell<VecDeque<IncomingBatch>>,
    stats: AggregatorStats,
}

impl<C: Communicator> Aggregator<C> {
    pub fn new(
        comm: C,
        config: AggregatorConfig,
        handlers: Arc<HandlerTable>,
        ticks: Arc<dyn TickSource>,
    ) -> Self {
        let max_nodes = comm.cores();
        assert!(max_nodes > 0, "communicator reports zero cores");
        let buffers = (0..max_nodes)
            .map(|_| AggregatorBuffer::new(config.buffer_capacity))
            .collect();
        Self {
            comm,
            config,
            handlers,
            ticks,
            buffers: RefCell::new(buffers),
            route_map: RefCell::new((0..max_nodes).collect()),
            least_recently_sent: RefCell::new(LrQueue::new(max_nodes)),
            previous_timestamp: Cell::new(0),
            received: RefCell::new(VecDeque::new()),
            stats: AggregatorStats::new(),
        }
    }

    /// This core's id.
    pub fn mycore(&self) -> Core {
        self.comm.mycore()
    }

    /// Capacity of each aggregation buffer.
    pub fn max_size(&self) -> usize {
        self.config.buffer_capacity
    }

    /// Bytes still free in the buffer serving `destination`.
    pub fn remaining_size(&self, destination: Core) -> usize {
        let target = self.target_for(destination);
        self.buffers.borrow()[target].remaining()
    }

    /// Route map lookup for hierarchical aggregation.
    pub fn target_for(&self, node: Core) -> Core {
        self.route_map.borrow()[node]
    }

    /// Route map update for hierarchical aggregation.
    pub fn set_target_for(&self, node: Core, target: Core) {
        self.route_map.borrow_mut()[node] = target;
    }

    /// Number of targets currently holding unflushed data.
    pub fn pending_targets(&self) -> usize {
        self.least_recently_sent.borrow().len()
    }

    pub fn stats(&self) -> &AggregatorStats {
        &self.stats
    }

    pub fn previous_timestamp(&self) -> u64 {
        self.previous_timestamp.get()
    }

    /// Batch one message toward `destination`.
    ///
    /// Oversized messages and out-of-range destinations are configuration
    /// errors and abort. A message that does not fit in the current buffer
    /// forces a capacity flush first and always fits afterward.
    pub fn aggregate(
        &self,
        destination: Core,
        handler: HandlerId,
        args: &[u8],
        payload: &[u8],
    ) {
        let max_nodes = self.comm.cores();
        assert!(
            destination < max_nodes,
            "destination {} out of range ({} nodes)",
            destination,
            max_nodes
        );
        let total = record_size(args.len(), payload.len());
        assert!(
            total < self.config.buffer_capacity,
            "message of {} bytes (args {} + payload {} + header {}) too big for buffer of {}",
            total,
            args.len(),
            payload.len(),
            RECORD_HEADER_SIZE,
            self.config.buffer_capacity
        );
        // Header size fields are u16; a roomy buffer must not let a block
        // through that the wire format cannot frame.
        assert!(args.len() <= u16::MAX as usize, "args block too large");
        assert!(payload.len() <= u16::MAX as usize, "payload too large");
        self.stats.record_aggregate();

        if !self.config.enable {
            // Aggregation bypassed entirely; one record goes straight out.
            let mut buf = vec![0u8; total];
            record::encode_record(&mut buf, handler, destination, args, payload);
            self.comm.send_immediate(destination, &buf);
            self.stats.record_immediate();
            return;
        }

        let target = self.target_for(destination);
        trace!(destination, target, total, "aggregating");

        if !self.buffers.borrow()[target].fits(total) {
            self.stats.record_capacity_flush();
            self.flush_target(target);
        }

        let now = self.ticks.ticks();
        {
            let mut buffers = self.buffers.borrow_mut();
            let buffer = &mut buffers[target];
            assert!(buffer.fits(total), "message does not fit an empty buffer");

            let mut header = [0u8; RECORD_HEADER_SIZE];
            record::encode_header(
                &mut header,
                &record::RecordHeader {
                    handler,
                    destination,
                    args_size: args.len() as u16,
                    payload_size: payload.len() as u16,
                },
            );
            buffer.insert(&header, now);
            buffer.insert(args, now);
            buffer.insert(payload, now);
        }

        self.least_recently_sent
            .borrow_mut()
            .update_or_insert(target, -(now as i64));
        self.previous_timestamp.set(now);
    }

    /// Send the batch pending for `node`'s target, then reset it.
    ///
    /// Flushing an empty buffer is a no-op apart from clearing the recency
    /// entry; no zero-byte send is issued.
    pub fn flush(&self, node: Core) {
        self.stats.record_requested_flush();
        self.flush_node(node);
    }

    fn flush_node(&self, node: Core) {
        let target = self.target_for(node);
        trace!(node, target, "flushing");
        self.flush_target(target);
    }

    fn flush_target(&self, target: Core) {
        let data = {
            let mut buffers = self.buffers.borrow_mut();
            let buffer = &mut buffers[target];
            if buffer.is_empty() {
                None
            } else {
                let data = buffer.contents().to_vec();
                buffer.reset();
                Some(data)
            }
        };
        self.least_recently_sent.borrow_mut().remove_key(target);
        if let Some(data) = data {
            self.comm.send(target, &data);
        }
    }

    /// One round of transport poll, timeout sweep, and deaggregation.
    ///
    /// Returns whether any useful work happened, so callers can decide
    /// between busy-polling and yielding.
    pub fn poll(&self) -> bool {
        let mut useful = false;

        while let Some(batch) = self.comm.poll() {
            self.stats.record_batch_received();
            self.received.borrow_mut().push_back(batch);
            useful = true;
        }

        let now = self.ticks.ticks();
        // Tick overflow is silently ignored; it takes years to see one.
        let mut flushed = 0;
        loop {
            if self.config.max_flush != 0 && flushed >= self.config.max_flush {
                break;
            }
            let expired = {
                let lrq = self.least_recently_sent.borrow();
                match lrq.top_key() {
                    None => None,
                    Some(key) => {
                        let inserted = (-lrq.top_priority()) as u64;
                        if inserted + self.config.autoflush_ticks < now {
                            Some(key)
                        } else {
                            None
                        }
                    }
                }
            };
            let Some(key) = expired else { break };
            trace!(key, now, "timeout flush");
            self.flush_node(key);
            // Route indirection can leave `key` behind when it maps
            // elsewhere; drop it so the sweep always makes progress.
            self.least_recently_sent.borrow_mut().remove_key(key);
            self.stats.record_timeout_flush();
            flushed += 1;
            useful = true;
        }
        self.previous_timestamp.set(now);

        if self.deaggregate() {
            useful = true;
        }

        self.stats.record_poll(useful);
        useful
    }

    /// Drain every pending buffer, then poll. Used by idle workers to
    /// accelerate egress when there is nothing else to do.
    pub fn idle_flush_poll(&self) -> bool {
        if self.config.flush_on_idle {
            loop {
                let key = self.least_recently_sent.borrow().top_key();
                let Some(key) = key else { break };
                self.flush_node(key);
                self.least_recently_sent.borrow_mut().remove_key(key);
                self.stats.record_idle_flush();
            }
        }
        self.poll()
    }

    /// Walk queued batches and dispatch each record.
    ///
    /// Handlers run synchronously and may re-enter `aggregate`. Records
    /// addressed to another core are re-aggregated toward it (hierarchical
    /// routing hands batches through intermediate cores).
    fn deaggregate(&self) -> bool {
        let mut any = false;
        loop {
            let batch = self.received.borrow_mut().pop_front();
            let Some(batch) = batch else { break };
            any = true;
            for rec in RecordWalker::new(&batch.data) {
                if rec.header.destination == self.comm.mycore() {
                    self.handlers.dispatch(rec.header.handler, rec.args, rec.payload);
                    self.stats.record_deaggregated();
                } else {
                    self.stats.record_forwarded();
                    self.aggregate(
                        rec.header.destination,
                        rec.header.handler,
                        rec.args,
                        rec.payload,
                    );
                }
            }
        }
        any
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LoopbackNetwork;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    fn test_config() -> AggregatorConfig {
        AggregatorConfig::builder()
            .buffer_capacity(1024)
            .autoflush_ticks(u64::MAX / 2)
            .build()
            .unwrap()
    }

    fn counting_handlers() -> (Arc<HandlerTable>, HandlerId, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let mut table = HandlerTable::new();
        let id = table.register(move |_, _| {
            hits2.fetch_add(1, Ordering::SeqCst);
        });
        (Arc::new(table), id, hits)
    }

    #[test]
    fn test_aggregate_buffers_without_send() {
        let net = LoopbackNetwork::new(2);
        let (handlers, id, _) = counting_handlers();
        let ticks = Arc::new(crate::ticks::ManualTicks::new(0));
        let agg = Aggregator::new(net.endpoint(0), test_config(), handlers, ticks);

        agg.aggregate(1, id, b"args", b"");
        assert_eq!(agg.pending_targets(), 1);
        // Nothing on the wire yet.
        assert!(net.endpoint(1).poll().is_none());
    }

    #[test]
    fn test_flush_sends_and_clears() {
        let net = LoopbackNetwork::new(2);
        let (handlers, id, _) = counting_handlers();
        let ticks = Arc::new(crate::ticks::ManualTicks::new(0));
        let agg = Aggregator::new(net.endpoint(0), test_config(), handlers, ticks);

        agg.aggregate(1, id, b"args", b"");
        agg.flush(1);
        assert_eq!(agg.pending_targets(), 0);
        let batch = net.endpoint(1).poll().unwrap();
        assert_eq!(RecordWalker::new(&batch.data).count(), 1);
    }

    #[test]
    fn test_flush_empty_buffer_sends_nothing() {
        let net = LoopbackNetwork::new(2);
        let (handlers, _, _) = counting_handlers();
        let ticks = Arc::new(crate::ticks::ManualTicks::new(0));
        let agg = Aggregator::new(net.endpoint(0), test_config(), handlers, ticks);

        agg.flush(1);
        assert!(net.endpoint(1).poll().is_none());
    }

    #[test]
    fn test_disabled_aggregation_sends_immediately() {
        let net = LoopbackNetwork::new(2);
        let (handlers, id, _) = counting_handlers();
        let ticks = Arc::new(crate::ticks::ManualTicks::new(0));
        let config = AggregatorConfig::builder().enable(false).build().unwrap();
        let agg = Aggregator::new(net.endpoint(0), config, handlers, ticks);

        agg.aggregate(1, id, b"args", b"");
        assert_eq!(agg.pending_targets(), 0);
        assert!(net.endpoint(1).poll().is_some());
        assert_eq!(agg.stats().snapshot().messages_immediate, 1);
    }

    #[test]
    fn test_deaggregation_dispatches_in_order() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let mut table = HandlerTable::new();
        let id = table.register(move |args, _| {
            seen2.lock().unwrap().push(args[0]);
        });
        let handlers = Arc::new(table);

        let net = LoopbackNetwork::new(2);
        let ticks = Arc::new(crate::ticks::ManualTicks::new(0));
        let sender = Aggregator::new(net.endpoint(0), test_config(), handlers.clone(), ticks.clone());
        let receiver = Aggregator::new(net.endpoint(1), test_config(), handlers, ticks);

        for i in 0..5u8 {
            sender.aggregate(1, id, &[i], b"");
        }
        sender.flush(1);
        assert!(receiver.poll());
        assert_eq!(*seen.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn test_forwarding_reaggregates_foreign_records() {
        let (handlers, id, hits) = counting_handlers();
        let net = LoopbackNetwork::new(3);
        let ticks = Arc::new(crate::ticks::ManualTicks::new(0));

        let sender = Aggregator::new(net.endpoint(0), test_config(), handlers.clone(), ticks.clone());
        let relay = Aggregator::new(net.endpoint(1), test_config(), handlers.clone(), ticks.clone());
        let receiver = Aggregator::new(net.endpoint(2), test_config(), handlers, ticks);

        // Core 0 routes traffic for core 2 through core 1.
        sender.set_target_for(2, 1);
        sender.aggregate(2, id, b"via-relay", b"");
        sender.flush(2);

        assert!(relay.poll());
        assert_eq!(hits.load(Ordering::SeqCst), 0);
        assert_eq!(relay.stats().snapshot().messages_forwarded, 1);

        relay.flush(2);
        assert!(receiver.poll());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    #[should_panic(expected = "too big for buffer")]
    fn test_oversized_message_is_fatal() {
        let net = LoopbackNetwork::new(2);
        let (handlers, id, _) = counting_handlers();
        let ticks = Arc::new(crate::ticks::ManualTicks::new(0));
        let agg = Aggregator::new(net.endpoint(0), test_config(), handlers, ticks);
        let big = vec![0u8; 2048];
        agg.aggregate(1, id, b"", &big);
    }

    #[test]
    #[should_panic(expected = "args block too large")]
    fn test_args_beyond_record_field_is_fatal() {
        let net = LoopbackNetwork::new(2);
        let (handlers, id, _) = counting_handlers();
        let ticks = Arc::new(crate::ticks::ManualTicks::new(0));
        // Large enough that the capacity check alone would accept the
        // message; the u16 size field still cannot frame it.
        let config = AggregatorConfig::builder()
            .buffer_capacity(128 * 1024)
            .build()
            .unwrap();
        let agg = Aggregator::new(net.endpoint(0), config, handlers, ticks);
        let big = vec![0u8; 70_000];
        agg.aggregate(1, id, &big, b"");
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn test_bad_destination_is_fatal() {
        let net = LoopbackNetwork::new(2);
        let (handlers, id, _) = counting_handlers();
        let ticks = Arc::new(crate::ticks::ManualTicks::new(0));
        let agg = Aggregator::new(net.endpoint(0), test_config(), handlers, ticks);
        agg.aggregate(7, id, b"", b"");
    }
}
