//! Multi-core, multi-locale aggregation over a bulk locale transport.
//!
//! Cores within a locale share one aggregator instance. Each message is
//! pushed onto a lock-free list keyed by (destination core, source core);
//! the send path drains whole lists into reusable transfer buffers and
//! hands them to the [`LocaleTransport`] one locale at a time.
//!
//! ```text
//!  enqueue (any thread)                 send path (worker or poll)
//!  --------------------                 --------------------------
//!  core_data[dest][src].push()   --->   grab lists -> fill RdmaBuffer
//!                |                            |
//!                v                            v
//!        target_size reached?          post_external_send(dest locale)
//!           signal sender                     |
//!                                             v
//!  receive worker <--- ReceivedList <--- BatchSink::deliver
//!        |
//!        v
//!  demux count table -> walk records -> handler dispatch
//! ```
//!
//! Delivery to a core of the local locale never touches the network; the
//! handler runs on the enqueuing thread. Per (source core, destination
//! core) pair, messages are delivered in enqueue order.

pub mod chooser;
pub mod core_data;
pub mod pool;
pub mod rbuf;
pub mod route;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, trace};

use crate::config::{AggregatorConfig, MAX_BUFFER_SIZE};
use crate::error::{Error, Result};
use crate::handler::HandlerTable;
use crate::message::Message;
use crate::rdma::chooser::MessageListChooser;
use crate::rdma::core_data::CoreData;
use crate::rdma::pool::{BufferList, ReceivedBatch, ReceivedList};
use crate::rdma::rbuf::{demux, BufferState, RdmaBuffer};
use crate::rdma::route::{core_index, locale_of, RouteMap};
use crate::record::RecordWalker;
use crate::stats::RdmaStats;
use crate::ticks::TickSource;
use crate::transport::{BatchSink, LocaleTransport};
use crate::{Core, Locale};

/// Shape of the machine as seen from one locale.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Topology {
    pub my_locale: Locale,
    pub locales: usize,
    pub locale_cores: usize,
}

impl Topology {
    pub fn new(my_locale: Locale, locales: usize, locale_cores: usize) -> Result<Self> {
        if locales == 0 || locale_cores == 0 {
            return Err(Error::EmptyTopology);
        }
        if my_locale >= locales {
            return Err(Error::LocaleOutOfRange { locale: my_locale, locales });
        }
        Ok(Self { my_locale, locales, locale_cores })
    }

    /// Total core count across all locales.
    #[inline]
    pub fn cores(&self) -> usize {
        self.locales * self.locale_cores
    }

    /// First global core id of this locale.
    #[inline]
    pub fn first_core(&self) -> Core {
        self.my_locale * self.locale_cores
    }

    /// Global core id of the local core at `index`.
    #[inline]
    pub fn core(&self, index: usize) -> Core {
        assert!(index < self.locale_cores, "local core {} out of range", index);
        self.first_core() + index
    }
}

/// Send-side coordination for one destination locale.
struct LocaleSender {
    requested: Mutex<bool>,
    signal: Condvar,
    /// Held while a transfer buffer is filled and posted for this locale;
    /// the value is the source-core rotation offset.
    fill: Mutex<usize>,
}

impl LocaleSender {
    fn new() -> Self {
        Self { requested: Mutex::new(false), signal: Condvar::new(), fill: Mutex::new(0) }
    }
}

struct Inner {
    topology: Topology,
    config: AggregatorConfig,
    handlers: Arc<HandlerTable>,
    ticks: Arc<dyn TickSource>,
    transport: Arc<dyn LocaleTransport>,
    route: RouteMap,
    /// One entry per (destination core, local source core) pair, indexed
    /// `dest_core * locale_cores + source_index`.
    core_data: Vec<CoreData>,
    free_buffers: BufferList,
    received: ReceivedList,
    senders: Vec<LocaleSender>,
    running: AtomicBool,
    stopped: Mutex<bool>,
    stop_signal: Condvar,
    stats: RdmaStats,
}

impl Inner {
    #[inline]
    fn pair(&self, dest_core: Core, source_index: usize) -> &CoreData {
        &self.core_data[dest_core * self.topology.locale_cores + source_index]
    }

    fn pairs_for_locale(&self, dest_locale: Locale) -> impl Iterator<Item = &CoreData> {
        let lc = self.topology.locale_cores;
        let start = dest_locale * lc * lc;
        self.core_data[start..start + lc * lc].iter()
    }

    /// Serialized bytes queued toward `dest_locale`.
    fn locale_queued(&self, dest_locale: Locale) -> usize {
        self.pairs_for_locale(dest_locale).map(|cd| cd.queued_bytes()).sum()
    }

    fn enqueue(&self, msg: Box<Message>) {
        let lc = self.topology.locale_cores;
        let dest = msg.destination();
        assert!(
            dest < self.topology.cores(),
            "destination core {} out of range ({} cores)",
            dest,
            self.topology.cores()
        );
        assert_eq!(
            locale_of(msg.source(), lc),
            self.topology.my_locale,
            "message sourced from a core outside this locale"
        );
        let dest_locale = locale_of(dest, lc);
        if dest_locale == self.topology.my_locale {
            self.deliver_locally(msg);
            return;
        }
        let size = msg.serialized_size();
        let max_record = MAX_BUFFER_SIZE - RdmaBuffer::table_size(lc);
        assert!(
            size <= max_record,
            "message of {} bytes exceeds transfer buffer space of {}",
            size,
            max_record
        );
        if !self.config.enable
            || (self.config.immediate_threshold > 0 && size < self.config.immediate_threshold)
        {
            self.send_immediate(msg);
            return;
        }

        let mut msg = msg;
        msg.mark_enqueued();
        let cd = self.pair(dest, core_index(msg.source(), lc));
        cd.add_queued(size);
        let retries = cd.list.push(msg);
        RdmaStats::bump(&self.stats.enqueues);
        if retries > 0 {
            RdmaStats::add(&self.stats.enqueue_cas, retries);
        }

        if self.locale_queued(dest_locale) >= self.config.target_size {
            trace!(dest_locale, "fill target reached, signaling sender");
            self.signal(dest_locale, true);
        }
    }

    /// Serialize one message into its own wire image and post it now.
    fn send_immediate(&self, msg: Box<Message>) {
        let lc = self.topology.locale_cores;
        let dest = msg.destination();
        let dest_locale = locale_of(dest, lc);
        if dest_locale == self.topology.my_locale {
            self.deliver_locally(msg);
            return;
        }
        let mut msg = msg;
        msg.mark_enqueued();
        let size = msg.serialized_size();
        let table = RdmaBuffer::table_size(lc);
        let mut wire = vec![0u8; table + size];
        let dest_index = core_index(dest, lc);
        wire[dest_index * 4..dest_index * 4 + 4].copy_from_slice(&(size as u32).to_le_bytes());
        msg.serialize_into(&mut wire[table..]);
        msg.mark_delivered();
        self.transport.post_external_send(self.topology.my_locale, dest_locale, &wire);
        msg.mark_sent();
        RdmaStats::bump(&self.stats.immediate_sends);
    }

    /// Run the handler on the enqueuing thread; the network is never
    /// involved for intra-locale traffic.
    fn deliver_locally(&self, msg: Box<Message>) {
        let mut msg = msg;
        msg.mark_enqueued();
        self.handlers.dispatch(msg.handler(), msg.args(), msg.payload().as_slice());
        msg.mark_delivered();
        msg.mark_sent();
        RdmaStats::bump(&self.stats.local_deliveries);
    }

    /// Move everything from the shared list into the send-private queue.
    fn grab_messages(cd: &CoreData, pending: &mut VecDeque<Box<Message>>) {
        pending.extend(cd.list.grab());
    }

    /// Fill `buffer` with queued records for `dest_locale`.
    ///
    /// Destination cores are visited in ascending order so the count table
    /// stays valid; `rotation` staggers the source-core start for
    /// fairness. Messages that do not fit stay pending for the next
    /// buffer. Returns the serialized messages, delivered but not yet
    /// sent.
    fn aggregate_to_buffer(
        &self,
        dest_locale: Locale,
        buffer: &mut RdmaBuffer,
        rotation: usize,
    ) -> Vec<Box<Message>> {
        let lc = self.topology.locale_cores;
        let first_core = dest_locale * lc;
        let now = self.ticks.ticks();
        let mut serialized = Vec::new();
        for (dest_index, source_index) in MessageListChooser::new(lc, lc, rotation) {
            let cd = self.pair(first_core + dest_index, source_index);
            let mut pending = cd.pending.lock();
            Self::grab_messages(cd, &mut pending);
            while let Some(mut msg) = pending.pop_front() {
                let size = msg.serialized_size();
                match buffer.reserve(dest_index, size) {
                    Some(slot) => {
                        let written = msg.serialize_into(slot);
                        debug_assert_eq!(written, size);
                        msg.mark_delivered();
                        cd.sub_queued(size);
                        serialized.push(msg);
                    }
                    None => {
                        // Stays at the head for the next buffer, keeping
                        // per-pair order.
                        pending.push_front(msg);
                        break;
                    }
                }
            }
            if pending.is_empty() {
                cd.last_sent.store(now, Ordering::Relaxed);
            }
        }
        serialized
    }

    /// Fill and post one transfer buffer toward `dest_locale`.
    ///
    /// Blocks on the free pool when every buffer is in flight; that is
    /// the backpressure path.
    fn send_locale(&self, dest_locale: Locale) {
        let sender = &self.senders[dest_locale];
        // One fill at a time per destination locale; also keeps posted
        // buffers in fill order.
        let mut rotation = sender.fill.lock();
        let Some(mut buffer) = self.free_buffers.take() else {
            return;
        };
        let serialized = self.aggregate_to_buffer(dest_locale, &mut buffer, *rotation);
        *rotation = (*rotation + 1) % self.topology.locale_cores;
        if serialized.is_empty() {
            self.free_buffers.put(buffer);
            return;
        }
        buffer.set_state(BufferState::Sending);
        {
            let wire = buffer.finish();
            debug!(
                dest_locale,
                bytes = wire.len(),
                messages = serialized.len(),
                "posting transfer buffer"
            );
            self.transport.post_external_send(self.topology.my_locale, dest_locale, wire);
        }
        RdmaStats::bump(&self.stats.buffers_sent);
        RdmaStats::add(&self.stats.messages_serialized, serialized.len() as u64);
        for mut msg in serialized {
            msg.mark_sent();
        }
        self.free_buffers.put(buffer);
    }

    /// Demultiplex one received buffer and dispatch every record.
    fn deaggregate_buffer(&self, batch: &ReceivedBatch) {
        let lc = self.topology.locale_cores;
        for (dest_index, chunk) in demux(&batch.data, lc) {
            for rec in RecordWalker::new(chunk) {
                let dest = rec.header.destination;
                assert_eq!(
                    locale_of(dest, lc),
                    self.topology.my_locale,
                    "record for core {} arrived at locale {}",
                    dest,
                    self.topology.my_locale
                );
                debug_assert_eq!(core_index(dest, lc), dest_index);
                self.handlers.dispatch(rec.header.handler, rec.args, rec.payload);
            }
        }
    }

    /// Whether `dest_locale` has queued traffic worth a send: either the
    /// fill target is reached or some pair has waited past the autoflush
    /// timeout (a zeroed `last_sent` forces this).
    fn check_for_work_on(&self, dest_locale: Locale, now: u64) -> bool {
        let mut queued = 0;
        let mut stale = false;
        for cd in self.pairs_for_locale(dest_locale) {
            let bytes = cd.queued_bytes();
            if bytes > 0 {
                queued += bytes;
                let last = cd.last_sent.load(Ordering::Relaxed);
                if last.saturating_add(self.config.autoflush_ticks) < now {
                    stale = true;
                }
            }
        }
        queued > 0 && (queued >= self.config.target_size || stale)
    }

    fn check_for_any_work_on(&self, now: u64) -> bool {
        (0..self.topology.locales)
            .any(|l| l != self.topology.my_locale && self.check_for_work_on(l, now))
    }

    fn signal(&self, dest_locale: Locale, requested: bool) {
        let sender = &self.senders[dest_locale];
        if requested {
            *sender.requested.lock() = true;
        }
        sender.signal.notify_all();
    }

    /// Consume a pending flush request for `dest_locale`.
    fn take_requested(&self, dest_locale: Locale) -> bool {
        std::mem::take(&mut *self.senders[dest_locale].requested.lock())
    }

    fn running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn send_worker(&self, dest_locale: Locale) {
        loop {
            {
                let sender = &self.senders[dest_locale];
                let mut requested = sender.requested.lock();
                while !*requested && self.running() {
                    sender.signal.wait(&mut requested);
                }
                *requested = false;
            }
            while self.locale_queued(dest_locale) > 0 {
                self.send_locale(dest_locale);
            }
            if !self.running() {
                return;
            }
        }
    }

    fn receive_worker(&self) {
        while let Some(batch) = self.received.pop() {
            trace!(source_locale = batch.source_locale, bytes = batch.data.len(), "deaggregating");
            self.deaggregate_buffer(&batch);
        }
    }

    /// Periodically wakes senders whose traffic has gone stale. Ticks are
    /// interpreted as nanoseconds for the sleep interval.
    fn idle_flusher(&self) {
        let period = Duration::from_nanos(self.config.autoflush_ticks.max(1));
        loop {
            {
                let mut stopped = self.stopped.lock();
                if *stopped {
                    return;
                }
                let _ = self.stop_signal.wait_for(&mut stopped, period);
                if *stopped {
                    return;
                }
            }
            let now = self.ticks.ticks();
            if !self.check_for_any_work_on(now) {
                continue;
            }
            for l in 0..self.topology.locales {
                if l != self.topology.my_locale && self.check_for_work_on(l, now) {
                    self.signal(l, true);
                }
            }
        }
    }
}

impl BatchSink for Inner {
    fn deliver(&self, source_locale: Locale, data: &[u8]) {
        RdmaStats::bump(&self.stats.buffers_received);
        self.received.push(ReceivedBatch { source_locale, data: data.to_vec() });
    }
}

/// Locale-wide aggregator over a bulk transport.
///
/// Without [`activate`](Self::activate) the instance is driven by
/// [`poll`](Self::poll); with it, background workers handle sends,
/// receives, and stale-traffic flushing.
pub struct RdmaAggregator {
    inner: Arc<Inner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RdmaAggregator {
    pub fn new(
        topology: Topology,
        config: AggregatorConfig,
        handlers: Arc<HandlerTable>,
        ticks: Arc<dyn TickSource>,
        transport: Arc<dyn LocaleTransport>,
    ) -> Result<Self> {
        let lc = topology.locale_cores;
        let route = RouteMap::new(topology.my_locale, topology.locales, lc);
        let core_data = (0..topology.cores() * lc).map(|_| CoreData::new()).collect();
        let free_buffers =
            BufferList::new(config.buffers_per_core * lc, lc, MAX_BUFFER_SIZE);
        let senders = (0..topology.locales).map(|_| LocaleSender::new()).collect();
        let inner = Arc::new(Inner {
            topology,
            config,
            handlers,
            ticks,
            transport,
            route,
            core_data,
            free_buffers,
            received: ReceivedList::new(),
            senders,
            running: AtomicBool::new(true),
            stopped: Mutex::new(false),
            stop_signal: Condvar::new(),
            stats: RdmaStats::new(),
        });
        Ok(Self { inner, workers: Mutex::new(Vec::new()) })
    }

    #[inline]
    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    #[inline]
    pub fn route(&self) -> &RouteMap {
        &self.inner.route
    }

    #[inline]
    pub fn stats(&self) -> &RdmaStats {
        &self.inner.stats
    }

    /// Receive-side sink to register with the fabric for this locale.
    pub fn sink(&self) -> Arc<dyn BatchSink> {
        self.inner.clone()
    }

    /// Serialized bytes queued toward `dest_locale`.
    pub fn queued_bytes(&self, dest_locale: Locale) -> usize {
        self.inner.locale_queued(dest_locale)
    }

    /// Queue one message for batched delivery. Intra-locale messages run
    /// their handler immediately on this thread.
    pub fn enqueue(&self, msg: Box<Message>) {
        self.inner.enqueue(msg);
    }

    /// Queue a locale-addressed message: it is retargeted to the core of
    /// `dest_locale` that receives this locale's traffic.
    pub fn enqueue_locale(&self, dest_locale: Locale, mut msg: Box<Message>) {
        assert!(
            dest_locale < self.inner.topology.locales,
            "locale {} out of range",
            dest_locale
        );
        msg.retarget(self.inner.route.dest_core_for_locale(dest_locale));
        self.inner.enqueue(msg);
    }

    /// Send one message now, bypassing batching.
    pub fn send_immediate(&self, msg: Box<Message>) {
        self.inner.send_immediate(msg);
    }

    /// Request a flush of traffic queued toward `core`'s locale.
    ///
    /// Zeroes the pairs' `last_sent` stamps so poll-driven instances
    /// treat the traffic as stale immediately, then signals the sender.
    pub fn flush(&self, core: Core) {
        RdmaStats::bump(&self.inner.stats.requested_flushes);
        let dest_locale = locale_of(core, self.inner.topology.locale_cores);
        if dest_locale == self.inner.topology.my_locale {
            return;
        }
        for cd in self.inner.pairs_for_locale(dest_locale) {
            cd.last_sent.store(0, Ordering::Relaxed);
        }
        self.inner.signal(dest_locale, true);
    }

    /// Request a flush toward every locale with queued traffic.
    pub fn idle_flush(&self) {
        for l in 0..self.inner.topology.locales {
            if l != self.inner.topology.my_locale && self.inner.locale_queued(l) > 0 {
                for cd in self.inner.pairs_for_locale(l) {
                    cd.last_sent.store(0, Ordering::Relaxed);
                }
                self.inner.signal(l, true);
            }
        }
    }

    /// Send-side poll: post one buffer per destination locale that has
    /// work. Returns whether anything was sent.
    pub fn send_poll(&self) -> bool {
        RdmaStats::bump(&self.inner.stats.poll_sends);
        let now = self.inner.ticks.ticks();
        let mut useful = false;
        for l in 0..self.inner.topology.locales {
            if l == self.inner.topology.my_locale {
                continue;
            }
            if self.inner.take_requested(l) || self.inner.check_for_work_on(l, now) {
                self.inner.send_locale(l);
                RdmaStats::bump(&self.inner.stats.poll_send_successes);
                useful = true;
            }
        }
        useful
    }

    /// Receive-side poll: deaggregate one queued buffer, if any.
    pub fn receive_poll(&self) -> bool {
        RdmaStats::bump(&self.inner.stats.poll_receives);
        match self.inner.received.try_pop() {
            Some(batch) => {
                self.inner.deaggregate_buffer(&batch);
                RdmaStats::bump(&self.inner.stats.poll_receive_successes);
                true
            }
            None => false,
        }
    }

    /// One send-side plus one receive-side poll round.
    pub fn poll(&self) -> bool {
        RdmaStats::bump(&self.inner.stats.polls);
        let sent = self.send_poll();
        let received = self.receive_poll();
        sent || received
    }

    /// Spawn the background workers: one sender per remote locale,
    /// `workers_per_core` receive workers per local core, and the idle
    /// flusher.
    pub fn activate(&self) {
        let mut workers = self.workers.lock();
        assert!(workers.is_empty(), "workers already active");
        self.inner.running.store(true, Ordering::Release);
        *self.inner.stopped.lock() = false;
        // A prior finish() closed the lists; the new worker generation
        // needs them open again.
        self.inner.free_buffers.reopen();
        self.inner.received.reopen();

        for l in 0..self.inner.topology.locales {
            if l == self.inner.topology.my_locale {
                continue;
            }
            let inner = self.inner.clone();
            let handle = thread::Builder::new()
                .name(format!("amflux-send-{}", l))
                .spawn(move || inner.send_worker(l))
                .expect("failed to spawn send worker");
            workers.push(handle);
        }

        let receive_workers =
            (self.inner.config.workers_per_core * self.inner.topology.locale_cores).max(1);
        for i in 0..receive_workers {
            let inner = self.inner.clone();
            let handle = thread::Builder::new()
                .name(format!("amflux-recv-{}", i))
                .spawn(move || inner.receive_worker())
                .expect("failed to spawn receive worker");
            workers.push(handle);
        }

        let inner = self.inner.clone();
        let handle = thread::Builder::new()
            .name("amflux-idle".to_string())
            .spawn(move || inner.idle_flusher())
            .expect("failed to spawn idle flusher");
        workers.push(handle);
    }

    /// Drain queued sends, stop the workers, and process every batch
    /// already received. The caller is responsible for quiescing enqueues
    /// first and for fabric-level synchronization with other locales.
    pub fn finish(&self) {
        for l in 0..self.inner.topology.locales {
            if l == self.inner.topology.my_locale {
                continue;
            }
            while self.inner.locale_queued(l) > 0 {
                self.inner.send_locale(l);
            }
        }

        self.inner.running.store(false, Ordering::Release);
        {
            let mut stopped = self.inner.stopped.lock();
            *stopped = true;
            self.inner.stop_signal.notify_all();
        }
        for l in 0..self.inner.topology.locales {
            self.inner.signal(l, false);
        }
        self.inner.received.close();
        self.inner.free_buffers.close();

        let mut workers = self.workers.lock();
        for handle in workers.drain(..) {
            handle.join().expect("worker thread panicked");
        }
    }
}
