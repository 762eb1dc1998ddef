//! Transport interfaces consumed by the aggregators, plus in-process
//! loopback implementations used by tests and benches.
//!
//! The aggregation layer assumes the underlying transport is reliable; it
//! adds batching and timing on top, never retries.

use std::sync::Arc;

use parking_lot::Mutex;
use std::collections::VecDeque;

use crate::{Core, Locale};

/// A batch of serialized records that arrived from the network.
#[derive(Debug, Clone)]
pub struct IncomingBatch {
    /// Core the batch was sent from.
    pub source: Core,
    /// Concatenated records.
    pub data: Vec<u8>,
}

/// Point-to-point transport used by the single-core [`Aggregator`](crate::Aggregator).
///
/// `send` carries a deaggregation-tagged batch; `send_immediate` carries a
/// single record bypassing aggregation. Both are fire-and-forget on a
/// reliable fabric.
pub trait Communicator {
    /// This core's id.
    fn mycore(&self) -> Core;

    /// Total core count.
    fn cores(&self) -> usize;

    /// Send a batch of records to `dest` for deaggregation.
    fn send(&self, dest: Core, data: &[u8]);

    /// Send a single record to `dest`, bypassing batching.
    fn send_immediate(&self, dest: Core, data: &[u8]);

    /// Drain one arrived batch, if any.
    fn poll(&self) -> Option<IncomingBatch>;

    /// Synchronize with all cores. No-op for loopback fabrics.
    fn barrier(&self) {}
}

#[derive(Debug, Default)]
struct Mailboxes {
    boxes: Vec<Mutex<VecDeque<IncomingBatch>>>,
}

/// In-process loopback network: every core's traffic lands in a shared
/// set of mailboxes, drained by each core's `poll`.
#[derive(Debug)]
pub struct LoopbackNetwork {
    mail: Arc<Mailboxes>,
    cores: usize,
}

impl LoopbackNetwork {
    pub fn new(cores: usize) -> Self {
        let boxes = (0..cores).map(|_| Mutex::new(VecDeque::new())).collect();
        Self { mail: Arc::new(Mailboxes { boxes }), cores }
    }

    /// Endpoint bound to `core`.
    pub fn endpoint(&self, core: Core) -> LoopbackEndpoint {
        assert!(core < self.cores, "core {} out of range", core);
        LoopbackEndpoint { mail: self.mail.clone(), cores: self.cores, core }
    }
}

/// One core's view of a [`LoopbackNetwork`].
#[derive(Debug, Clone)]
pub struct LoopbackEndpoint {
    mail: Arc<Mailboxes>,
    cores: usize,
    core: Core,
}

impl Communicator for LoopbackEndpoint {
    fn mycore(&self) -> Core {
        self.core
    }

    fn cores(&self) -> usize {
        self.cores
    }

    fn send(&self, dest: Core, data: &[u8]) {
        assert!(dest < self.cores, "destination {} out of range", dest);
        self.mail.boxes[dest]
            .lock()
            .push_back(IncomingBatch { source: self.core, data: data.to_vec() });
    }

    fn send_immediate(&self, dest: Core, data: &[u8]) {
        // An immediate send is a one-record batch on the wire.
        self.send(dest, data);
    }

    fn poll(&self) -> Option<IncomingBatch> {
        self.mail.boxes[self.core].lock().pop_front()
    }
}

/// Locale-to-locale bulk transport used by the multi-core aggregator.
///
/// `post_external_send` returns once the data has been copied out of the
/// caller's buffer, at which point the buffer may be reused. This collapses
/// the original completion callback into a synchronous hand-off.
pub trait LocaleTransport: Send + Sync {
    fn post_external_send(&self, source_locale: Locale, dest_locale: Locale, data: &[u8]);
}

/// Receive-side sink a locale registers with the fabric.
pub trait BatchSink: Send + Sync {
    /// Accept a filled batch buffer addressed to this locale.
    fn deliver(&self, source_locale: Locale, data: &[u8]);
}

/// In-process fabric connecting the [`BatchSink`]s of several locales.
#[derive(Default)]
pub struct LoopbackFabric {
    sinks: Mutex<Vec<Option<Arc<dyn BatchSink>>>>,
}

impl LoopbackFabric {
    pub fn new(locales: usize) -> Self {
        Self { sinks: Mutex::new(vec![None; locales]) }
    }

    /// Register `sink` as the receive path for `locale`.
    pub fn register(&self, locale: Locale, sink: Arc<dyn BatchSink>) {
        let mut sinks = self.sinks.lock();
        assert!(locale < sinks.len(), "locale {} out of range", locale);
        sinks[locale] = Some(sink);
    }
}

impl LocaleTransport for LoopbackFabric {
    fn post_external_send(&self, source_locale: Locale, dest_locale: Locale, data: &[u8]) {
        let sink = {
            let sinks = self.sinks.lock();
            sinks
                .get(dest_locale)
                .cloned()
                .flatten()
                .unwrap_or_else(|| panic!("no sink registered for locale {}", dest_locale))
        };
        sink.deliver(source_locale, data);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_send_poll() {
        let net = LoopbackNetwork::new(2);
        let a = net.endpoint(0);
        let b = net.endpoint(1);

        a.send(1, b"hello");
        let batch = b.poll().unwrap();
        assert_eq!(batch.source, 0);
        assert_eq!(batch.data, b"hello");
        assert!(b.poll().is_none());
    }

    #[test]
    fn test_loopback_preserves_order() {
        let net = LoopbackNetwork::new(2);
        let a = net.endpoint(0);
        let b = net.endpoint(1);

        a.send(1, b"one");
        a.send_immediate(1, b"two");
        assert_eq!(b.poll().unwrap().data, b"one");
        assert_eq!(b.poll().unwrap().data, b"two");
    }

    #[test]
    fn test_fabric_routes_to_sink() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct CountingSink(AtomicUsize);
        impl BatchSink for CountingSink {
            fn deliver(&self, source: Locale, data: &[u8]) {
                assert_eq!(source, 0);
                assert_eq!(data, b"batch");
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let fabric = LoopbackFabric::new(2);
        let sink = Arc::new(CountingSink(AtomicUsize::new(0)));
        fabric.register(1, sink.clone());
        fabric.post_external_send(0, 1, b"batch");
        assert_eq!(sink.0.load(Ordering::SeqCst), 1);
    }
}
