//! amflux: active-message aggregation for fine-grained communication.
//!
//! Small messages to many destinations are expensive to send one at a
//! time. This crate batches them: per-destination staging buffers absorb
//! records until a capacity, timeout, or explicit flush sends the whole
//! batch, and the receiving side walks the batch dispatching each record
//! to its registered handler.
//!
//! Two aggregators are provided:
//!
//! - [`Aggregator`]: single-core, poll-driven. One staging buffer per
//!   destination core, a recency index choosing what to flush on timeout,
//!   and re-entrant deaggregation with hierarchical forwarding.
//! - [`rdma::RdmaAggregator`]: locale-wide, worker-driven. Lock-free
//!   per-(destination core, source core) message lists drained into
//!   reusable transfer buffers with a per-core demux table, posted to a
//!   bulk [`transport::LocaleTransport`].
//!
//! ```text
//!   aggregate(dest, handler, args)          poll()
//!        |                                    |
//!        v                                    v
//!   [staging buffer per dest] --flush--> Communicator --> deaggregate
//!        |                                                    |
//!   recency index (oldest first,                      handler dispatch
//!   timeout sweep in poll)                            (re-entrant)
//! ```
//!
//! Handlers are registered ids, not function pointers on the wire; every
//! participant must register the same handlers in the same order.
//!
//! ```
//! use std::sync::Arc;
//! use amflux::{Aggregator, AggregatorConfig, HandlerTable, LoopbackNetwork, MonotonicTicks};
//!
//! let mut handlers = HandlerTable::new();
//! let hello = handlers.register(|args, _payload| {
//!     assert_eq!(args, b"hi");
//! });
//!
//! let net = LoopbackNetwork::new(2);
//! let handlers = Arc::new(handlers);
//! let ticks = Arc::new(MonotonicTicks::new());
//! let config = AggregatorConfig::default();
//! let a = Aggregator::new(net.endpoint(0), config.clone(), handlers.clone(), ticks.clone());
//! let b = Aggregator::new(net.endpoint(1), config, handlers, ticks);
//!
//! a.aggregate(1, hello, b"hi", b"");
//! a.flush(1);
//! assert!(b.poll());
//! ```

pub mod aggregator;
pub mod buffer;
pub mod config;
pub mod error;
pub mod handler;
pub mod lrqueue;
pub mod message;
pub mod pool;
pub mod rdma;
pub mod record;
pub mod stats;
pub mod ticks;
pub mod transport;

/// Global core id.
pub type Core = usize;
/// Locale (shared-memory domain) id.
pub type Locale = usize;

pub use aggregator::Aggregator;
pub use buffer::AggregatorBuffer;
pub use config::{AggregatorConfig, AggregatorConfigBuilder, MAX_BUFFER_SIZE};
pub use error::{Error, Result};
pub use handler::{HandlerId, HandlerTable};
pub use lrqueue::LrQueue;
pub use message::{Message, MessageFlags, MessagePayload};
pub use pool::MessagePool;
pub use rdma::{RdmaAggregator, Topology};
pub use record::{Record, RecordHeader, RecordWalker, RECORD_HEADER_SIZE};
pub use stats::{AggregatorStats, RdmaStats, RdmaStatsSnapshot, StatsSnapshot};
pub use ticks::{ManualTicks, MonotonicTicks, TickSource};
pub use transport::{
    BatchSink, Communicator, IncomingBatch, LocaleTransport, LoopbackEndpoint, LoopbackFabric,
    LoopbackNetwork,
};
