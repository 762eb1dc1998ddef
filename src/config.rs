//! Configuration knobs for the aggregation layer.
//!
//! One struct covers both the single-core [`Aggregator`](crate::Aggregator)
//! and the multi-core [`RdmaAggregator`](crate::rdma::RdmaAggregator); each
//! consumer reads the knobs relevant to it.

use crate::error::{Error, Result};
use crate::record::RECORD_HEADER_SIZE;

/// Fixed capacity of a network transfer buffer, count table included.
pub const MAX_BUFFER_SIZE: usize = 1 << 16;

/// Default per-destination aggregation buffer capacity in bytes.
pub const DEFAULT_BUFFER_CAPACITY: usize = 4024;

/// Default autoflush timeout in ticks.
pub const DEFAULT_AUTOFLUSH_TICKS: u64 = 1_000_000;

/// Default number of reusable network buffers per core.
pub const DEFAULT_BUFFERS_PER_CORE: usize = 6;

/// Aggregation configuration.
#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Capacity of each per-destination aggregation buffer.
    pub buffer_capacity: usize,
    /// Ticks a buffer may hold data before the timeout sweep flushes it.
    pub autoflush_ticks: u64,
    /// Maximum timeout flushes per `poll()`. 0 means unlimited.
    pub max_flush: usize,
    /// Master switch; when false every message is sent immediately.
    pub enable: bool,
    /// Whether `idle_flush_poll()` drains all pending buffers.
    pub flush_on_idle: bool,
    /// Fill target for network buffers before they are handed to the
    /// transport.
    pub target_size: usize,
    /// Number of reusable network buffers per local core.
    pub buffers_per_core: usize,
    /// Number of receive worker tasks per local core.
    pub workers_per_core: usize,
    /// Serialized size below which a message bypasses batching and is
    /// sent on its own. 0 disables the bypass.
    pub immediate_threshold: usize,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: DEFAULT_BUFFER_CAPACITY,
            autoflush_ticks: DEFAULT_AUTOFLUSH_TICKS,
            max_flush: 1,
            enable: true,
            flush_on_idle: true,
            target_size: 1 << 13,
            buffers_per_core: DEFAULT_BUFFERS_PER_CORE,
            workers_per_core: 1,
            immediate_threshold: 0,
        }
    }
}

impl AggregatorConfig {
    pub fn builder() -> AggregatorConfigBuilder {
        AggregatorConfigBuilder::new()
    }
}

/// Builder for [`AggregatorConfig`].
#[derive(Debug, Clone)]
pub struct AggregatorConfigBuilder {
    config: AggregatorConfig,
}

impl Default for AggregatorConfigBuilder {
    fn default() -> Self {
        Self { config: AggregatorConfig::default() }
    }
}

impl AggregatorConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the per-destination aggregation buffer capacity.
    pub fn buffer_capacity(mut self, bytes: usize) -> Self {
        self.config.buffer_capacity = bytes;
        self
    }

    /// Set the autoflush timeout in ticks.
    pub fn autoflush_ticks(mut self, ticks: u64) -> Self {
        self.config.autoflush_ticks = ticks;
        self
    }

    /// Set the per-poll timeout flush budget (0 = unlimited).
    pub fn max_flush(mut self, flushes: usize) -> Self {
        self.config.max_flush = flushes;
        self
    }

    /// Enable or disable aggregation entirely.
    pub fn enable(mut self, enable: bool) -> Self {
        self.config.enable = enable;
        self
    }

    /// Enable or disable idle draining.
    pub fn flush_on_idle(mut self, flush: bool) -> Self {
        self.config.flush_on_idle = flush;
        self
    }

    /// Set the network buffer fill target.
    pub fn target_size(mut self, bytes: usize) -> Self {
        self.config.target_size = bytes;
        self
    }

    /// Set the free-pool size per local core.
    pub fn buffers_per_core(mut self, buffers: usize) -> Self {
        self.config.buffers_per_core = buffers;
        self
    }

    /// Set the receive worker count per local core.
    pub fn workers_per_core(mut self, workers: usize) -> Self {
        self.config.workers_per_core = workers;
        self
    }

    /// Set the immediate-send size threshold (0 disables the bypass).
    pub fn immediate_threshold(mut self, bytes: usize) -> Self {
        self.config.immediate_threshold = bytes;
        self
    }

    /// Validate and produce the configuration.
    pub fn build(self) -> Result<AggregatorConfig> {
        let c = self.config;
        if c.buffer_capacity <= RECORD_HEADER_SIZE {
            return Err(Error::BufferCapacityTooSmall {
                capacity: c.buffer_capacity,
                min: RECORD_HEADER_SIZE + 1,
            });
        }
        if c.target_size > MAX_BUFFER_SIZE {
            return Err(Error::TargetSizeTooLarge {
                target_size: c.target_size,
                max: MAX_BUFFER_SIZE,
            });
        }
        if c.buffers_per_core == 0 {
            return Err(Error::EmptyBufferPool);
        }
        Ok(c)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_builds() {
        let config = AggregatorConfig::builder().build().unwrap();
        assert!(config.enable);
        assert_eq!(config.buffer_capacity, DEFAULT_BUFFER_CAPACITY);
        assert_eq!(config.max_flush, 1);
    }

    #[test]
    fn test_rejects_tiny_buffer() {
        let err = AggregatorConfig::builder().buffer_capacity(8).build();
        assert!(matches!(err, Err(Error::BufferCapacityTooSmall { .. })));
    }

    #[test]
    fn test_rejects_oversized_target() {
        let err = AggregatorConfig::builder()
            .target_size(MAX_BUFFER_SIZE + 1)
            .build();
        assert!(matches!(err, Err(Error::TargetSizeTooLarge { .. })));
    }

    #[test]
    fn test_rejects_empty_pool() {
        let err = AggregatorConfig::builder().buffers_per_core(0).build();
        assert!(matches!(err, Err(Error::EmptyBufferPool)));
    }
}
