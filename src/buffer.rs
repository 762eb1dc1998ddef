//! Per-destination aggregation buffer.
//!
//! A fixed-capacity byte arena owned by exactly one aggregation context at a
//! time. It does no I/O and no locking; the owning aggregator serializes all
//! access.

/// Fixed-capacity contiguous staging area for one destination.
#[derive(Debug)]
pub struct AggregatorBuffer {
    buf: Box<[u8]>,
    fill: usize,
    /// Tick of the first insert since the last reset. Meaningless when empty.
    oldest_ts: u64,
    /// Tick of the most recent insert.
    newest_ts: u64,
}

impl AggregatorBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            fill: 0,
            oldest_ts: 0,
            newest_ts: 0,
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    #[inline]
    pub fn fill(&self) -> usize {
        self.fill
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.fill == 0
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.fill
    }

    /// Whether `size` more bytes fit. Strictly less than capacity, keeping
    /// one byte of slack so `insert` after a positive `fits` can never
    /// reach the end of the arena.
    #[inline]
    pub fn fits(&self, size: usize) -> bool {
        self.fill + size < self.buf.len()
    }

    /// Append `data`, stamping insert times.
    ///
    /// Precondition: `fits(data.len())`.
    pub fn insert(&mut self, data: &[u8], now: u64) {
        assert!(self.fits(data.len()), "insert would overflow buffer");
        if self.fill == 0 {
            self.oldest_ts = now;
        }
        self.buf[self.fill..self.fill + data.len()].copy_from_slice(data);
        self.fill += data.len();
        self.newest_ts = now;
    }

    /// The filled region. Valid until the next `insert` or `reset`.
    #[inline]
    pub fn contents(&self) -> &[u8] {
        &self.buf[..self.fill]
    }

    /// Forget the contents. The caller sends `contents()` first; reset
    /// itself performs no I/O.
    #[inline]
    pub fn reset(&mut self) {
        self.fill = 0;
    }

    #[inline]
    pub fn oldest_ts(&self) -> u64 {
        self.oldest_ts
    }

    #[inline]
    pub fn newest_ts(&self) -> u64 {
        self.newest_ts
    }
}
