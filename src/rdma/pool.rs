//! Blocking buffer and batch queues for the multi-core aggregator.
//!
//! The free-buffer pool is the backpressure mechanism: a sender that
//! cannot get a buffer parks until one is returned. Both queues support
//! close, which wakes every waiter and makes further takes return `None`.

use parking_lot::{Condvar, Mutex};

use crate::rdma::rbuf::{BufferState, RdmaBuffer};
use crate::Locale;

struct BufferListInner {
    buffers: Vec<RdmaBuffer>,
    closed: bool,
}

/// Pool of free [`RdmaBuffer`]s with blocking acquire.
pub struct BufferList {
    inner: Mutex<BufferListInner>,
    available: Condvar,
}

impl BufferList {
    pub fn new(count: usize, locale_cores: usize, capacity: usize) -> Self {
        let buffers = (0..count)
            .map(|_| RdmaBuffer::new(locale_cores, capacity))
            .collect();
        Self {
            inner: Mutex::new(BufferListInner { buffers, closed: false }),
            available: Condvar::new(),
        }
    }

    /// Take a buffer, parking until one is free. Returns `None` once the
    /// pool is closed and drained of waiters' chances.
    pub fn take(&self) -> Option<RdmaBuffer> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(mut buffer) = inner.buffers.pop() {
                debug_assert_eq!(buffer.state(), BufferState::Free);
                buffer.set_state(BufferState::Filling);
                return Some(buffer);
            }
            if inner.closed {
                return None;
            }
            self.available.wait(&mut inner);
        }
    }

    /// Take a buffer only if one is free right now.
    pub fn try_take(&self) -> Option<RdmaBuffer> {
        let mut inner = self.inner.lock();
        inner.buffers.pop().map(|mut buffer| {
            debug_assert_eq!(buffer.state(), BufferState::Free);
            buffer.set_state(BufferState::Filling);
            buffer
        })
    }

    /// Return a buffer to the pool and wake one waiter.
    pub fn put(&self, mut buffer: RdmaBuffer) {
        buffer.reset();
        buffer.set_state(BufferState::Free);
        let mut inner = self.inner.lock();
        inner.buffers.push(buffer);
        self.available.notify_one();
    }

    /// Wake all waiters; subsequent takes on an empty pool return `None`.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.available.notify_all();
    }

    /// Undo a close so the pool can serve a new worker generation.
    pub fn reopen(&self) {
        self.inner.lock().closed = false;
    }

    pub fn free_count(&self) -> usize {
        self.inner.lock().buffers.len()
    }
}

/// A batch accepted from the fabric, waiting for a receive worker.
#[derive(Debug)]
pub struct ReceivedBatch {
    pub source_locale: Locale,
    pub data: Vec<u8>,
}

struct ReceivedListInner {
    batches: std::collections::VecDeque<ReceivedBatch>,
    closed: bool,
}

/// Queue of received batches with blocking pop.
pub struct ReceivedList {
    inner: Mutex<ReceivedListInner>,
    ready: Condvar,
}

impl Default for ReceivedList {
    fn default() -> Self {
        Self {
            inner: Mutex::new(ReceivedListInner {
                batches: std::collections::VecDeque::new(),
                closed: false,
            }),
            ready: Condvar::new(),
        }
    }
}

impl ReceivedList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, batch: ReceivedBatch) {
        let mut inner = self.inner.lock();
        inner.batches.push_back(batch);
        self.ready.notify_one();
    }

    /// Pop the next batch, parking until one arrives or the list closes.
    pub fn pop(&self) -> Option<ReceivedBatch> {
        let mut inner = self.inner.lock();
        loop {
            if let Some(batch) = inner.batches.pop_front() {
                return Some(batch);
            }
            if inner.closed {
                return None;
            }
            self.ready.wait(&mut inner);
        }
    }

    /// Pop without blocking.
    pub fn try_pop(&self) -> Option<ReceivedBatch> {
        self.inner.lock().batches.pop_front()
    }

    pub fn close(&self) {
        let mut inner = self.inner.lock();
        inner.closed = true;
        self.ready.notify_all();
    }

    /// Undo a close so the queue can serve a new worker generation.
    pub fn reopen(&self) {
        self.inner.lock().closed = false;
    }

    pub fn len(&self) -> usize {
        self.inner.lock().batches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
