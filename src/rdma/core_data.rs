//! Shared per-(destination core, source core) message queues.
//!
//! Senders on any thread push messages onto a [`MessageList`] with a CAS
//! loop; the send path takes the whole list with one atomic swap, so the
//! fast path never locks. The swap yields messages newest-first; they are
//! reversed to arrival order before use.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicPtr, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::message::Message;

/// Intrusive lock-free MPSC stack of messages.
#[derive(Debug)]
pub struct MessageList {
    head: AtomicPtr<Message>,
}

impl Default for MessageList {
    fn default() -> Self {
        Self { head: AtomicPtr::new(std::ptr::null_mut()) }
    }
}

impl MessageList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push one message. Returns the number of CAS retries it took.
    pub fn push(&self, msg: Box<Message>) -> u64 {
        let raw = Box::into_raw(msg);
        let mut retries = 0;
        let mut head = self.head.load(Ordering::Relaxed);
        loop {
            // Exclusive access until the CAS publishes the node.
            unsafe { (*raw).next = head };
            match self.head.compare_exchange_weak(
                head,
                raw,
                Ordering::Release,
                Ordering::Relaxed,
            ) {
                Ok(_) => return retries,
                Err(actual) => {
                    retries += 1;
                    head = actual;
                }
            }
        }
    }

    /// Take every queued message in arrival order.
    pub fn grab(&self) -> Vec<Box<Message>> {
        let mut raw = self.head.swap(std::ptr::null_mut(), Ordering::Acquire);
        let mut messages = Vec::new();
        while !raw.is_null() {
            let mut msg = unsafe { Box::from_raw(raw) };
            raw = msg.next;
            msg.next = std::ptr::null_mut();
            messages.push(msg);
        }
        messages.reverse();
        messages
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Relaxed).is_null()
    }
}

impl Drop for MessageList {
    fn drop(&mut self) {
        // Reclaim anything still queued.
        drop(self.grab());
    }
}

/// Send-side state for one (destination core, source core) pair.
#[derive(Debug, Default)]
pub struct CoreData {
    /// Lock-free inbox filled by the owning source core.
    pub list: MessageList,
    /// Messages grabbed but not yet serialized; only the send path touches
    /// this, under its per-locale lock.
    pub pending: Mutex<VecDeque<Box<Message>>>,
    /// Serialized bytes currently queued (list + pending).
    pub queued_bytes: AtomicUsize,
    /// Tick of the last send that drained this pair.
    pub last_sent: AtomicU64,
}

impl CoreData {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn add_queued(&self, bytes: usize) {
        self.queued_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn sub_queued(&self, bytes: usize) {
        self.queued_bytes.fetch_sub(bytes, Ordering::Relaxed);
    }
}
