//! Message pool with block-until-drained semantics.
//!
//! A pool counts the messages it has issued and lets the owning task wait
//! until every one of them has been sent. Completion is signaled from the
//! send path (possibly another thread) through the ticket the message
//! carries.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::handler::HandlerId;
use crate::message::Message;
use crate::Core;

#[derive(Debug, Default)]
struct PoolShared {
    outstanding: Mutex<usize>,
    drained: Condvar,
}

/// Completion ticket carried by pool-issued messages.
///
/// Dropping the ticket without completion is a leak of the count, so the
/// send path must call [`PoolTicket::complete`] exactly once when the
/// message transitions to sent.
#[derive(Debug, Clone)]
pub struct PoolTicket {
    shared: Arc<PoolShared>,
}

impl PoolTicket {
    /// Mark one pool message as sent.
    pub fn complete(&self) {
        let mut outstanding = self.shared.outstanding.lock();
        assert!(*outstanding > 0, "pool completion count mismatch");
        *outstanding -= 1;
        if *outstanding == 0 {
            self.shared.drained.notify_all();
        }
    }
}

/// Scoped allocator for message storage.
///
/// Messages issued from the pool delete themselves after send; the pool
/// itself only tracks drain state.
#[derive(Debug, Default)]
pub struct MessagePool {
    shared: Arc<PoolShared>,
}

impl MessagePool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a pool-tracked message.
    pub fn message(
        &self,
        source: Core,
        destination: Core,
        handler: HandlerId,
        args: &[u8],
    ) -> Box<Message> {
        let mut m = Message::new(source, destination, handler, args);
        self.attach(&mut m);
        Box::new(m)
    }

    /// Build a pool-tracked message with a variable payload.
    pub fn message_with_payload(
        &self,
        source: Core,
        destination: Core,
        handler: HandlerId,
        args: &[u8],
        payload: Vec<u8>,
    ) -> Box<Message> {
        let mut m = Message::with_payload(source, destination, handler, args, payload);
        self.attach(&mut m);
        Box::new(m)
    }

    fn attach(&self, m: &mut Message) {
        *self.shared.outstanding.lock() += 1;
        m.set_delete_after_send();
        m.set_completion(PoolTicket { shared: self.shared.clone() });
    }

    /// Number of issued messages not yet sent.
    pub fn outstanding(&self) -> usize {
        *self.shared.outstanding.lock()
    }

    /// Park until every issued message has been marked sent.
    pub fn block_until_all_sent(&self) {
        let mut outstanding = self.shared.outstanding.lock();
        while *outstanding > 0 {
            self.shared.drained.wait(&mut outstanding);
        }
    }
}
