//! Registered-handler dispatch.
//!
//! Records carry a small-integer handler id instead of a raw code address,
//! so dispatch works across processes as long as every core performs the
//! same registrations in the same order before any traffic flows.

use slab::Slab;

/// Identifier of a registered handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(pub u16);

/// Handler invoked with the record's argument block and payload.
pub type HandlerFn = Box<dyn Fn(&[u8], &[u8]) + Send + Sync>;

/// Table of registered handlers, indexed by [`HandlerId`].
///
/// Registration must complete before the table is shared with an
/// aggregator; dispatch of an unknown id is a fatal invariant violation.
pub struct HandlerTable {
    handlers: Slab<HandlerFn>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self { handlers: Slab::new() }
    }

    /// Register a handler, returning its id.
    pub fn register<F>(&mut self, handler: F) -> HandlerId
    where
        F: Fn(&[u8], &[u8]) + Send + Sync + 'static,
    {
        let key = self.handlers.insert(Box::new(handler));
        assert!(key <= u16::MAX as usize, "handler table full");
        HandlerId(key as u16)
    }

    /// Look up a handler by id.
    ///
    /// Panics on an unknown id: the sender and receiver disagree about the
    /// registration order, which is a configuration bug.
    #[inline]
    pub fn get(&self, id: HandlerId) -> &HandlerFn {
        self.handlers
            .get(id.0 as usize)
            .unwrap_or_else(|| panic!("unregistered handler id {}", id.0))
    }

    /// Invoke the handler registered under `id`.
    #[inline]
    pub fn dispatch(&self, id: HandlerId, args: &[u8], payload: &[u8]) {
        (self.get(id))(args, payload);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_register_and_dispatch() {
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();

        let mut table = HandlerTable::new();
        let id = table.register(move |args, payload| {
            assert_eq!(args, b"args");
            assert_eq!(payload, b"payload");
            hits2.fetch_add(1, Ordering::SeqCst);
        });

        table.dispatch(id, b"args", b"payload");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_ids_are_dense() {
        let mut table = HandlerTable::new();
        let a = table.register(|_, _| {});
        let b = table.register(|_, _| {});
        assert_eq!(a, HandlerId(0));
        assert_eq!(b, HandlerId(1));
        assert_eq!(table.len(), 2);
    }

    #[test]
    #[should_panic(expected = "unregistered handler id")]
    fn test_unknown_id_is_fatal() {
        let table = HandlerTable::new();
        table.dispatch(HandlerId(9), b"", b"");
    }
}
