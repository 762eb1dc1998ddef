//! Message representation for the multi-core aggregator.
//!
//! A message is a closed tagged type: the argument block is inline and
//! fixed-capacity, the payload is either absent or an owned byte vector.
//! Lifecycle state is a monotonic flag progression:
//!
//! ```text
//! created → ENQUEUED → DELIVERED → SENT
//! ```
//!
//! DELIVERED means the message's contents left it: either its handler ran
//! locally or its bytes were serialized into a network buffer. SENT means
//! the transfer was confirmed; for pool-issued messages it also notifies
//! the pool ticket.

use bitflags::bitflags;

use crate::handler::HandlerId;
use crate::pool::PoolTicket;
use crate::record::{self, record_size};
use crate::Core;

/// Capacity of the inline argument block.
pub const MAX_INLINE_ARGS: usize = 64;

bitflags! {
    /// Message lifecycle flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct MessageFlags: u8 {
        /// Placed on a shared message list.
        const ENQUEUED = 1 << 0;
        /// Handler ran locally or contents were serialized.
        const DELIVERED = 1 << 1;
        /// Transfer confirmed; owner may reclaim the message.
        const SENT = 1 << 2;
        /// Contents were moved out (diagnostic aid for misuse).
        const MOVED = 1 << 3;
        /// Owner frees the message automatically once sent.
        const DELETE_AFTER_SEND = 1 << 4;
    }
}

/// Variable payload of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagePayload {
    None,
    Bytes(Vec<u8>),
}

impl MessagePayload {
    #[inline]
    pub fn len(&self) -> usize {
        match self {
            MessagePayload::None => 0,
            MessagePayload::Bytes(b) => b.len(),
        }
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn as_slice(&self) -> &[u8] {
        match self {
            MessagePayload::None => &[],
            MessagePayload::Bytes(b) => b.as_slice(),
        }
    }
}

/// One unit of remote work.
pub struct Message {
    destination: Core,
    source: Core,
    handler: HandlerId,
    args_len: u16,
    args: [u8; MAX_INLINE_ARGS],
    payload: MessagePayload,
    flags: MessageFlags,
    completion: Option<PoolTicket>,
    /// Intrusive link used by the shared message lists. Only the list that
    /// owns the message may touch it.
    pub(crate) next: *mut Message,
}

// The raw `next` pointer is only manipulated while the message is owned by
// exactly one list or one sender; messages otherwise carry owned data.
unsafe impl Send for Message {}

impl Message {
    pub fn new(source: Core, destination: Core, handler: HandlerId, args: &[u8]) -> Self {
        assert!(
            args.len() <= MAX_INLINE_ARGS,
            "args block of {} bytes exceeds inline capacity {}",
            args.len(),
            MAX_INLINE_ARGS
        );
        let mut inline = [0u8; MAX_INLINE_ARGS];
        inline[..args.len()].copy_from_slice(args);
        Self {
            destination,
            source,
            handler,
            args_len: args.len() as u16,
            args: inline,
            payload: MessagePayload::None,
            flags: MessageFlags::empty(),
            completion: None,
            next: std::ptr::null_mut(),
        }
    }

    pub fn with_payload(
        source: Core,
        destination: Core,
        handler: HandlerId,
        args: &[u8],
        payload: Vec<u8>,
    ) -> Self {
        assert!(payload.len() <= u16::MAX as usize, "payload too large");
        let mut m = Self::new(source, destination, handler, args);
        m.payload = MessagePayload::Bytes(payload);
        m
    }

    #[inline]
    pub fn destination(&self) -> Core {
        self.destination
    }

    #[inline]
    pub fn source(&self) -> Core {
        self.source
    }

    #[inline]
    pub fn handler(&self) -> HandlerId {
        self.handler
    }

    #[inline]
    pub fn args(&self) -> &[u8] {
        &self.args[..self.args_len as usize]
    }

    #[inline]
    pub fn payload(&self) -> &MessagePayload {
        &self.payload
    }

    #[inline]
    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    /// Serialized size of this message as a record.
    #[inline]
    pub fn serialized_size(&self) -> usize {
        record_size(self.args_len as usize, self.payload.len())
    }

    /// Serialize into `buf`, returning bytes written.
    pub fn serialize_into(&self, buf: &mut [u8]) -> usize {
        record::encode_record(
            buf,
            self.handler,
            self.destination,
            self.args(),
            self.payload.as_slice(),
        )
    }

    pub fn set_delete_after_send(&mut self) {
        self.flags |= MessageFlags::DELETE_AFTER_SEND;
    }

    #[inline]
    pub fn delete_after_send(&self) -> bool {
        self.flags.contains(MessageFlags::DELETE_AFTER_SEND)
    }

    pub(crate) fn set_completion(&mut self, ticket: PoolTicket) {
        self.completion = Some(ticket);
    }

    /// Redirect a locale-addressed message to a concrete core.
    pub(crate) fn retarget(&mut self, destination: Core) {
        assert!(
            !self.flags.contains(MessageFlags::ENQUEUED),
            "message retargeted after enqueue"
        );
        self.destination = destination;
    }

    /// Record placement on a shared list.
    pub fn mark_enqueued(&mut self) {
        assert!(
            !self.flags.contains(MessageFlags::SENT),
            "message enqueued after send"
        );
        self.flags |= MessageFlags::ENQUEUED;
    }

    /// Record that the contents left the message.
    ///
    /// A message is never delivered twice.
    pub fn mark_delivered(&mut self) {
        assert!(
            !self.flags.contains(MessageFlags::DELIVERED),
            "message delivered twice"
        );
        self.flags |= MessageFlags::DELIVERED | MessageFlags::MOVED;
    }

    /// Record transfer confirmation and notify the pool, if any.
    pub fn mark_sent(&mut self) {
        assert!(
            self.flags.contains(MessageFlags::ENQUEUED),
            "message sent without being enqueued"
        );
        assert!(
            self.flags.contains(MessageFlags::DELIVERED),
            "message sent before delivery"
        );
        if !self.flags.contains(MessageFlags::SENT) {
            self.flags |= MessageFlags::SENT;
            if let Some(ticket) = &self.completion {
                ticket.complete();
            }
        }
    }

    #[inline]
    pub fn is_sent(&self) -> bool {
        self.flags.contains(MessageFlags::SENT)
    }
}

impl std::fmt::Debug for Message {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Message")
            .field("destination", &self.destination)
            .field("source", &self.source)
            .field("handler", &self.handler)
            .field("args_len", &self.args_len)
            .field("payload_len", &self.payload.len())
            .field("flags", &self.flags)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RecordWalker;

    #[test]
    fn test_lifecycle_progression() {
        let mut m = Message::new(0, 1, HandlerId(0), b"args");
        assert_eq!(m.flags(), MessageFlags::empty());
        m.mark_enqueued();
        m.mark_delivered();
        m.mark_sent();
        assert!(m.is_sent());
    }

    #[test]
    #[should_panic(expected = "delivered twice")]
    fn test_double_delivery_is_fatal() {
        let mut m = Message::new(0, 1, HandlerId(0), b"");
        m.mark_delivered();
        m.mark_delivered();
    }

    #[test]
    #[should_panic(expected = "without being enqueued")]
    fn test_sent_implies_enqueued() {
        let mut m = Message::new(0, 1, HandlerId(0), b"");
        m.mark_delivered();
        m.mark_sent();
    }

    #[test]
    fn test_serialize_roundtrip() {
        let m = Message::with_payload(2, 5, HandlerId(3), b"argblock", b"payload".to_vec());
        let mut buf = vec![0u8; m.serialized_size()];
        let n = m.serialize_into(&mut buf);
        assert_eq!(n, buf.len());

        let records: Vec<_> = RecordWalker::new(&buf).collect();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].header.handler, HandlerId(3));
        assert_eq!(records[0].header.destination, 5);
        assert_eq!(records[0].args, b"argblock");
        assert_eq!(records[0].payload, b"payload");
    }

    #[test]
    #[should_panic(expected = "exceeds inline capacity")]
    fn test_oversized_args_are_fatal() {
        let big = [0u8; MAX_INLINE_ARGS + 1];
        let _ = Message::new(0, 1, HandlerId(0), &big);
    }
}
