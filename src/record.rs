//! Serialized message record format.
//!
//! A batch buffer is a plain concatenation of self-describing records:
//!
//! ```text
//! ┌──────────────┬─────────────┬───────────────┬──────────────┬──────────┐
//! │ handler: u32 │ dest: u32   │ args_size:u16 │ payload:u16  │ rsvd:u32 │ 16 B
//! ├──────────────┴─────────────┴───────────────┴──────────────┴──────────┤
//! │ args bytes (args_size)                                               │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │ payload bytes (payload_size)                                         │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! All fields are little-endian. The handler field is a registered handler
//! id, not a code address, so it resolves identically on any core that
//! performed the same registrations (closed-world assumption).

use crate::handler::HandlerId;
use crate::Core;

/// Size of a record header in bytes.
pub const RECORD_HEADER_SIZE: usize = 16;

/// Header of one serialized record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    /// Registered handler id to invoke on the destination.
    pub handler: HandlerId,
    /// Final destination core of this record.
    pub destination: Core,
    /// Length of the fixed argument block.
    pub args_size: u16,
    /// Length of the optional variable payload.
    pub payload_size: u16,
}

impl RecordHeader {
    /// Total serialized size of the record this header describes.
    #[inline]
    pub fn record_size(&self) -> usize {
        RECORD_HEADER_SIZE + self.args_size as usize + self.payload_size as usize
    }
}

/// Total serialized size for a record with the given block lengths.
#[inline]
pub fn record_size(args_size: usize, payload_size: usize) -> usize {
    RECORD_HEADER_SIZE + args_size + payload_size
}

/// Encode a record header into `buf[..RECORD_HEADER_SIZE]`.
#[inline]
pub fn encode_header(buf: &mut [u8], header: &RecordHeader) {
    debug_assert!(buf.len() >= RECORD_HEADER_SIZE);
    buf[0..4].copy_from_slice(&u32::from(header.handler.0).to_le_bytes());
    buf[4..8].copy_from_slice(&(header.destination as u32).to_le_bytes());
    buf[8..10].copy_from_slice(&header.args_size.to_le_bytes());
    buf[10..12].copy_from_slice(&header.payload_size.to_le_bytes());
    buf[12..16].copy_from_slice(&0u32.to_le_bytes());
}

/// Decode a record header from `buf[..RECORD_HEADER_SIZE]`.
///
/// Panics if the buffer is too short; a truncated header means the batch
/// framing is corrupt, which is unrecoverable.
#[inline]
pub fn decode_header(buf: &[u8]) -> RecordHeader {
    assert!(
        buf.len() >= RECORD_HEADER_SIZE,
        "truncated record header: {} bytes",
        buf.len()
    );
    let handler = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let destination = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    let args_size = u16::from_le_bytes(buf[8..10].try_into().unwrap());
    let payload_size = u16::from_le_bytes(buf[10..12].try_into().unwrap());
    RecordHeader {
        handler: HandlerId(handler as u16),
        destination: destination as Core,
        args_size,
        payload_size,
    }
}

/// Serialize a full record into `buf`, returning the bytes written.
///
/// The caller guarantees `buf` has room; the record format has no internal
/// length escape for oversized messages.
pub fn encode_record(
    buf: &mut [u8],
    handler: HandlerId,
    destination: Core,
    args: &[u8],
    payload: &[u8],
) -> usize {
    assert!(args.len() <= u16::MAX as usize, "args block too large");
    assert!(payload.len() <= u16::MAX as usize, "payload too large");
    let header = RecordHeader {
        handler,
        destination,
        args_size: args.len() as u16,
        payload_size: payload.len() as u16,
    };
    let total = header.record_size();
    debug_assert!(buf.len() >= total);

    encode_header(buf, &header);
    let args_end = RECORD_HEADER_SIZE + args.len();
    buf[RECORD_HEADER_SIZE..args_end].copy_from_slice(args);
    buf[args_end..total].copy_from_slice(payload);
    total
}

/// One decoded record borrowed from a batch buffer.
#[derive(Debug, Clone, Copy)]
pub struct Record<'a> {
    pub header: RecordHeader,
    pub args: &'a [u8],
    pub payload: &'a [u8],
}

/// Iterator walking the records of a batch buffer front to back.
///
/// A partial trailing record aborts the process: the sender never emits one,
/// so observing it means the framing is corrupt.
pub struct RecordWalker<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> RecordWalker<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }
}

impl<'a> Iterator for RecordWalker<'a> {
    type Item = Record<'a>;

    fn next(&mut self) -> Option<Record<'a>> {
        if self.pos == self.buf.len() {
            return None;
        }
        let header = decode_header(&self.buf[self.pos..]);
        let total = header.record_size();
        assert!(
            self.pos + total <= self.buf.len(),
            "partial record in batch: need {} bytes, have {}",
            total,
            self.buf.len() - self.pos
        );
        let args_start = self.pos + RECORD_HEADER_SIZE;
        let args_end = args_start + header.args_size as usize;
        let payload_end = args_end + header.payload_size as usize;
        let record = Record {
            header,
            args: &self.buf[args_start..args_end],
            payload: &self.buf[args_end..payload_end],
        };
        self.pos += total;
        Some(record)
    }
}
