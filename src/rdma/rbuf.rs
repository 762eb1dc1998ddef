//! Reusable network transfer buffers.
//!
//! Wire layout of a filled buffer:
//!
//! ```text
//! +-------------------------------+------------------+------------------+--
//! | u32 byte count per dest core  | dest core 0      | dest core 1      | ...
//! | (locale_cores entries, LE)    | records          | records          |
//! +-------------------------------+------------------+------------------+--
//! ```
//!
//! Records for each destination core are contiguous, so the receiver can
//! demultiplex by walking the count table without parsing records. Appends
//! must therefore happen in ascending destination-core order.

use crate::config::MAX_BUFFER_SIZE;

/// Where a buffer currently is in its reuse cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferState {
    /// On the free pool.
    Free,
    /// Held by a sender, accepting records.
    Filling,
    /// Handed to the transport.
    Sending,
    /// Held by a receive worker.
    Processing,
}

/// One reusable transfer buffer with its demux count table.
#[derive(Debug)]
pub struct RdmaBuffer {
    data: Box<[u8]>,
    locale_cores: usize,
    fill: usize,
    counts: Vec<u32>,
    last_dest: usize,
    state: BufferState,
}

impl RdmaBuffer {
    /// Bytes consumed by the count table for `locale_cores` cores.
    #[inline]
    pub fn table_size(locale_cores: usize) -> usize {
        locale_cores * 4
    }

    pub fn new(locale_cores: usize, capacity: usize) -> Self {
        assert!(locale_cores > 0, "no destination cores");
        assert!(capacity <= MAX_BUFFER_SIZE, "buffer larger than wire maximum");
        assert!(
            capacity > Self::table_size(locale_cores),
            "buffer of {} bytes cannot hold a {}-core count table",
            capacity,
            locale_cores
        );
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            locale_cores,
            fill: Self::table_size(locale_cores),
            counts: vec![0u32; locale_cores],
            last_dest: 0,
            state: BufferState::Free,
        }
    }

    #[inline]
    pub fn state(&self) -> BufferState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: BufferState) {
        self.state = state;
    }

    /// Bytes of record space still free.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.fill
    }

    /// Record bytes appended so far.
    #[inline]
    pub fn payload_bytes(&self) -> usize {
        self.fill - Self::table_size(self.locale_cores)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.payload_bytes() == 0
    }

    /// Reserve space for one record destined to local core `dest`.
    ///
    /// Returns a mutable slice to serialize into, or `None` when the
    /// record does not fit. Appends must come in ascending `dest` order.
    pub fn reserve(&mut self, dest: usize, size: usize) -> Option<&mut [u8]> {
        assert!(dest < self.locale_cores, "destination core {} out of range", dest);
        assert!(
            dest >= self.last_dest,
            "destination core {} appended after {}",
            dest,
            self.last_dest
        );
        if size > self.remaining() {
            return None;
        }
        self.last_dest = dest;
        self.counts[dest] += size as u32;
        let start = self.fill;
        self.fill += size;
        Some(&mut self.data[start..start + size])
    }

    /// Write the count table and expose the wire image.
    pub fn finish(&mut self) -> &[u8] {
        for (i, count) in self.counts.iter().enumerate() {
            self.data[i * 4..i * 4 + 4].copy_from_slice(&count.to_le_bytes());
        }
        &self.data[..self.fill]
    }

    /// Make the buffer reusable for the next fill.
    pub fn reset(&mut self) {
        self.fill = Self::table_size(self.locale_cores);
        self.counts.iter_mut().for_each(|c| *c = 0);
        self.last_dest = 0;
    }
}

/// Split a received wire image into per-destination-core record chunks.
///
/// Yields `(dest core index, records)` for non-empty chunks. Panics on a
/// malformed image; corrupt buffers on a reliable fabric are fatal.
pub fn demux(data: &[u8], locale_cores: usize) -> impl Iterator<Item = (usize, &[u8])> {
    let table = RdmaBuffer::table_size(locale_cores);
    assert!(data.len() >= table, "buffer shorter than its count table");
    let mut offset = table;
    let chunks: Vec<(usize, &[u8])> = (0..locale_cores)
        .filter_map(|dest| {
            let count =
                u32::from_le_bytes(data[dest * 4..dest * 4 + 4].try_into().unwrap()) as usize;
            if count == 0 {
                return None;
            }
            assert!(offset + count <= data.len(), "count table overruns buffer");
            let chunk = &data[offset..offset + count];
            offset += count;
            Some((dest, chunk))
        })
        .collect();
    assert_eq!(offset, data.len(), "trailing bytes after demux");
    chunks.into_iter()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reserve_and_demux_roundtrip() {
        let mut buf = RdmaBuffer::new(3, 256);
        buf.reserve(0, 4).unwrap().copy_from_slice(b"aaaa");
        buf.reserve(0, 2).unwrap().copy_from_slice(b"bb");
        buf.reserve(2, 3).unwrap().copy_from_slice(b"ccc");
        let wire = buf.finish().to_vec();

        let chunks: Vec<_> = demux(&wire, 3).collect();
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], (0, b"aaaabb".as_slice()));
        assert_eq!(chunks[1], (2, b"ccc".as_slice()));
    }

    #[test]
    fn test_reserve_rejects_overflow() {
        let mut buf = RdmaBuffer::new(1, 16);
        assert_eq!(buf.remaining(), 12);
        assert!(buf.reserve(0, 13).is_none());
        assert!(buf.reserve(0, 12).is_some());
        assert_eq!(buf.remaining(), 0);
    }

    #[test]
    #[should_panic(expected = "appended after")]
    fn test_descending_dest_is_fatal() {
        let mut buf = RdmaBuffer::new(2, 64);
        buf.reserve(1, 4).unwrap();
        buf.reserve(0, 4).unwrap();
    }

    #[test]
    fn test_reset_clears_counts() {
        let mut buf = RdmaBuffer::new(2, 64);
        buf.reserve(0, 4).unwrap().copy_from_slice(b"xxxx");
        buf.reset();
        assert!(buf.is_empty());
        let wire = buf.finish().to_vec();
        assert_eq!(demux(&wire, 2).count(), 0);
    }

    #[test]
    #[should_panic(expected = "overruns buffer")]
    fn test_demux_rejects_bad_counts() {
        let mut wire = vec![0u8; 8];
        wire[0..4].copy_from_slice(&100u32.to_le_bytes());
        let _ = demux(&wire, 1).count();
    }
}
