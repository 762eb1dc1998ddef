//! Order in which the send path visits message lists while filling a
//! network buffer.
//!
//! Destination cores are visited in ascending order so each destination
//! core's records form one contiguous chunk, matching the buffer's count
//! table. Within a destination core, source cores are visited round-robin
//! from a rotating start so no source core starves when buffers run out
//! of room.

/// Iterator over (destination core index, source core index) pairs.
#[derive(Debug)]
pub struct MessageListChooser {
    dest_cores: usize,
    source_cores: usize,
    first_source: usize,
    dest: usize,
    source: usize,
}

impl MessageListChooser {
    /// Visit all pairs for a locale with `dest_cores` destination cores
    /// and `source_cores` local source cores, starting source rotation at
    /// `first_source`.
    pub fn new(dest_cores: usize, source_cores: usize, first_source: usize) -> Self {
        assert!(source_cores > 0, "no source cores");
        Self {
            dest_cores,
            source_cores,
            first_source: first_source % source_cores,
            dest: 0,
            source: 0,
        }
    }

}

impl Iterator for MessageListChooser {
    type Item = (usize, usize);

    fn next(&mut self) -> Option<(usize, usize)> {
        if self.dest >= self.dest_cores {
            return None;
        }
        let pair = (
            self.dest,
            (self.first_source + self.source) % self.source_cores,
        );
        self.source += 1;
        if self.source == self.source_cores {
            self.source = 0;
            self.dest += 1;
        }
        Some(pair)
    }
}
