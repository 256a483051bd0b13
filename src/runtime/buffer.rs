//! Per-connection line buffer.
//!
//! Accumulates raw bytes from the socket and hands out complete
//! newline-terminated commands. Capacity is fixed; a connection that sends
//! more than `capacity` bytes without a newline has its buffer discarded
//! rather than grown.

/// Outcome of appending a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Append {
    /// Chunk stored behind the existing data.
    Stored,
    /// Existing data was discarded to make room; the chunk was stored.
    Reset,
    /// Existing data was discarded and the chunk alone exceeds capacity,
    /// so nothing was stored.
    Dropped,
}

/// Fixed-capacity compacting byte queue split on `\n`.
pub struct LineBuffer {
    buf: Vec<u8>,
    /// Start of unconsumed data.
    start: usize,
    /// End of valid data.
    end: usize,
}

impl LineBuffer {
    /// Create a buffer holding at most `capacity` bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity],
            start: 0,
            end: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes currently held (consumed lines excluded).
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Append newly received bytes.
    ///
    /// If the chunk does not fit behind the data already held, everything
    /// held is discarded before the chunk is stored.
    pub fn append(&mut self, chunk: &[u8]) -> Append {
        self.compact();

        let mut outcome = Append::Stored;
        if self.end + chunk.len() > self.capacity() {
            self.clear();
            outcome = Append::Reset;
            if chunk.len() > self.capacity() {
                return Append::Dropped;
            }
        }

        self.buf[self.end..self.end + chunk.len()].copy_from_slice(chunk);
        self.end += chunk.len();
        outcome
    }

    /// Take the next complete line, without its `\n` and an optional
    /// trailing `\r`.
    ///
    /// Returns `None` when only a partial line (or nothing) remains.
    pub fn take_line(&mut self) -> Option<&[u8]> {
        let pending = &self.buf[self.start..self.end];
        let newline = pending.iter().position(|&b| b == b'\n')?;

        let line_start = self.start;
        let mut line_end = line_start + newline;
        self.start = line_end + 1;

        if line_end > line_start && self.buf[line_end - 1] == b'\r' {
            line_end -= 1;
        }
        Some(&self.buf[line_start..line_end])
    }

    /// Move the unconsumed remainder to the front of the buffer.
    pub fn compact(&mut self) {
        if self.start == 0 {
            return;
        }
        if self.start < self.end {
            self.buf.copy_within(self.start..self.end, 0);
        }
        self.end -= self.start;
        self.start = 0;
    }

    /// Discard everything held.
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// Unconsumed bytes (the trailing partial line after extraction).
    #[cfg(test)]
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }
}
