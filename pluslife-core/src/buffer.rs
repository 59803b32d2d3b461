//! Fixed-size circular buffer backing the reading history
//!
//! ## Overview
//!
//! The history window needs a sliding record of the most recent day of
//! samples on a process that must never grow its memory under a noisy or
//! misbehaving sensor. This buffer has a fixed capacity chosen at compile
//! time through a const generic and evicts the oldest reading when full.
//!
//! ## Why not `heapless::Vec`?
//!
//! `heapless::Vec` errors when full; the window wants automatic overwrite
//! because recent samples are strictly more valuable than old ones. The
//! buffer also needs explicit front eviction so retention by age (drop
//! everything older than 24h) works regardless of fill level.
//!
//! ## Layout
//!
//! A ring over `[Option<Reading>; N]` with a `start` index for the oldest
//! element and a length:
//!
//! ```text
//! Physical:  [D, E, A, B, C]   start = 2, len = 5
//! Logical:   [A, B, C, D, E]   get(i) = data[(start + i) % N]
//! ```
//!
//! All operations are O(1) except iteration; nothing allocates.

use crate::reading::Reading;

/// Circular buffer of readings, oldest evicted on overflow
#[derive(Clone)]
pub struct ReadingBuffer<const N: usize> {
    data: [Option<Reading>; N],
    /// Index of the oldest element
    start: usize,
    /// Number of stored readings, at most N
    len: usize,
}

impl<const N: usize> ReadingBuffer<N> {
    /// Create an empty buffer
    pub const fn new() -> Self {
        Self {
            data: [None; N],
            start: 0,
            len: 0,
        }
    }

    /// Append a reading, evicting the oldest when full
    pub fn push(&mut self, reading: Reading) {
        let slot = (self.start + self.len) % N;
        self.data[slot] = Some(reading);

        if self.len < N {
            self.len += 1;
        } else {
            // Overwrote the oldest element
            self.start = (self.start + 1) % N;
        }
    }

    /// Remove and return the oldest reading
    pub fn pop_oldest(&mut self) -> Option<Reading> {
        if self.len == 0 {
            return None;
        }

        let reading = self.data[self.start].take();
        self.start = (self.start + 1) % N;
        self.len -= 1;
        reading
    }

    /// Number of stored readings
    pub fn len(&self) -> usize {
        self.len
    }

    /// Check if the buffer is empty
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Check if the buffer is full
    pub fn is_full(&self) -> bool {
        self.len == N
    }

    /// Oldest stored reading
    pub fn first(&self) -> Option<&Reading> {
        self.get(0)
    }

    /// Newest stored reading
    pub fn last(&self) -> Option<&Reading> {
        if self.len == 0 {
            return None;
        }
        self.get(self.len - 1)
    }

    /// Reading by logical index (0 = oldest)
    pub fn get(&self, index: usize) -> Option<&Reading> {
        if index >= self.len {
            return None;
        }
        self.data[(self.start + index) % N].as_ref()
    }

    /// Iterate from oldest to newest
    pub fn iter(&self) -> ReadingBufferIter<'_, N> {
        ReadingBufferIter {
            buffer: self,
            index: 0,
        }
    }

    /// Drop all readings
    pub fn clear(&mut self) {
        self.data = [None; N];
        self.start = 0;
        self.len = 0;
    }
}

impl<const N: usize> Default for ReadingBuffer<N> {
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over buffer contents in chronological order
pub struct ReadingBufferIter<'a, const N: usize> {
    buffer: &'a ReadingBuffer<N>,
    index: usize,
}

impl<'a, const N: usize> Iterator for ReadingBufferIter<'a, N> {
    type Item = &'a Reading;

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.buffer.get(self.index)?;
        self.index += 1;
        Some(item)
    }
}
