//! Bounded output ring buffer for agent streams.

use std::collections::VecDeque;

/// A byte ring holding the most recent output of one stream.
///
/// On overflow the oldest bytes are evicted; the caller is told exactly
/// once per overflow burst so it can surface a truncation marker.
#[derive(Debug)]
pub struct OutputRing {
    bytes: VecDeque<u8>,
    capacity: usize,
    in_overflow_burst: bool,
}

impl OutputRing {
    /// Create a ring holding up to `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            bytes: VecDeque::with_capacity(capacity.min(64 * 1024)),
            capacity: capacity.max(1),
            in_overflow_burst: false,
        }
    }

    /// Append a chunk, evicting from the front as needed.
    ///
    /// Returns `true` exactly when this push started a new overflow burst,
    /// i.e. the truncation marker should be emitted now.
    pub fn push(&mut self, chunk: &[u8]) -> bool {
        self.bytes.extend(chunk.iter().copied());
        let mut evicted = false;
        while self.bytes.len() > self.capacity {
            self.bytes.pop_front();
            evicted = true;
        }
        if evicted {
            if self.in_overflow_burst {
                return false;
            }
            self.in_overflow_burst = true;
            return true;
        }
        self.in_overflow_burst = false;
        false
    }

    /// Current contents, lossily decoded as UTF-8.
    #[must_use]
    pub fn to_string_lossy(&self) -> String {
        let (front, back) = self.bytes.as_slices();
        let mut buf = Vec::with_capacity(self.bytes.len());
        buf.extend_from_slice(front);
        buf.extend_from_slice(back);
        String::from_utf8_lossy(&buf).into_owned()
    }

    /// Number of buffered bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Whether the ring holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}
