//! Fixed-capacity per-connection buffers.
//!
//! Both buffers are sized for exactly one maximum frame (`4 + 4096` bytes).
//! The read side keeps valid bytes starting at offset 0 and compacts after
//! each consumed frame. The write side holds one response and a cursor for
//! how much of it has reached the socket.
//!
//! Accounting errors here are programming defects, so they panic instead of
//! returning errors.

use crate::protocol::MAX_FRAME_BYTES;

/// Inbound bytes awaiting frame extraction.
pub struct ReadBuffer {
    buf: Box<[u8]>,
    filled: usize,
}

impl ReadBuffer {
    pub fn new() -> Self {
        Self::with_capacity(MAX_FRAME_BYTES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            filled: 0,
        }
    }

    /// Bytes currently buffered.
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.filled]
    }

    /// Unused tail of the buffer, where the next read lands.
    pub fn spare_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.filled..]
    }

    /// Record `n` freshly read bytes.
    ///
    /// # Panics
    /// Panics if the fill level would exceed capacity.
    pub fn advance(&mut self, n: usize) {
        assert!(
            n <= self.buf.len() - self.filled,
            "read buffer overflow: filled {} + {} > {}",
            self.filled,
            n,
            self.buf.len()
        );
        self.filled += n;
    }

    /// Drop the first `n` bytes and shift the remainder to offset 0.
    ///
    /// # Panics
    /// Panics if `n` exceeds the fill level.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.filled, "consumed {} of {} buffered bytes", n, self.filled);
        self.buf.copy_within(n..self.filled, 0);
        self.filled -= n;
    }

    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }

    pub fn is_full(&self) -> bool {
        self.filled == self.buf.len()
    }
}

impl Default for ReadBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Outbound bytes for the single in-flight response.
pub struct WriteBuffer {
    buf: Box<[u8]>,
    filled: usize,
    sent: usize,
}

impl WriteBuffer {
    pub fn new() -> Self {
        Self::with_capacity(MAX_FRAME_BYTES)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            filled: 0,
            sent: 0,
        }
    }

    /// Whole buffer for encoding a new response.
    ///
    /// # Panics
    /// Panics if a response is still queued; only one may be in flight.
    pub fn space_mut(&mut self) -> &mut [u8] {
        assert!(self.is_empty(), "response queued while another is in flight");
        &mut self.buf[..]
    }

    /// Mark the first `n` bytes as a queued response.
    ///
    /// # Panics
    /// Panics if `n` exceeds capacity or a response is already queued.
    pub fn queue(&mut self, n: usize) {
        assert!(self.is_empty(), "response queued while another is in flight");
        assert!(n <= self.buf.len(), "queued {} bytes into {}", n, self.buf.len());
        self.filled = n;
    }

    /// Bytes queued but not yet sent.
    pub fn pending(&self) -> &[u8] {
        &self.buf[self.sent..self.filled]
    }

    /// Record `n` bytes written to the socket. Returns `true` once the whole
    /// response has been sent, at which point both cursors reset to 0.
    ///
    /// # Panics
    /// Panics if more bytes are reported sent than were queued.
    pub fn advance(&mut self, n: usize) -> bool {
        self.sent += n;
        assert!(
            self.sent <= self.filled,
            "sent {} bytes of a {} byte response",
            self.sent,
            self.filled
        );
        if self.sent == self.filled {
            self.sent = 0;
            self.filled = 0;
            true
        } else {
            false
        }
    }

    /// Queued bytes.
    #[allow(dead_code)]
    pub fn len(&self) -> usize {
        self.filled
    }

    pub fn is_empty(&self) -> bool {
        self.filled == 0
    }
}

impl Default for WriteBuffer {
    fn default() -> Self {
        Self::new()
    }
}
