//! Growable byte staging area for pending connection input and output.
//!
//! A [`Buffer`] is a FIFO of bytes backed by [`BytesMut`]. Bytes are appended
//! at the tail and consumed from the head. Storage grows in whole multiples of
//! a fixed growth step, and an optional hard limit bounds how many bytes the
//! buffer may hold at once.

use bytes::{Buf, BytesMut};
use thiserror::Error;

/// Growth step used when none is specified.
pub const DEFAULT_GROW_STEP: usize = 4096;

/// Errors produced by [`Buffer`] operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BufferError {
    #[error("buffer limit of {limit} bytes exceeded ({requested} bytes requested)")]
    LimitExceeded { limit: usize, requested: usize },
}

/// A growable FIFO byte buffer.
///
/// # Examples
///
/// ```
/// use embhttp::buffer::Buffer;
///
/// let mut buf = Buffer::new(16);
/// buf.append(b"hello world").unwrap();
/// buf.consume(6);
/// assert_eq!(buf.as_slice(), b"world");
/// ```
#[derive(Debug)]
pub struct Buffer {
    inner: BytesMut,
    step: usize,
    limit: usize,
}

impl Buffer {
    /// Creates an unbounded buffer with `step` bytes of initial capacity.
    ///
    /// `step` is also the growth increment. A zero step falls back to
    /// [`DEFAULT_GROW_STEP`].
    pub fn new(step: usize) -> Self {
        Self::with_limit(step, usize::MAX)
    }

    /// Creates a buffer that refuses to hold more than `limit` bytes.
    pub fn with_limit(step: usize, limit: usize) -> Self {
        let step = if step == 0 { DEFAULT_GROW_STEP } else { step };
        Self {
            inner: BytesMut::with_capacity(step.min(limit)),
            step,
            limit,
        }
    }

    /// Number of unconsumed bytes.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Total bytes the buffer can hold without reallocating.
    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    /// Spare capacity after the last unconsumed byte.
    pub fn headroom(&self) -> usize {
        self.inner.capacity() - self.inner.len()
    }

    /// Maximum number of bytes this buffer will hold.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// The unconsumed bytes, oldest first.
    pub fn as_slice(&self) -> &[u8] {
        &self.inner
    }

    /// Grows the buffer so that at least `n` more bytes fit without reallocating.
    ///
    /// Capacity never shrinks. Growth happens in multiples of the growth step.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LimitExceeded`] if holding `n` more bytes would
    /// exceed the buffer's limit.
    pub fn ensure_headroom(&mut self, n: usize) -> Result<(), BufferError> {
        let headroom = self.headroom();
        if headroom >= n {
            return Ok(());
        }

        let requested = self.len().saturating_add(n);
        if requested > self.limit {
            return Err(BufferError::LimitExceeded {
                limit: self.limit,
                requested,
            });
        }

        let grow = (n - headroom).div_ceil(self.step).saturating_mul(self.step);
        let target = self
            .capacity()
            .saturating_add(grow)
            .min(self.limit)
            .max(requested);
        self.inner.reserve(target - self.len());
        Ok(())
    }

    /// Appends all of `data` to the tail of the buffer.
    ///
    /// Either every byte is accepted or none is.
    ///
    /// # Errors
    ///
    /// Returns [`BufferError::LimitExceeded`] if the buffer would grow past its limit.
    pub fn append(&mut self, data: &[u8]) -> Result<usize, BufferError> {
        if data.is_empty() {
            return Ok(0);
        }
        let requested = self.len().saturating_add(data.len());
        if requested > self.limit {
            return Err(BufferError::LimitExceeded {
                limit: self.limit,
                requested,
            });
        }
        self.ensure_headroom(data.len())?;
        self.inner.extend_from_slice(data);
        Ok(data.len())
    }

    /// Drops the first `n` bytes. Consuming more than [`len`](Self::len) empties the buffer.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.inner.len());
        self.inner.advance(n);
    }

    /// Discards all bytes, keeping the allocation.
    pub fn reset(&mut self) {
        self.inner.clear();
    }

    /// Discards all bytes and frees the allocation.
    pub fn release(&mut self) {
        self.inner = BytesMut::new();
    }

    /// Raw access for socket reads. Callers must ensure headroom first.
    pub(crate) fn as_bytes_mut(&mut self) -> &mut BytesMut {
        &mut self.inner
    }
}

impl Default for Buffer {
    fn default() -> Self {
        Self::new(DEFAULT_GROW_STEP)
    }
}
