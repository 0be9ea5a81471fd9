//! Buffer pooling and the [`Block`] unit of transfer.
//!
//! Every block owns a [`PooledBuffer`]. The buffer goes back to its pool when
//! the guard is dropped, so a block that is written, rejected, dropped as
//! benign, or left in a queue at shutdown releases its buffer exactly once.

use crate::session::{FileId, SessionId};
use crossbeam_channel::{Receiver, Sender, bounded};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Storage block size that aligned writes are padded to
pub const STORAGE_BLOCK_SIZE: usize = 4096;

/// Round `n` up to the next multiple of [`STORAGE_BLOCK_SIZE`]
#[must_use]
pub const fn align_up(n: usize) -> usize {
    n.div_ceil(STORAGE_BLOCK_SIZE) * STORAGE_BLOCK_SIZE
}

/// Fixed-capacity pool of equally sized byte buffers.
///
/// Buffers are allocated lazily, up to `capacity`, and recycled through a
/// bounded channel. Acquisition blocks (or times out) once every buffer is
/// outstanding, which bounds the memory a transfer can pin.
pub struct BufferPool {
    buffer_size: usize,
    capacity: usize,
    allocated: AtomicUsize,
    free_tx: Sender<Vec<u8>>,
    free_rx: Receiver<Vec<u8>>,
}

impl BufferPool {
    /// Create a pool of at most `capacity` buffers.
    ///
    /// `buffer_size` is rounded up to a multiple of [`STORAGE_BLOCK_SIZE`] so
    /// a tail block can always be padded in place.
    #[must_use]
    pub fn new(buffer_size: usize, capacity: usize) -> Arc<Self> {
        let capacity = capacity.max(1);
        let (free_tx, free_rx) = bounded(capacity);
        Arc::new(Self {
            buffer_size: align_up(buffer_size.max(1)),
            capacity,
            allocated: AtomicUsize::new(0),
            free_tx,
            free_rx,
        })
    }

    /// Size in bytes of every buffer in the pool
    #[must_use]
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Maximum number of buffers
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Take a buffer without waiting
    pub fn try_acquire(self: &Arc<Self>) -> Option<PooledBuffer> {
        if let Ok(buf) = self.free_rx.try_recv() {
            return Some(self.wrap(buf));
        }

        let mut current = self.allocated.load(Ordering::Acquire);
        while current < self.capacity {
            match self.allocated.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(self.wrap(vec![0u8; self.buffer_size])),
                Err(actual) => current = actual,
            }
        }
        None
    }

    /// Take a buffer, waiting up to `timeout` for one to be released
    pub fn acquire_timeout(self: &Arc<Self>, timeout: Duration) -> Option<PooledBuffer> {
        if let Some(buf) = self.try_acquire() {
            return Some(buf);
        }
        self.free_rx
            .recv_timeout(timeout)
            .ok()
            .map(|buf| self.wrap(buf))
    }

    /// Take a buffer, waiting as long as necessary
    pub fn acquire(self: &Arc<Self>) -> PooledBuffer {
        loop {
            if let Some(buf) = self.acquire_timeout(Duration::from_millis(250)) {
                return buf;
            }
        }
    }

    /// Buffers that can be acquired without waiting
    #[must_use]
    pub fn available(&self) -> usize {
        self.free_rx.len() + (self.capacity - self.allocated.load(Ordering::Acquire))
    }

    /// Buffers allocated so far
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    /// Buffers currently held outside the pool
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.allocated().saturating_sub(self.free_rx.len())
    }

    fn wrap(self: &Arc<Self>, buf: Vec<u8>) -> PooledBuffer {
        PooledBuffer {
            buf: Some(buf),
            pool: Arc::clone(self),
        }
    }

    fn release(&self, buf: Vec<u8>) {
        if self.free_tx.try_send(buf).is_err() {
            // More buffers came back than were handed out; forget this one.
            self.allocated.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("capacity", &self.capacity)
            .field("allocated", &self.allocated())
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// A buffer on loan from a [`BufferPool`]; returned when dropped
pub struct PooledBuffer {
    buf: Option<Vec<u8>>,
    pool: Arc<BufferPool>,
}

impl PooledBuffer {
    /// Copy `data` into the start of the buffer, returning the number of
    /// bytes copied
    pub fn fill_from(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.len());
        self[..n].copy_from_slice(&data[..n]);
        n
    }
}

impl Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.buf.as_deref().unwrap_or(&[])
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut [u8] {
        self.buf.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledBuffer")
            .field("len", &self.len())
            .finish()
    }
}

/// A chunk of file data with an explicit destination offset
pub struct Block {
    /// Owning session
    pub session_id: SessionId,
    /// Owning file unit
    pub file_id: FileId,
    /// Byte offset within the file
    pub offset: u64,
    buffer: PooledBuffer,
    len: usize,
}

impl Block {
    /// Create a block carrying the first `len` bytes of `buffer`.
    ///
    /// `len` is clamped to the buffer size.
    #[must_use]
    pub fn new(
        session_id: SessionId,
        file_id: FileId,
        offset: u64,
        buffer: PooledBuffer,
        len: usize,
    ) -> Self {
        let len = len.min(buffer.len());
        Self {
            session_id,
            file_id,
            offset,
            buffer,
            len,
        }
    }

    /// Payload bytes
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.buffer[..self.len]
    }

    /// Number of payload bytes
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if the block carries no payload
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Size of the underlying buffer
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buffer.len()
    }

    /// Offset one past the last payload byte
    #[must_use]
    pub fn end(&self) -> u64 {
        self.offset + self.len as u64
    }

    /// Payload zero-padded up to `padded_len` bytes.
    ///
    /// Returns `None` when the buffer is too small for the padding.
    pub fn padded(&mut self, padded_len: usize) -> Option<&[u8]> {
        if padded_len < self.len || padded_len > self.buffer.len() {
            return None;
        }
        self.buffer[self.len..padded_len].fill(0);
        Some(&self.buffer[..padded_len])
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Block")
            .field("session_id", &self.session_id)
            .field("file_id", &self.file_id)
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}
