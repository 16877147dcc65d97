//! # Audio Buffers
//!
//! Two byte-level buffers used by the processor, one per pipeline mode.
//!
//! ## Key Features:
//! - **RingBuffer**: fixed-capacity FIFO shared by the write path and the drain
//!   task. Writes either land completely or wait for space; reads only hand out
//!   complete frames.
//! - **ChunkAccumulator**: single-owner buffer that slices an arbitrary byte
//!   stream into fixed-size frames, keeping the remainder for the next call.
//!
//! Both work on raw bytes; sample alignment is the caller's job (every size
//! used with them is validated to be a multiple of two).

use parking_lot::Mutex;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::Notify;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum BufferError {
    /// Not enough free space to take the whole write right now
    #[error("ring buffer has insufficient free space")]
    WouldBlock,

    /// `close_writer` was called, no further data is accepted
    #[error("ring buffer writer is closed")]
    WriterClosed,
}

struct RingState {
    data: VecDeque<u8>,
    writer_closed: bool,
}

/// Bounded single-producer/single-consumer byte FIFO.
///
/// ## Thread Safety:
/// The state sits behind a `parking_lot::Mutex` that is never held across an
/// `.await`. Blocked writers park on a `Notify` that readers, `reset` and
/// `close_writer` wake.
///
/// ## Rust Concepts:
/// - **Notify**: async wake-up primitive; `enable()` registers interest before
///   the state is checked so a wake-up between check and await is never lost
pub struct RingBuffer {
    state: Mutex<RingState>,
    space_available: Notify,
    capacity: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(RingState {
                data: VecDeque::with_capacity(capacity),
                writer_closed: false,
            }),
            space_available: Notify::new(),
            capacity,
        }
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.state.lock().data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_writer_closed(&self) -> bool {
        self.state.lock().writer_closed
    }

    /// Write all of `data` or nothing.
    ///
    /// ## Returns:
    /// - `Ok(n)` with `n == data.len()` when the bytes were appended
    /// - `Err(WouldBlock)` when free space is short; the buffer is unchanged
    /// - `Err(WriterClosed)` after `close_writer`
    pub fn try_write(&self, data: &[u8]) -> Result<usize, BufferError> {
        let mut state = self.state.lock();
        if state.writer_closed {
            return Err(BufferError::WriterClosed);
        }
        if self.capacity - state.data.len() < data.len() {
            return Err(BufferError::WouldBlock);
        }
        state.data.extend(data);
        Ok(data.len())
    }

    /// Write `data`, waiting for the reader to free space as needed.
    ///
    /// Bytes are appended as space becomes available. If the writer is closed
    /// while waiting the call returns early with the count written so far, so a
    /// short count means "released by shutdown".
    pub async fn write(&self, data: &[u8]) -> usize {
        let mut written = 0;

        while written < data.len() {
            let notified = self.space_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut state = self.state.lock();
                if state.writer_closed {
                    break;
                }
                let free = self.capacity - state.data.len();
                let n = free.min(data.len() - written);
                state.data.extend(&data[written..written + n]);
                written += n;
            }

            if written < data.len() {
                notified.await;
            }
        }

        written
    }

    /// Remove exactly `n` bytes, or nothing if fewer are buffered.
    pub fn read_exact(&self, n: usize) -> Option<Vec<u8>> {
        let frame = {
            let mut state = self.state.lock();
            if n == 0 || state.data.len() < n {
                return None;
            }
            state.data.drain(..n).collect::<Vec<u8>>()
        };
        self.space_available.notify_waiters();
        Some(frame)
    }

    /// Stop accepting writes and release every blocked writer.
    pub fn close_writer(&self) {
        self.state.lock().writer_closed = true;
        self.space_available.notify_waiters();
    }

    /// Drop all buffered bytes. A closed writer stays closed.
    pub fn reset(&self) {
        self.state.lock().data.clear();
        self.space_available.notify_waiters();
    }
}

/// Slices a byte stream into `chunk_size` frames.
///
/// ## Example:
/// With `chunk_size = 512`, pushing 700 bytes yields one frame and keeps 188;
/// pushing 400 more yields a second frame and keeps 76.
#[derive(Debug)]
pub struct ChunkAccumulator {
    pending: Vec<u8>,
    chunk_size: usize,
}

impl ChunkAccumulator {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            pending: Vec::with_capacity(chunk_size * 2),
            chunk_size,
        }
    }

    /// Append `data` and return every complete frame now available, oldest first.
    pub fn push(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(data);

        if self.chunk_size == 0 || self.pending.len() < self.chunk_size {
            return Vec::new();
        }

        let complete = self.pending.len() / self.chunk_size * self.chunk_size;
        let frames = self
            .pending
            .chunks_exact(self.chunk_size)
            .map(<[u8]>::to_vec)
            .collect();
        self.pending.drain(..complete);
        frames
    }

    /// Bytes waiting for the next frame boundary.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
