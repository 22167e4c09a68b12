//! Windowed chunk queues for relayed transfers.
//!
//! A transfer moves a file as fixed-size byte ranges ([`Chunk`]s). The
//! sending side keeps an [`UploadQueue`] of minted but unacknowledged
//! chunks; the receiving side keeps a [`DownloadQueue`] of received but not
//! yet written chunks, bounded by a byte budget.
//!
//! Queue operations never fail. Expected conditions (full, drained, out of
//! range) are reported through return values.

use std::collections::VecDeque;
use std::fmt;

/// Smallest configurable chunk size (1 KiB).
pub const MIN_CHUNK_SIZE: u64 = 1024;

/// Default chunk size (768 KiB).
pub const DEFAULT_CHUNK_SIZE: u64 = 768 * 1024;

/// Largest configurable chunk size (32 MiB).
pub const MAX_CHUNK_SIZE: u64 = 32 * 1024 * 1024;

/// Default download buffer, in chunks.
pub const BUFFER_CHUNKS: u64 = 16;

/// Default download buffer in bytes.
pub const DEFAULT_BUFFER_SIZE: u64 = DEFAULT_CHUNK_SIZE * BUFFER_CHUNKS;

/// Drift is disabled by default.
pub const DEFAULT_CHUNK_DRIFT: u64 = 0;

/// A contiguous byte range of a file in transit.
#[derive(Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Offset of the first byte within the file.
    pub offset: u64,
    /// Length of the range.
    pub size: u64,
    /// Payload. Empty for ranges minted by an [`UploadQueue`].
    pub data: Vec<u8>,
    /// Whether the peer confirmed receipt.
    pub acknowledged: bool,
}

impl Chunk {
    /// A range without payload.
    pub fn range(offset: u64, size: u64) -> Self {
        Self {
            offset,
            size,
            data: Vec::new(),
            acknowledged: false,
        }
    }

    /// A chunk carrying `data`, sized to fit it.
    pub fn with_data(offset: u64, data: Vec<u8>) -> Self {
        Self {
            offset,
            size: data.len() as u64,
            data,
            acknowledged: false,
        }
    }

    /// One past the last byte.
    pub fn end(&self) -> u64 {
        self.offset.saturating_add(self.size)
    }
}

impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chunk")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("data_len", &self.data.len())
            .field("acknowledged", &self.acknowledged)
            .finish()
    }
}

/// Sending-side window of unacknowledged chunks.
///
/// `file_offset` only moves forward as new ranges are minted and never
/// passes `file_size` (except through [`rewind`](Self::rewind), which
/// discards the window).
#[derive(Debug, Clone)]
pub struct UploadQueue {
    file_size: u64,
    file_offset: u64,
    chunk_size: u64,
    chunk_drift: u64,
    window: VecDeque<Chunk>,
}

impl UploadQueue {
    /// Create a queue for a file of `file_size` bytes.
    pub fn new(file_size: u64, chunk_size: u64) -> Self {
        Self {
            file_size,
            file_offset: 0,
            chunk_size: chunk_size.max(1),
            chunk_drift: DEFAULT_CHUNK_DRIFT,
            window: VecDeque::new(),
        }
    }

    /// Bound the spread between oldest and newest in-flight offsets.
    /// Zero disables the bound.
    pub fn with_drift(mut self, chunk_drift: u64) -> Self {
        self.chunk_drift = chunk_drift;
        self
    }

    /// Next chunk to send.
    ///
    /// Mints a new range when possible. Once the whole file is windowed, or
    /// when the window has drifted `chunk_drift` bytes ahead of its oldest
    /// entry, the oldest chunk is rotated to the back and returned again
    /// instead. Returns `None` only when everything has been acknowledged.
    pub fn next(&mut self) -> Option<Chunk> {
        if self.file_offset >= self.file_size {
            return self.rotate();
        }

        if self.chunk_drift > 0 && self.window.len() >= 2 && self.spread() >= self.chunk_drift {
            return self.rotate();
        }

        let size = self.chunk_size.min(self.file_size - self.file_offset);
        let chunk = Chunk::range(self.file_offset, size);
        self.file_offset += size;
        self.window.push_back(chunk.clone());
        Some(chunk)
    }

    fn rotate(&mut self) -> Option<Chunk> {
        let oldest = self.window.pop_front()?;
        self.window.push_back(oldest.clone());
        Some(oldest)
    }

    /// Acknowledge the chunk at `offset`, removing it from the window.
    pub fn ack(&mut self, offset: u64) -> Option<Chunk> {
        let index = self.window.iter().position(|c| c.offset == offset)?;
        let mut chunk = self.window.remove(index)?;
        chunk.acknowledged = true;
        Some(chunk)
    }

    /// Discard the window and move `file_offset` back to its oldest
    /// unacknowledged byte, so minting restarts from there.
    pub fn rewind(&mut self) {
        if let Some(oldest) = self.window.iter().map(|c| c.offset).min() {
            self.file_offset = oldest;
        }
        self.window.clear();
    }

    /// `max(offset) - min(offset)` over the window.
    pub fn spread(&self) -> u64 {
        let mut offsets = self.window.iter().map(|c| c.offset);
        let Some(first) = offsets.next() else {
            return 0;
        };
        let (min, max) = offsets.fold((first, first), |(lo, hi), o| (lo.min(o), hi.max(o)));
        max - min
    }

    /// Window drained and the whole file minted.
    pub fn is_done(&self) -> bool {
        self.window.is_empty() && self.file_offset >= self.file_size
    }

    /// Total file size.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Next offset to mint.
    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    /// Size of minted ranges.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    /// Drift bound, zero when disabled.
    pub fn chunk_drift(&self) -> u64 {
        self.chunk_drift
    }

    /// Chunks in flight.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Nothing in flight.
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}

/// Receiving-side window of chunks waiting to be written.
///
/// `buffer_used` always equals the summed size of the queued chunks.
#[derive(Debug, Clone)]
pub struct DownloadQueue {
    file_size: u64,
    file_offset: u64,
    chunk_count: u64,
    buffer_limit: u64,
    buffer_used: u64,
    window: VecDeque<Chunk>,
}

impl DownloadQueue {
    /// Create a queue for `file_size` bytes holding at most about
    /// `buffer_limit` bytes.
    pub fn new(file_size: u64, buffer_limit: u64) -> Self {
        Self {
            file_size,
            file_offset: 0,
            chunk_count: 0,
            buffer_limit,
            buffer_used: 0,
            window: VecDeque::new(),
        }
    }

    /// Queue a chunk seen for the first time.
    ///
    /// Returns `false` for a chunk reaching past the end of the file,
    /// which is never queued.
    pub fn push(&mut self, chunk: Chunk) -> bool {
        self.push_with(chunk, true)
    }

    /// Queue a chunk whose range was already counted (a re-delivery).
    pub fn push_redelivery(&mut self, chunk: Chunk) -> bool {
        self.push_with(chunk, false)
    }

    fn push_with(&mut self, chunk: Chunk, initial: bool) -> bool {
        debug_assert!(
            chunk.end() <= self.file_size,
            "chunk {}..{} past end of file ({})",
            chunk.offset,
            chunk.end(),
            self.file_size
        );
        if chunk.end() > self.file_size {
            return false;
        }

        self.buffer_used += chunk.size;
        if initial {
            self.file_offset = (self.file_offset + chunk.size).min(self.file_size);
            self.chunk_count += 1;
        }
        self.window.push_back(chunk);
        true
    }

    /// Remove the oldest chunk.
    pub fn pop(&mut self) -> Option<Chunk> {
        let chunk = self.window.pop_front()?;
        self.buffer_used -= chunk.size;
        Some(chunk)
    }

    /// Remove the first chunk matching `predicate`.
    ///
    /// Does not touch `chunk_count`, which only tracks initial pushes.
    pub fn pop_if<F>(&mut self, predicate: F) -> Option<Chunk>
    where
        F: FnMut(&Chunk) -> bool,
    {
        let index = self.window.iter().position(predicate)?;
        let chunk = self.window.remove(index)?;
        self.buffer_used -= chunk.size;
        Some(chunk)
    }

    /// Whether a chunk at `offset` is queued.
    pub fn contains(&self, offset: u64) -> bool {
        self.window.iter().any(|c| c.offset == offset)
    }

    /// Backpressure: stop requesting until the writer drains.
    pub fn is_full(&self) -> bool {
        self.buffer_used >= self.buffer_limit
    }

    /// Window drained and the whole file received.
    pub fn is_done(&self) -> bool {
        self.window.is_empty() && self.file_offset >= self.file_size
    }

    /// Drop every queued chunk and move `file_offset` back to the oldest
    /// discarded byte.
    pub fn clear(&mut self) {
        if let Some(oldest) = self.window.iter().map(|c| c.offset).min() {
            self.file_offset = self.file_offset.min(oldest);
        }
        self.window.clear();
        self.buffer_used = 0;
    }

    /// Chunks received for the first time.
    pub fn chunk_count(&self) -> u64 {
        self.chunk_count
    }

    /// Bytes currently queued.
    pub fn buffer_used(&self) -> u64 {
        self.buffer_used
    }

    /// Byte budget.
    pub fn buffer_limit(&self) -> u64 {
        self.buffer_limit
    }

    /// Change the byte budget.
    pub fn set_buffer_limit(&mut self, buffer_limit: u64) {
        self.buffer_limit = buffer_limit;
    }

    /// Bytes received for the first time.
    pub fn file_offset(&self) -> u64 {
        self.file_offset
    }

    /// Total file size.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Chunks queued.
    pub fn len(&self) -> usize {
        self.window.len()
    }

    /// Nothing queued.
    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }
}

/// The chunk window a transfer owns, by direction.
#[derive(Debug, Clone)]
pub enum Window {
    /// Outgoing transfer.
    Upload(UploadQueue),
    /// Incoming transfer.
    Download(DownloadQueue),
}

impl Window {
    /// Discard in-flight chunks.
    pub fn clear(&mut self) {
        match self {
            Window::Upload(queue) => queue.rewind(),
            Window::Download(queue) => queue.clear(),
        }
    }

    /// Whether the window has moved the whole file.
    pub fn is_done(&self) -> bool {
        match self {
            Window::Upload(queue) => queue.is_done(),
            Window::Download(queue) => queue.is_done(),
        }
    }

    /// Chunks in flight.
    pub fn len(&self) -> usize {
        match self {
            Window::Upload(queue) => queue.len(),
            Window::Download(queue) => queue.len(),
        }
    }

    /// Nothing in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
