//! Chunked Transport
//!
//! The relay channel carries no length prefix of its own, so a revealed
//! state always travels as exactly [`CHUNK_COUNT`] chunks of exactly
//! [`CHUNK_SIZE`] bytes. [`ChunkArena`] is the fixed-capacity buffer both
//! directions use: the sender writes the serialized state into it and slices
//! the zero-padded frame into chunks; the receiver appends chunks in arrival
//! order until the frame is full.

use thiserror::Error;

/// Size of one chunk in bytes. Protocol constant.
pub const CHUNK_SIZE: usize = 32 * 1024;

/// Number of chunks per revealed state. Protocol constant.
pub const CHUNK_COUNT: usize = 5;

/// Total frame capacity in bytes.
pub const FRAME_CAPACITY: usize = CHUNK_SIZE * CHUNK_COUNT;

/// Errors raised by the arena.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChunkError {
    /// A write would run past the fixed capacity.
    #[error("{needed} bytes exceed frame capacity of {capacity}")]
    CapacityExceeded {
        /// Bytes the write would need in total.
        needed: usize,
        /// Fixed capacity of the arena.
        capacity: usize,
    },

    /// An inbound chunk is not exactly one chunk long.
    #[error("chunk of {got} bytes, expected {expected}")]
    WrongChunkSize {
        /// Required chunk size.
        expected: usize,
        /// Size actually received.
        got: usize,
    },

    /// More chunks arrived than a frame holds.
    #[error("chunk {index} is beyond the {count} chunks of a frame")]
    TooManyChunks {
        /// Zero-based index of the surplus chunk.
        index: usize,
        /// Chunks per frame.
        count: usize,
    },
}

/// Fixed-capacity byte arena with an explicit fill length.
///
/// Bytes past `len` are always zero, so the padded frame is well defined
/// at any point.
#[derive(Clone, PartialEq, Eq)]
pub struct ChunkArena {
    bytes: Box<[u8]>,
    len: usize,
    chunk_size: usize,
}

impl ChunkArena {
    /// Arena sized for one protocol frame.
    pub fn new() -> Self {
        Self::with_geometry(CHUNK_SIZE, CHUNK_COUNT)
    }

    /// Arena with custom geometry, used by tests of the boundary cases.
    pub fn with_geometry(chunk_size: usize, chunk_count: usize) -> Self {
        Self {
            bytes: vec![0u8; chunk_size * chunk_count].into_boxed_slice(),
            len: 0,
            chunk_size,
        }
    }

    /// Bytes written so far.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Whether nothing has been written.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fixed capacity in bytes.
    pub fn capacity(&self) -> usize {
        self.bytes.len()
    }

    /// Chunk size of this arena.
    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    /// Number of chunks in a full frame.
    pub fn chunk_count(&self) -> usize {
        self.capacity() / self.chunk_size
    }

    /// Whether every byte of the frame has been filled by chunks.
    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Number of whole chunks appended so far.
    pub fn chunks_filled(&self) -> usize {
        self.len / self.chunk_size
    }

    /// Append raw bytes, rejecting the write if it would exceed capacity.
    pub fn write(&mut self, data: &[u8]) -> Result<(), ChunkError> {
        let needed = self.len + data.len();
        if needed > self.capacity() {
            return Err(ChunkError::CapacityExceeded {
                needed,
                capacity: self.capacity(),
            });
        }
        self.bytes[self.len..needed].copy_from_slice(data);
        self.len = needed;
        Ok(())
    }

    /// Append one inbound chunk. It must be exactly one chunk long.
    pub fn push_chunk(&mut self, chunk: &[u8]) -> Result<(), ChunkError> {
        if chunk.len() != self.chunk_size {
            return Err(ChunkError::WrongChunkSize {
                expected: self.chunk_size,
                got: chunk.len(),
            });
        }
        if self.is_full() {
            return Err(ChunkError::TooManyChunks {
                index: self.chunks_filled(),
                count: self.chunk_count(),
            });
        }
        self.write(chunk)
    }

    /// All chunks of the zero-padded frame in order.
    pub fn chunks(&self) -> impl Iterator<Item = &[u8]> {
        self.bytes.chunks(self.chunk_size)
    }

    /// Bytes written so far.
    pub fn filled(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// The whole frame including zero padding.
    pub fn padded(&self) -> &[u8] {
        &self.bytes
    }

    /// Drop everything written, keeping the allocation.
    pub fn clear(&mut self) {
        self.bytes[..self.len].fill(0);
        self.len = 0;
    }
}

impl Default for ChunkArena {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ChunkArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkArena")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

/// Split `blob` into the fixed chunks of a frame.
pub fn split(blob: &[u8]) -> Result<Vec<Vec<u8>>, ChunkError> {
    let mut arena = ChunkArena::new();
    arena.write(blob)?;
    Ok(arena.chunks().map(<[u8]>::to_vec).collect())
}

/// Reassemble chunks in arrival order and cut the frame back to `len`.
pub fn reassemble<'a>(
    chunks: impl IntoIterator<Item = &'a [u8]>,
    len: usize,
) -> Result<Vec<u8>, ChunkError> {
    let mut arena = ChunkArena::new();
    for chunk in chunks {
        arena.push_chunk(chunk)?;
    }
    if len > arena.len() {
        return Err(ChunkError::CapacityExceeded {
            needed: len,
            capacity: arena.len(),
        });
    }
    Ok(arena.filled()[..len].to_vec())
}

// =============================================================================
// TESTS
// =============================================================================
