//! Protocol primitives.
//!
//! Pure building blocks of the fair exchange: commitments, the fixed-size
//! chunk frame, and seed derivation. Nothing here performs I/O.

pub mod chunk;
pub mod commitment;
pub mod seed;

// Re-export core types
pub use chunk::{ChunkArena, ChunkError, CHUNK_COUNT, CHUNK_SIZE, FRAME_CAPACITY};
pub use commitment::{commit, verify, Commitment, COMMITMENT_LEN};
pub use seed::{derive_seed, generate_nonce, Nonce, SharedSeed, NONCE_LEN};
