//! Revealed State
//!
//! What a peer binds itself to when it becomes ready: a fresh nonce and its
//! compressed save. Sealing writes the bincode encoding into a frame arena
//! and commits to the whole zero-padded frame, so the commitment covers
//! exactly the bytes that travel as chunks.

use std::fmt;

use bincode::Options;
use lz4_flex::{compress_prepend_size, decompress_size_prepended};
use serde::{Deserialize, Serialize};

use crate::core::chunk::{ChunkArena, FRAME_CAPACITY};
use crate::core::commitment::{commit, Commitment};
use crate::core::seed::{generate_nonce, Nonce};

use super::error::{ProtocolViolation, ResourceError};

/// Largest save accepted in either direction, before compression.
pub const MAX_SAVE_SIZE: usize = 1024 * 1024;

/// Bytes of the little-endian size prefix on a compressed save.
const SIZE_PREFIX_LEN: usize = 4;

/// A peer's committed contribution.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevealedState {
    /// Contribution to the shared seed.
    pub nonce: Nonce,
    /// Size-prepended LZ4 block of the save.
    pub save_blob: Vec<u8>,
}

/// A revealed state ready to commit and transmit.
#[derive(Debug, Clone)]
pub struct SealedReveal {
    /// The state itself.
    pub state: RevealedState,
    /// Serialized state, zero-padded to a full frame.
    pub frame: ChunkArena,
    /// Commitment over the padded frame.
    pub commitment: Commitment,
}

fn frame_codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_limit(FRAME_CAPACITY as u64)
        .allow_trailing_bytes()
}

impl RevealedState {
    /// Compress `save` under a fresh nonce.
    pub fn from_save(save: &[u8]) -> Result<Self, ResourceError> {
        Self::with_nonce(generate_nonce(), save)
    }

    /// Compress `save` under the given nonce.
    pub fn with_nonce(nonce: Nonce, save: &[u8]) -> Result<Self, ResourceError> {
        if save.len() > MAX_SAVE_SIZE {
            return Err(ResourceError::SaveTooLarge {
                size: save.len(),
                limit: MAX_SAVE_SIZE,
            });
        }
        Ok(Self {
            nonce,
            save_blob: compress_prepend_size(save),
        })
    }

    /// Serialize into a frame and commit to it.
    pub fn seal(self) -> Result<SealedReveal, ResourceError> {
        let bytes = frame_codec()
            .serialize(&self)
            .map_err(|e| ResourceError::Encode(e.to_string()))?;

        let mut frame = ChunkArena::new();
        frame
            .write(&bytes)
            .map_err(ResourceError::CapacityExceeded)?;
        let commitment = commit(frame.padded());

        Ok(SealedReveal {
            state: self,
            frame,
            commitment,
        })
    }

    /// Decode a received frame. Zero padding after the encoding is ignored.
    pub fn open(frame: &ChunkArena) -> Result<Self, ProtocolViolation> {
        frame_codec()
            .deserialize(frame.padded())
            .map_err(|e| ProtocolViolation::UndecodableReveal(e.to_string()))
    }

    /// Decompress the save, refusing claimed sizes over [`MAX_SAVE_SIZE`].
    pub fn decompress_save(&self) -> Result<Vec<u8>, ProtocolViolation> {
        let prefix: [u8; SIZE_PREFIX_LEN] = self
            .save_blob
            .get(..SIZE_PREFIX_LEN)
            .and_then(|p| p.try_into().ok())
            .ok_or_else(|| ProtocolViolation::UndecodableReveal("save blob too short".into()))?;

        let size = u32::from_le_bytes(prefix) as usize;
        if size > MAX_SAVE_SIZE {
            return Err(ProtocolViolation::OversizedSave {
                size,
                limit: MAX_SAVE_SIZE,
            });
        }

        decompress_size_prepended(&self.save_blob)
            .map_err(|e| ProtocolViolation::UndecodableReveal(e.to_string()))
    }
}

impl fmt::Debug for RevealedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RevealedState")
            .field("nonce", &hex::encode(self.nonce))
            .field("save_blob_len", &self.save_blob.len())
            .finish()
    }
}
