//! Commitment Scheme
//!
//! Binds a peer to its revealed state before the opponent's is visible.
//! A commitment is SHA-256 over a fixed domain separator followed by the
//! committed bytes, so digests from this protocol never collide with
//! digests the same hash produces for unrelated purposes.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Domain separator for revealed-state commitments.
const COMMITMENT_DOMAIN: &[u8] = b"NETBATTLE_STATE_COMMIT_V1:";

/// Digest length in bytes. Protocol constant.
pub const COMMITMENT_LEN: usize = 32;

/// A binding digest of a revealed state.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Commitment([u8; COMMITMENT_LEN]);

impl Commitment {
    /// Wrap raw digest bytes received from a peer.
    pub const fn from_bytes(bytes: [u8; COMMITMENT_LEN]) -> Self {
        Self(bytes)
    }

    /// Raw digest bytes.
    pub const fn as_bytes(&self) -> &[u8; COMMITMENT_LEN] {
        &self.0
    }

    /// Short hex prefix for log lines.
    pub fn short_hex(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Debug for Commitment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Commitment({})", hex::encode(self.0))
    }
}

/// Commit to an opaque blob.
pub fn commit(blob: &[u8]) -> Commitment {
    let mut hasher = Sha256::new();
    hasher.update(COMMITMENT_DOMAIN);
    hasher.update(blob);
    Commitment(hasher.finalize().into())
}

/// Check that `blob` is the preimage of `commitment`.
///
/// The comparison touches every byte regardless of where the first
/// difference is.
pub fn verify(commitment: &Commitment, blob: &[u8]) -> bool {
    constant_time_eq(commit(blob).as_bytes(), commitment.as_bytes())
}

fn constant_time_eq(a: &[u8; COMMITMENT_LEN], b: &[u8; COMMITMENT_LEN]) -> bool {
    let diff = a
        .iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y));
    std::hint::black_box(diff) == 0
}

// =============================================================================
// TESTS
// =============================================================================
