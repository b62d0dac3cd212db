//! Shared Seed Derivation
//!
//! Both peers contribute a committed 16-byte nonce; the match seed is their
//! byte-wise XOR. Because each nonce is bound by a commitment before either
//! is revealed, neither side can pick its nonce as a function of the other's.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

/// Nonce length in bytes.
pub const NONCE_LEN: usize = 16;

/// A peer's random contribution to the shared seed.
pub type Nonce = [u8; NONCE_LEN];

/// Draw a fresh nonce from the operating system CSPRNG.
pub fn generate_nonce() -> Nonce {
    let mut nonce = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

/// Seed shared by both sides of a negotiated match.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SharedSeed([u8; NONCE_LEN]);

impl SharedSeed {
    /// Raw seed bytes.
    pub const fn as_bytes(&self) -> &[u8; NONCE_LEN] {
        &self.0
    }
}

impl fmt::Debug for SharedSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SharedSeed({})", hex::encode(self.0))
    }
}

impl fmt::Display for SharedSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

/// Combine the local and remote nonces into the shared seed.
pub fn derive_seed(local: &Nonce, remote: &Nonce) -> SharedSeed {
    let mut seed = *local;
    for (s, r) in seed.iter_mut().zip(remote.iter()) {
        *s ^= r;
    }
    SharedSeed(seed)
}

// =============================================================================
// TESTS
// =============================================================================
