//! # Netbattle Lobby
//!
//! Commit-reveal match negotiation for paired emulator netplay.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     NETBATTLE LOBBY                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  core/            - Protocol primitives (no I/O)             │
//! │  ├── commitment.rs- Domain-separated SHA-256 commitments     │
//! │  ├── chunk.rs     - Fixed-capacity chunk frame               │
//! │  └── seed.rs      - Nonces and shared seed derivation        │
//! │                                                              │
//! │  game/            - What peers propose                       │
//! │  ├── selection.rs - Game selection, match settings           │
//! │  └── catalog.rs   - Netplay compatibility resolver           │
//! │                                                              │
//! │  network/         - Wire and core process plumbing           │
//! │  ├── protocol.rs  - Lobby and core messages                  │
//! │  ├── bridge.rs    - Core process bridge                      │
//! │  └── loopback.rs  - Two cores back to back, for tests/demo   │
//! │                                                              │
//! │  negotiation/     - The lobby protocol                       │
//! │  ├── state.rs     - Sans-IO state machine                    │
//! │  ├── reveal.rs    - Revealed state sealing                   │
//! │  ├── session.rs   - Session task, handle, lobby              │
//! │  └── error.rs     - Error categories                         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Fairness Guarantee
//!
//! Neither peer learns the other's save or nonce before binding itself to
//! its own:
//! - Readiness commits to the whole padded frame before any chunk is sent
//! - Chunks flow only after both commitments are held
//! - The seed is derived only after the remote frame verifies
//!
//! A relay that alters a single byte of a chunk makes verification fail,
//! and the match is never launched.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod core;
pub mod game;
pub mod negotiation;
pub mod network;

// Re-export commonly used types
pub use crate::core::chunk::{CHUNK_COUNT, CHUNK_SIZE};
pub use crate::core::commitment::Commitment;
pub use crate::core::seed::SharedSeed;
pub use game::{Catalog, GameSelection, MatchSettings, MatchType, PairingCode};
pub use negotiation::{
    spawn_session, Lobby, MatchRequest, NegotiationError, SessionConfig, SessionHandle,
    SessionOutcome, SessionSnapshot,
};
pub use network::{channel_bridge, CoreBridge};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Lobby protocol version
pub const PROTOCOL_VERSION: u32 = 1;
