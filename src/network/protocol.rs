//! Protocol Messages
//!
//! Two layers travel over the core process bridge:
//!
//! - Lobby messages, exchanged with the opposing peer. They are opaque to
//!   the core and the relay, which carry them as smuggled payloads.
//! - Core messages, exchanged with the local match process: start/stop
//!   requests, state indications, and the smuggled payloads themselves.
//!
//! Lobby messages are bincode encoded. Variants are externally tagged,
//! which bincode supports, so exactly one payload kind is populated per
//! envelope.

use std::fmt;
use std::path::PathBuf;

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::core::chunk::CHUNK_SIZE;
use crate::core::commitment::Commitment;
use crate::core::seed::SharedSeed;
use crate::game::selection::{GameSelection, MatchSettings, MatchType};

/// Upper bound for one encoded lobby message.
pub const MAX_MESSAGE_SIZE: u64 = (CHUNK_SIZE as u64) * 2;

// =============================================================================
// PEER <-> PEER (SMUGGLED)
// =============================================================================

/// Messages exchanged with the opposing peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LobbyMessage {
    /// Full replacement of the sender's proposed settings.
    SetSettings(MatchSettings),

    /// Sender is ready and bound to the revealed state with this digest.
    Commit {
        /// Digest of the sender's revealed state.
        commitment: Commitment,
    },

    /// Sender withdrew readiness.
    Uncommit,

    /// One fixed-size piece of the sender's revealed state.
    Chunk {
        /// Chunk bytes.
        bytes: Vec<u8>,
    },
}

/// Payload kind of a lobby message, used by the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    /// [`LobbyMessage::SetSettings`].
    SetSettings,
    /// [`LobbyMessage::Commit`].
    Commit,
    /// [`LobbyMessage::Uncommit`].
    Uncommit,
    /// [`LobbyMessage::Chunk`].
    Chunk,
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SetSettings => "set_settings",
            Self::Commit => "commit",
            Self::Uncommit => "uncommit",
            Self::Chunk => "chunk",
        })
    }
}

impl LobbyMessage {
    /// Payload kind.
    pub fn kind(&self) -> MessageKind {
        match self {
            Self::SetSettings(_) => MessageKind::SetSettings,
            Self::Commit { .. } => MessageKind::Commit,
            Self::Uncommit => MessageKind::Uncommit,
            Self::Chunk { .. } => MessageKind::Chunk,
        }
    }

    fn codec() -> impl Options {
        bincode::DefaultOptions::new()
            .with_fixint_encoding()
            .with_limit(MAX_MESSAGE_SIZE)
            .reject_trailing_bytes()
    }

    /// Serialize to binary.
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        Self::codec().serialize(self)
    }

    /// Deserialize from binary.
    pub fn from_bytes(data: &[u8]) -> Result<Self, bincode::Error> {
        Self::codec().deserialize(data)
    }
}

// =============================================================================
// LOCAL <-> CORE PROCESS
// =============================================================================

/// Lifecycle state reported by the core process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreState {
    /// Nothing reported yet.
    #[default]
    Unknown,
    /// Connecting to the relay.
    Connecting,
    /// Connected, waiting for the opponent.
    Waiting,
    /// Both peers linked; the lobby protocol may begin.
    Starting,
    /// Match is running.
    Running,
}

/// Settings for a negotiated match start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NegotiatedStart {
    /// Opponent's selection, which the core emulates for the remote side.
    pub opponent_game: GameSelection,
    /// Shared RNG seed.
    pub shared_seed: SharedSeed,
    /// Decompressed remote save.
    pub opponent_save: Vec<u8>,
    /// Local input delay.
    pub input_delay: u32,
    /// Agreed match rules.
    pub match_type: MatchType,
    /// Opponent's display name.
    pub opponent_name: String,
}

/// Request to start the match process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartRequest {
    /// Local selection.
    pub game: GameSelection,
    /// Local save file.
    pub save_path: PathBuf,
    /// Window title for the match.
    pub window_title: String,
    /// Present for negotiated matches, absent for solo play.
    pub negotiated: Option<NegotiatedStart>,
}

/// Messages sent to the core process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ToCore {
    /// Relay this payload to the opposing peer.
    Smuggle(Vec<u8>),
    /// Start the match.
    Start(StartRequest),
    /// Terminate the match process.
    Stop,
}

/// Messages received from the core process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FromCore {
    /// Lifecycle update.
    StateIndication(CoreState),
    /// Payload relayed from the opposing peer.
    Smuggled(Vec<u8>),
}

impl FromCore {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
