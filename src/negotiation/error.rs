//! Negotiation errors.
//!
//! Session failures fall into five categories, plus the local misuse of
//! verifying too early. Everything except [`NegotiationError::Resource`]
//! ends the session; resource failures only fail the readiness toggle that
//! caused them.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::core::chunk::ChunkError;
use crate::game::catalog::CatalogError;
use crate::game::selection::{GameSelection, MatchType, SettingsError};
use crate::network::bridge::BridgeError;
use crate::network::protocol::MessageKind;

use super::state::Phase;

/// Session failure.
#[derive(Debug, Error)]
pub enum NegotiationError {
    /// The bridge or the message stream failed.
    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    /// The opponent broke the protocol.
    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolViolation),

    /// The revealed state does not match the announced commitment.
    #[error("opponent's revealed state does not match its commitment")]
    VerificationFailed,

    /// Local I/O or encoding failed while preparing the revealed state.
    #[error("resource: {0}")]
    Resource(#[from] ResourceError),

    /// The user aborted the session.
    #[error("session cancelled")]
    Cancelled,

    /// Verification was requested before both frames were complete.
    #[error("nothing to verify while {0}")]
    NotVerifying(Phase),
}

impl NegotiationError {
    /// Whether the error ends the session.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Resource(_))
    }
}

/// Transport failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The core stream ended before the protocol finished.
    #[error("core stream ended unexpectedly")]
    UnexpectedEof,

    /// Sending through the bridge failed.
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    /// A smuggled payload is not a lobby message.
    #[error("undecodable lobby message: {0}")]
    Decode(String),

    /// An outbound lobby message could not be encoded.
    #[error("unencodable lobby message: {0}")]
    Encode(String),
}

/// Opponent behavior the protocol does not allow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
    /// Message kind is not accepted in the current phase.
    #[error("{kind} not allowed while {phase}")]
    UnexpectedMessage {
        /// Phase the message arrived in.
        phase: Phase,
        /// Kind of the offending message.
        kind: MessageKind,
    },

    /// Commitment arrived before any settings.
    #[error("commit received before opponent settings")]
    CommitBeforeSettings,

    /// A chunk broke the frame geometry.
    #[error(transparent)]
    Chunk(#[from] ChunkError),

    /// Opponent settings are out of range.
    #[error("invalid opponent settings: {0}")]
    InvalidSettings(#[from] SettingsError),

    /// The verified frame does not decode to a revealed state.
    #[error("undecodable revealed state: {0}")]
    UndecodableReveal(String),

    /// The revealed save claims a size over the accepted ceiling.
    #[error("revealed save of {size} bytes exceeds {limit}")]
    OversizedSave {
        /// Claimed decompressed size.
        size: usize,
        /// Accepted ceiling.
        limit: usize,
    },

    /// The opponent committed without a selected game.
    #[error("opponent committed without selecting a game")]
    MissingOpponentGame,
}

/// Local resource failures.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// The save file could not be read.
    #[error("cannot read save {path:?}: {source}")]
    SaveUnreadable {
        /// Save file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },

    /// The save file is over the accepted ceiling.
    #[error("save of {size} bytes exceeds {limit}")]
    SaveTooLarge {
        /// Save size.
        size: usize,
        /// Accepted ceiling.
        limit: usize,
    },

    /// Serializing the revealed state failed.
    #[error("cannot encode revealed state: {0}")]
    Encode(String),

    /// The serialized revealed state does not fit a frame.
    #[error("revealed state too large: {0}")]
    CapacityExceeded(#[source] ChunkError),

    /// The background preparation task died.
    #[error("preparation task failed: {0}")]
    Task(String),

    /// No game or save is selected for launch.
    #[error("no game and save selected for launch")]
    MissingLaunchTarget,
}

/// Rejection of a local command.
#[derive(Debug, Error)]
pub enum CommandError {
    /// Readiness needs a selected game.
    #[error("no game selected")]
    NoGameSelected,

    /// Readiness needs a save file.
    #[error("no save file selected")]
    NoSavePath,

    /// Opponent settings have not arrived yet.
    #[error("opponent settings not received yet")]
    OpponentSettingsMissing,

    /// Match rules differ.
    #[error("match types differ: local {local:?}, opponent {remote:?}")]
    MatchTypeMismatch {
        /// Local match type.
        local: MatchType,
        /// Opponent match type.
        remote: MatchType,
    },

    /// The opponent does not list the local selection as playable.
    #[error("opponent cannot play against {0}")]
    GameNotAccepted(GameSelection),

    /// The opponent has not selected a game.
    #[error("opponent has not selected a game")]
    OpponentGameMissing,

    /// The local catalog cannot run the opponent's selection against the
    /// local one.
    #[error("cannot play {0} against the local selection")]
    OpponentGameUnplayable(GameSelection),

    /// Another readiness toggle is still running.
    #[error("readiness toggle already in flight")]
    ToggleInFlight,

    /// The opponent has not answered a local settings change yet.
    #[error("waiting for opponent to acknowledge settings change")]
    AwaitingAcknowledgement,

    /// Readiness can no longer be withdrawn.
    #[error("state transfer already started")]
    TransferStarted,

    /// Readiness already has the requested value.
    #[error("readiness unchanged")]
    Unchanged,

    /// Settings cannot change while ready.
    #[error("settings are locked while ready")]
    SettingsLocked,

    /// Command does not apply to the current phase.
    #[error("not allowed while {0}")]
    WrongPhase(Phase),

    /// Local settings are out of range.
    #[error(transparent)]
    InvalidSettings(#[from] SettingsError),

    /// Local selection is not in the catalog.
    #[error(transparent)]
    Catalog(#[from] CatalogError),

    /// Preparing the revealed state failed. The session continues.
    #[error("readiness toggle failed: {0}")]
    Toggle(#[source] NegotiationError),

    /// The session task is gone.
    #[error("session is not running")]
    SessionClosed,
}

impl From<ResourceError> for CommandError {
    fn from(err: ResourceError) -> Self {
        Self::Toggle(NegotiationError::Resource(err))
    }
}
