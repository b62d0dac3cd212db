//! Negotiation State Machine
//!
//! Sans-IO core of a lobby session. The [`Negotiator`] consumes core state
//! indications, lobby messages and local commands, and returns the lobby
//! messages to send in response. It never blocks and owns no channels; the
//! session task feeds it and performs the I/O.
//!
//! ## Phases
//!
//! ```text
//! Idle -> AwaitingCoreStart -> ExchangingSettings -> BothCommitted
//!      -> Transferring -> Verifying -> Complete
//! ```
//!
//! Any non-terminal phase may drop to `Aborted`. An opponent `Uncommit`
//! during transfer drops back to `ExchangingSettings` with the local
//! commitment kept.
//!
//! ## Transfer
//!
//! Chunks move in lockstep: chunk `k` goes out once `k` chunks have come
//! in, so chunk 0 is sent as soon as both sides are committed. The frame is
//! verified once both directions are complete.
//!
//! Every `Commit` starts a fresh chunk stream from its sender. The receiver
//! discards what it buffered of the previous stream, and the sender restarts
//! at chunk 0. A stream survives the opponent's `Uncommit`, since the
//! local frame has not changed.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::core::chunk::{ChunkArena, CHUNK_COUNT};
use crate::core::commitment::{verify, Commitment};
use crate::core::seed::{derive_seed, SharedSeed};
use crate::game::catalog::Catalog;
use crate::game::selection::{GameSelection, MatchSettings};
use crate::network::protocol::{CoreState, LobbyMessage, MessageKind};

use super::error::{CommandError, NegotiationError, ProtocolViolation, ResourceError};
use super::reveal::{RevealedState, SealedReveal};

// =============================================================================
// PHASES
// =============================================================================

/// Negotiation phase.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// No session.
    #[default]
    Idle,
    /// Waiting for the core to link both peers.
    AwaitingCoreStart,
    /// Settings and readiness are being exchanged.
    ExchangingSettings,
    /// Both sides committed; chunk 0 sent or about to be.
    BothCommitted,
    /// Chunks are flowing in both directions.
    Transferring,
    /// All chunks exchanged; the opponent's frame awaits verification.
    Verifying,
    /// Agreement reached, or solo launch ready.
    Complete,
    /// Session torn down.
    Aborted,
}

impl Phase {
    /// Whether the phase ends the negotiation.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Complete | Self::Aborted)
    }

    /// Transition table: whether a lobby message of `kind` may arrive now.
    pub fn accepts(self, kind: MessageKind) -> bool {
        match self {
            Self::ExchangingSettings => true,
            Self::BothCommitted | Self::Transferring => kind != MessageKind::SetSettings,
            Self::Idle
            | Self::AwaitingCoreStart
            | Self::Verifying
            | Self::Complete
            | Self::Aborted => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Idle => "idle",
            Self::AwaitingCoreStart => "awaiting_core_start",
            Self::ExchangingSettings => "exchanging_settings",
            Self::BothCommitted => "both_committed",
            Self::Transferring => "transferring",
            Self::Verifying => "verifying",
            Self::Complete => "complete",
            Self::Aborted => "aborted",
        })
    }
}

// =============================================================================
// PEER VIEWS
// =============================================================================

/// Which side of the negotiation a view describes.
pub trait Side {
    /// What this side is bound to once ready.
    type Pledge;
}

/// The local peer, bound to its full revealed state.
#[derive(Debug)]
pub struct Own;

/// The opposing peer, known only by its commitment until the reveal.
#[derive(Debug)]
pub struct Opponent;

impl Side for Own {
    type Pledge = SealedReveal;
}

impl Side for Opponent {
    type Pledge = Commitment;
}

/// One side's settings and readiness.
pub struct PeerView<S: Side> {
    /// Latest proposed settings.
    pub settings: MatchSettings,
    /// Present while the side is ready.
    pub pledge: Option<S::Pledge>,
}

impl<S: Side> PeerView<S> {
    fn new(settings: MatchSettings) -> Self {
        Self {
            settings,
            pledge: None,
        }
    }

    /// Whether the side is committed.
    pub fn is_ready(&self) -> bool {
        self.pledge.is_some()
    }
}

impl<S: Side> fmt::Debug for PeerView<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerView")
            .field("settings", &self.settings)
            .field("ready", &self.is_ready())
            .finish()
    }
}

// =============================================================================
// OUTPUTS
// =============================================================================

/// Result of a verified exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Agreement {
    /// Local selection.
    pub local_game: GameSelection,
    /// Local save file.
    pub save_path: PathBuf,
    /// Local settings at commit time.
    pub local_settings: MatchSettings,
    /// Opponent settings at commit time.
    pub opponent_settings: MatchSettings,
    /// Opponent selection.
    pub opponent_game: GameSelection,
    /// XOR of both nonces.
    pub shared_seed: SharedSeed,
    /// Decompressed opponent save.
    pub opponent_save: Vec<u8>,
}

/// Observable view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionSnapshot {
    /// Negotiation phase.
    pub phase: Phase,
    /// Last core state indication.
    pub core_state: CoreState,
    /// Local settings.
    pub own_settings: MatchSettings,
    /// Local readiness.
    pub own_ready: bool,
    /// Local commitment, while ready.
    pub own_commitment: Option<Commitment>,
    /// Opponent settings, once received.
    pub opponent_settings: Option<MatchSettings>,
    /// Whether the opponent's commitment is held.
    pub opponent_committed: bool,
    /// A readiness toggle is running.
    pub toggle_in_flight: bool,
    /// Waiting for the opponent to answer a settings change.
    pub awaiting_ack: bool,
    /// Whether flipping readiness would be accepted now.
    pub can_toggle_ready: bool,
    /// Chunks sent.
    pub chunks_sent: usize,
    /// Chunks received.
    pub chunks_received: usize,
}

impl SessionSnapshot {
    /// Serialize to JSON string.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// =============================================================================
// NEGOTIATOR
// =============================================================================

/// Sans-IO negotiation state.
#[derive(Debug)]
pub struct Negotiator {
    phase: Phase,
    core_state: CoreState,
    solo: bool,
    own: PeerView<Own>,
    opponent: Option<PeerView<Opponent>>,
    save_path: Option<PathBuf>,
    catalog: Arc<Catalog>,
    toggle_in_flight: bool,
    awaiting_ack: bool,
    chunks_sent: usize,
    inbound: ChunkArena,
}

impl Negotiator {
    /// Fresh negotiator holding the local proposal. `catalog` decides which
    /// opponent selections this side can run.
    pub fn new(settings: MatchSettings, save_path: Option<PathBuf>, catalog: Arc<Catalog>) -> Self {
        Self {
            phase: Phase::Idle,
            core_state: CoreState::Unknown,
            solo: false,
            own: PeerView::new(settings),
            opponent: None,
            save_path,
            catalog,
            toggle_in_flight: false,
            awaiting_ack: false,
            chunks_sent: 0,
            inbound: ChunkArena::new(),
        }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Whether this session skips negotiation.
    pub fn is_solo(&self) -> bool {
        self.solo
    }

    /// Local view.
    pub fn own(&self) -> &PeerView<Own> {
        &self.own
    }

    /// Opponent view, once its settings arrived.
    pub fn opponent(&self) -> Option<&PeerView<Opponent>> {
        self.opponent.as_ref()
    }

    /// Begin waiting for the core. Returns `false` unless idle.
    pub fn start(&mut self, solo: bool) -> bool {
        if self.phase != Phase::Idle {
            return false;
        }
        self.solo = solo;
        self.phase = Phase::AwaitingCoreStart;
        true
    }

    /// Record a core state indication. `Starting` opens the lobby.
    pub fn on_core_state(&mut self, state: CoreState) -> Vec<LobbyMessage> {
        self.core_state = state;
        if state != CoreState::Starting || self.phase != Phase::AwaitingCoreStart {
            return Vec::new();
        }

        if self.solo {
            info!("core linked, solo launch");
            self.phase = Phase::Complete;
            return Vec::new();
        }

        info!("core linked, exchanging settings");
        self.phase = Phase::ExchangingSettings;
        vec![LobbyMessage::SetSettings(self.own.settings.clone())]
    }

    /// Local game and save to launch with.
    pub fn launch_target(&self) -> Result<(GameSelection, PathBuf), ResourceError> {
        match (&self.own.settings.game, &self.save_path) {
            (Some(game), Some(path)) => Ok((game.clone(), path.clone())),
            _ => Err(ResourceError::MissingLaunchTarget),
        }
    }

    // -------------------------------------------------------------------------
    // Local commands
    // -------------------------------------------------------------------------

    fn ensure_unlocked(&self) -> Result<(), CommandError> {
        if self.phase != Phase::ExchangingSettings {
            return Err(CommandError::WrongPhase(self.phase));
        }
        if self.own.is_ready() || self.toggle_in_flight {
            return Err(CommandError::SettingsLocked);
        }
        Ok(())
    }

    /// Replace local settings. Returns the broadcast.
    pub fn change_local_settings(
        &mut self,
        settings: MatchSettings,
    ) -> Result<LobbyMessage, CommandError> {
        self.ensure_unlocked()?;
        settings.validate()?;

        self.own.settings = settings;
        if let Some(opponent) = self.opponent.as_mut() {
            if opponent.pledge.take().is_some() {
                debug!("settings changed, awaiting opponent acknowledgement");
                self.awaiting_ack = true;
                self.inbound.clear();
            }
        }
        Ok(LobbyMessage::SetSettings(self.own.settings.clone()))
    }

    /// Choose the save file. Not transmitted.
    pub fn select_save(&mut self, path: Option<PathBuf>) -> Result<(), CommandError> {
        self.ensure_unlocked()?;
        self.save_path = path;
        Ok(())
    }

    fn check_compatible(&self) -> Result<(), CommandError> {
        let game = self
            .own
            .settings
            .game
            .as_ref()
            .ok_or(CommandError::NoGameSelected)?;
        let opponent = self
            .opponent
            .as_ref()
            .ok_or(CommandError::OpponentSettingsMissing)?;

        if opponent.settings.match_type != self.own.settings.match_type {
            return Err(CommandError::MatchTypeMismatch {
                local: self.own.settings.match_type,
                remote: opponent.settings.match_type,
            });
        }
        if !opponent.settings.accepts(game) {
            return Err(CommandError::GameNotAccepted(game.clone()));
        }
        let opponent_game = opponent
            .settings
            .game
            .as_ref()
            .ok_or(CommandError::OpponentGameMissing)?;
        if !self.catalog.are_compatible(game, opponent_game)? {
            return Err(CommandError::OpponentGameUnplayable(opponent_game.clone()));
        }
        Ok(())
    }

    fn check_ready(&self) -> Result<(), CommandError> {
        if self.own.settings.game.is_none() {
            return Err(CommandError::NoGameSelected);
        }
        if self.save_path.is_none() {
            return Err(CommandError::NoSavePath);
        }
        if self.opponent.is_none() {
            return Err(CommandError::OpponentSettingsMissing);
        }
        if self.awaiting_ack {
            return Err(CommandError::AwaitingAcknowledgement);
        }
        self.check_compatible()
    }

    /// Whether readiness may be set to `ready` now.
    pub fn readiness_gate(&self, ready: bool) -> Result<(), CommandError> {
        match self.phase {
            Phase::ExchangingSettings => {}
            Phase::BothCommitted | Phase::Transferring | Phase::Verifying if !ready => {
                return Err(CommandError::TransferStarted)
            }
            phase => return Err(CommandError::WrongPhase(phase)),
        }
        if self.toggle_in_flight {
            return Err(CommandError::ToggleInFlight);
        }
        if ready == self.own.is_ready() {
            return Err(CommandError::Unchanged);
        }
        if ready {
            self.check_ready()
        } else {
            Ok(())
        }
    }

    /// Start a ready toggle. Returns the save to read.
    pub fn begin_ready(&mut self) -> Result<PathBuf, CommandError> {
        self.readiness_gate(true)?;
        let (_, path) = self.launch_target()?;
        self.toggle_in_flight = true;
        Ok(path)
    }

    /// Finish a ready toggle with the prepared reveal.
    ///
    /// Preconditions are checked again, since the opponent may have changed
    /// its settings while the save was being read.
    pub fn complete_ready(
        &mut self,
        prepared: Result<SealedReveal, ResourceError>,
    ) -> Result<Vec<LobbyMessage>, CommandError> {
        self.toggle_in_flight = false;
        if self.phase != Phase::ExchangingSettings {
            return Err(CommandError::WrongPhase(self.phase));
        }
        let sealed = prepared?;
        self.check_ready()?;

        info!(commitment = %sealed.commitment.short_hex(), "ready");
        let commitment = sealed.commitment;
        self.own.pledge = Some(sealed);
        self.chunks_sent = 0;

        let mut out = vec![LobbyMessage::Commit { commitment }];
        self.maybe_begin_transfer(&mut out);
        Ok(out)
    }

    /// Withdraw readiness.
    pub fn unready(&mut self) -> Result<Vec<LobbyMessage>, CommandError> {
        self.readiness_gate(false)?;
        self.own.pledge = None;
        info!("no longer ready");
        Ok(vec![LobbyMessage::Uncommit])
    }

    // -------------------------------------------------------------------------
    // Inbound messages
    // -------------------------------------------------------------------------

    /// Apply a lobby message from the opponent.
    pub fn on_message(&mut self, msg: LobbyMessage) -> Result<Vec<LobbyMessage>, NegotiationError> {
        let kind = msg.kind();
        if !self.phase.accepts(kind) {
            return Err(ProtocolViolation::UnexpectedMessage {
                phase: self.phase,
                kind,
            }
            .into());
        }

        let mut out = Vec::new();
        match msg {
            LobbyMessage::SetSettings(settings) => {
                settings
                    .validate()
                    .map_err(ProtocolViolation::InvalidSettings)?;
                debug!(opponent = %settings.display_name, "opponent settings");
                self.awaiting_ack = false;
                self.opponent = Some(PeerView::new(settings));
                self.inbound.clear();
                self.reaffirm(&mut out);
            }
            LobbyMessage::Commit { commitment } => {
                let opponent = self
                    .opponent
                    .as_mut()
                    .ok_or(ProtocolViolation::CommitBeforeSettings)?;
                if self.phase != Phase::ExchangingSettings {
                    // Only a re-announcement of the held commitment can
                    // cross our own entry into transfer.
                    if opponent.pledge != Some(commitment) {
                        return Err(ProtocolViolation::UnexpectedMessage {
                            phase: self.phase,
                            kind,
                        }
                        .into());
                    }
                    debug!("opponent re-announced its commitment, stream restarts");
                    self.inbound.clear();
                    self.phase = Phase::BothCommitted;
                    return Ok(out);
                }
                debug!(commitment = %commitment.short_hex(), "opponent committed");
                opponent.pledge = Some(commitment);
                self.inbound.clear();
                self.awaiting_ack = false;
                self.maybe_begin_transfer(&mut out);
            }
            LobbyMessage::Uncommit => {
                if let Some(opponent) = self.opponent.as_mut() {
                    opponent.pledge = None;
                }
                self.inbound.clear();
                self.awaiting_ack = false;
                if self.phase == Phase::ExchangingSettings {
                    debug!("opponent uncommitted");
                } else {
                    info!(sent = self.chunks_sent, "opponent withdrew, transfer rolled back");
                    self.phase = Phase::ExchangingSettings;
                }
            }
            LobbyMessage::Chunk { bytes } => {
                if !self.opponent.as_ref().is_some_and(PeerView::is_ready) {
                    // Sent before our settings change reached the opponent.
                    debug!("dropping chunk of a withdrawn stream");
                    return Ok(out);
                }
                self.inbound
                    .push_chunk(&bytes)
                    .map_err(ProtocolViolation::Chunk)?;
                #[cfg(feature = "debug-tracing")]
                tracing::trace!(
                    received = self.inbound.chunks_filled(),
                    sent = self.chunks_sent,
                    "chunk in"
                );
                if self.phase == Phase::ExchangingSettings {
                    debug!("holding chunk until ready");
                } else {
                    self.phase = Phase::Transferring;
                    self.pump(&mut out);
                }
            }
        }
        Ok(out)
    }

    /// Answer new opponent settings while committed: re-announce the same
    /// commitment if still compatible, otherwise withdraw.
    fn reaffirm(&mut self, out: &mut Vec<LobbyMessage>) {
        let Some(commitment) = self.own.pledge.as_ref().map(|s| s.commitment) else {
            return;
        };
        match self.check_compatible() {
            Ok(()) => {
                self.chunks_sent = 0;
                out.push(LobbyMessage::Commit { commitment });
            }
            Err(reason) => {
                warn!(%reason, "opponent settings no longer compatible, withdrawing");
                self.own.pledge = None;
                out.push(LobbyMessage::Uncommit);
            }
        }
    }

    fn maybe_begin_transfer(&mut self, out: &mut Vec<LobbyMessage>) {
        let opponent_ready = self.opponent.as_ref().is_some_and(PeerView::is_ready);
        if !(self.own.is_ready() && opponent_ready) {
            return;
        }
        info!(
            sent = self.chunks_sent,
            received = self.inbound.chunks_filled(),
            "both committed, transferring state"
        );
        self.phase = Phase::BothCommitted;
        self.pump(out);
    }

    /// Send every chunk the lockstep allows.
    fn pump(&mut self, out: &mut Vec<LobbyMessage>) {
        let Some(sealed) = self.own.pledge.as_ref() else {
            return;
        };
        let received = self.inbound.chunks_filled();
        for chunk in sealed.frame.chunks().skip(self.chunks_sent) {
            if received < self.chunks_sent {
                break;
            }
            out.push(LobbyMessage::Chunk {
                bytes: chunk.to_vec(),
            });
            self.chunks_sent += 1;
        }
        if self.chunks_sent == CHUNK_COUNT && self.inbound.is_full() {
            debug!("all chunks exchanged");
            self.phase = Phase::Verifying;
        }
    }

    // -------------------------------------------------------------------------
    // Verification
    // -------------------------------------------------------------------------

    /// Check the opponent's frame against its commitment and derive the seed.
    pub fn verify(&mut self) -> Result<Agreement, NegotiationError> {
        if self.phase != Phase::Verifying {
            return Err(NegotiationError::NotVerifying(self.phase));
        }
        let result = self.try_verify();
        match &result {
            Ok(agreement) => {
                info!(seed = %agreement.shared_seed, "state verified");
                self.phase = Phase::Complete;
            }
            Err(err) => {
                warn!(%err, "verification failed");
                self.abort();
            }
        }
        result
    }

    fn try_verify(&self) -> Result<Agreement, NegotiationError> {
        let (sealed, opponent, commitment) = match (&self.own.pledge, &self.opponent) {
            (Some(sealed), Some(opponent)) => match opponent.pledge {
                Some(commitment) => (sealed, opponent, commitment),
                None => return Err(NegotiationError::VerificationFailed),
            },
            _ => return Err(NegotiationError::VerificationFailed),
        };

        if !verify(&commitment, self.inbound.padded()) {
            return Err(NegotiationError::VerificationFailed);
        }

        let revealed = RevealedState::open(&self.inbound)?;
        let opponent_save = revealed.decompress_save()?;
        let opponent_game = opponent
            .settings
            .game
            .clone()
            .ok_or(ProtocolViolation::MissingOpponentGame)?;
        let (local_game, save_path) = self.launch_target()?;

        Ok(Agreement {
            local_game,
            save_path,
            local_settings: self.own.settings.clone(),
            opponent_settings: opponent.settings.clone(),
            opponent_game,
            shared_seed: derive_seed(&sealed.state.nonce, &revealed.nonce),
            opponent_save,
        })
    }

    /// Discard everything. Safe from any phase.
    pub fn abort(&mut self) {
        if self.phase != Phase::Aborted {
            info!(phase = %self.phase, "negotiation aborted");
        }
        self.phase = Phase::Aborted;
        self.own.pledge = None;
        self.opponent = None;
        self.toggle_in_flight = false;
        self.awaiting_ack = false;
        self.chunks_sent = 0;
        self.inbound.clear();
    }

    /// Observable state.
    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            phase: self.phase,
            core_state: self.core_state,
            own_settings: self.own.settings.clone(),
            own_ready: self.own.is_ready(),
            own_commitment: self.own.pledge.as_ref().map(|s| s.commitment),
            opponent_settings: self.opponent.as_ref().map(|o| o.settings.clone()),
            opponent_committed: self.opponent.as_ref().is_some_and(PeerView::is_ready),
            toggle_in_flight: self.toggle_in_flight,
            awaiting_ack: self.awaiting_ack,
            can_toggle_ready: self.readiness_gate(!self.own.is_ready()).is_ok(),
            chunks_sent: self.chunks_sent,
            chunks_received: self.inbound.chunks_filled(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================
