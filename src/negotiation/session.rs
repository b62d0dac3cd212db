//! Session Driver
//!
//! One tokio task per lobby session. The task owns the [`Negotiator`] and
//! the core bridge, and is the only thing that mutates negotiation state.
//! Local commands arrive over an mpsc channel with oneshot replies;
//! observers follow [`SessionSnapshot`]s on a watch channel.
//!
//! Save reading and sealing run as a spawned sub-task so lobby messages keep
//! flowing while a readiness toggle is prepared.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, info, info_span, instrument, warn, Instrument};
use uuid::Uuid;

use crate::game::catalog::Catalog;
use crate::game::selection::{GameSelection, MatchSettings, MatchType, PairingCode};
use crate::network::bridge::CoreBridge;
use crate::network::protocol::{
    CoreState, FromCore, LobbyMessage, NegotiatedStart, StartRequest, ToCore,
};

use super::error::{CommandError, NegotiationError, ResourceError, TransportError};
use super::reveal::{RevealedState, SealedReveal};
use super::state::{Agreement, Negotiator, Phase, SessionSnapshot};

// =============================================================================
// CONFIGURATION
// =============================================================================

/// Local defaults applied to every session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Name shown to opponents.
    pub display_name: String,
    /// Input delay in frames.
    pub input_delay: u32,
    /// Preferred match rules.
    pub match_type: MatchType,
    /// Capacity of the local command channel.
    pub command_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            display_name: "player".to_string(),
            input_delay: 3,
            match_type: MatchType::Triple,
            command_buffer: 16,
        }
    }
}

impl SessionConfig {
    /// Load from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            display_name: std::env::var("NETBATTLE_NICKNAME").unwrap_or(defaults.display_name),
            input_delay: std::env::var("NETBATTLE_INPUT_DELAY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.input_delay),
            match_type: std::env::var("NETBATTLE_MATCH_TYPE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.match_type),
            command_buffer: std::env::var("NETBATTLE_COMMAND_BUFFER")
                .ok()
                .and_then(|v| v.parse().ok())
                .filter(|&n: &usize| n > 0)
                .unwrap_or(defaults.command_buffer),
        }
    }

    /// Initial settings proposed for `game`.
    pub fn match_settings(&self, game: Option<GameSelection>) -> MatchSettings {
        let mut settings = MatchSettings::new(self.display_name.clone());
        settings.input_delay = self.input_delay;
        settings.match_type = self.match_type;
        settings.game = game;
        settings
    }
}

/// What the user asked to play.
#[derive(Debug, Clone, Default)]
pub struct MatchRequest {
    /// Raw pairing code. Empty after normalization means solo play.
    pub pairing_code: String,
    /// Local selection.
    pub game: Option<GameSelection>,
    /// Local save file.
    pub save_path: Option<PathBuf>,
}

// =============================================================================
// OUTCOME
// =============================================================================

/// Parameters the match was launched with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchParams {
    /// Request sent to the core.
    pub start: StartRequest,
    /// Last state the core reported before its stream ended.
    pub final_core_state: CoreState,
}

/// How a session ended successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Negotiated match launched.
    Launched(LaunchParams),
    /// Solo match launched without negotiation.
    Solo(LaunchParams),
}

impl SessionOutcome {
    /// Launch parameters.
    pub fn params(&self) -> &LaunchParams {
        match self {
            Self::Launched(params) | Self::Solo(params) => params,
        }
    }
}

// =============================================================================
// HANDLE
// =============================================================================

type Reply<T> = oneshot::Sender<Result<T, CommandError>>;

/// Commands accepted by a running session.
#[derive(Debug)]
pub enum LocalCommand {
    /// Replace local settings; available games are filled from the catalog.
    UpdateSettings {
        /// New settings.
        settings: MatchSettings,
        /// Completion.
        reply: Reply<()>,
    },
    /// Choose the save file.
    SelectSave {
        /// Save path, or none.
        path: Option<PathBuf>,
        /// Completion.
        reply: Reply<()>,
    },
    /// Toggle readiness.
    SetReady {
        /// Desired readiness.
        ready: bool,
        /// Completion, sent once the toggle has finished.
        reply: Reply<()>,
    },
}

/// Handle to a running session.
#[derive(Debug)]
pub struct SessionHandle {
    id: Uuid,
    commands: mpsc::Sender<LocalCommand>,
    snapshots: watch::Receiver<SessionSnapshot>,
    cancel: watch::Sender<bool>,
    task: JoinHandle<Result<SessionOutcome, NegotiationError>>,
}

impl SessionHandle {
    /// Session identifier.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Latest snapshot.
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    /// Follow snapshots.
    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.clone()
    }

    /// Whether the session task has ended.
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(Reply<T>) -> LocalCommand,
    ) -> Result<T, CommandError> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(make(tx))
            .await
            .map_err(|_| CommandError::SessionClosed)?;
        rx.await.map_err(|_| CommandError::SessionClosed)?
    }

    /// Replace local settings.
    pub async fn update_settings(&self, settings: MatchSettings) -> Result<(), CommandError> {
        self.request(|reply| LocalCommand::UpdateSettings { settings, reply })
            .await
    }

    /// Choose the save file.
    pub async fn select_save(&self, path: Option<PathBuf>) -> Result<(), CommandError> {
        self.request(|reply| LocalCommand::SelectSave { path, reply })
            .await
    }

    /// Toggle readiness. Resolves once the toggle has finished.
    pub async fn set_ready(&self, ready: bool) -> Result<(), CommandError> {
        self.request(|reply| LocalCommand::SetReady { ready, reply })
            .await
    }

    /// Ask the session to abort.
    pub fn abort(&self) {
        // Only fails if the task already exited.
        let _ = self.cancel.send(true);
    }

    /// Wait for the session to end.
    pub async fn join(self) -> Result<SessionOutcome, NegotiationError> {
        let Self { task, cancel, .. } = self;
        let result = task.await;
        drop(cancel);
        result.unwrap_or_else(|e| {
            warn!(error = %e, "session task did not finish");
            Err(NegotiationError::Cancelled)
        })
    }
}

/// Start a session task for `request`, talking to the core over `bridge`.
pub fn spawn_session<B>(
    config: &SessionConfig,
    catalog: Arc<Catalog>,
    request: MatchRequest,
    bridge: B,
) -> Result<SessionHandle, CommandError>
where
    B: CoreBridge + 'static,
{
    let mut settings = config.match_settings(request.game);
    settings.validate()?;
    if let Some(game) = &settings.game {
        settings.available_games = catalog.available_games(game)?;
    }

    let code = PairingCode::parse(&request.pairing_code);
    let solo = code.is_none();
    if solo {
        if settings.game.is_none() {
            return Err(CommandError::NoGameSelected);
        }
        if request.save_path.is_none() {
            return Err(CommandError::NoSavePath);
        }
    }

    let mut negotiator = Negotiator::new(settings, request.save_path, Arc::clone(&catalog));
    negotiator.start(solo);

    let id = Uuid::new_v4();
    let (command_tx, command_rx) = mpsc::channel(config.command_buffer);
    let (snapshot_tx, snapshot_rx) = watch::channel(negotiator.snapshot());
    let (cancel_tx, cancel_rx) = watch::channel(false);

    let driver = Driver {
        negotiator,
        bridge,
        catalog,
        snapshots: snapshot_tx,
        pending: None,
    };
    let span = info_span!(
        "session",
        %id,
        code = code.as_ref().map(PairingCode::as_str).unwrap_or("solo")
    );
    let task = tokio::spawn(driver.run(command_rx, cancel_rx).instrument(span));

    Ok(SessionHandle {
        id,
        commands: command_tx,
        snapshots: snapshot_rx,
        cancel: cancel_tx,
        task,
    })
}

// =============================================================================
// DRIVER
// =============================================================================

struct PendingToggle {
    task: JoinHandle<Result<SealedReveal, ResourceError>>,
    reply: Reply<()>,
}

enum Event {
    Cancelled,
    Core(Option<FromCore>),
    Command(LocalCommand),
    Toggle(Result<Result<SealedReveal, ResourceError>, JoinError>),
}

struct Driver<B> {
    negotiator: Negotiator,
    bridge: B,
    catalog: Arc<Catalog>,
    snapshots: watch::Sender<SessionSnapshot>,
    pending: Option<PendingToggle>,
}

async fn wait_toggle(
    pending: &mut Option<PendingToggle>,
) -> Result<Result<SealedReveal, ResourceError>, JoinError> {
    match pending {
        Some(toggle) => (&mut toggle.task).await,
        None => std::future::pending().await,
    }
}

#[instrument(skip_all, fields(path = %path.display()))]
async fn prepare_reveal(path: PathBuf) -> Result<SealedReveal, ResourceError> {
    let save = tokio::fs::read(&path)
        .await
        .map_err(|source| ResourceError::SaveUnreadable { path, source })?;
    tokio::task::spawn_blocking(move || RevealedState::from_save(&save)?.seal())
        .await
        .map_err(|e| ResourceError::Task(e.to_string()))?
}

impl<B: CoreBridge> Driver<B> {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<LocalCommand>,
        mut cancel: watch::Receiver<bool>,
    ) -> Result<SessionOutcome, NegotiationError> {
        let start = match self.negotiate(&mut commands, &mut cancel).await {
            Ok(start) => start,
            Err(err) => {
                self.fail(&err);
                return Err(err);
            }
        };
        let solo = start.negotiated.is_none();

        if let Err(err) = self.send(ToCore::Start(start.clone())).await {
            self.fail(&err);
            return Err(err);
        }
        info!(game = %start.game, solo, "match launched");

        let final_core_state = match self.monitor(&mut cancel).await {
            Ok(state) => state,
            Err(err) => {
                self.fail(&err);
                return Err(err);
            }
        };

        let params = LaunchParams {
            start,
            final_core_state,
        };
        Ok(if solo {
            SessionOutcome::Solo(params)
        } else {
            SessionOutcome::Launched(params)
        })
    }

    /// Run the lobby until a start request can be built.
    async fn negotiate(
        &mut self,
        commands: &mut mpsc::Receiver<LocalCommand>,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<StartRequest, NegotiationError> {
        loop {
            match self.negotiator.phase() {
                Phase::Verifying => {
                    let agreement = self.negotiator.verify()?;
                    self.publish();
                    return Ok(negotiated_start(agreement));
                }
                Phase::Complete if self.negotiator.is_solo() => {
                    let (game, save_path) = self.negotiator.launch_target()?;
                    return Ok(StartRequest {
                        window_title: game.to_string(),
                        game,
                        save_path,
                        negotiated: None,
                    });
                }
                _ => {}
            }

            // Local commands go ahead of core traffic so a busy peer cannot
            // starve them.
            let event = tokio::select! {
                biased;
                _ = cancel.changed() => Event::Cancelled,
                Some(cmd) = commands.recv() => Event::Command(cmd),
                joined = wait_toggle(&mut self.pending) => Event::Toggle(joined),
                msg = self.bridge.receive() => Event::Core(msg),
            };

            match event {
                Event::Cancelled => return Err(NegotiationError::Cancelled),
                Event::Core(None) => return Err(TransportError::UnexpectedEof.into()),
                Event::Core(Some(FromCore::StateIndication(state))) => {
                    debug!(?state, "core state");
                    let out = self.negotiator.on_core_state(state);
                    self.send_all(out).await?;
                }
                Event::Core(Some(FromCore::Smuggled(payload))) => {
                    let msg = LobbyMessage::from_bytes(&payload)
                        .map_err(|e| TransportError::Decode(e.to_string()))?;
                    let out = self.negotiator.on_message(msg)?;
                    self.send_all(out).await?;
                }
                Event::Command(cmd) => self.handle_command(cmd).await?,
                Event::Toggle(joined) => self.finish_toggle(joined).await?,
            }
            self.publish();
        }
    }

    /// Forward core status after launch until the core stream ends.
    async fn monitor(
        &mut self,
        cancel: &mut watch::Receiver<bool>,
    ) -> Result<CoreState, NegotiationError> {
        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.changed() => Event::Cancelled,
                msg = self.bridge.receive() => Event::Core(msg),
            };
            match event {
                Event::Core(Some(FromCore::StateIndication(state))) => {
                    debug!(?state, "core state");
                    self.negotiator.on_core_state(state);
                    self.publish();
                }
                Event::Core(Some(FromCore::Smuggled(_))) => {
                    debug!("ignoring payload after launch");
                }
                Event::Core(None) => {
                    info!("core exited");
                    return Ok(self.negotiator.snapshot().core_state);
                }
                _ => return Err(NegotiationError::Cancelled),
            }
        }
    }

    async fn handle_command(&mut self, cmd: LocalCommand) -> Result<(), NegotiationError> {
        match cmd {
            LocalCommand::UpdateSettings { settings, reply } => {
                match self.apply_settings(settings) {
                    Ok(msg) => {
                        self.send_all(vec![msg]).await?;
                        self.publish();
                        let _ = reply.send(Ok(()));
                    }
                    Err(e) => {
                        let _ = reply.send(Err(e));
                    }
                }
            }
            LocalCommand::SelectSave { path, reply } => {
                let result = self.negotiator.select_save(path);
                self.publish();
                let _ = reply.send(result);
            }
            LocalCommand::SetReady { ready: true, reply } => match self.negotiator.begin_ready() {
                Ok(path) => {
                    debug!(?path, "preparing revealed state");
                    self.pending = Some(PendingToggle {
                        task: tokio::spawn(prepare_reveal(path)),
                        reply,
                    });
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
            LocalCommand::SetReady { ready: false, reply } => match self.negotiator.unready() {
                Ok(out) => {
                    self.send_all(out).await?;
                    self.publish();
                    let _ = reply.send(Ok(()));
                }
                Err(e) => {
                    let _ = reply.send(Err(e));
                }
            },
        }
        Ok(())
    }

    fn apply_settings(&mut self, mut settings: MatchSettings) -> Result<LobbyMessage, CommandError> {
        settings.available_games = match &settings.game {
            Some(game) => self.catalog.available_games(game)?,
            None => Vec::new(),
        };
        self.negotiator.change_local_settings(settings)
    }

    async fn finish_toggle(
        &mut self,
        joined: Result<Result<SealedReveal, ResourceError>, JoinError>,
    ) -> Result<(), NegotiationError> {
        let Some(PendingToggle { reply, .. }) = self.pending.take() else {
            return Ok(());
        };
        let prepared = joined.unwrap_or_else(|e| Err(ResourceError::Task(e.to_string())));
        match self.negotiator.complete_ready(prepared) {
            Ok(out) => {
                self.send_all(out).await?;
                self.publish();
                let _ = reply.send(Ok(()));
            }
            Err(e) => {
                warn!(error = %e, "readiness toggle failed");
                self.publish();
                let _ = reply.send(Err(e));
            }
        }
        Ok(())
    }

    async fn send(&mut self, msg: ToCore) -> Result<(), NegotiationError> {
        self.bridge
            .send(msg)
            .await
            .map_err(|e| TransportError::Bridge(e).into())
    }

    async fn send_all(&mut self, msgs: Vec<LobbyMessage>) -> Result<(), NegotiationError> {
        for msg in msgs {
            let bytes = msg
                .to_bytes()
                .map_err(|e| TransportError::Encode(e.to_string()))?;
            self.send(ToCore::Smuggle(bytes)).await?;
        }
        Ok(())
    }

    fn publish(&self) {
        self.snapshots.send_replace(self.negotiator.snapshot());
    }

    /// Tear down after a fatal error or abort.
    fn fail(&mut self, err: &NegotiationError) {
        warn!(error = %err, "session ended");
        if let Some(toggle) = self.pending.take() {
            toggle.task.abort();
            let _ = toggle.reply.send(Err(CommandError::SessionClosed));
        }
        self.negotiator.abort();
        self.bridge.cancel();
        self.publish();
    }
}

fn negotiated_start(agreement: Agreement) -> StartRequest {
    let Agreement {
        local_game,
        save_path,
        local_settings,
        opponent_settings,
        opponent_game,
        shared_seed,
        opponent_save,
    } = agreement;

    StartRequest {
        window_title: format!(
            "{} vs {}",
            local_settings.display_name, opponent_settings.display_name
        ),
        game: local_game,
        save_path,
        negotiated: Some(NegotiatedStart {
            opponent_game,
            shared_seed,
            opponent_save,
            input_delay: local_settings.input_delay,
            match_type: local_settings.match_type,
            opponent_name: opponent_settings.display_name,
        }),
    }
}

// =============================================================================
// LOBBY
// =============================================================================

/// Owner of at most one session at a time.
#[derive(Debug)]
pub struct Lobby {
    config: SessionConfig,
    catalog: Arc<Catalog>,
    session: Option<SessionHandle>,
}

impl Lobby {
    /// Idle lobby.
    pub fn new(config: SessionConfig, catalog: Arc<Catalog>) -> Self {
        Self {
            config,
            catalog,
            session: None,
        }
    }

    /// Session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Whether no session is running.
    pub fn is_idle(&self) -> bool {
        self.session.as_ref().map_or(true, SessionHandle::is_finished)
    }

    /// Current session, if any.
    pub fn session(&self) -> Option<&SessionHandle> {
        self.session.as_ref()
    }

    /// Start a session. Returns `false` without side effects if one is
    /// already running.
    pub fn start<B>(&mut self, request: MatchRequest, bridge: B) -> Result<bool, CommandError>
    where
        B: CoreBridge + 'static,
    {
        if !self.is_idle() {
            debug!("session already running, start ignored");
            return Ok(false);
        }
        let handle = spawn_session(&self.config, Arc::clone(&self.catalog), request, bridge)?;
        info!(id = %handle.id(), "session started");
        self.session = Some(handle);
        Ok(true)
    }

    /// Abort the current session and return to idle.
    pub fn abort(&mut self) {
        if let Some(session) = self.session.take() {
            info!(id = %session.id(), "aborting session");
            session.abort();
        }
    }

    /// Wait for the current session to end and return to idle.
    pub async fn finish(&mut self) -> Option<Result<SessionOutcome, NegotiationError>> {
        let session = self.session.take()?;
        Some(session.join().await)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tempfile::TempDir;

    use crate::network::bridge::channel_bridge;
    use crate::network::loopback::{spawn_loopback, RelayOptions, RelaySide};

    const TIMEOUT: Duration = Duration::from_secs(10);

    fn falzar() -> GameSelection {
        GameSelection::rom("MEGAMAN6_FXX")
    }

    fn gregar() -> GameSelection {
        GameSelection::rom("MEGAMAN6_GXX")
    }

    fn catalog() -> Arc<Catalog> {
        Arc::new(
            Catalog::new()
                .with_rom("MEGAMAN6_FXX", "Mega Man Battle Network 6 Falzar", "bn6")
                .with_rom("MEGAMAN6_GXX", "Mega Man Battle Network 6 Gregar", "bn6")
                .with_rom("MEGAMAN5_TP_BR5E", "Mega Man Battle Network 5 Protoman", "bn5"),
        )
    }

    fn config(name: &str) -> SessionConfig {
        SessionConfig {
            display_name: name.into(),
            ..SessionConfig::default()
        }
    }

    fn write_save(dir: &TempDir, name: &str, fill: u8, len: usize) -> (PathBuf, Vec<u8>) {
        let bytes: Vec<u8> = (0..len).map(|i| fill.wrapping_add((i / 512) as u8)).collect();
        let path = dir.path().join(name);
        std::fs::write(&path, &bytes).unwrap();
        (path, bytes)
    }

    async fn wait_until(handle: &SessionHandle, pred: impl FnMut(&SessionSnapshot) -> bool) {
        let mut rx = handle.subscribe();
        tokio::time::timeout(TIMEOUT, rx.wait_for(pred))
            .await
            .expect("timed out waiting for snapshot")
            .expect("session ended");
    }

    struct Pair {
        alice: SessionHandle,
        bob: SessionHandle,
        relay: JoinHandle<crate::network::loopback::RelayReport>,
        alice_save: Vec<u8>,
        bob_save: Vec<u8>,
        _dir: TempDir,
    }

    fn spawn_pair(bob_game: GameSelection, options: RelayOptions) -> Pair {
        let dir = TempDir::new().unwrap();
        let (alice_path, alice_save) = write_save(&dir, "alice.sav", 1, 64 * 1024);
        let (bob_path, bob_save) = write_save(&dir, "bob.sav", 9, 96 * 1024);

        let (alice_bridge, alice_core) = channel_bridge(64);
        let (bob_bridge, bob_core) = channel_bridge(64);
        let relay = spawn_loopback(alice_core, bob_core, options);

        let alice = spawn_session(
            &config("alice"),
            catalog(),
            MatchRequest {
                pairing_code: "Table-7".into(),
                game: Some(falzar()),
                save_path: Some(alice_path),
            },
            alice_bridge,
        )
        .unwrap();
        let bob = spawn_session(
            &config("bob"),
            catalog(),
            MatchRequest {
                pairing_code: "table7".into(),
                game: Some(bob_game),
                save_path: Some(bob_path),
            },
            bob_bridge,
        )
        .unwrap();

        Pair {
            alice,
            bob,
            relay,
            alice_save,
            bob_save,
            _dir: dir,
        }
    }

    async fn both_see_opponent(pair: &Pair) {
        wait_until(&pair.alice, |s| s.opponent_settings.is_some()).await;
        wait_until(&pair.bob, |s| s.opponent_settings.is_some()).await;
    }

    #[test]
    fn test_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.input_delay, 3);
        assert_eq!(config.match_type, MatchType::Triple);
        let settings = config.match_settings(Some(falzar()));
        assert_eq!(settings.display_name, "player");
        assert!(settings.validate().is_ok());
    }

    #[tokio::test]
    async fn test_negotiated_match_launches_both_sides() {
        // Scenario A
        let pair = spawn_pair(gregar(), RelayOptions::default());
        both_see_opponent(&pair).await;

        pair.alice.set_ready(true).await.unwrap();
        pair.bob.set_ready(true).await.unwrap();

        let Pair {
            alice,
            bob,
            relay,
            alice_save,
            bob_save,
            _dir,
        } = pair;
        let alice = tokio::time::timeout(TIMEOUT, alice.join()).await.unwrap().unwrap();
        let bob = tokio::time::timeout(TIMEOUT, bob.join()).await.unwrap().unwrap();

        let (SessionOutcome::Launched(a), SessionOutcome::Launched(b)) = (&alice, &bob) else {
            panic!("expected negotiated launches: {alice:?} {bob:?}");
        };
        assert_eq!(a.final_core_state, CoreState::Running);

        let a_start = a.start.negotiated.as_ref().unwrap();
        let b_start = b.start.negotiated.as_ref().unwrap();
        assert_eq!(a_start.shared_seed, b_start.shared_seed);
        assert_eq!(a_start.opponent_save, bob_save);
        assert_eq!(b_start.opponent_save, alice_save);
        assert_eq!(a_start.opponent_game, gregar());
        assert_eq!(b_start.opponent_game, falzar());
        assert_eq!(a_start.opponent_name, "bob");
        assert_eq!(a.start.window_title, "alice vs bob");

        let report = relay.await.unwrap();
        assert_eq!(report.starts.len(), 2);
    }

    #[tokio::test]
    async fn test_incompatible_games_block_readiness() {
        let pair = spawn_pair(GameSelection::rom("MEGAMAN5_TP_BR5E"), RelayOptions::default());
        both_see_opponent(&pair).await;

        assert!(matches!(
            pair.alice.set_ready(true).await,
            Err(CommandError::GameNotAccepted(_))
        ));
        assert!(!pair.alice.snapshot().can_toggle_ready);
    }

    #[tokio::test]
    async fn test_match_type_mismatch_blocks_readiness() {
        let pair = spawn_pair(gregar(), RelayOptions::default());
        both_see_opponent(&pair).await;

        let mut single = pair.alice.snapshot().own_settings;
        single.match_type = MatchType::Single;
        pair.alice.update_settings(single).await.unwrap();
        wait_until(&pair.bob, |s| {
            s.opponent_settings
                .as_ref()
                .is_some_and(|o| o.match_type == MatchType::Single)
        })
        .await;

        assert!(matches!(
            pair.bob.set_ready(true).await,
            Err(CommandError::MatchTypeMismatch { .. })
        ));
        assert!(matches!(
            pair.alice.set_ready(true).await,
            Err(CommandError::MatchTypeMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_tampered_chunk_aborts_without_launch() {
        // Scenario C
        let mut flipped = false;
        let options = RelayOptions {
            tamper: Some(Box::new(move |side: RelaySide, payload: &mut Vec<u8>| {
                if side != RelaySide::A || flipped {
                    return;
                }
                if let Ok(LobbyMessage::Chunk { mut bytes }) = LobbyMessage::from_bytes(payload) {
                    bytes[100] ^= 0x80;
                    if let Ok(encoded) = (LobbyMessage::Chunk { bytes }).to_bytes() {
                        *payload = encoded;
                        flipped = true;
                    }
                }
            })),
        };
        let pair = spawn_pair(gregar(), options);
        both_see_opponent(&pair).await;

        pair.alice.set_ready(true).await.unwrap();
        pair.bob.set_ready(true).await.unwrap();

        let Pair { alice, bob, relay, .. } = pair;
        let bob = tokio::time::timeout(TIMEOUT, bob.join()).await.unwrap();
        assert!(matches!(bob, Err(NegotiationError::VerificationFailed)));

        // Alice may or may not launch depending on timing; Bob never does.
        let _ = tokio::time::timeout(TIMEOUT, alice.join()).await.unwrap();
        let report = relay.await.unwrap();
        assert!(report.starts.iter().all(|(side, _)| *side != RelaySide::B));
    }

    #[tokio::test]
    async fn test_unready_then_ready_again() {
        let pair = spawn_pair(gregar(), RelayOptions::default());
        both_see_opponent(&pair).await;

        pair.alice.set_ready(true).await.unwrap();
        wait_until(&pair.bob, |s| s.opponent_committed).await;
        assert!(matches!(
            pair.alice.set_ready(true).await,
            Err(CommandError::Unchanged)
        ));

        pair.alice.set_ready(false).await.unwrap();
        wait_until(&pair.bob, |s| !s.opponent_committed).await;
        assert!(!pair.alice.snapshot().own_ready);

        pair.alice.set_ready(true).await.unwrap();
        wait_until(&pair.bob, |s| s.opponent_committed).await;
    }

    #[tokio::test]
    async fn test_withdrawn_commit_defers_transfer() {
        // Scenario B
        let pair = spawn_pair(gregar(), RelayOptions::default());
        both_see_opponent(&pair).await;

        pair.bob.set_ready(true).await.unwrap();
        wait_until(&pair.alice, |s| s.opponent_committed).await;
        pair.bob.set_ready(false).await.unwrap();
        wait_until(&pair.alice, |s| !s.opponent_committed).await;

        pair.alice.set_ready(true).await.unwrap();
        wait_until(&pair.bob, |s| s.opponent_committed).await;

        let alice = pair.alice.snapshot();
        assert_eq!(alice.phase, Phase::ExchangingSettings);
        assert!(alice.own_ready);
        assert!(!alice.opponent_committed);
        assert_eq!(alice.chunks_sent, 0);
        let bob = pair.bob.snapshot();
        assert_eq!(bob.phase, Phase::ExchangingSettings);
        assert_eq!((bob.chunks_sent, bob.chunks_received), (0, 0));

        pair.bob.set_ready(true).await.unwrap();
        let Pair {
            alice,
            bob,
            alice_save,
            bob_save,
            ..
        } = pair;
        let alice = tokio::time::timeout(TIMEOUT, alice.join()).await.unwrap().unwrap();
        let bob = tokio::time::timeout(TIMEOUT, bob.join()).await.unwrap().unwrap();
        let (SessionOutcome::Launched(a), SessionOutcome::Launched(b)) = (&alice, &bob) else {
            panic!("expected negotiated launches: {alice:?} {bob:?}");
        };
        let a_start = a.start.negotiated.as_ref().unwrap();
        let b_start = b.start.negotiated.as_ref().unwrap();
        assert_eq!(a_start.shared_seed, b_start.shared_seed);
        assert_eq!(a_start.opponent_save, bob_save);
        assert_eq!(b_start.opponent_save, alice_save);
    }

    #[tokio::test]
    async fn test_commands_served_ahead_of_queued_core_traffic() {
        let (bridge, core) = channel_bridge(64);
        for state in [CoreState::Connecting, CoreState::Waiting, CoreState::Starting] {
            core.events.indicate(state).await.unwrap();
        }
        for _ in 0..32 {
            core.events.indicate(CoreState::Waiting).await.unwrap();
        }

        let handle = spawn_session(
            &config("alice"),
            catalog(),
            MatchRequest {
                pairing_code: "busy".into(),
                game: Some(falzar()),
                save_path: None,
            },
            bridge,
        )
        .unwrap();

        // The session task has not run yet; the queued core traffic,
        // including `Starting`, is still waiting behind this command.
        assert!(matches!(
            handle.select_save(None).await,
            Err(CommandError::WrongPhase(Phase::AwaitingCoreStart))
        ));
        wait_until(&handle, |s| s.phase == Phase::ExchangingSettings).await;
    }

    #[tokio::test]
    async fn test_unreadable_save_fails_toggle_only() {
        let pair = spawn_pair(gregar(), RelayOptions::default());
        both_see_opponent(&pair).await;

        pair.alice
            .select_save(Some(PathBuf::from("/nonexistent/alice.sav")))
            .await
            .unwrap();
        let err = pair.alice.set_ready(true).await.unwrap_err();
        assert!(matches!(
            err,
            CommandError::Toggle(NegotiationError::Resource(ResourceError::SaveUnreadable { .. }))
        ));

        let snapshot = pair.alice.snapshot();
        assert_eq!(snapshot.phase, Phase::ExchangingSettings);
        assert!(!snapshot.own_ready);
        assert!(!snapshot.toggle_in_flight);
    }

    #[tokio::test]
    async fn test_abort_cancels_session() {
        let pair = spawn_pair(gregar(), RelayOptions::default());
        both_see_opponent(&pair).await;

        pair.alice.abort();
        let Pair { alice, bob, .. } = pair;
        let result = tokio::time::timeout(TIMEOUT, alice.join()).await.unwrap();
        assert!(matches!(result, Err(NegotiationError::Cancelled)));

        // The relay ends Bob's stream once Alice's core stops.
        let result = tokio::time::timeout(TIMEOUT, bob.join()).await.unwrap();
        assert!(matches!(
            result,
            Err(NegotiationError::Transport(TransportError::UnexpectedEof))
        ));
    }

    #[tokio::test]
    async fn test_solo_start_skips_negotiation() {
        let dir = TempDir::new().unwrap();
        let (path, _) = write_save(&dir, "solo.sav", 0, 1024);
        let (bridge, core) = channel_bridge(8);
        let (idle_bridge, idle_core) = channel_bridge(8);
        let relay = spawn_loopback(core, idle_core, RelayOptions::default());

        let handle = spawn_session(
            &config("alice"),
            catalog(),
            MatchRequest {
                pairing_code: " -- ".into(),
                game: Some(falzar()),
                save_path: Some(path.clone()),
            },
            bridge,
        )
        .unwrap();

        let outcome = tokio::time::timeout(TIMEOUT, handle.join()).await.unwrap().unwrap();
        let SessionOutcome::Solo(params) = outcome else {
            panic!("expected solo launch");
        };
        assert!(params.start.negotiated.is_none());
        assert_eq!(params.start.game, falzar());
        assert_eq!(params.start.save_path, path);

        drop(idle_bridge);
        assert_eq!(relay.await.unwrap().starts.len(), 1);
    }

    #[tokio::test]
    async fn test_solo_requires_game_and_save() {
        let (bridge, _core) = channel_bridge(8);
        let err = spawn_session(&config("alice"), catalog(), MatchRequest::default(), bridge)
            .unwrap_err();
        assert!(matches!(err, CommandError::NoGameSelected));
    }

    #[tokio::test]
    async fn test_lobby_single_session_and_abort() {
        let mut lobby = Lobby::new(config("alice"), catalog());
        assert!(lobby.is_idle());

        let request = MatchRequest {
            pairing_code: "room1".into(),
            game: Some(falzar()),
            save_path: None,
        };
        let (bridge, _core) = channel_bridge(8);
        assert!(lobby.start(request.clone(), bridge).unwrap());
        let first = lobby.session().unwrap().id();

        let (bridge, _other_core) = channel_bridge(8);
        assert!(!lobby.start(request, bridge).unwrap());
        assert_eq!(lobby.session().unwrap().id(), first);

        lobby.abort();
        assert!(lobby.is_idle());
        assert!(lobby.finish().await.is_none());
    }
}
