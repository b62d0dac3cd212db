//! Match negotiation.
//!
//! The commit-reveal lobby protocol: a sans-IO state machine, the revealed
//! state it commits to, and the tokio task that drives it over a core
//! bridge.

pub mod error;
pub mod reveal;
pub mod session;
pub mod state;

pub use error::{CommandError, NegotiationError, ProtocolViolation, ResourceError, TransportError};
pub use reveal::{RevealedState, SealedReveal, MAX_SAVE_SIZE};
pub use session::{
    spawn_session, LaunchParams, LocalCommand, Lobby, MatchRequest, SessionConfig, SessionHandle,
    SessionOutcome,
};
pub use state::{Agreement, Negotiator, Own, Opponent, PeerView, Phase, SessionSnapshot, Side};
