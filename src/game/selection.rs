//! Game selection and match settings.
//!
//! These are the values each peer proposes during negotiation and
//! retransmits wholesale whenever any of them changes.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Smallest accepted input delay, in frames.
pub const MIN_INPUT_DELAY: u32 = 3;

/// Largest accepted input delay, in frames.
pub const MAX_INPUT_DELAY: u32 = 10;

/// Longest pairing code kept after normalization.
pub const MAX_PAIRING_CODE_LEN: usize = 40;

/// A specific version of an installed patch.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PatchRef {
    /// Patch name as catalogued.
    pub name: String,
    /// Patch version string.
    pub version: String,
}

/// A ROM, optionally with a patch applied.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GameSelection {
    /// ROM identifier (internal ROM name).
    pub rom: String,
    /// Patch applied on top of the ROM.
    pub patch: Option<PatchRef>,
}

impl GameSelection {
    /// Unpatched ROM.
    pub fn rom(rom: impl Into<String>) -> Self {
        Self {
            rom: rom.into(),
            patch: None,
        }
    }

    /// ROM with a patch version applied.
    pub fn patched(
        rom: impl Into<String>,
        patch: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            rom: rom.into(),
            patch: Some(PatchRef {
                name: patch.into(),
                version: version.into(),
            }),
        }
    }
}

impl fmt::Display for GameSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.patch {
            Some(patch) => write!(f, "{} + {} v{}", self.rom, patch.name, patch.version),
            None => f.write_str(&self.rom),
        }
    }
}

/// Match rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchType {
    /// One battle.
    Single,
    /// Best of three.
    #[default]
    Triple,
}

impl std::str::FromStr for MatchType {
    type Err = SettingsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "single" | "0" => Ok(Self::Single),
            "triple" | "1" => Ok(Self::Triple),
            other => Err(SettingsError::UnknownMatchType(other.to_string())),
        }
    }
}

/// Invalid settings values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettingsError {
    /// Input delay outside the accepted range.
    #[error("input delay {0} outside 3..=10")]
    InputDelayOutOfRange(u32),

    /// Unrecognized match type name.
    #[error("unknown match type: {0}")]
    UnknownMatchType(String),
}

/// Settings one peer proposes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchSettings {
    /// Name shown to the opponent.
    pub display_name: String,
    /// Input delay in frames.
    pub input_delay: u32,
    /// Match rules.
    pub match_type: MatchType,
    /// Selected game, if any.
    pub game: Option<GameSelection>,
    /// Every selection the opponent may use against `game`.
    pub available_games: Vec<GameSelection>,
}

impl MatchSettings {
    /// Defaults for a fresh negotiation.
    pub fn new(display_name: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            input_delay: MIN_INPUT_DELAY,
            match_type: MatchType::default(),
            game: None,
            available_games: Vec::new(),
        }
    }

    /// Check value ranges.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if !(MIN_INPUT_DELAY..=MAX_INPUT_DELAY).contains(&self.input_delay) {
            return Err(SettingsError::InputDelayOutOfRange(self.input_delay));
        }
        Ok(())
    }

    /// Whether these settings advertise `game` as playable against them.
    pub fn accepts(&self, game: &GameSelection) -> bool {
        self.available_games.iter().any(|g| g == game)
    }
}

/// Normalized pairing code routing two peers to one relay session.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PairingCode(String);

impl PairingCode {
    /// Normalize user input: lower-case, `[a-z0-9]` only, at most
    /// [`MAX_PAIRING_CODE_LEN`] characters. Empty input means no pairing.
    pub fn parse(input: &str) -> Option<Self> {
        let code: String = input
            .chars()
            .flat_map(char::to_lowercase)
            .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit())
            .take(MAX_PAIRING_CODE_LEN)
            .collect();
        if code.is_empty() {
            None
        } else {
            Some(Self(code))
        }
    }

    /// Normalized code.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PairingCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
