//! Game domain.
//!
//! What each peer proposes (selection and rules) and which selections are
//! netplay-compatible with each other.

pub mod catalog;
pub mod selection;

pub use catalog::{Catalog, CatalogError, KnownRom, PatchInfo, PatchVersion};
pub use selection::{
    GameSelection, MatchSettings, MatchType, PairingCode, PatchRef, SettingsError,
    MAX_INPUT_DELAY, MIN_INPUT_DELAY,
};
