//! Netplay Compatibility Catalog
//!
//! Known ROMs and installed patches, each tagged with a netplay
//! compatibility class. Two selections can play each other when they share
//! a tag. A patched selection takes the tag declared by that patch version,
//! never the base ROM's.
//!
//! Scanning ROM and patch directories happens elsewhere; this module only
//! holds the result and answers compatibility queries over it.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::selection::{GameSelection, PatchRef};

/// A ROM the launcher recognizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownRom {
    /// Human readable title.
    pub title: String,
    /// Compatibility tag.
    pub netplay_compatibility: String,
}

/// One published version of a patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchVersion {
    /// Compatibility tag of the patched game.
    pub netplay_compatibility: String,
}

/// An installed patch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchInfo {
    /// Human readable title.
    pub title: String,
    /// ROM this patch applies to.
    pub for_rom: String,
    /// Installed versions keyed by version string.
    pub versions: BTreeMap<String, PatchVersion>,
}

/// Catalog lookup failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CatalogError {
    /// ROM is not in the catalog.
    #[error("unknown rom: {0}")]
    UnknownRom(String),

    /// Patch is not installed.
    #[error("unknown patch: {0}")]
    UnknownPatch(String),

    /// Patch is installed but not at this version.
    #[error("patch {name} has no version {version}")]
    UnknownPatchVersion {
        /// Patch name.
        name: String,
        /// Requested version.
        version: String,
    },

    /// Catalog document failed to parse.
    #[error("invalid catalog: {0}")]
    Parse(String),
}

/// ROMs and patches known to this launcher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Catalog {
    /// Known ROMs keyed by ROM identifier.
    pub roms: BTreeMap<String, KnownRom>,
    /// Installed patches keyed by patch name.
    pub patches: BTreeMap<String, PatchInfo>,
}

impl Catalog {
    /// Empty catalog.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a catalog produced by the ROM/patch scanner.
    pub fn from_json(s: &str) -> Result<Self, CatalogError> {
        serde_json::from_str(s).map_err(|e| CatalogError::Parse(e.to_string()))
    }

    /// Add a ROM.
    pub fn with_rom(
        mut self,
        rom: impl Into<String>,
        title: impl Into<String>,
        netplay_compatibility: impl Into<String>,
    ) -> Self {
        self.roms.insert(
            rom.into(),
            KnownRom {
                title: title.into(),
                netplay_compatibility: netplay_compatibility.into(),
            },
        );
        self
    }

    /// Add one version of a patch, registering the patch on first use.
    pub fn with_patch_version(
        mut self,
        name: impl Into<String>,
        for_rom: impl Into<String>,
        version: impl Into<String>,
        netplay_compatibility: impl Into<String>,
    ) -> Self {
        let name = name.into();
        let for_rom = for_rom.into();
        let patch = self.patches.entry(name.clone()).or_insert_with(|| PatchInfo {
            title: name,
            for_rom,
            versions: BTreeMap::new(),
        });
        patch.versions.insert(
            version.into(),
            PatchVersion {
                netplay_compatibility: netplay_compatibility.into(),
            },
        );
        self
    }

    /// Compatibility tag of a selection.
    pub fn compatibility_of(&self, game: &GameSelection) -> Result<&str, CatalogError> {
        let rom = self
            .roms
            .get(&game.rom)
            .ok_or_else(|| CatalogError::UnknownRom(game.rom.clone()))?;

        match &game.patch {
            None => Ok(&rom.netplay_compatibility),
            Some(PatchRef { name, version }) => {
                let patch = self
                    .patches
                    .get(name)
                    .ok_or_else(|| CatalogError::UnknownPatch(name.clone()))?;
                let info = patch.versions.get(version).ok_or_else(|| {
                    CatalogError::UnknownPatchVersion {
                        name: name.clone(),
                        version: version.clone(),
                    }
                })?;
                Ok(&info.netplay_compatibility)
            }
        }
    }

    /// Every selection sharing `game`'s compatibility tag: known ROMs first,
    /// then patch versions, each in name order.
    pub fn available_games(&self, game: &GameSelection) -> Result<Vec<GameSelection>, CatalogError> {
        let tag = self.compatibility_of(game)?;

        let roms = self
            .roms
            .iter()
            .filter(|(_, rom)| rom.netplay_compatibility == tag)
            .map(|(name, _)| GameSelection::rom(name.clone()));

        let patches = self.patches.iter().flat_map(|(name, patch)| {
            patch
                .versions
                .iter()
                .filter(|(_, v)| v.netplay_compatibility == tag)
                .map(move |(version, _)| {
                    GameSelection::patched(patch.for_rom.clone(), name.clone(), version.clone())
                })
        });

        Ok(roms.chain(patches).collect())
    }

    /// Whether two selections can play each other.
    pub fn are_compatible(&self, a: &GameSelection, b: &GameSelection) -> Result<bool, CatalogError> {
        Ok(self.compatibility_of(a)? == self.compatibility_of(b)?)
    }
}
