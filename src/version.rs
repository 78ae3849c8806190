//! # Version
//!
//! Identifies which known binary layout the host process is running.
//! Detection happens once per process; the result never changes afterwards.

use std::fmt;
use std::path::Path;

use lazy_static::lazy_static;
use serde::{Deserialize, Serialize};

/// Known binary layouts of the host executable
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum GameVersion {
    /// Executable not recognized; only pattern-based targets can resolve
    Unknown,
    /// Standalone retail build
    Retail,
    /// Steam storefront build
    Steam,
    /// GOG storefront build
    Gog,
}

/// Executable file names (lowercase) mapped to the layout they ship with
const KNOWN_EXECUTABLES: &[(&str, GameVersion)] = &[
    ("game.exe", GameVersion::Retail),
    ("game_retail.exe", GameVersion::Retail),
    ("game_steam.exe", GameVersion::Steam),
    ("game_gog.exe", GameVersion::Gog),
];

impl GameVersion {
    /// Every variant, in declaration order
    pub const ALL: [GameVersion; 4] = [
        GameVersion::Unknown,
        GameVersion::Retail,
        GameVersion::Steam,
        GameVersion::Gog,
    ];

    /// Maps an executable file name (no directory) to a version
    pub fn from_executable_name(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        KNOWN_EXECUTABLES
            .iter()
            .find(|(known, _)| *known == name)
            .map(|(_, version)| *version)
            .unwrap_or(GameVersion::Unknown)
    }

    /// Maps an executable path to a version, looking only at the file name
    pub fn from_executable_path(path: &Path) -> Self {
        path.file_name()
            .and_then(|name| name.to_str())
            .map(Self::from_executable_name)
            .unwrap_or(GameVersion::Unknown)
    }

    /// Bit used for this version in a [`VersionMask`]
    pub const fn bit(self) -> u32 {
        1 << self as u32
    }
}

impl fmt::Display for GameVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GameVersion::Unknown => "unknown",
            GameVersion::Retail => "retail",
            GameVersion::Steam => "steam",
            GameVersion::Gog => "gog",
        };
        f.write_str(name)
    }
}

/// Set of versions a patch supports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionMask(u32);

impl VersionMask {
    /// No version at all
    pub const NONE: Self = Self(0);
    /// Every version, including [`GameVersion::Unknown`]
    pub const ALL: Self = Self(
        GameVersion::Unknown.bit()
            | GameVersion::Retail.bit()
            | GameVersion::Steam.bit()
            | GameVersion::Gog.bit(),
    );
    /// Every recognized version
    pub const KNOWN: Self =
        Self(GameVersion::Retail.bit() | GameVersion::Steam.bit() | GameVersion::Gog.bit());

    /// Builds a mask from a list of versions
    pub const fn of(versions: &[GameVersion]) -> Self {
        let mut bits = 0;
        let mut i = 0;
        while i < versions.len() {
            bits |= versions[i].bit();
            i += 1;
        }
        Self(bits)
    }

    /// Returns this mask with `version` added
    pub const fn with(self, version: GameVersion) -> Self {
        Self(self.0 | version.bit())
    }

    /// Whether `version` is in the mask
    pub const fn contains(self, version: GameVersion) -> bool {
        self.0 & version.bit() != 0
    }

    /// Raw bits
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Versions in the mask
    pub fn versions(self) -> impl Iterator<Item = GameVersion> {
        GameVersion::ALL
            .into_iter()
            .filter(move |version| self.contains(*version))
    }
}

impl Default for VersionMask {
    fn default() -> Self {
        Self::ALL
    }
}

/// Inspects the current executable and picks a version
pub fn detect_version() -> GameVersion {
    match std::env::current_exe() {
        Ok(path) => {
            let version = GameVersion::from_executable_path(&path);
            log::info!("Detected {} from {}", version, path.display());
            version
        }
        Err(e) => {
            log::warn!("Unable to read host executable path: {e}");
            GameVersion::Unknown
        }
    }
}

lazy_static! {
    /// Version of this process, detected on first use
    static ref HOST_VERSION: GameVersion = detect_version();
}

/// Version of the host process. Detected once; every call returns the same value.
pub fn host_version() -> GameVersion {
    *HOST_VERSION
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_executable_names() {
        assert_eq!(
            GameVersion::from_executable_name("Game_Steam.EXE"),
            GameVersion::Steam
        );
        assert_eq!(
            GameVersion::from_executable_path(Path::new("/opt/game/game_gog.exe")),
            GameVersion::Gog
        );
        assert_eq!(
            GameVersion::from_executable_name("notepad.exe"),
            GameVersion::Unknown
        );
    }

    #[test]
    fn test_mask() {
        let mask = VersionMask::of(&[GameVersion::Retail, GameVersion::Gog]);
        assert!(mask.contains(GameVersion::Retail));
        assert!(mask.contains(GameVersion::Gog));
        assert!(!mask.contains(GameVersion::Steam));
        assert!(!VersionMask::KNOWN.contains(GameVersion::Unknown));
        assert!(VersionMask::ALL.contains(GameVersion::Unknown));
        assert_eq!(
            mask.versions().collect::<Vec<_>>(),
            vec![GameVersion::Retail, GameVersion::Gog]
        );
        assert_eq!(mask.with(GameVersion::Steam).versions().count(), 3);
    }

    #[test]
    fn test_host_version_is_stable() {
        assert_eq!(host_version(), host_version());
    }
}
