//! Saving and restoring patch state as a TOML document, one table per patch:
//!
//! ```toml
//! [FramePacing]
//! Enabled = true
//! Settings.TargetFps = 144
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::{Deserialize, Serialize};

use super::PatchManager;
use crate::error::ConfigError;

/// Persisted state of one patch
#[derive(Debug, Default, Serialize, Deserialize)]
struct PatchSection {
    /// Whether the patch should be installed
    #[serde(rename = "Enabled", default, skip_serializing_if = "Option::is_none")]
    enabled: Option<bool>,
    /// Settings that differ from their defaults
    #[serde(
        rename = "Settings",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    settings: BTreeMap<String, toml::Value>,
}

impl PatchManager {
    /// Serializes the state of every patch that was toggled or has non-default settings
    pub fn save(&self) -> Result<String, ConfigError> {
        let mut document = BTreeMap::new();
        for patch in self.snapshot() {
            let patch = patch.lock();
            let settings: BTreeMap<_, _> = patch
                .settings()
                .iter()
                .filter(|s| s.is_modified())
                .map(|s| (s.name().to_owned(), s.to_toml()))
                .collect();
            if !patch.is_touched() && settings.is_empty() {
                continue;
            }
            document.insert(
                patch.name().to_owned(),
                PatchSection {
                    enabled: Some(patch.is_enabled()),
                    settings,
                },
            );
        }
        Ok(toml::to_string_pretty(&document)?)
    }

    /// Restores state saved by [`save`](Self::save). Returns the number of patches restored.
    ///
    /// A document that does not parse changes nothing. Sections and settings that do not match a
    /// patch are skipped with a warning. Settings are applied before the enabled flag, so a patch
    /// installs with its saved configuration.
    pub fn load(&self, document: &str) -> Result<usize, ConfigError> {
        let table: toml::Table = toml::from_str(document)?;

        let mut restored = 0;
        for (name, value) in table {
            let section: PatchSection = match value.try_into() {
                Ok(section) => section,
                Err(e) => {
                    log::warn!("Ignoring malformed section [{name}]: {e}");
                    continue;
                }
            };
            let Some(patch) = self.find(&name) else {
                log::warn!("Ignoring state for unknown patch {name}");
                continue;
            };
            let mut patch = patch.lock();

            for (key, value) in &section.settings {
                let parsed = match patch.settings().iter().find(|s| s.name() == key.as_str()) {
                    Some(setting) => setting.parse_toml(value),
                    None => {
                        log::warn!("Ignoring unknown setting {name}.{key}");
                        continue;
                    }
                };
                let Some(parsed) = parsed else {
                    log::warn!("Ignoring {name}.{key}: unexpected value {value}");
                    continue;
                };
                if let Err(e) = patch.set_setting(key, parsed) {
                    log::warn!("Failed to restore {name}.{key}: {e}");
                }
            }

            match section.enabled {
                Some(true) => {
                    patch.touch();
                    patch.install();
                }
                Some(false) => {
                    patch.touch();
                    patch.uninstall();
                }
                None => {}
            }
            restored += 1;
        }

        log::info!("Restored state of {restored} patch(es)");
        Ok(restored)
    }

    /// Writes [`save`](Self::save) output to `path`
    pub fn save_to_path(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        fs::write(path, self.save()?)?;
        Ok(())
    }

    /// Restores state from `path`. A missing file leaves every patch at its defaults.
    pub fn load_from_path(&self, path: impl AsRef<Path>) -> Result<usize, ConfigError> {
        let path = path.as_ref();
        match fs::read_to_string(path) {
            Ok(document) => self.load(&document),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                log::info!("No saved patch state at {}", path.display());
                Ok(0)
            }
            Err(e) => Err(e.into()),
        }
    }
}
