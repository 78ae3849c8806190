//! # Manager
//!
//! The [`PatchRegistry`] lists every patch the host knows about; the [`PatchManager`] instantiates
//! them once and is the only way the rest of the program enables, disables, configures or persists
//! them.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ImageError, SettingError};
use crate::patch::{Patch, PatchBehavior, PatchInfo, PatchMetadata, SettingValue};
use crate::resolve::AddressResolver;
use crate::scan::ModuleImage;
use crate::version::host_version;

mod persist;

/// Builds a fresh patch body
pub type PatchFactory = Box<dyn Fn() -> Box<dyn PatchBehavior> + Send + Sync>;

/// One registered patch: how to build it and what it is
pub struct RegistryEntry {
    /// Body factory
    factory: PatchFactory,
    /// Static description
    metadata: PatchMetadata,
}

impl RegistryEntry {
    /// Creates an entry
    pub fn new(
        metadata: PatchMetadata,
        factory: impl Fn() -> Box<dyn PatchBehavior> + Send + Sync + 'static,
    ) -> Self {
        Self {
            factory: Box::new(factory),
            metadata,
        }
    }

    /// Static description
    pub fn metadata(&self) -> &PatchMetadata {
        &self.metadata
    }
}

impl fmt::Debug for RegistryEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryEntry")
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Push-only list of patches, built by a startup routine before the manager exists
#[derive(Debug, Default)]
pub struct PatchRegistry {
    /// Entries in registration order
    entries: Vec<RegistryEntry>,
}

impl PatchRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a patch
    pub fn register(
        &mut self,
        metadata: PatchMetadata,
        factory: impl Fn() -> Box<dyn PatchBehavior> + Send + Sync + 'static,
    ) -> &mut Self {
        self.entries.push(RegistryEntry::new(metadata, factory));
        self
    }

    /// Registers a prebuilt entry
    pub fn push(&mut self, entry: RegistryEntry) -> &mut Self {
        self.entries.push(entry);
        self
    }

    /// Entries in registration order
    pub fn entries(&self) -> &[RegistryEntry] {
        &self.entries
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Owns every patch and the resolver they share
pub struct PatchManager {
    /// Resolver for the running version
    resolver: Arc<AddressResolver>,
    /// Registry, until [`instantiate_all`](Self::instantiate_all) consumes it
    registry: Mutex<Option<PatchRegistry>>,
    /// Instantiated patches by name, in registration order
    patches: Mutex<Vec<(&'static str, Arc<Mutex<Patch>>)>>,
}

impl fmt::Debug for PatchManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PatchManager")
            .field("version", &self.resolver.version())
            .field("patches", &self.names())
            .finish()
    }
}

impl PatchManager {
    /// Creates a manager; no patch exists until [`instantiate_all`](Self::instantiate_all)
    pub fn new(registry: PatchRegistry, resolver: AddressResolver) -> Self {
        Self {
            resolver: Arc::new(resolver),
            registry: Mutex::new(Some(registry)),
            patches: Mutex::new(Vec::new()),
        }
    }

    /// Creates a manager for the host executable and its detected version
    pub fn for_host(registry: PatchRegistry) -> Result<Self, ImageError> {
        let resolver = AddressResolver::new(host_version(), ModuleImage::host()?);
        Ok(Self::new(registry, resolver))
    }

    /// Resolver shared by every patch
    pub fn resolver(&self) -> &AddressResolver {
        &self.resolver
    }

    /// Builds every registered patch, disabled. Runs once; later calls return 0.
    ///
    /// A second entry with an already-used name is logged and skipped.
    pub fn instantiate_all(&self) -> usize {
        let Some(registry) = self.registry.lock().take() else {
            log::debug!("Patches already instantiated");
            return 0;
        };

        let mut seen = HashSet::new();
        let mut created = Vec::with_capacity(registry.len());
        for entry in registry.entries {
            if !seen.insert(entry.metadata.name) {
                log::warn!(
                    "Patch {} is registered more than once; ignoring duplicate",
                    entry.metadata.name
                );
                continue;
            }
            let name = entry.metadata.name;
            let behavior = (entry.factory)();
            let patch = Patch::new(entry.metadata, behavior, self.resolver.clone());
            created.push((name, Arc::new(Mutex::new(patch))));
        }

        let count = created.len();
        self.patches.lock().extend(created);
        log::info!("Instantiated {count} patch(es) for {}", self.resolver.version());
        count
    }

    /// Snapshot of the patch list; the list lock is released before any patch is touched
    fn snapshot(&self) -> Vec<Arc<Mutex<Patch>>> {
        self.patches
            .lock()
            .iter()
            .map(|(_, patch)| patch.clone())
            .collect()
    }

    /// Looks a patch up by name
    fn find(&self, name: &str) -> Option<Arc<Mutex<Patch>>> {
        self.patches
            .lock()
            .iter()
            .find(|(key, _)| *key == name)
            .map(|(_, patch)| patch.clone())
    }

    /// Runs `f` on the named patch
    pub fn with_patch<R>(&self, name: &str, f: impl FnOnce(&mut Patch) -> R) -> Option<R> {
        let patch = self.find(name)?;
        let mut patch = patch.lock();
        Some(f(&mut patch))
    }

    /// Every patch with its current state
    pub fn list(&self) -> Vec<PatchInfo> {
        self.snapshot()
            .iter()
            .map(|patch| patch.lock().info())
            .collect()
    }

    /// Names of every patch, in registration order
    pub fn names(&self) -> Vec<&'static str> {
        self.patches.lock().iter().map(|(name, _)| *name).collect()
    }

    /// Whether the named patch is installed, or `None` if there is no such patch
    pub fn is_enabled(&self, name: &str) -> Option<bool> {
        self.with_patch(name, |patch| patch.is_enabled())
    }

    /// Installs the named patch. Returns whether it is enabled afterwards.
    pub fn enable(&self, name: &str) -> bool {
        match self.with_patch(name, |patch| {
            patch.touch();
            patch.install()
        }) {
            Some(enabled) => enabled,
            None => {
                log::warn!("Cannot enable unknown patch {name}");
                false
            }
        }
    }

    /// Uninstalls the named patch. Returns whether it is disabled afterwards.
    pub fn disable(&self, name: &str) -> bool {
        match self.with_patch(name, |patch| {
            patch.touch();
            patch.uninstall()
        }) {
            Some(disabled) => disabled,
            None => {
                log::warn!("Cannot disable unknown patch {name}");
                false
            }
        }
    }

    /// Current value of a patch setting
    pub fn get_setting(&self, patch: &str, setting: &str) -> Result<SettingValue, SettingError> {
        self.with_patch(patch, |p| {
            p.setting(setting)
                .ok_or_else(|| SettingError::UnknownSetting(setting.to_owned()))
        })
        .unwrap_or_else(|| Err(SettingError::UnknownPatch(patch.to_owned())))
    }

    /// Changes a patch setting; see [`Patch::set_setting`]
    pub fn set_setting(
        &self,
        patch: &str,
        setting: &str,
        value: SettingValue,
    ) -> Result<SettingValue, SettingError> {
        self.with_patch(patch, |p| p.set_setting(setting, value))
            .unwrap_or_else(|| Err(SettingError::UnknownPatch(patch.to_owned())))
    }

    /// Gives every enabled patch a chance to retry deferred work
    pub fn update(&self) {
        for patch in self.snapshot() {
            patch.lock().update();
        }
    }

    /// Uninstalls every patch in reverse registration order. Returns whether all are disabled.
    pub fn disable_all(&self) -> bool {
        let mut all = true;
        for patch in self.snapshot().iter().rev() {
            all &= patch.lock().uninstall();
        }
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PatchError;
    use crate::patch::InstallContext;
    use crate::version::GameVersion;

    /// Body that does nothing
    struct Noop;

    impl PatchBehavior for Noop {
        fn install(&mut self, _cx: &mut InstallContext<'_>) -> Result<(), PatchError> {
            Ok(())
        }
    }

    /// Manager over an empty image
    fn manager(registry: PatchRegistry) -> PatchManager {
        PatchManager::new(
            registry,
            AddressResolver::new(GameVersion::Retail, ModuleImage::new(0, 0)),
        )
    }

    #[test]
    fn test_instantiate_once_and_skip_duplicates() {
        let mut registry = PatchRegistry::new();
        registry
            .register(PatchMetadata::new("A"), || Box::new(Noop))
            .register(PatchMetadata::new("B"), || Box::new(Noop))
            .register(PatchMetadata::new("A").category("Duplicate"), || {
                Box::new(Noop)
            });
        let manager = manager(registry);

        assert_eq!(manager.instantiate_all(), 2);
        assert_eq!(manager.instantiate_all(), 0);
        assert_eq!(manager.names(), ["A", "B"]);
        assert_eq!(manager.list()[0].metadata.category, "General");
    }

    #[test]
    fn test_enable_disable_by_name() {
        let mut registry = PatchRegistry::new();
        registry.register(PatchMetadata::new("A"), || Box::new(Noop));
        let manager = manager(registry);
        manager.instantiate_all();

        assert_eq!(manager.is_enabled("A"), Some(false));
        assert!(manager.enable("A"));
        assert_eq!(manager.is_enabled("A"), Some(true));
        assert!(manager.disable("A"));
        assert!(!manager.enable("Missing"));
        assert_eq!(manager.is_enabled("Missing"), None);
        assert!(matches!(
            manager.get_setting("Missing", "x"),
            Err(SettingError::UnknownPatch(_))
        ));
        assert!(matches!(
            manager.get_setting("A", "x"),
            Err(SettingError::UnknownSetting(_))
        ));
    }
}
