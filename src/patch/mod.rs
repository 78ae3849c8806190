//! # Patch
//!
//! A patch is one installable, uninstallable change to the host. Its body is a [`PatchBehavior`];
//! the [`Patch`] wrapper owns the lifecycle: version gating, panic containment, recording of every
//! transaction and hook batch the body applies, and all-or-nothing rollback.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::Serialize;

use crate::error::{PatchError, ResolveError, SettingError};
use crate::hook::HookBatch;
use crate::patcher::Transaction;
use crate::resolve::{AddressResolver, TargetDescriptor};
use crate::scan::ModuleImage;
use crate::version::{GameVersion, VersionMask};

mod setting;

pub use setting::{
    BindingTarget, PatchSetting, SettingBinding, SettingInfo, SettingKind, SettingValue,
    ValueWidth,
};

/// Read-only description of a patch for the presentation layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PatchMetadata {
    /// Unique key, also the persisted section name
    pub name: &'static str,
    /// Name shown to users
    pub display_name: &'static str,
    /// One-line summary
    pub description: &'static str,
    /// Grouping for display
    pub category: &'static str,
    /// Whether the patch is considered experimental
    pub experimental: bool,
    /// Versions the patch may be installed on
    pub versions: VersionMask,
    /// Free-text implementation notes
    pub technical_details: &'static str,
}

impl PatchMetadata {
    /// Metadata with only a name; supports every version
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            display_name: name,
            description: "",
            category: "General",
            experimental: false,
            versions: VersionMask::ALL,
            technical_details: "",
        }
    }

    /// Sets the display name
    pub const fn display_name(mut self, display_name: &'static str) -> Self {
        self.display_name = display_name;
        self
    }

    /// Sets the summary
    pub const fn description(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Sets the category
    pub const fn category(mut self, category: &'static str) -> Self {
        self.category = category;
        self
    }

    /// Marks the patch experimental
    pub const fn experimental(mut self) -> Self {
        self.experimental = true;
        self
    }

    /// Restricts the supported versions
    pub const fn versions(mut self, versions: VersionMask) -> Self {
        self.versions = versions;
        self
    }

    /// Sets the implementation notes
    pub const fn technical_details(mut self, technical_details: &'static str) -> Self {
        self.technical_details = technical_details;
        self
    }
}

/// Body of a patch.
///
/// `install` applies its changes only through the [`InstallContext`], which records them so the
/// owning [`Patch`] can undo them. Returning an error (or panicking) undoes whatever was applied.
pub trait PatchBehavior: Send {
    /// Settings exposed by the patch, with their defaults
    fn settings(&self) -> Vec<PatchSetting> {
        Vec::new()
    }

    /// Resolves targets and applies the patch
    fn install(&mut self, cx: &mut InstallContext<'_>) -> Result<(), PatchError>;

    /// Periodic retry of work that could not happen at install time. Only called while enabled.
    fn update(&mut self, _cx: &mut InstallContext<'_>) -> Result<(), PatchError> {
        Ok(())
    }

    /// Called after every recorded change has been undone
    fn uninstalled(&mut self) {}

    /// Whether the presentation layer should show a dedicated panel for this patch
    fn has_custom_ui(&self) -> bool {
        false
    }
}

/// Something applied on behalf of a patch body
#[derive(Debug)]
enum Applied {
    /// Committed memory writes
    Memory(Transaction),
    /// Attached hooks
    Hooks(HookBatch),
}

impl Applied {
    /// Undoes the change
    ///
    /// # Safety
    ///
    /// The host must no longer depend on the change
    unsafe fn revert(&mut self) -> Result<(), PatchError> {
        match self {
            Self::Memory(tx) => tx.rollback()?,
            Self::Hooks(batch) => batch.detach()?,
        }
        Ok(())
    }

    /// Applies the change again after a revert
    ///
    /// # Safety
    ///
    /// Must only follow a successful [`revert`](Self::revert)
    unsafe fn reapply(&mut self) -> Result<(), PatchError> {
        match self {
            Self::Memory(tx) => tx.reapply()?,
            Self::Hooks(batch) => batch.attach()?,
        }
        Ok(())
    }
}

/// Undoes `applied` in reverse order; on failure re-applies what was already undone
///
/// # Safety
///
/// The host must no longer depend on the changes
unsafe fn revert_all(applied: &mut [Applied]) -> Result<(), PatchError> {
    for index in (0..applied.len()).rev() {
        if let Err(e) = applied[index].revert() {
            for item in applied[index + 1..].iter_mut() {
                if let Err(e) = item.reapply() {
                    log::error!("Failed to re-apply change after aborted revert: {e}");
                }
            }
            return Err(e);
        }
    }
    Ok(())
}

/// Handed to a patch body; records everything it applies
pub struct InstallContext<'a> {
    /// Resolver for the running version
    resolver: &'a AddressResolver,
    /// The patch's settings
    settings: &'a [PatchSetting],
    /// Changes in order of application
    applied: Vec<Applied>,
}

impl<'a> InstallContext<'a> {
    /// Creates a context with nothing applied
    fn new(resolver: &'a AddressResolver, settings: &'a [PatchSetting]) -> Self {
        Self {
            resolver,
            settings,
            applied: Vec::new(),
        }
    }

    /// Version the host is running
    pub fn version(&self) -> GameVersion {
        self.resolver.version()
    }

    /// Host image
    pub fn image(&self) -> &ModuleImage {
        self.resolver.image()
    }

    /// Resolves and validates a target
    pub fn resolve(&self, descriptor: &TargetDescriptor) -> Result<usize, ResolveError> {
        self.resolver.resolve(descriptor).map(|r| r.address)
    }

    /// Current value of one of the patch's settings
    pub fn setting(&self, name: &str) -> Option<SettingValue> {
        self.settings
            .iter()
            .find(|s| s.name() == name)
            .map(|s| s.value())
    }

    /// Runs `f` against a fresh transaction. If `f` fails, its writes are rolled back immediately;
    /// otherwise the transaction is committed and recorded.
    pub fn transaction<F>(&mut self, f: F) -> Result<(), PatchError>
    where
        F: FnOnce(&mut Transaction) -> Result<(), PatchError>,
    {
        let mut tx = Transaction::new();
        if let Err(e) = f(&mut tx) {
            // SAFETY: the writes were made by `f` moments ago and are being abandoned
            if let Err(rollback) = unsafe { tx.rollback() } {
                log::error!("Failed to roll back transaction: {rollback}");
            }
            return Err(e);
        }
        tx.commit();
        self.applied.push(Applied::Memory(tx));
        Ok(())
    }

    /// Attaches `batch` and records it. A batch left partly attached by a failed rollback is
    /// recorded too, so undoing the patch retries it.
    ///
    /// # Safety
    ///
    /// Every hook's target must be safe to redirect
    pub unsafe fn hooks(&mut self, mut batch: HookBatch) -> Result<(), PatchError> {
        let result = batch.attach();
        if batch.is_attached() {
            self.applied.push(Applied::Hooks(batch));
        }
        result?;
        Ok(())
    }

    /// Number of recorded changes
    pub fn applied(&self) -> usize {
        self.applied.len()
    }

    /// Recorded changes, in order of application
    fn into_applied(self) -> Vec<Applied> {
        self.applied
    }
}

/// Turns a panic payload into a message
fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Presentation view of a patch and its current state
#[derive(Debug, Clone, Serialize)]
pub struct PatchInfo {
    /// Static description
    #[serde(flatten)]
    pub metadata: PatchMetadata,
    /// Whether the patch is installed
    pub enabled: bool,
    /// Why the last install, uninstall or update failed
    pub last_error: Option<String>,
    /// Whether the patch wants a dedicated panel
    pub has_custom_ui: bool,
    /// Settings and their values
    pub settings: Vec<SettingInfo>,
}

/// A patch and its lifecycle: `Disabled -> install -> Enabled -> uninstall -> Disabled`.
///
/// `install` and `uninstall` never leave the host half-patched: they either complete or undo
/// everything they did, and report failure through a `bool` and [`last_error`](Self::last_error).
pub struct Patch {
    /// Static description
    metadata: PatchMetadata,
    /// The body
    behavior: Box<dyn PatchBehavior>,
    /// Resolver for the running version
    resolver: Arc<AddressResolver>,
    /// Whether the patch is installed
    enabled: bool,
    /// Message of the last failure
    last_error: Option<String>,
    /// Settings, in the order the body declared them
    settings: Vec<PatchSetting>,
    /// Changes made by the body, in order of application
    applied: Vec<Applied>,
    /// Whether the patch was ever enabled or disabled by request
    touched: bool,
}

impl std::fmt::Debug for Patch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Patch")
            .field("name", &self.metadata.name)
            .field("enabled", &self.enabled)
            .field("last_error", &self.last_error)
            .field("applied", &self.applied.len())
            .finish()
    }
}

impl Patch {
    /// Creates a disabled patch
    pub fn new(
        metadata: PatchMetadata,
        behavior: Box<dyn PatchBehavior>,
        resolver: Arc<AddressResolver>,
    ) -> Self {
        let settings = behavior.settings();
        Self {
            metadata,
            behavior,
            resolver,
            enabled: false,
            last_error: None,
            settings,
            applied: Vec::new(),
            touched: false,
        }
    }

    /// Unique key
    pub fn name(&self) -> &'static str {
        self.metadata.name
    }

    /// Static description
    pub fn metadata(&self) -> &PatchMetadata {
        &self.metadata
    }

    /// Whether the patch is installed
    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Message of the last failure, cleared by the next success
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Settings, in declaration order
    pub fn settings(&self) -> &[PatchSetting] {
        &self.settings
    }

    /// Current value of a setting
    pub fn setting(&self, name: &str) -> Option<SettingValue> {
        self.settings
            .iter()
            .find(|s| s.name() == name)
            .map(|s| s.value())
    }

    /// Whether a failed install left changes it could not undo. They are kept so that
    /// [`uninstall`](Self::uninstall) or the next [`install`](Self::install) can retry.
    pub fn is_stranded(&self) -> bool {
        !self.enabled && !self.applied.is_empty()
    }

    /// Whether the patch was ever enabled or disabled by request
    pub fn is_touched(&self) -> bool {
        self.touched
    }

    /// Records that the patch was toggled by request
    pub(crate) fn touch(&mut self) {
        self.touched = true;
    }

    /// Presentation view
    pub fn info(&self) -> PatchInfo {
        PatchInfo {
            metadata: self.metadata.clone(),
            enabled: self.enabled,
            last_error: self.last_error.clone(),
            has_custom_ui: self.behavior.has_custom_ui(),
            settings: self.settings.iter().map(SettingInfo::from).collect(),
        }
    }

    /// Records a failure
    fn fail(&mut self, action: &str, error: PatchError) {
        let message = error.to_string();
        log::warn!("Failed to {action} {}: {message}", self.metadata.name);
        self.last_error = Some(message);
    }

    /// Writes every bound setting; unavailable addresses are left pending
    ///
    /// # Safety
    ///
    /// Overwriting the bound addresses must be sound for the program
    unsafe fn write_settings(&mut self) -> Result<(), SettingError> {
        for setting in &mut self.settings {
            setting.write_live(&self.resolver)?;
        }
        Ok(())
    }

    /// Restores every bound setting that is currently written
    ///
    /// # Safety
    ///
    /// Reverting the bound addresses must be sound for the program
    unsafe fn restore_settings(&mut self) -> Result<(), SettingError> {
        for index in 0..self.settings.len() {
            if let Err(e) = self.settings[index].restore_live() {
                for setting in &mut self.settings[..index] {
                    if let Err(e) = setting.write_live(&self.resolver) {
                        log::error!("Failed to rewrite setting `{}`: {e}", setting.name());
                    }
                }
                return Err(e);
            }
        }
        Ok(())
    }

    /// Installs the patch. Returns `true` if the patch is enabled afterwards.
    ///
    /// Installing an enabled patch is a no-op. On failure every change made so far is undone, the
    /// patch stays disabled and [`last_error`](Self::last_error) says why.
    pub fn install(&mut self) -> bool {
        if self.enabled {
            return true;
        }

        if !self.applied.is_empty() {
            // SAFETY: leftovers of an earlier install of this patch
            if let Err(e) = unsafe { revert_all(&mut self.applied) } {
                self.fail("install", e);
                return false;
            }
            self.applied.clear();
        }

        let version = self.resolver.version();
        if !self.metadata.versions.contains(version) {
            self.fail("install", PatchError::UnsupportedVersion(version));
            return false;
        }

        let mut cx = InstallContext::new(&self.resolver, &self.settings);
        let behavior = &mut self.behavior;
        let result = panic::catch_unwind(AssertUnwindSafe(|| behavior.install(&mut cx)));
        let mut applied = cx.into_applied();
        let result = match result {
            Ok(result) => result,
            Err(payload) => Err(PatchError::Panicked(panic_message(payload))),
        };
        // SAFETY: bound settings belong to this patch, which is being installed
        let result = result.and_then(|()| unsafe { self.write_settings() }.map_err(Into::into));

        if let Err(e) = result {
            // SAFETY: everything being undone was applied by this install attempt
            unsafe {
                if let Err(e) = self.restore_settings() {
                    log::error!("Failed to restore settings of {}: {e}", self.name());
                }
                if let Err(e) = revert_all(&mut applied) {
                    log::error!(
                        "Failed to roll back {}, keeping its changes for a later uninstall: {e}",
                        self.name()
                    );
                    self.applied = applied;
                }
            }
            self.fail("install", e);
            return false;
        }

        log::info!(
            "Installed {} ({} change(s))",
            self.metadata.name,
            applied.len()
        );
        self.applied = applied;
        self.enabled = true;
        self.last_error = None;
        true
    }

    /// Uninstalls the patch. Returns `true` if the patch is disabled afterwards.
    ///
    /// Bound settings are restored first, then every recorded change in reverse order of
    /// application. If anything cannot be undone, what was already undone is re-applied and the
    /// patch stays enabled. A [stranded](Self::is_stranded) patch has its leftovers undone.
    pub fn uninstall(&mut self) -> bool {
        if !self.enabled && self.applied.is_empty() {
            return true;
        }

        let enabled = self.enabled;
        // SAFETY: every change being undone was applied by this patch
        let result = unsafe {
            self.restore_settings()
                .map_err(PatchError::from)
                .and_then(|()| match revert_all(&mut self.applied) {
                    Ok(()) => Ok(()),
                    Err(e) => {
                        if enabled {
                            if let Err(e) = self.write_settings() {
                                log::error!("Failed to rewrite settings of {}: {e}", self.name());
                            }
                        }
                        Err(e)
                    }
                })
        };
        if let Err(e) = result {
            self.fail("uninstall", e);
            return false;
        }

        self.applied.clear();
        self.enabled = false;
        self.last_error = None;
        let behavior = &mut self.behavior;
        if panic::catch_unwind(AssertUnwindSafe(|| behavior.uninstalled())).is_err() {
            log::warn!("{} panicked after uninstall", self.metadata.name);
        }
        log::info!("Uninstalled {}", self.metadata.name);
        true
    }

    /// Retries deferred work: pending bound settings and the body's own `update`.
    ///
    /// Never changes whether the patch is enabled. A failing body update has its own changes
    /// undone and is reported through [`last_error`](Self::last_error).
    pub fn update(&mut self) {
        if !self.enabled {
            return;
        }

        for setting in self.settings.iter_mut().filter(|s| s.is_pending()) {
            // SAFETY: the patch is enabled, so its bound settings are meant to be live
            if let Err(e) = unsafe { setting.write_live(&self.resolver) } {
                log::warn!("Deferred setting of {}: {e}", self.metadata.name);
            }
        }

        let mut cx = InstallContext::new(&self.resolver, &self.settings);
        let behavior = &mut self.behavior;
        let result = panic::catch_unwind(AssertUnwindSafe(|| behavior.update(&mut cx)));
        let mut applied = cx.into_applied();
        let result = match result {
            Ok(result) => result,
            Err(payload) => Err(PatchError::Panicked(panic_message(payload))),
        };

        match result {
            Ok(()) => self.applied.append(&mut applied),
            Err(e) => {
                // SAFETY: only the changes of this update are undone
                if let Err(e) = unsafe { revert_all(&mut applied) } {
                    log::error!(
                        "Failed to roll back update of {}, keeping its changes for uninstall: {e}",
                        self.name()
                    );
                    self.applied.append(&mut applied);
                }
                self.fail("update", e);
            }
        }
    }

    /// Changes a setting. The value is clamped into bounds; if the patch is enabled and the setting
    /// is bound, the new value is written immediately (or left pending until its address exists).
    ///
    /// Returns the stored value. A failed bound write leaves the previous value in place.
    pub fn set_setting(
        &mut self,
        name: &str,
        value: SettingValue,
    ) -> Result<SettingValue, SettingError> {
        let enabled = self.enabled;
        let resolver = &self.resolver;
        let setting = self
            .settings
            .iter_mut()
            .find(|s| s.name() == name)
            .ok_or_else(|| SettingError::UnknownSetting(name.to_owned()))?;

        let previous = setting.value();
        let value = setting.assign(value)?;
        if enabled {
            // SAFETY: the patch is enabled, so its bound settings are meant to be live
            if let Err(e) = unsafe { setting.write_live(resolver) } {
                setting.assign(previous)?;
                return Err(e);
            }
        }
        log::debug!("{}.{name} = {value:?}", self.metadata.name);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::SlotHook;

    /// Writes two byte ranges of a buffer in one transaction
    struct TwoWrites {
        /// Buffer start
        address: usize,
        /// Fail after the first write
        fail_midway: bool,
    }

    impl PatchBehavior for TwoWrites {
        fn install(&mut self, cx: &mut InstallContext<'_>) -> Result<(), PatchError> {
            let address = self.address;
            let fail_midway = self.fail_midway;
            cx.transaction(|tx| unsafe {
                tx.write(address, &[0xAA, 0xBB])?;
                if fail_midway {
                    return Err(PatchError::Other("second write refused".into()));
                }
                tx.write_u16(address + 4, 0xCCDD)?;
                Ok(())
            })
        }
    }

    /// Resolver that never needs the image
    fn resolver(version: GameVersion) -> Arc<AddressResolver> {
        Arc::new(AddressResolver::new(version, ModuleImage::new(0, 0)))
    }

    #[test]
    fn test_install_uninstall_round_trip() {
        let mut data = vec![1u8, 2, 3, 4, 5, 6];
        let address = data.as_mut_ptr() as usize;
        let mut patch = Patch::new(
            PatchMetadata::new("TwoWrites"),
            Box::new(TwoWrites {
                address,
                fail_midway: false,
            }),
            resolver(GameVersion::Retail),
        );

        assert!(patch.install());
        assert!(patch.install());
        assert_eq!(data, [0xAA, 0xBB, 3, 4, 0xDD, 0xCC]);

        assert!(patch.uninstall());
        assert!(patch.uninstall());
        assert_eq!(data, [1, 2, 3, 4, 5, 6]);
        assert!(!patch.is_enabled());
    }

    #[test]
    fn test_failed_install_leaves_no_trace() {
        let mut data = vec![1u8, 2, 3, 4, 5, 6];
        let address = data.as_mut_ptr() as usize;
        let mut patch = Patch::new(
            PatchMetadata::new("TwoWrites"),
            Box::new(TwoWrites {
                address,
                fail_midway: true,
            }),
            resolver(GameVersion::Retail),
        );

        assert!(!patch.install());
        assert!(!patch.is_enabled());
        assert_eq!(patch.last_error(), Some("second write refused"));
        assert_eq!(data, [1, 2, 3, 4, 5, 6]);
    }

    /// Panics halfway through
    struct Panicky {
        /// Buffer start
        address: usize,
    }

    impl PatchBehavior for Panicky {
        fn install(&mut self, cx: &mut InstallContext<'_>) -> Result<(), PatchError> {
            let address = self.address;
            cx.transaction(|tx| unsafe {
                tx.nop(address, 2)?;
                Ok(())
            })?;
            panic!("boom");
        }
    }

    #[test]
    /// A panicking body is contained and its committed writes are undone
    fn test_panic_is_contained() {
        let mut data = vec![1u8, 2];
        let address = data.as_mut_ptr() as usize;
        let mut patch = Patch::new(
            PatchMetadata::new("Panicky"),
            Box::new(Panicky { address }),
            resolver(GameVersion::Retail),
        );

        assert!(!patch.install());
        assert_eq!(patch.last_error(), Some("patch panicked: boom"));
        assert_eq!(data, [1, 2]);
    }

    #[test]
    fn test_unsupported_version() {
        let mut data = vec![0u8; 6];
        let address = data.as_mut_ptr() as usize;
        let mut patch = Patch::new(
            PatchMetadata::new("SteamOnly").versions(VersionMask::of(&[GameVersion::Steam])),
            Box::new(TwoWrites {
                address,
                fail_midway: false,
            }),
            resolver(GameVersion::Gog),
        );

        assert!(!patch.install());
        assert_eq!(patch.last_error(), Some("not supported on gog"));
        assert_eq!(data, [0u8; 6]);
    }

    /// Exposes one bound setting and writes nothing else
    struct Limiter {
        /// Bound address
        address: usize,
    }

    impl PatchBehavior for Limiter {
        fn settings(&self) -> Vec<PatchSetting> {
            vec![PatchSetting::int("Limit", 60, 0, 100)
                .bind(SettingBinding::address(self.address, ValueWidth::U8))]
        }

        fn install(&mut self, _cx: &mut InstallContext<'_>) -> Result<(), PatchError> {
            Ok(())
        }
    }

    #[test]
    /// Bound settings are written while enabled, rewritten on change and restored on uninstall
    fn test_bound_setting_lifecycle() {
        let mut data = vec![7u8];
        let address = data.as_mut_ptr() as usize;
        let mut patch = Patch::new(
            PatchMetadata::new("Limiter"),
            Box::new(Limiter { address }),
            resolver(GameVersion::Retail),
        );

        // disabled: stored only
        assert_eq!(
            patch.set_setting("Limit", SettingValue::Int(80)).unwrap(),
            SettingValue::Int(80)
        );
        assert_eq!(data, [7]);

        assert!(patch.install());
        assert_eq!(data, [80]);

        assert_eq!(
            patch.set_setting("Limit", SettingValue::Int(150)).unwrap(),
            SettingValue::Int(100)
        );
        assert_eq!(data, [100]);

        assert!(matches!(
            patch.set_setting("Limit", SettingValue::Bool(true)),
            Err(SettingError::TypeMismatch { .. })
        ));
        assert!(matches!(
            patch.set_setting("Nope", SettingValue::Int(1)),
            Err(SettingError::UnknownSetting(_))
        ));

        assert!(patch.uninstall());
        assert_eq!(data, [7]);
        assert_eq!(patch.setting("Limit"), Some(SettingValue::Int(100)));
    }

    #[test]
    /// An uninstall that cannot restore memory keeps the patch enabled and whole
    fn test_failed_uninstall_stays_enabled() {
        let mut data = vec![1u8, 2, 3, 4, 5, 6];
        let address = data.as_mut_ptr() as usize;
        let mut patch = Patch::new(
            PatchMetadata::new("TwoWrites"),
            Box::new(TwoWrites {
                address,
                fail_midway: false,
            }),
            resolver(GameVersion::Retail),
        );
        assert!(patch.install());

        // something else overwrote the patched bytes
        data[0] = 0x11;
        assert!(!patch.uninstall());
        assert!(patch.is_enabled());
        assert!(patch.last_error().unwrap().contains("unexpected bytes"));
        assert_eq!(data, [0x11, 0xBB, 3, 4, 0xDD, 0xCC]);

        data[0] = 0xAA;
        assert!(patch.uninstall());
        assert_eq!(data, [1, 2, 3, 4, 5, 6]);
    }

    /// Exposes a setting bound to an address that appears later
    struct Deferred {
        /// Published address, 0 while unavailable
        published: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl PatchBehavior for Deferred {
        fn settings(&self) -> Vec<PatchSetting> {
            let published = self.published.clone();
            let locate = move || {
                match published.load(std::sync::atomic::Ordering::SeqCst) {
                    0 => None,
                    address => Some(address),
                }
            };
            vec![PatchSetting::bool("Enabled", true)
                .bind(SettingBinding::deferred(locate, ValueWidth::U8))]
        }

        fn install(&mut self, _cx: &mut InstallContext<'_>) -> Result<(), PatchError> {
            Ok(())
        }
    }

    #[test]
    /// A bound setting whose address does not exist yet is written by a later update
    fn test_deferred_setting_applied_by_update() {
        let published = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut data = vec![0u8];
        let mut patch = Patch::new(
            PatchMetadata::new("Deferred"),
            Box::new(Deferred {
                published: published.clone(),
            }),
            resolver(GameVersion::Retail),
        );

        assert!(patch.install());
        assert!(patch.settings()[0].is_pending());

        published.store(data.as_mut_ptr() as usize, std::sync::atomic::Ordering::SeqCst);
        patch.update();
        assert!(patch.is_enabled());
        assert!(!patch.settings()[0].is_pending());
        assert_eq!(data, [1]);

        assert!(patch.uninstall());
        assert_eq!(data, [0]);
    }

    #[test]
    fn test_info_serializes() {
        let patch = Patch::new(
            PatchMetadata::new("Limiter")
                .display_name("Frame limiter")
                .category("Performance"),
            Box::new(Limiter { address: 0 }),
            resolver(GameVersion::Retail),
        );
        let info = toml::to_string(&patch.info()).unwrap();
        assert!(info.contains("display_name = \"Frame limiter\""));
        assert!(info.contains("enabled = false"));
    }

    /// Swaps a table entry, then writes over the first byte of that same entry
    struct HookThenWrite {
        /// Address of the hooked table entry
        slot: usize,
        /// Original-function slot
        original: &'static std::sync::atomic::AtomicUsize,
        /// Fail after the write
        fail_late: bool,
    }

    impl PatchBehavior for HookThenWrite {
        fn install(&mut self, cx: &mut InstallContext<'_>) -> Result<(), PatchError> {
            let batch =
                HookBatch::new().with(SlotHook::new("Entry", self.slot, 0xdead, self.original));
            unsafe { cx.hooks(batch)? };

            let (slot, fail_late) = (self.slot, self.fail_late);
            cx.transaction(|tx| unsafe {
                tx.write_u8(slot, 0x90)?;
                if fail_late {
                    return Err(PatchError::Other("late failure".into()));
                }
                Ok(())
            })
        }
    }

    #[test]
    /// A transaction failing after a hook batch attached detaches the batch again
    fn test_failed_install_detaches_hooks() {
        static ORIGINAL: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
        let mut table = vec![0x1111usize, 0x2222];
        let slot = unsafe { table.as_mut_ptr().add(1) } as usize;

        let mut patch = Patch::new(
            PatchMetadata::new("HookThenWrite"),
            Box::new(HookThenWrite {
                slot,
                original: &ORIGINAL,
                fail_late: true,
            }),
            resolver(GameVersion::Retail),
        );

        assert!(!patch.install());
        assert_eq!(patch.last_error(), Some("late failure"));
        assert!(!patch.is_stranded());
        assert_eq!(table, [0x1111, 0x2222]);
    }

    #[test]
    /// Uninstall undoes the later write before the earlier hook; the write sits on the hooked
    /// entry, so the other order could not restore it
    fn test_uninstall_reverses_mixed_changes() {
        static ORIGINAL: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);
        let mut table = vec![0x1111usize, 0x2222];
        let slot = unsafe { table.as_mut_ptr().add(1) } as usize;

        let mut patch = Patch::new(
            PatchMetadata::new("HookThenWrite"),
            Box::new(HookThenWrite {
                slot,
                original: &ORIGINAL,
                fail_late: false,
            }),
            resolver(GameVersion::Retail),
        );

        assert!(patch.install());
        assert_eq!(table[1], (0xdead & !0xff) | 0x90);
        assert_eq!(ORIGINAL.load(std::sync::atomic::Ordering::SeqCst), 0x2222);

        assert!(patch.uninstall());
        assert_eq!(table, [0x1111, 0x2222]);
    }

    /// Commits a write, then overwrites it behind the transaction's back and fails
    struct Tampered {
        /// Buffer start
        address: usize,
    }

    impl PatchBehavior for Tampered {
        fn install(&mut self, cx: &mut InstallContext<'_>) -> Result<(), PatchError> {
            let address = self.address;
            cx.transaction(|tx| unsafe {
                tx.write_u8(address, 0xAA)?;
                Ok(())
            })?;
            unsafe { *(address as *mut u8) = 0x11 };
            Err(PatchError::Other("gave up".into()))
        }
    }

    #[test]
    /// Changes a failed install cannot undo are kept, and a later uninstall removes them
    fn test_unrevertable_install_is_kept_for_uninstall() {
        let mut data = vec![1u8, 2];
        let address = data.as_mut_ptr() as usize;
        let mut patch = Patch::new(
            PatchMetadata::new("Tampered"),
            Box::new(Tampered { address }),
            resolver(GameVersion::Retail),
        );

        assert!(!patch.install());
        assert!(!patch.is_enabled());
        assert!(patch.is_stranded());
        assert_eq!(data, [0x11, 2]);

        // still tampered: uninstall retries and fails without losing the record
        assert!(!patch.uninstall());
        assert!(patch.is_stranded());

        data[0] = 0xAA;
        assert!(patch.uninstall());
        assert!(!patch.is_stranded());
        assert_eq!(data, [1, 2]);
    }
}
