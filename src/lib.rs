#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::missing_crate_level_docs)]
#![doc = include_str!("../README.md")]

pub mod alloc;
pub mod code;
pub mod error;
pub mod hook;
pub mod manager;
pub mod patch;
pub mod patcher;
pub mod resolve;
pub mod scan;
pub mod version;

pub use error::{
    ConfigError, HookBatchError, HookError, ImageError, MemoryError, PatchError, PatternError,
    ResolveError, SettingError,
};
pub use hook::{Hook, HookBatch, InlineHook, SlotHook};
pub use manager::{PatchFactory, PatchManager, PatchRegistry, RegistryEntry};
pub use patch::{
    BindingTarget, InstallContext, Patch, PatchBehavior, PatchInfo, PatchMetadata, PatchSetting,
    SettingBinding, SettingInfo, SettingKind, SettingValue, ValueWidth,
};
pub use patcher::{PatchLocation, Transaction};
pub use resolve::{AddressResolver, ResolvedAddress, TargetDescriptor};
pub use scan::{ModuleImage, Pattern, PatternByte};
pub use version::{GameVersion, VersionMask};
