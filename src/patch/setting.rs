//! Typed, bounded patch settings, optionally bound to a live address

use std::fmt;
use std::sync::Arc;

use serde::Serialize;

use crate::error::SettingError;
use crate::patcher::PatchLocation;
use crate::resolve::{AddressResolver, TargetDescriptor};

/// Type and bounds of a setting
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum SettingKind {
    /// On/off switch
    Bool,
    /// Integer within `[min, max]`
    Int {
        /// Lower bound
        min: i64,
        /// Upper bound
        max: i64,
    },
    /// Float within `[min, max]`
    Float {
        /// Lower bound
        min: f64,
        /// Upper bound
        max: f64,
    },
    /// One of a fixed list of options
    Enum {
        /// Option names, stored value is an index
        options: &'static [&'static str],
    },
}

impl SettingKind {
    /// Human readable name, used in type mismatch errors
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Bool => "a boolean",
            Self::Int { .. } => "an integer",
            Self::Float { .. } => "a number",
            Self::Enum { .. } => "an option",
        }
    }

    /// Brings `value` into this kind's bounds, or `None` if it is the wrong type
    pub fn clamp(&self, value: SettingValue) -> Option<SettingValue> {
        match (self, value) {
            (Self::Bool, SettingValue::Bool(b)) => Some(SettingValue::Bool(b)),
            (Self::Int { min, max }, SettingValue::Int(v)) => {
                Some(SettingValue::Int(v.max(*min).min(*max)))
            }
            (Self::Float { min, max }, SettingValue::Float(v)) if v.is_nan() => {
                Some(SettingValue::Float(*min))
            }
            (Self::Float { min, max }, SettingValue::Float(v)) => {
                Some(SettingValue::Float(v.max(*min).min(*max)))
            }
            (Self::Float { .. }, SettingValue::Int(v)) => self.clamp(SettingValue::Float(v as f64)),
            (Self::Enum { options }, SettingValue::Enum(i)) => {
                Some(SettingValue::Enum(i.min(options.len().saturating_sub(1))))
            }
            _ => None,
        }
    }
}

/// Current or default value of a setting
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(untagged)]
pub enum SettingValue {
    /// Boolean value
    Bool(bool),
    /// Integer value
    Int(i64),
    /// Float value
    Float(f64),
    /// Index into the enum's options
    Enum(usize),
}

impl SettingValue {
    /// Value as an integer; floats truncate, booleans are 0 or 1
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Bool(b) => b as i64,
            Self::Int(v) => v,
            Self::Float(v) => v as i64,
            Self::Enum(i) => i as i64,
        }
    }

    /// Value as a float
    pub fn as_f64(self) -> f64 {
        match self {
            Self::Float(v) => v,
            other => other.as_i64() as f64,
        }
    }

    /// Value as a boolean; any non-zero number is `true`
    pub fn as_bool(self) -> bool {
        match self {
            Self::Bool(b) => b,
            Self::Float(v) => v != 0.0,
            other => other.as_i64() != 0,
        }
    }
}

impl From<bool> for SettingValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for SettingValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

/// In-memory encoding of a bound setting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ValueWidth {
    /// One byte; booleans are 0 or 1
    U8,
    /// Little-endian `i32`
    I32,
    /// Little-endian `u32`
    U32,
    /// Little-endian `f32`
    F32,
    /// Little-endian `f64`
    F64,
}

impl ValueWidth {
    /// Number of bytes written
    pub fn len(self) -> usize {
        match self {
            Self::U8 => 1,
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::F64 => 8,
        }
    }

    /// Encodes `value` at this width
    pub fn encode(self, value: SettingValue) -> Vec<u8> {
        match self {
            Self::U8 => vec![value.as_i64() as u8],
            Self::I32 => (value.as_i64() as i32).to_le_bytes().to_vec(),
            Self::U32 => (value.as_i64() as u32).to_le_bytes().to_vec(),
            Self::F32 => (value.as_f64() as f32).to_le_bytes().to_vec(),
            Self::F64 => value.as_f64().to_le_bytes().to_vec(),
        }
    }
}

/// Where a bound setting lives
#[derive(Clone)]
pub enum BindingTarget {
    /// Fixed address
    Address(usize),
    /// Resolved through the patch's resolver
    Target(TargetDescriptor),
    /// Computed on demand; `None` while the host has not created the object yet
    Deferred(Arc<dyn Fn() -> Option<usize> + Send + Sync>),
}

impl fmt::Debug for BindingTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Address(address) => write!(f, "Address({address:#x})"),
            Self::Target(descriptor) => write!(f, "Target({})", descriptor.name()),
            Self::Deferred(_) => f.write_str("Deferred"),
        }
    }
}

/// Live address a setting's value is written to
#[derive(Debug, Clone)]
pub struct SettingBinding {
    /// Where the value goes
    target: BindingTarget,
    /// How the value is encoded
    width: ValueWidth,
}

impl SettingBinding {
    /// Binds to a fixed address
    pub fn address(address: usize, width: ValueWidth) -> Self {
        Self {
            target: BindingTarget::Address(address),
            width,
        }
    }

    /// Binds to a resolved target
    pub fn target(descriptor: TargetDescriptor, width: ValueWidth) -> Self {
        Self {
            target: BindingTarget::Target(descriptor),
            width,
        }
    }

    /// Binds to an address computed on demand
    pub fn deferred(
        locate: impl Fn() -> Option<usize> + Send + Sync + 'static,
        width: ValueWidth,
    ) -> Self {
        Self {
            target: BindingTarget::Deferred(Arc::new(locate)),
            width,
        }
    }

    /// Where the value goes
    pub fn target_kind(&self) -> &BindingTarget {
        &self.target
    }

    /// How the value is encoded
    pub fn width(&self) -> ValueWidth {
        self.width
    }

    /// Current address, or `None` if it is not available yet
    fn locate(&self, resolver: &AddressResolver) -> Option<usize> {
        match &self.target {
            BindingTarget::Address(address) => Some(*address),
            BindingTarget::Target(descriptor) => match resolver.resolve(descriptor) {
                Ok(resolved) => Some(resolved.address),
                Err(e) => {
                    log::debug!("Setting target {} unavailable: {e}", descriptor.name());
                    None
                }
            },
            BindingTarget::Deferred(locate) => locate(),
        }
    }
}

/// One typed, bounded setting of a patch
#[derive(Debug, Clone)]
pub struct PatchSetting {
    /// Key, unique within the patch
    name: &'static str,
    /// Free-text description
    description: &'static str,
    /// Type and bounds
    kind: SettingKind,
    /// Compiled-in default
    default: SettingValue,
    /// Current value, always within bounds
    value: SettingValue,
    /// Optional live address
    binding: Option<SettingBinding>,
    /// Bound write currently in memory
    live: Option<PatchLocation>,
    /// Bound write waiting for its address to become available
    pending: bool,
}

impl PatchSetting {
    /// Creates a setting; `default` is clamped into `kind`'s bounds
    fn new(name: &'static str, kind: SettingKind, default: SettingValue) -> Self {
        let default = kind.clamp(default).unwrap_or(default);
        Self {
            name,
            description: "",
            kind,
            default,
            value: default,
            binding: None,
            live: None,
            pending: false,
        }
    }

    /// Boolean setting
    pub fn bool(name: &'static str, default: bool) -> Self {
        Self::new(name, SettingKind::Bool, SettingValue::Bool(default))
    }

    /// Integer setting within `[min, max]`
    ///
    /// Bounds given in the wrong order are swapped.
    pub fn int(name: &'static str, default: i64, min: i64, max: i64) -> Self {
        let (min, max) = (min.min(max), min.max(max));
        Self::new(name, SettingKind::Int { min, max }, SettingValue::Int(default))
    }

    /// Float setting within `[min, max]`
    ///
    /// Bounds given in the wrong order are swapped.
    pub fn float(name: &'static str, default: f64, min: f64, max: f64) -> Self {
        let (min, max) = if min <= max { (min, max) } else { (max, min) };
        Self::new(
            name,
            SettingKind::Float { min, max },
            SettingValue::Float(default),
        )
    }

    /// Choice among `options`; the default is an index
    pub fn choice(name: &'static str, default: usize, options: &'static [&'static str]) -> Self {
        Self::new(name, SettingKind::Enum { options }, SettingValue::Enum(default))
    }

    /// Sets the description
    pub fn describe(mut self, description: &'static str) -> Self {
        self.description = description;
        self
    }

    /// Binds the value to a live address
    pub fn bind(mut self, binding: SettingBinding) -> Self {
        self.binding = Some(binding);
        self
    }

    /// Key of the setting
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Free-text description
    pub fn description(&self) -> &'static str {
        self.description
    }

    /// Type and bounds
    pub fn kind(&self) -> &SettingKind {
        &self.kind
    }

    /// Compiled-in default
    pub fn default_value(&self) -> SettingValue {
        self.default
    }

    /// Current value
    pub fn value(&self) -> SettingValue {
        self.value
    }

    /// Whether the value differs from the default
    pub fn is_modified(&self) -> bool {
        self.value != self.default
    }

    /// Whether a bound write is waiting for its address
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Live binding, if any
    pub fn binding(&self) -> Option<&SettingBinding> {
        self.binding.as_ref()
    }

    /// Whether the bound value is currently written to memory
    pub(crate) fn is_live(&self) -> bool {
        self.live.is_some()
    }

    /// Clamps and stores `value` without touching memory
    pub(crate) fn assign(&mut self, value: SettingValue) -> Result<SettingValue, SettingError> {
        let value = self
            .kind
            .clamp(value)
            .ok_or_else(|| SettingError::TypeMismatch {
                name: self.name.to_owned(),
                expected: self.kind.type_name(),
            })?;
        self.value = value;
        Ok(value)
    }

    /// Writes the current value to the bound address.
    ///
    /// Returns `Ok(false)` and marks the setting pending when the address is not available yet.
    /// Unbound settings are a no-op.
    ///
    /// # Safety
    ///
    /// Overwriting the bound address must be sound for the program
    pub(crate) unsafe fn write_live(
        &mut self,
        resolver: &AddressResolver,
    ) -> Result<bool, SettingError> {
        let Some(binding) = &self.binding else {
            return Ok(true);
        };
        let Some(address) = binding.locate(resolver) else {
            if !self.pending {
                log::warn!("Setting {} has no address yet, deferring", self.name);
            }
            self.pending = true;
            return Ok(false);
        };

        let bytes = binding.width.encode(self.value);
        let write_error = |source| SettingError::Write {
            name: self.name.to_owned(),
            source,
        };
        match &mut self.live {
            Some(live) if live.address() == address => {
                live.retarget(bytes).map_err(write_error)?;
            }
            live => {
                // the binding moved; put the old address back before writing the new one
                if let Some(old) = live.as_ref() {
                    old.restore().map_err(write_error)?;
                }
                *live = None;
                let location = PatchLocation::capture(address, bytes).map_err(write_error)?;
                location.apply().map_err(write_error)?;
                *live = Some(location);
            }
        }
        self.pending = false;
        log::debug!("Wrote setting {} = {:?} at {address:#x}", self.name, self.value);
        Ok(true)
    }

    /// Restores whatever the bound write replaced
    ///
    /// # Safety
    ///
    /// Reverting the bound address must be sound for the program
    pub(crate) unsafe fn restore_live(&mut self) -> Result<(), SettingError> {
        self.pending = false;
        if let Some(live) = &self.live {
            live.restore().map_err(|source| SettingError::Write {
                name: self.name.to_owned(),
                source,
            })?;
            self.live = None;
        }
        Ok(())
    }

    /// Value in its persisted form; enums persist by option name
    pub(crate) fn to_toml(&self) -> toml::Value {
        match (self.value, &self.kind) {
            (SettingValue::Enum(i), SettingKind::Enum { options }) => match options.get(i) {
                Some(option) => toml::Value::String((*option).to_owned()),
                None => toml::Value::Integer(i as i64),
            },
            (SettingValue::Bool(b), _) => toml::Value::Boolean(b),
            (SettingValue::Int(v), _) => toml::Value::Integer(v),
            (SettingValue::Float(v), _) => toml::Value::Float(v),
            (SettingValue::Enum(i), _) => toml::Value::Integer(i as i64),
        }
    }

    /// Interprets a persisted value for this setting's kind
    pub(crate) fn parse_toml(&self, value: &toml::Value) -> Option<SettingValue> {
        match (&self.kind, value) {
            (SettingKind::Bool, toml::Value::Boolean(b)) => Some(SettingValue::Bool(*b)),
            (SettingKind::Int { .. }, toml::Value::Integer(v)) => Some(SettingValue::Int(*v)),
            (SettingKind::Float { .. }, toml::Value::Float(v)) => Some(SettingValue::Float(*v)),
            (SettingKind::Float { .. }, toml::Value::Integer(v)) => {
                Some(SettingValue::Float(*v as f64))
            }
            (SettingKind::Enum { options }, toml::Value::String(name)) => options
                .iter()
                .position(|option| option.eq_ignore_ascii_case(name))
                .map(SettingValue::Enum),
            (SettingKind::Enum { .. }, toml::Value::Integer(i)) => {
                usize::try_from(*i).ok().map(SettingValue::Enum)
            }
            _ => None,
        }
    }
}

/// Presentation view of a setting
#[derive(Debug, Clone, Serialize)]
pub struct SettingInfo {
    /// Key of the setting
    pub name: &'static str,
    /// Free-text description
    pub description: &'static str,
    /// Type and bounds
    pub kind: SettingKind,
    /// Compiled-in default
    pub default: SettingValue,
    /// Current value
    pub value: SettingValue,
    /// Whether a bound write is waiting for its address
    pub pending: bool,
}

impl From<&PatchSetting> for SettingInfo {
    fn from(setting: &PatchSetting) -> Self {
        Self {
            name: setting.name,
            description: setting.description,
            kind: setting.kind.clone(),
            default: setting.default,
            value: setting.value,
            pending: setting.pending,
        }
    }
}
