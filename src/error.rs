//! # Errors
//!
//! Every failure the engine can report. Low-level primitives return these through `Result`;
//! the [`Patch`](crate::patch::Patch) boundary flattens them into a `bool` plus a message.

use thiserror::Error;

use crate::alloc::AllocError;
use crate::version::GameVersion;

/// Errors while parsing a byte pattern
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    /// Pattern contained no bytes at all
    #[error("pattern is empty")]
    Empty,
    /// A token was neither a hex byte nor a wildcard
    #[error("invalid pattern token `{token}` at position {position}")]
    InvalidToken {
        /// Offending token
        token: String,
        /// Zero-based token index
        position: usize,
    },
}

/// Errors while locating the host module image
#[derive(Debug, Error)]
pub enum ImageError {
    /// The host executable path could not be determined or read
    #[error("unable to identify host module: {0}")]
    Io(#[from] std::io::Error),
    /// No mapping belonging to the host executable was found
    #[error("host module is not mapped")]
    NotMapped,
    /// The platform offers no way to query the host module
    #[error("host module lookup is not supported on this platform")]
    Unsupported,
}

/// Resolution failures: the target could not be found or failed validation
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolveError {
    /// Descriptor has neither an address table nor a pattern
    #[error("target `{name}` has no address table and no pattern")]
    NoStrategy {
        /// Descriptor name
        name: String,
    },
    /// No table entry for this version and the pattern (if any) did not match
    #[error("target `{name}` not found for version {version}")]
    NotFound {
        /// Descriptor name
        name: String,
        /// Version being resolved for
        version: GameVersion,
    },
    /// The candidate address could not be read
    #[error("target `{name}` at {address:#x} is not readable")]
    Unreadable {
        /// Descriptor name
        name: String,
        /// Candidate address
        address: usize,
    },
    /// The live bytes at the candidate address do not match the fingerprint
    #[error("target `{name}` at {address:#x} failed validation: expected {expected:02X?}, found {found:02X?}")]
    Validation {
        /// Descriptor name
        name: String,
        /// Candidate address
        address: usize,
        /// Fingerprint from the descriptor
        expected: Vec<u8>,
        /// Bytes actually present
        found: Vec<u8>,
    },
}

/// Memory access and write verification failures
#[derive(Debug, Error)]
pub enum MemoryError {
    /// Part of the range is not mapped/committed
    #[error("memory at {address:#x} (+{len}) is not committed")]
    Uncommitted {
        /// Start of the range
        address: usize,
        /// Length of the range
        len: usize,
    },
    /// Part of the range is not readable, or is a guard page
    #[error("memory at {address:#x} has protection {protection:?} which does not permit access")]
    Protection {
        /// Start of the offending region
        address: usize,
        /// Protection currently in effect
        protection: region::Protection,
    },
    /// The bytes in memory are not what the caller expected to overwrite
    #[error("unexpected bytes at {address:#x}: expected {expected:02X?}, found {found:02X?}")]
    UnexpectedBytes {
        /// Start of the range
        address: usize,
        /// Bytes the caller expected
        expected: Vec<u8>,
        /// Bytes actually present
        found: Vec<u8>,
    },
    /// Memory does not hold the bytes the write expected; reported without copying them
    #[error("memory at {address:#x} (+{len}) does not hold the expected bytes")]
    Mismatch {
        /// Start of the range
        address: usize,
        /// Length of the range
        len: usize,
    },
    /// A write failed part-way and the original bytes could not be put back
    #[error("write at {address:#x} failed part-way and could not be undone")]
    Torn {
        /// Start of the range
        address: usize,
    },
    /// Read-back after a write did not match what was written
    #[error("write verification failed at {address:#x}")]
    Verification {
        /// Start of the range
        address: usize,
    },
    /// A rel32 displacement cannot reach the destination
    #[error("rel32 from {from:#x} cannot reach {to:#x}")]
    OutOfRange {
        /// Instruction address
        from: usize,
        /// Destination address
        to: usize,
    },
    /// Error when querying or setting memory protections
    #[error("error setting memory protections: {0}")]
    Region(#[from] region::Error),
}

/// Failure of a single hook
#[derive(Debug, Error)]
pub enum HookError {
    /// Error writing the redirect
    #[error("{0}")]
    Memory(#[from] MemoryError),
    /// Error allocating the trampoline
    #[error("{0}")]
    Alloc(#[from] AllocError),
    /// Error re-encoding the stolen instructions
    #[error("{0}")]
    Encode(#[from] iced_x86::IcedError),
    /// An undecodable instruction sits inside the redirect window
    #[error("invalid instruction at {address:#x}")]
    InvalidInstruction {
        /// Address of the instruction
        address: usize,
    },
    /// Target function ends before the redirect fits
    #[error("function at {address:#x} is too short to hook ({len} bytes)")]
    TooShort {
        /// Target address
        address: usize,
        /// Bytes available before the function returns
        len: usize,
    },
    /// Relocated instructions outgrew the trampoline
    #[error("relocated code for {address:#x} does not fit its trampoline")]
    TrampolineOverflow {
        /// Target address
        address: usize,
    },
    /// `attach` was called without a successful `prepare`
    #[error("hook was not prepared")]
    NotPrepared,
}

/// Hook batch failures; the whole batch is aborted
#[derive(Debug, Error)]
pub enum HookBatchError {
    /// One hook could not be attached; none of the batch is active
    #[error("failed to attach hook #{index} `{name}`: {source}")]
    Attach {
        /// Position in the batch
        index: usize,
        /// Hook name
        name: String,
        /// Underlying failure
        source: HookError,
    },
    /// One hook could not be detached; the whole batch stays attached
    #[error("failed to detach hook #{index} `{name}`: {source}")]
    Detach {
        /// Position in the batch
        index: usize,
        /// Hook name
        name: String,
        /// Underlying failure
        source: HookError,
    },
    /// Undoing a partial attach or detach failed; the batch is partly applied and stays attached
    #[error("hook #{index} `{name}` could not be rolled back after `{cause}` failed: {source}")]
    Stuck {
        /// Position in the batch of the hook left out of step
        index: usize,
        /// Hook name
        name: String,
        /// Name of the hook whose failure started the rollback
        cause: String,
        /// Why the rollback step failed
        source: HookError,
    },
}

/// Persisted state could not be read or written
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Document is not valid TOML or has the wrong shape
    #[error("failed to parse patch state: {0}")]
    Parse(#[from] toml::de::Error),
    /// State could not be serialized
    #[error("failed to serialize patch state: {0}")]
    Serialize(#[from] toml::ser::Error),
    /// File could not be read or written
    #[error("{0}")]
    Io(#[from] std::io::Error),
}

/// Setting lookups and updates
#[derive(Debug, Error)]
pub enum SettingError {
    /// No patch by that name
    #[error("unknown patch `{0}`")]
    UnknownPatch(String),
    /// The patch has no setting by that name
    #[error("unknown setting `{0}`")]
    UnknownSetting(String),
    /// Value type does not match the setting kind
    #[error("setting `{name}` expects {expected}")]
    TypeMismatch {
        /// Setting name
        name: String,
        /// Human readable kind
        expected: &'static str,
    },
    /// Bound write failed; the stored value is unchanged
    #[error("failed to write setting `{name}`: {source}")]
    Write {
        /// Setting name
        name: String,
        /// Underlying failure
        source: MemoryError,
    },
}

/// Anything that can make a patch fail to install
#[derive(Debug, Error)]
pub enum PatchError {
    /// A pattern literal did not parse
    #[error("{0}")]
    Pattern(#[from] PatternError),
    /// Target resolution failed
    #[error("{0}")]
    Resolve(#[from] ResolveError),
    /// Memory write failed
    #[error("{0}")]
    Memory(#[from] MemoryError),
    /// Hook batch failed
    #[error("{0}")]
    Hooks(#[from] HookBatchError),
    /// Setting could not be applied
    #[error("{0}")]
    Setting(#[from] SettingError),
    /// The patch does not support the running version
    #[error("not supported on {0}")]
    UnsupportedVersion(GameVersion),
    /// The patch body panicked
    #[error("patch panicked: {0}")]
    Panicked(String),
    /// Patch-specific failure
    #[error("{0}")]
    Other(String),
}
