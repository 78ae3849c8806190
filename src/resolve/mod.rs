//! # Resolve
//!
//! Turns a [`TargetDescriptor`] into a validated concrete address.
//!
//! Binary offsets are brittle across revisions, so an address is never trusted until the live bytes
//! at it match the descriptor's fingerprint. A mismatch is a loud, attributable failure instead of a
//! silent write into the wrong layout.

use std::collections::HashMap;
use std::ops::Range;

use parking_lot::Mutex;

use crate::error::ResolveError;
use crate::patcher::read_bytes;
use crate::scan::{ModuleImage, Pattern};
use crate::version::GameVersion;

/// Static description of how to find one patch site.
///
/// Two descriptors share a cached resolution only when every field matches, so unrelated patches
/// may reuse a name without seeing each other's addresses.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetDescriptor {
    /// Name used in logs and errors
    name: String,
    /// Absolute address per version
    addresses: Vec<(GameVersion, usize)>,
    /// Pattern scanned for when the table has no entry
    pattern: Option<Pattern>,
    /// Added to the match address
    pattern_offset: isize,
    /// Follow a rel32 displacement inside the matched instruction: (displacement offset, instruction length)
    rip_relative: Option<(usize, usize)>,
    /// Bounds the scan to this range of image offsets
    scan_window: Option<Range<usize>>,
    /// Bytes that must be present at the chosen address
    expected: Option<Vec<u8>>,
}

impl TargetDescriptor {
    /// Empty descriptor; add an address table entry or a pattern before resolving it
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            addresses: Vec::new(),
            pattern: None,
            pattern_offset: 0,
            rip_relative: None,
            scan_window: None,
            expected: None,
        }
    }

    /// Adds a fixed address for `version`
    pub fn at(mut self, version: GameVersion, address: usize) -> Self {
        self.addresses.retain(|(v, _)| *v != version);
        self.addresses.push((version, address));
        self
    }

    /// Sets the fallback pattern
    pub fn pattern(mut self, pattern: Pattern) -> Self {
        self.pattern = Some(pattern);
        self
    }

    /// Offset applied to a pattern match
    pub fn offset(mut self, offset: isize) -> Self {
        self.pattern_offset = offset;
        self
    }

    /// After a pattern match, reads the rel32 at `match + displacement` and resolves it relative to
    /// the end of the instruction (`match + instruction_len`). Applied before [`offset`](Self::offset).
    pub fn rip_relative(mut self, displacement: usize, instruction_len: usize) -> Self {
        self.rip_relative = Some((displacement, instruction_len));
        self
    }

    /// Restricts the pattern scan to `window`, in offsets from the image base
    pub fn within(mut self, window: Range<usize>) -> Self {
        self.scan_window = Some(window);
        self
    }

    /// Fingerprint the chosen address must carry
    pub fn expect(mut self, bytes: &[u8]) -> Self {
        self.expected = Some(bytes.to_vec());
        self
    }

    /// Descriptor name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Fixed address for `version`, if the table has one
    pub fn address_for(&self, version: GameVersion) -> Option<usize> {
        self.addresses
            .iter()
            .find(|(v, _)| *v == version)
            .map(|(_, address)| *address)
    }

    /// Fingerprint, if any
    pub fn expected(&self) -> Option<&[u8]> {
        self.expected.as_deref()
    }

    /// Whether at least one resolution strategy is configured
    pub fn has_strategy(&self) -> bool {
        !self.addresses.is_empty() || self.pattern.is_some()
    }
}

/// A resolved target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedAddress {
    /// Concrete address
    pub address: usize,
    /// Whether a fingerprint was checked
    pub validated: bool,
}

/// Resolves descriptors for one version and image, remembering every success
pub struct AddressResolver {
    /// Version selecting address table entries
    version: GameVersion,
    /// Image scanned for patterns
    image: ModuleImage,
    /// First successful resolution per descriptor
    cache: Mutex<HashMap<TargetDescriptor, ResolvedAddress>>,
}

impl AddressResolver {
    /// Creates a resolver with an empty cache
    pub fn new(version: GameVersion, image: ModuleImage) -> Self {
        Self {
            version,
            image,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Version this resolver selects for
    pub fn version(&self) -> GameVersion {
        self.version
    }

    /// Image scanned for patterns
    pub fn image(&self) -> &ModuleImage {
        &self.image
    }

    /// Cached resolution for `descriptor`
    pub fn cached(&self, descriptor: &TargetDescriptor) -> Option<ResolvedAddress> {
        self.cache.lock().get(descriptor).copied()
    }

    /// Resolves `descriptor`, returning the cached result if it already resolved once.
    ///
    /// Failures are not cached, so a target the host has not set up yet can resolve later.
    pub fn resolve(&self, descriptor: &TargetDescriptor) -> Result<ResolvedAddress, ResolveError> {
        if let Some(resolved) = self.cached(descriptor) {
            return Ok(resolved);
        }

        // scan and validate without holding the lock
        let resolved = self.resolve_uncached(descriptor)?;

        let mut cache = self.cache.lock();
        let resolved = *cache.entry(descriptor.clone()).or_insert(resolved);
        drop(cache);

        log::debug!(
            "Resolved {} to {:#x} (validated: {})",
            descriptor.name(),
            resolved.address,
            resolved.validated
        );
        Ok(resolved)
    }

    /// Picks a candidate and validates it
    fn resolve_uncached(
        &self,
        descriptor: &TargetDescriptor,
    ) -> Result<ResolvedAddress, ResolveError> {
        if !descriptor.has_strategy() {
            return Err(ResolveError::NoStrategy {
                name: descriptor.name.clone(),
            });
        }

        let address = match descriptor.address_for(self.version) {
            Some(address) => address,
            None => self.scan(descriptor)?,
        };

        let validated = match descriptor.expected() {
            Some(expected) => {
                let found =
                    read_bytes(address, expected.len()).map_err(|_| ResolveError::Unreadable {
                        name: descriptor.name.clone(),
                        address,
                    })?;
                if found != expected {
                    log::warn!(
                        "Target {} at {:#x} does not match its fingerprint",
                        descriptor.name,
                        address
                    );
                    return Err(ResolveError::Validation {
                        name: descriptor.name.clone(),
                        address,
                        expected: expected.to_vec(),
                        found,
                    });
                }
                true
            }
            None => false,
        };

        Ok(ResolvedAddress { address, validated })
    }

    /// Pattern-scans the image and applies the descriptor's post-match adjustments
    fn scan(&self, descriptor: &TargetDescriptor) -> Result<usize, ResolveError> {
        let not_found = || ResolveError::NotFound {
            name: descriptor.name.clone(),
            version: self.version,
        };
        let pattern = descriptor.pattern.as_ref().ok_or_else(not_found)?;

        let window = descriptor
            .scan_window
            .clone()
            .unwrap_or(0..self.image.size());
        let found = self
            .image
            .scan_within(pattern, window)
            .ok_or_else(not_found)?;

        let found = match descriptor.rip_relative {
            Some((displacement, instruction_len)) => {
                let raw = read_bytes(found + displacement, 4).map_err(|_| {
                    ResolveError::Unreadable {
                        name: descriptor.name.clone(),
                        address: found + displacement,
                    }
                })?;
                let rel = i32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]);
                (found + instruction_len).wrapping_add_signed(rel as isize)
            }
            None => found,
        };

        Ok(found.wrapping_add_signed(descriptor.pattern_offset))
    }
}
