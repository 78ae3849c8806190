//! # Scan
//!
//! Byte-pattern matching with wildcards over a memory region.
//!
//! Patterns are written the way they come out of a disassembler, e.g. `"48 8B 05 ?? ?? ?? ?? 48 85 C0"`.
//! Scans are a plain linear walk; they only run a handful of times per process.

use std::fmt;
use std::str::FromStr;

use crate::error::PatternError;

mod image;

pub use image::ModuleImage;

/// One position of a pattern
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PatternByte {
    /// Byte to match when `exact` is set
    pub value: u8,
    /// `false` for a wildcard ("don't care") position
    pub exact: bool,
}

impl PatternByte {
    /// Position that must equal `value`
    pub const fn exact(value: u8) -> Self {
        Self { value, exact: true }
    }

    /// Position that matches anything
    pub const fn wildcard() -> Self {
        Self {
            value: 0,
            exact: false,
        }
    }

    /// Whether `byte` satisfies this position
    #[inline]
    pub fn matches(self, byte: u8) -> bool {
        !self.exact || self.value == byte
    }
}

/// A non-empty byte pattern
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Pattern {
    /// Pattern positions, never empty
    bytes: Vec<PatternByte>,
}

impl Pattern {
    /// Builds a pattern from positions
    pub fn new(bytes: Vec<PatternByte>) -> Result<Self, PatternError> {
        if bytes.is_empty() {
            return Err(PatternError::Empty);
        }
        Ok(Self { bytes })
    }

    /// Builds a pattern where every byte must match exactly
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, PatternError> {
        Self::new(bytes.iter().copied().map(PatternByte::exact).collect())
    }

    /// Parses whitespace separated hex bytes, with `?` or `??` as wildcards
    pub fn parse(pattern: &str) -> Result<Self, PatternError> {
        let bytes = pattern
            .split_whitespace()
            .enumerate()
            .map(|(position, token)| match token {
                "?" | "??" => Ok(PatternByte::wildcard()),
                hex if hex.len() == 2 => u8::from_str_radix(hex, 16)
                    .map(PatternByte::exact)
                    .map_err(|_| PatternError::InvalidToken {
                        token: token.to_owned(),
                        position,
                    }),
                _ => Err(PatternError::InvalidToken {
                    token: token.to_owned(),
                    position,
                }),
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(bytes)
    }

    /// Number of positions
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Always `false`; patterns are never empty
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Pattern positions
    pub fn bytes(&self) -> &[PatternByte] {
        &self.bytes
    }

    /// Whether `window` starts with a match for this pattern
    pub fn matches(&self, window: &[u8]) -> bool {
        window.len() >= self.bytes.len()
            && self
                .bytes
                .iter()
                .zip(window)
                .all(|(pattern, byte)| pattern.matches(*byte))
    }

    /// Offset of the first match in `haystack`
    pub fn find(&self, haystack: &[u8]) -> Option<usize> {
        if self.bytes.len() > haystack.len() {
            return None;
        }
        (0..=haystack.len() - self.bytes.len()).find(|&offset| self.matches(&haystack[offset..]))
    }

    /// Scans raw memory for the first match and returns its address
    ///
    /// # Safety
    ///
    /// `[base, base + size)` must be readable for the duration of the scan
    pub unsafe fn scan(&self, base: usize, size: usize) -> Option<usize> {
        let region = std::slice::from_raw_parts(base as *const u8, size);
        self.find(region).map(|offset| base + offset)
    }
}

impl FromStr for Pattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, byte) in self.bytes.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if byte.exact {
                write!(f, "{:02X}", byte.value)?;
            } else {
                f.write_str("??")?;
            }
        }
        Ok(())
    }
}
