//! This module contains the undo record for a byte patch

use super::mem::{read_bytes, write_checked, write_exact};
use crate::error::MemoryError;

/// One captured write: the bytes that were at `address` and the bytes that replace them.
///
/// The pre-image is captured before anything is written, so a location can always be put back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchLocation {
    /// Start of the patched range
    address: usize,
    /// Bytes present before the patch
    original: Vec<u8>,
    /// Bytes written by the patch
    patched: Vec<u8>,
}

impl PatchLocation {
    /// Captures the current bytes at `address` without writing anything
    pub fn capture(address: usize, patched: Vec<u8>) -> Result<Self, MemoryError> {
        let original = read_bytes(address, patched.len())?;
        Ok(Self {
            address,
            original,
            patched,
        })
    }

    /// Start of the patched range
    pub fn address(&self) -> usize {
        self.address
    }

    /// Bytes present before the patch
    pub fn original(&self) -> &[u8] {
        &self.original
    }

    /// Bytes written by the patch
    pub fn patched(&self) -> &[u8] {
        &self.patched
    }

    /// Length of the patched range
    pub fn len(&self) -> usize {
        self.patched.len()
    }

    /// Whether the record covers no bytes
    pub fn is_empty(&self) -> bool {
        self.patched.is_empty()
    }

    /// Writes the patch. Fails without writing unless memory still holds the pre-image.
    ///
    /// # Safety
    ///
    /// Overwriting the range must be sound for the program
    pub unsafe fn apply(&self) -> Result<(), MemoryError> {
        write_checked(self.address, &self.original, &self.patched)
    }

    /// Puts the pre-image back. Fails without writing unless memory still holds the patch.
    ///
    /// # Safety
    ///
    /// Reverting must be sound for the program
    pub unsafe fn restore(&self) -> Result<(), MemoryError> {
        write_checked(self.address, &self.patched, &self.original)
    }

    /// [`apply`](Self::apply) without allocating or logging, for use while other threads are
    /// suspended. A mismatch is reported as [`MemoryError::Mismatch`].
    ///
    /// # Safety
    ///
    /// Overwriting the range must be sound for the program
    pub(crate) unsafe fn apply_frozen(&self) -> Result<(), MemoryError> {
        write_exact(self.address, &self.original, &self.patched)
    }

    /// [`restore`](Self::restore) without allocating or logging
    ///
    /// # Safety
    ///
    /// Reverting must be sound for the program
    pub(crate) unsafe fn restore_frozen(&self) -> Result<(), MemoryError> {
        write_exact(self.address, &self.patched, &self.original)
    }

    /// Replaces an applied patch with new bytes of the same length, keeping the pre-image
    ///
    /// # Safety
    ///
    /// Overwriting the range must be sound for the program
    pub(crate) unsafe fn retarget(&mut self, patched: Vec<u8>) -> Result<(), MemoryError> {
        write_checked(self.address, &self.patched, &patched)?;
        self.patched = patched;
        Ok(())
    }
}
