//! This module contains the transaction: an ordered group of writes committed or rolled back as a unit

use super::byte::PatchLocation;
use crate::code::x64;
use crate::error::MemoryError;

/// Where a transaction is in its life
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Accepting writes; rolled back if dropped
    Open,
    /// Finalized; the writes stay in place
    Committed,
    /// Every write has been undone
    RolledBack,
}

/// Ordered list of applied writes with their pre-images.
///
/// Writes apply in program order and roll back in reverse order, so overlapping writes unwind
/// correctly. An open transaction that goes out of scope is rolled back.
#[derive(Debug)]
pub struct Transaction {
    /// Applied writes, in order of application
    locations: Vec<PatchLocation>,
    /// Current state
    state: State,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::new()
    }
}

impl Transaction {
    /// Creates an empty open transaction
    pub fn new() -> Self {
        Self {
            locations: Vec::new(),
            state: State::Open,
        }
    }

    /// Captures the pre-image at `location` and writes the patch, recording it on success
    ///
    /// # Safety
    ///
    /// Overwriting the range must be sound for the program
    unsafe fn push(&mut self, location: PatchLocation) -> Result<&PatchLocation, MemoryError> {
        location.apply()?;
        log::debug!(
            "Patched {:#x}: {:02X?} -> {:02X?}",
            location.address(),
            location.original(),
            location.patched()
        );
        self.locations.push(location);
        Ok(&self.locations[self.locations.len() - 1])
    }

    /// Writes raw bytes
    ///
    /// # Safety
    ///
    /// Overwriting the range must be sound for the program
    pub unsafe fn write(
        &mut self,
        address: usize,
        bytes: &[u8],
    ) -> Result<&PatchLocation, MemoryError> {
        self.push(PatchLocation::capture(address, bytes.to_vec())?)
    }

    /// Writes raw bytes, but only if memory currently holds `expected`
    ///
    /// # Safety
    ///
    /// Overwriting the range must be sound for the program
    pub unsafe fn write_expecting(
        &mut self,
        address: usize,
        bytes: &[u8],
        expected: &[u8],
    ) -> Result<&PatchLocation, MemoryError> {
        let location = PatchLocation::capture(address, bytes.to_vec())?;
        if location.original() != expected {
            return Err(MemoryError::UnexpectedBytes {
                address,
                expected: expected.to_vec(),
                found: location.original().to_vec(),
            });
        }
        self.push(location)
    }

    /// Writes a single byte
    ///
    /// # Safety
    ///
    /// Overwriting the byte must be sound for the program
    pub unsafe fn write_u8(&mut self, address: usize, value: u8) -> Result<(), MemoryError> {
        self.write(address, &[value]).map(|_| ())
    }

    /// Writes a little-endian word
    ///
    /// # Safety
    ///
    /// Overwriting the range must be sound for the program
    pub unsafe fn write_u16(&mut self, address: usize, value: u16) -> Result<(), MemoryError> {
        self.write(address, &value.to_le_bytes()).map(|_| ())
    }

    /// Writes a little-endian dword
    ///
    /// # Safety
    ///
    /// Overwriting the range must be sound for the program
    pub unsafe fn write_u32(&mut self, address: usize, value: u32) -> Result<(), MemoryError> {
        self.write(address, &value.to_le_bytes()).map(|_| ())
    }

    /// Fills `count` bytes with `nop`
    ///
    /// # Safety
    ///
    /// `count` must cover whole instructions
    pub unsafe fn nop(&mut self, address: usize, count: usize) -> Result<(), MemoryError> {
        self.write(address, &x64::nops(count)).map(|_| ())
    }

    /// Writes `call rel32` at `address` targeting `destination`
    ///
    /// # Safety
    ///
    /// The five bytes at `address` must be replaceable by a call
    pub unsafe fn call_rel32(
        &mut self,
        address: usize,
        destination: usize,
    ) -> Result<(), MemoryError> {
        let code = x64::call_rel32(address, destination).ok_or(MemoryError::OutOfRange {
            from: address,
            to: destination,
        })?;
        self.write(address, &code).map(|_| ())
    }

    /// Writes `jmp rel32` at `address` targeting `destination`
    ///
    /// # Safety
    ///
    /// The five bytes at `address` must be replaceable by a jump
    pub unsafe fn jmp_rel32(
        &mut self,
        address: usize,
        destination: usize,
    ) -> Result<(), MemoryError> {
        let code = x64::jmp_rel32(address, destination).ok_or(MemoryError::OutOfRange {
            from: address,
            to: destination,
        })?;
        self.write(address, &code).map(|_| ())
    }

    /// Applied writes, in order of application
    pub fn locations(&self) -> &[PatchLocation] {
        &self.locations
    }

    /// Number of applied writes
    pub fn len(&self) -> usize {
        self.locations.len()
    }

    /// Whether nothing has been written
    pub fn is_empty(&self) -> bool {
        self.locations.is_empty()
    }

    /// Marks the transaction final; its writes stay in place when it is dropped
    pub fn commit(&mut self) {
        self.state = State::Committed;
    }

    /// Whether [`commit`](Self::commit) was called and no rollback happened since
    pub fn is_committed(&self) -> bool {
        self.state == State::Committed
    }

    /// Restores every pre-image in reverse order of capture.
    ///
    /// If one location cannot be restored, the locations already restored are re-applied so the
    /// transaction is left whole, and the error is returned.
    ///
    /// # Safety
    ///
    /// Reverting the writes must be sound for the program
    pub unsafe fn rollback(&mut self) -> Result<(), MemoryError> {
        if self.state == State::RolledBack {
            return Ok(());
        }
        for (restored, location) in self.locations.iter().rev().enumerate() {
            if let Err(e) = location.restore() {
                let undone = self.locations.len() - restored;
                for location in &self.locations[undone..] {
                    if let Err(e) = location.apply() {
                        log::error!(
                            "Failed to re-apply {:#x} after aborted rollback: {e}",
                            location.address()
                        );
                    }
                }
                return Err(e);
            }
        }
        self.state = State::RolledBack;
        Ok(())
    }

    /// Writes every location again in order of capture after a rollback
    ///
    /// # Safety
    ///
    /// Re-applying the writes must be sound for the program
    pub(crate) unsafe fn reapply(&mut self) -> Result<(), MemoryError> {
        if self.state != State::RolledBack {
            return Ok(());
        }
        for (applied, location) in self.locations.iter().enumerate() {
            if let Err(e) = location.apply() {
                for location in self.locations[..applied].iter().rev() {
                    if let Err(e) = location.restore() {
                        log::error!(
                            "Failed to restore {:#x} after aborted re-apply: {e}",
                            location.address()
                        );
                    }
                }
                return Err(e);
            }
        }
        self.state = State::Committed;
        Ok(())
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.state == State::Open && !self.locations.is_empty() {
            // SAFETY: the writes were made by this transaction and never finalized
            if let Err(e) = unsafe { self.rollback() } {
                log::error!("Failed to roll back abandoned transaction: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    /// NOP x5 over a call, then rollback restores the call exactly
    fn test_nop_rollback() {
        let mut data = vec![0xE8u8, 0x11, 0x22, 0x33, 0x44, 0xC3];
        let address = data.as_mut_ptr() as usize;

        let mut tx = Transaction::new();
        unsafe { tx.nop(address, 5).unwrap() };
        assert_eq!(data, [0x90, 0x90, 0x90, 0x90, 0x90, 0xC3]);

        unsafe { tx.rollback().unwrap() };
        assert_eq!(data, [0xE8, 0x11, 0x22, 0x33, 0x44, 0xC3]);
    }

    #[test]
    /// Overlapping writes A then B unwind B first
    fn test_overlapping_rollback_order() {
        let mut data = vec![0u8; 8];
        let address = data.as_mut_ptr() as usize;

        let mut tx = Transaction::new();
        unsafe {
            tx.write(address, &[1, 1, 1, 1]).unwrap();
            tx.write(address + 2, &[2, 2, 2, 2]).unwrap();
        }
        assert_eq!(data, [1, 1, 2, 2, 2, 2, 0, 0]);
        assert_eq!(tx.locations()[1].original(), &[1, 1, 0, 0]);

        unsafe { tx.rollback().unwrap() };
        assert_eq!(data, [0u8; 8]);
    }

    #[test]
    /// A failing write leaves memory byte-for-byte as it was once the transaction unwinds
    fn test_failed_write_rolls_back() {
        let mut data = vec![0xAAu8; 8];
        let before = data.clone();
        let address = data.as_mut_ptr() as usize;

        {
            let mut tx = Transaction::new();
            unsafe {
                tx.write_u16(address, 0xBEEF).unwrap();
                tx.write_u8(address + 4, 0x00).unwrap();
                let result = tx.write_expecting(address + 6, &[0, 0], &[0x12, 0x34]);
                assert!(matches!(result, Err(MemoryError::UnexpectedBytes { .. })));
                let result = tx.write(0, &[0]);
                assert!(result.is_err());
            }
            assert_eq!(tx.len(), 2);
            // dropped while open
        }
        assert_eq!(data, before);
    }

    #[test]
    fn test_committed_transaction_survives_drop() {
        let mut data = vec![0u8; 4];
        let address = data.as_mut_ptr() as usize;

        let mut tx = Transaction::new();
        unsafe { tx.write_u32(address, 0x0403_0201).unwrap() };
        tx.commit();
        assert!(tx.is_committed());
        drop(tx);
        assert_eq!(data, [1, 2, 3, 4]);
    }

    #[test]
    fn test_rollback_is_all_or_nothing() {
        let mut data = vec![0u8; 8];
        let address = data.as_mut_ptr() as usize;

        let mut tx = Transaction::new();
        unsafe {
            tx.write(address, &[1, 1]).unwrap();
            tx.write(address + 4, &[2, 2]).unwrap();
        }
        tx.commit();

        // someone else rewrites the first location; it can no longer be restored
        data[0] = 9;
        assert!(unsafe { tx.rollback() }.is_err());
        // the second location was put back in place
        assert_eq!(data, [9, 1, 0, 0, 2, 2, 0, 0]);
        assert!(tx.is_committed());
    }

    #[test]
    fn test_rel32_writes() {
        let mut data = vec![0u8; 16];
        let address = data.as_mut_ptr() as usize;

        let mut tx = Transaction::new();
        unsafe {
            tx.call_rel32(address, address + 16).unwrap();
            tx.jmp_rel32(address + 5, address).unwrap();
        }
        assert_eq!(&data[..5], &[0xE8, 11, 0, 0, 0]);
        assert_eq!(&data[5..10], &[0xE9, 0xF6, 0xFF, 0xFF, 0xFF]);
        tx.commit();
    }
}
