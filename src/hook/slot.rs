//! Pointer-slot hooks: a function pointer in memory (an import table entry, a vtable slot) is swapped
//! for the interceptor. Only calls routed through that slot are affected.

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::Hook;
use crate::error::HookError;
use crate::patcher::{read_bytes, PatchLocation};

/// Swaps the pointer stored at `slot` for `detour`
#[derive(Debug)]
pub struct SlotHook {
    /// Name reported in batch failures
    name: String,
    /// Address of the pointer being swapped
    slot: usize,
    /// Interceptor
    detour: usize,
    /// Receives the pointer the slot held before the swap
    original: &'static AtomicUsize,
    /// Swap captured by `prepare`
    location: Option<PatchLocation>,
    /// Whether the slot holds the detour
    attached: bool,
}

impl SlotHook {
    /// Creates a detached hook over the pointer at `slot`
    pub fn new(
        name: impl Into<String>,
        slot: usize,
        detour: usize,
        original: &'static AtomicUsize,
    ) -> Self {
        Self {
            name: name.into(),
            slot,
            detour,
            original,
            location: None,
            attached: false,
        }
    }

    /// Address of the pointer being swapped
    pub fn slot(&self) -> usize {
        self.slot
    }
}

unsafe impl Hook for SlotHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&mut self) -> Result<(), HookError> {
        if self.location.is_none() {
            self.location = Some(PatchLocation::capture(
                self.slot,
                self.detour.to_ne_bytes().to_vec(),
            )?);
        }
        Ok(())
    }

    unsafe fn attach(&mut self) -> Result<(), HookError> {
        if self.attached {
            return Ok(());
        }
        let location = self.location.as_ref().ok_or(HookError::NotPrepared)?;

        let mut previous = [0u8; mem::size_of::<usize>()];
        previous.copy_from_slice(location.original());
        self.original
            .store(usize::from_ne_bytes(previous), Ordering::SeqCst);
        location.apply_frozen()?;
        self.attached = true;
        Ok(())
    }

    unsafe fn detach(&mut self) -> Result<(), HookError> {
        if !self.attached {
            return Ok(());
        }
        let location = self.location.as_ref().ok_or(HookError::NotPrepared)?;
        location.restore_frozen()?;
        self.attached = false;
        Ok(())
    }

    fn is_attached(&self) -> bool {
        self.attached
    }
}

impl Drop for SlotHook {
    fn drop(&mut self) {
        if self.attached {
            // SAFETY: the swap was made by this hook
            if let Err(e) = unsafe { self.detach() } {
                log::error!("Failed to detach hook `{}` on drop: {e}", self.name);
            }
        }
    }
}

/// Reads the pointer currently stored at `slot`
pub fn read_slot(slot: usize) -> Result<usize, HookError> {
    let bytes = read_bytes(slot, mem::size_of::<usize>())?;
    let mut value = [0u8; mem::size_of::<usize>()];
    value.copy_from_slice(&bytes);
    Ok(usize::from_ne_bytes(value))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slot_swap() {
        static ORIGINAL: AtomicUsize = AtomicUsize::new(0);
        let mut table = vec![0x1111usize, 0x2222, 0x3333];
        let slot = unsafe { table.as_mut_ptr().add(1) } as usize;

        let mut hook = SlotHook::new("entry", slot, 0xdead, &ORIGINAL);
        hook.prepare().unwrap();
        assert_eq!(table[1], 0x2222);

        unsafe { hook.attach().unwrap() };
        assert_eq!(read_slot(slot).unwrap(), 0xdead);
        assert_eq!(ORIGINAL.load(Ordering::SeqCst), 0x2222);

        unsafe { hook.detach().unwrap() };
        assert_eq!(table, [0x1111, 0x2222, 0x3333]);
    }

    #[test]
    fn test_unreadable_slot() {
        static ORIGINAL: AtomicUsize = AtomicUsize::new(0);
        let mut hook = SlotHook::new("null", 0, 0xdead, &ORIGINAL);
        assert!(matches!(hook.prepare(), Err(HookError::Memory(_))));
    }
}
