//! # Alloc
//!
//! Executable memory for hook trampolines. Trampolines must sit within ±2 GiB of the function they
//! relocate so rip-relative operands in the stolen instructions can still reach their targets.

use std::ops::{Deref, DerefMut};

use lazy_static::lazy_static;
use parking_lot::Mutex;
use slice_pool::sync::SliceBox;
use thiserror::Error;

mod pool;
mod search;

use pool::TrampolinePool;

/// Furthest distance between a hook target and its trampoline (2 GiB)
pub const TRAMPOLINE_RANGE: usize = 0x8000_0000;

lazy_static! {
    /// Process-wide pool; every hook allocates from it
    static ref POOL: Mutex<TrampolinePool> = Mutex::new(TrampolinePool::new(TRAMPOLINE_RANGE));
}

/// Trampoline memory could not be allocated
#[derive(Debug, Error)]
pub enum AllocError {
    /// No free page was found close enough to the target
    #[error("no executable memory available within range of {origin:#x}")]
    OutOfMemory {
        /// Address the memory had to be close to
        origin: usize,
    },
    /// Mapping a page failed for a reason other than exhaustion
    #[error("failed to map executable memory: {0}")]
    Map(mmap::MapError),
    /// Querying the address space failed
    #[error("failed to query memory region: {0}")]
    Region(#[from] region::Error),
}

/// Read-, write- and executable memory handed out by the trampoline pool.
///
/// Dropping it returns the slot to its pool, and pages stay mapped for the life of the process.
/// Hooks forget the memory instead once a trampoline has been published, since a thread may still
/// be executing inside it after the hook is removed.
pub struct ExecutableMemory {
    /// Slot inside one of the pool's pages
    data: SliceBox<u8>,
}

impl ExecutableMemory {
    /// Address of the first byte
    pub fn address(&self) -> usize {
        self.data.as_ptr() as usize
    }
}

impl std::fmt::Debug for ExecutableMemory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutableMemory")
            .field("address", &format_args!("{:#x}", self.address()))
            .field("len", &self.data.len())
            .finish()
    }
}

impl Deref for ExecutableMemory {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.data
    }
}

impl DerefMut for ExecutableMemory {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

/// Allocates `size` bytes of executable memory within [`TRAMPOLINE_RANGE`] of `origin`.
///
/// The contents of the returned buffer are unspecified.
pub fn allocate_executable(origin: usize, size: usize) -> Result<ExecutableMemory, AllocError> {
    let data = POOL.lock().allocate(origin, size)?;
    log::trace!(
        "Allocated {size} executable bytes at {:#x} for {origin:#x}",
        data.as_ptr() as usize
    );
    Ok(ExecutableMemory { data })
}
