//! Trampoline hooks: the target's first instructions are relocated into a trampoline and replaced by
//! an absolute jump to the interceptor

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl, Instruction,
    InstructionBlock,
};

use super::Hook;
use crate::alloc::{allocate_executable, ExecutableMemory};
use crate::code::x64::{jmp_abs, nops, JMP_ABS_LEN};
use crate::error::HookError;
use crate::patcher::{read_bytes, PatchLocation};

/// Longest x86 instruction
const MAX_INSTRUCTION_LEN: usize = 15;
/// Room reserved per relocated instruction; short branches grow when moved
const RELOCATED_INSTRUCTION_LEN: usize = 2 * MAX_INSTRUCTION_LEN;

/// Everything built by [`InlineHook::prepare`]
#[derive(Debug)]
struct Prepared {
    /// Relocated prologue followed by a jump back into the target
    trampoline: ExecutableMemory,
    /// Redirect written over the prologue
    location: PatchLocation,
}

/// Redirects every call to `target` to `detour`, whoever the caller is.
///
/// The detour reaches the unhooked behavior by calling through `original`, which holds the
/// trampoline while the hook is attached and `target` otherwise.
#[derive(Debug)]
pub struct InlineHook {
    /// Name reported in batch failures
    name: String,
    /// Function being intercepted
    target: usize,
    /// Interceptor
    detour: usize,
    /// Caller's original-function slot
    original: &'static AtomicUsize,
    /// Trampoline and redirect, once built
    prepared: Option<Prepared>,
    /// Whether the redirect is in place
    attached: bool,
    /// Whether the trampoline was ever reachable from the target
    published: bool,
}

impl InlineHook {
    /// Creates a detached hook; `original` is pointed at `target`
    pub fn new(
        name: impl Into<String>,
        target: usize,
        detour: usize,
        original: &'static AtomicUsize,
    ) -> Self {
        original.store(target, Ordering::SeqCst);
        Self {
            name: name.into(),
            target,
            detour,
            original,
            prepared: None,
            attached: false,
            published: false,
        }
    }

    /// Function being intercepted
    pub fn target(&self) -> usize {
        self.target
    }

    /// Address of the trampoline, once prepared
    pub fn trampoline(&self) -> Option<usize> {
        self.prepared.as_ref().map(|p| p.trampoline.address())
    }
}

/// Decodes whole instructions from the start of `code` until they cover an absolute jump
fn steal(target: usize, code: &[u8]) -> Result<(Vec<Instruction>, usize), HookError> {
    let mut decoder = Decoder::with_ip(64, code, target as u64, DecoderOptions::NONE);
    let mut stolen = Vec::new();
    let mut len = 0;

    while len < JMP_ABS_LEN {
        let instruction = decoder.decode();
        if instruction.is_invalid() {
            return Err(HookError::InvalidInstruction {
                address: instruction.ip() as usize,
            });
        }
        len += instruction.len();
        let leaves = matches!(
            instruction.flow_control(),
            FlowControl::Return | FlowControl::UnconditionalBranch | FlowControl::IndirectBranch
        );
        stolen.push(instruction);
        if leaves && len < JMP_ABS_LEN {
            return Err(HookError::TooShort {
                address: target,
                len,
            });
        }
    }
    Ok((stolen, len))
}

unsafe impl Hook for InlineHook {
    fn name(&self) -> &str {
        &self.name
    }

    fn prepare(&mut self) -> Result<(), HookError> {
        if self.prepared.is_some() {
            return Ok(());
        }

        let code = read_bytes(self.target, JMP_ABS_LEN + MAX_INSTRUCTION_LEN - 1)?;
        let (stolen, len) = steal(self.target, &code)?;

        let mut trampoline = allocate_executable(
            self.target,
            stolen.len() * RELOCATED_INSTRUCTION_LEN + JMP_ABS_LEN,
        )?;
        let block = InstructionBlock::new(&stolen, trampoline.address() as u64);
        let relocated = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE)?.code_buffer;

        let end = relocated.len() + JMP_ABS_LEN;
        if end > trampoline.len() {
            return Err(HookError::TrampolineOverflow {
                address: self.target,
            });
        }
        trampoline[..relocated.len()].copy_from_slice(&relocated);
        trampoline[relocated.len()..end].copy_from_slice(&jmp_abs(self.target + len));

        let mut redirect = jmp_abs(self.detour).to_vec();
        redirect.extend(nops(len - JMP_ABS_LEN));
        let location = PatchLocation::capture(self.target, redirect)?;

        log::debug!(
            "Prepared hook `{}`: {} bytes stolen from {:#x}, trampoline at {:#x}",
            self.name,
            len,
            self.target,
            trampoline.address()
        );
        self.prepared = Some(Prepared {
            trampoline,
            location,
        });
        Ok(())
    }

    unsafe fn attach(&mut self) -> Result<(), HookError> {
        if self.attached {
            return Ok(());
        }
        let prepared = self.prepared.as_ref().ok_or(HookError::NotPrepared)?;

        // publish the trampoline before the first call can land in the detour
        self.original
            .store(prepared.trampoline.address(), Ordering::SeqCst);
        self.published = true;
        if let Err(e) = prepared.location.apply_frozen() {
            self.original.store(self.target, Ordering::SeqCst);
            return Err(e.into());
        }
        self.attached = true;
        Ok(())
    }

    unsafe fn detach(&mut self) -> Result<(), HookError> {
        if !self.attached {
            return Ok(());
        }
        let prepared = self.prepared.as_ref().ok_or(HookError::NotPrepared)?;
        prepared.location.restore_frozen()?;
        self.original.store(self.target, Ordering::SeqCst);
        self.attached = false;
        Ok(())
    }

    fn is_attached(&self) -> bool {
        self.attached
    }
}

impl Drop for InlineHook {
    fn drop(&mut self) {
        if self.attached {
            // SAFETY: the redirect was written by this hook
            if let Err(e) = unsafe { self.detach() } {
                log::error!("Failed to detach hook `{}` on drop: {e}", self.name);
            }
        }
        // a thread may still be running the relocated prologue
        if self.published {
            if let Some(Prepared { trampoline, .. }) = self.prepared.take() {
                mem::forget(trampoline);
            }
        }
    }
}
