//! # Hook
//!
//! This module covers hooks, which redirect calls from a target to an interceptor. Hooks are
//! installed and removed in batches: either every hook of a batch is active or none is.

use crate::error::{HookBatchError, HookError, MemoryError};
use crate::patcher::read_bytes;

mod inline;
mod quiesce;
mod slot;

pub use inline::InlineHook;
pub use quiesce::ThreadFreeze;
pub use slot::{read_slot, SlotHook};

/// A single call interception
///
/// # Safety
///
/// `attach` and `detach` run while every other thread is suspended. They must not allocate, log or
/// take a lock another thread could hold; all such work belongs in `prepare`. After `detach`
/// returns `Ok`, the intercepted memory must hold exactly what it held before `attach`.
pub unsafe trait Hook: Send {
    /// Name reported when the hook fails
    fn name(&self) -> &str;

    /// Builds everything the hook needs (trampolines, captured pre-images). Idempotent.
    fn prepare(&mut self) -> Result<(), HookError>;

    /// Writes the redirect. Idempotent.
    ///
    /// # Safety
    ///
    /// The target must be safe to redirect to the interceptor
    unsafe fn attach(&mut self) -> Result<(), HookError>;

    /// Removes the redirect. Idempotent.
    ///
    /// # Safety
    ///
    /// No thread may depend on the redirect once it is removed
    unsafe fn detach(&mut self) -> Result<(), HookError>;

    /// Whether the redirect is currently in place
    fn is_attached(&self) -> bool;
}

/// Hooks attached and detached as one unit
#[derive(Default)]
pub struct HookBatch {
    /// Hooks in attach order
    hooks: Vec<Box<dyn Hook>>,
    /// Whether the batch is active
    attached: bool,
}

impl std::fmt::Debug for HookBatch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookBatch")
            .field("hooks", &self.names().collect::<Vec<_>>())
            .field("attached", &self.attached)
            .finish()
    }
}

impl HookBatch {
    /// Creates an empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a hook to the end of the batch
    pub fn push(&mut self, hook: impl Hook + 'static) {
        self.hooks.push(Box::new(hook));
    }

    /// Builder form of [`push`](Self::push)
    pub fn with(mut self, hook: impl Hook + 'static) -> Self {
        self.push(hook);
        self
    }

    /// Names of the hooks, in attach order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.hooks.iter().map(|hook| hook.name())
    }

    /// Number of hooks in the batch
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Whether the batch holds no hooks
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    /// Whether the batch is active
    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Attaches every hook, or none.
    ///
    /// All hooks are prepared first; nothing is written if any preparation fails. The writes then
    /// happen with the other threads suspended. If hook `index` fails to attach, the hooks before it
    /// are detached again before returning.
    ///
    /// If one of those hooks cannot be detached either, [`HookBatchError::Stuck`] is returned and the
    /// batch stays marked attached, so a later [`detach`](Self::detach) finishes the job.
    ///
    /// # Safety
    ///
    /// Every hook's target must be safe to redirect
    pub unsafe fn attach(&mut self) -> Result<(), HookBatchError> {
        if self.attached {
            return Ok(());
        }

        for (index, hook) in self.hooks.iter_mut().enumerate() {
            hook.prepare().map_err(|source| HookBatchError::Attach {
                index,
                name: hook.name().to_owned(),
                source,
            })?;
        }

        let mut failure = None;
        let mut stuck = None;
        let freeze = ThreadFreeze::new();
        for index in 0..self.hooks.len() {
            if let Err(e) = self.hooks[index].attach() {
                for undo in (0..index).rev() {
                    if let Err(e) = self.hooks[undo].detach() {
                        stuck.get_or_insert((undo, e));
                    }
                }
                failure = Some((index, e));
                break;
            }
        }
        drop(freeze);

        if let Some((index, source)) = failure {
            let name = self.hooks[index].name().to_owned();
            report_mismatch(&source);
            if let Some((undo, rollback)) = stuck {
                log::error!("Hook `{name}` failed to attach: {source}");
                self.attached = true;
                return Err(self.stuck(undo, name, rollback));
            }
            return Err(HookBatchError::Attach {
                index,
                name,
                source,
            });
        }

        log::debug!("Attached {} hook(s)", self.hooks.len());
        self.attached = true;
        Ok(())
    }

    /// Detaches every hook in reverse attach order, or none.
    ///
    /// If a hook fails to detach, the hooks already detached are attached again so the batch stays
    /// whole. If one of them cannot be attached again, [`HookBatchError::Stuck`] is returned. The
    /// batch stays marked attached either way; detaching is idempotent per hook, so calling this again
    /// retries only what is still in place.
    ///
    /// # Safety
    ///
    /// No thread may depend on the redirects once they are removed
    pub unsafe fn detach(&mut self) -> Result<(), HookBatchError> {
        if !self.attached {
            return Ok(());
        }

        let mut failure = None;
        let mut stuck = None;
        let freeze = ThreadFreeze::new();
        for index in (0..self.hooks.len()).rev() {
            if let Err(e) = self.hooks[index].detach() {
                for redo in index + 1..self.hooks.len() {
                    if let Err(e) = self.hooks[redo].attach() {
                        stuck.get_or_insert((redo, e));
                    }
                }
                failure = Some((index, e));
                break;
            }
        }
        drop(freeze);

        if let Some((index, source)) = failure {
            let name = self.hooks[index].name().to_owned();
            report_mismatch(&source);
            if let Some((redo, rollback)) = stuck {
                log::error!("Hook `{name}` failed to detach: {source}");
                return Err(self.stuck(redo, name, rollback));
            }
            return Err(HookBatchError::Detach {
                index,
                name,
                source,
            });
        }

        log::debug!("Detached {} hook(s)", self.hooks.len());
        self.attached = false;
        Ok(())
    }

    /// Error for a hook that could not be rolled back after `cause` failed
    fn stuck(&self, index: usize, cause: String, source: HookError) -> HookBatchError {
        let name = self.hooks[index].name().to_owned();
        log::error!("Hook `{name}` could not be rolled back after `{cause}` failed: {source}");
        report_mismatch(&source);
        HookBatchError::Stuck {
            index,
            name,
            cause,
            source,
        }
    }
}

/// Logs the live bytes behind a mismatch reported while threads were suspended
fn report_mismatch(error: &HookError) {
    if let HookError::Memory(MemoryError::Mismatch { address, len }) = error {
        match read_bytes(*address, *len) {
            Ok(found) => log::warn!("Memory at {address:#x} holds {found:02X?}"),
            Err(e) => log::warn!("Memory at {address:#x} is no longer readable: {e}"),
        }
    }
}

impl Drop for HookBatch {
    fn drop(&mut self) {
        if self.attached {
            // SAFETY: every redirect was written by this batch
            if let Err(e) = unsafe { self.detach() } {
                log::error!("Failed to detach hook batch on drop: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    /// Hook that only tracks whether it is attached, failing on request
    struct MockHook {
        /// Hook name
        name: &'static str,
        /// Number of currently attached mock hooks
        active: Arc<AtomicUsize>,
        /// Fail in `attach`
        fail_attach: bool,
        /// Fail in `detach`
        fail_detach: bool,
        /// Fail every `attach` after the first successful one
        fail_reattach: bool,
        /// Successful attaches so far
        attaches: usize,
        /// Attachment state
        attached: bool,
    }

    impl MockHook {
        /// Creates a detached mock counted in `active`
        fn new(name: &'static str, active: &Arc<AtomicUsize>) -> Self {
            Self {
                name,
                active: active.clone(),
                fail_attach: false,
                fail_detach: false,
                fail_reattach: false,
                attaches: 0,
                attached: false,
            }
        }
    }

    unsafe impl Hook for MockHook {
        fn name(&self) -> &str {
            self.name
        }

        fn prepare(&mut self) -> Result<(), HookError> {
            Ok(())
        }

        unsafe fn attach(&mut self) -> Result<(), HookError> {
            if self.attached {
                return Ok(());
            }
            if self.fail_attach || (self.fail_reattach && self.attaches > 0) {
                return Err(HookError::NotPrepared);
            }
            self.active.fetch_add(1, Ordering::SeqCst);
            self.attaches += 1;
            self.attached = true;
            Ok(())
        }

        unsafe fn detach(&mut self) -> Result<(), HookError> {
            if self.fail_detach {
                return Err(HookError::NotPrepared);
            }
            if self.attached {
                self.active.fetch_sub(1, Ordering::SeqCst);
                self.attached = false;
            }
            Ok(())
        }

        fn is_attached(&self) -> bool {
            self.attached
        }
    }

    #[test]
    /// A failure on the third hook leaves none of the batch attached
    fn test_attach_failure_is_atomic() {
        let active = Arc::new(AtomicUsize::new(0));
        let mut failing = MockHook::new("c", &active);
        failing.fail_attach = true;
        let mut batch = HookBatch::new()
            .with(MockHook::new("a", &active))
            .with(MockHook::new("b", &active))
            .with(failing)
            .with(MockHook::new("d", &active));

        let err = unsafe { batch.attach() }.unwrap_err();
        assert!(matches!(
            err,
            HookBatchError::Attach { index: 2, ref name, .. } if name == "c"
        ));
        assert_eq!(active.load(Ordering::SeqCst), 0);
        assert!(!batch.is_attached());
    }

    #[test]
    fn test_attach_detach() {
        let active = Arc::new(AtomicUsize::new(0));
        let mut batch = HookBatch::new()
            .with(MockHook::new("a", &active))
            .with(MockHook::new("b", &active));

        unsafe { batch.attach().unwrap() };
        assert_eq!(active.load(Ordering::SeqCst), 2);
        unsafe { batch.attach().unwrap() };
        assert_eq!(active.load(Ordering::SeqCst), 2);

        unsafe { batch.detach().unwrap() };
        assert_eq!(active.load(Ordering::SeqCst), 0);
        assert_eq!(batch.names().collect::<Vec<_>>(), ["a", "b"]);
    }

    #[test]
    /// A detach failure re-attaches whatever was already detached
    fn test_detach_failure_keeps_batch_whole() {
        let active = Arc::new(AtomicUsize::new(0));
        let mut stuck = MockHook::new("a", &active);
        stuck.fail_detach = true;
        let mut batch = HookBatch::new()
            .with(stuck)
            .with(MockHook::new("b", &active))
            .with(MockHook::new("c", &active));

        unsafe { batch.attach().unwrap() };
        let err = unsafe { batch.detach() }.unwrap_err();
        assert!(matches!(err, HookBatchError::Detach { index: 0, .. }));
        assert_eq!(active.load(Ordering::SeqCst), 3);
        assert!(batch.is_attached());
    }

    #[test]
    /// A hook that cannot be detached while unwinding a failed attach is reported and keeps the batch
    /// marked attached
    fn test_attach_rollback_failure_is_reported() {
        let active = Arc::new(AtomicUsize::new(0));
        let mut sticky = MockHook::new("a", &active);
        sticky.fail_detach = true;
        let mut failing = MockHook::new("c", &active);
        failing.fail_attach = true;
        let mut batch = HookBatch::new()
            .with(sticky)
            .with(MockHook::new("b", &active))
            .with(failing);

        let err = unsafe { batch.attach() }.unwrap_err();
        assert!(matches!(
            err,
            HookBatchError::Stuck { index: 0, ref name, ref cause, .. } if name == "a" && cause == "c"
        ));
        assert_eq!(active.load(Ordering::SeqCst), 1);
        assert!(batch.is_attached());
    }

    #[test]
    /// A hook that cannot be re-attached while unwinding a failed detach is reported
    fn test_detach_rollback_failure_is_reported() {
        let active = Arc::new(AtomicUsize::new(0));
        let mut sticky = MockHook::new("b", &active);
        sticky.fail_detach = true;
        let mut once = MockHook::new("c", &active);
        once.fail_reattach = true;
        let mut batch = HookBatch::new()
            .with(MockHook::new("a", &active))
            .with(sticky)
            .with(once);

        unsafe { batch.attach().unwrap() };
        let err = unsafe { batch.detach() }.unwrap_err();
        assert!(matches!(
            err,
            HookBatchError::Stuck { index: 2, ref cause, .. } if cause == "b"
        ));
        assert_eq!(active.load(Ordering::SeqCst), 2);
        assert!(batch.is_attached());
    }

    #[test]
    /// Slot hooks over a table swap every entry in one batch
    fn test_slot_batch() {
        static A: AtomicUsize = AtomicUsize::new(0);
        static B: AtomicUsize = AtomicUsize::new(0);
        let mut table = vec![0x10usize, 0x20];
        let base = table.as_mut_ptr() as usize;

        let mut batch = HookBatch::new()
            .with(SlotHook::new("first", base, 0x100, &A))
            .with(SlotHook::new("second", base + std::mem::size_of::<usize>(), 0x200, &B));
        unsafe { batch.attach().unwrap() };
        assert_eq!(table, [0x100, 0x200]);
        assert_eq!((A.load(Ordering::SeqCst), B.load(Ordering::SeqCst)), (0x10, 0x20));

        unsafe { batch.detach().unwrap() };
        assert_eq!(table, [0x10, 0x20]);
    }

    #[test]
    /// A hook that cannot be prepared stops the batch before anything is written
    fn test_prepare_failure_writes_nothing() {
        static A: AtomicUsize = AtomicUsize::new(0);
        static B: AtomicUsize = AtomicUsize::new(0);
        let mut table = vec![0x10usize];
        let base = table.as_mut_ptr() as usize;

        let mut batch = HookBatch::new()
            .with(SlotHook::new("good", base, 0x100, &A))
            .with(SlotHook::new("bad", 0, 0x200, &B));
        let err = unsafe { batch.attach() }.unwrap_err();
        assert!(matches!(err, HookBatchError::Attach { index: 1, .. }));
        assert_eq!(table, [0x10]);
    }
}
