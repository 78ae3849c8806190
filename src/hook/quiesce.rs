//! Suspends every other thread of the process while a hook batch rewrites code

/// Guard that keeps all other threads of the process suspended until dropped.
///
/// Only effective on Windows; elsewhere it is a no-op and callers rely on the writes being small
/// enough that a thread never observes a torn instruction.
pub struct ThreadFreeze {
    /// Handles of the suspended threads
    #[cfg(windows)]
    threads: Vec<windows::Win32::Foundation::HANDLE>,
}

#[cfg(windows)]
impl ThreadFreeze {
    /// Suspends every thread of the current process except the caller
    pub fn new() -> Self {
        use windows::Win32::Foundation::CloseHandle;
        use windows::Win32::System::Diagnostics::ToolHelp::{
            CreateToolhelp32Snapshot, Thread32First, Thread32Next, TH32CS_SNAPTHREAD,
            THREADENTRY32,
        };
        use windows::Win32::System::Threading::{
            GetCurrentProcessId, GetCurrentThreadId, OpenThread, SuspendThread,
            THREAD_SUSPEND_RESUME,
        };

        let mut threads = Vec::new();
        unsafe {
            let snapshot = match CreateToolhelp32Snapshot(TH32CS_SNAPTHREAD, 0) {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    log::warn!("Unable to snapshot threads, patching without suspending: {e}");
                    return Self { threads };
                }
            };
            let pid = GetCurrentProcessId();
            let current = GetCurrentThreadId();

            let mut entry = THREADENTRY32 {
                dwSize: std::mem::size_of::<THREADENTRY32>() as u32,
                ..Default::default()
            };
            // open everything before suspending anything; opening may allocate
            if Thread32First(snapshot, &mut entry).is_ok() {
                loop {
                    if entry.th32OwnerProcessID == pid && entry.th32ThreadID != current {
                        match OpenThread(THREAD_SUSPEND_RESUME, false, entry.th32ThreadID) {
                            Ok(handle) => threads.push(handle),
                            Err(e) => {
                                log::warn!("Unable to open thread {}: {e}", entry.th32ThreadID)
                            }
                        }
                    }
                    if Thread32Next(snapshot, &mut entry).is_err() {
                        break;
                    }
                }
            }
            let _ = CloseHandle(snapshot);

            threads.retain(|&handle| {
                if SuspendThread(handle) == u32::MAX {
                    let _ = CloseHandle(handle);
                    false
                } else {
                    true
                }
            });
        }
        Self { threads }
    }

    /// Number of threads held suspended
    pub fn suspended(&self) -> usize {
        self.threads.len()
    }
}

#[cfg(windows)]
impl Drop for ThreadFreeze {
    fn drop(&mut self) {
        use windows::Win32::Foundation::CloseHandle;
        use windows::Win32::System::Threading::ResumeThread;

        for handle in self.threads.drain(..) {
            unsafe {
                ResumeThread(handle);
                let _ = CloseHandle(handle);
            }
        }
    }
}

#[cfg(not(windows))]
impl ThreadFreeze {
    /// No thread suspension on this platform
    pub fn new() -> Self {
        Self {}
    }

    /// Number of threads held suspended
    pub fn suspended(&self) -> usize {
        0
    }
}

impl Default for ThreadFreeze {
    fn default() -> Self {
        Self::new()
    }
}
