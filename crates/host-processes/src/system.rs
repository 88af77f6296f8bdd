use parking_lot::Mutex;
use std::sync::Arc;
use sysinfo::{Pid, System};

use crate::{ProcessEntry, ProcessError, ProcessTable, ProcessWatch};

/// Process table backed by the operating system.
pub struct SystemProcessTable {
    system: Arc<Mutex<System>>,
}

impl SystemProcessTable {
    pub fn new() -> Self {
        Self {
            system: Arc::new(Mutex::new(System::new())),
        }
    }
}

impl Default for SystemProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable for SystemProcessTable {
    fn snapshot(&self) -> Result<Vec<ProcessEntry>, ProcessError> {
        let mut system = self.system.lock();
        system.refresh_processes();

        let mut entries: Vec<ProcessEntry> = system
            .processes()
            .iter()
            .map(|(pid, process)| ProcessEntry {
                pid: pid.as_u32(),
                name: process.name().to_string(),
            })
            .collect();
        if entries.is_empty() {
            return Err(ProcessError::Snapshot("no processes reported".into()));
        }
        entries.sort_by_key(|e| e.pid);

        tracing::trace!(count = entries.len(), "process snapshot");
        Ok(entries)
    }

    fn watch(&self, pid: u32) -> Result<Box<dyn ProcessWatch>, ProcessError> {
        #[cfg(windows)]
        {
            win32::HandleWatch::open(pid).map(|w| Box::new(w) as Box<dyn ProcessWatch>)
        }

        #[cfg(not(windows))]
        {
            PolledWatch::new(self.system.clone(), pid).map(|w| Box::new(w) as Box<dyn ProcessWatch>)
        }
    }
}

// ============================================================================
// Polled Watch
// ============================================================================

/// Exit watch that re-queries the process table. The start time guards
/// against PID reuse.
#[cfg_attr(windows, allow(dead_code))]
struct PolledWatch {
    system: Arc<Mutex<System>>,
    pid: u32,
    start_time: u64,
}

#[cfg_attr(windows, allow(dead_code))]
impl PolledWatch {
    fn new(system: Arc<Mutex<System>>, pid: u32) -> Result<Self, ProcessError> {
        let start_time = {
            let mut sys = system.lock();
            let sys_pid = Pid::from_u32(pid);
            if !sys.refresh_process(sys_pid) {
                return Err(ProcessError::Watch {
                    pid,
                    reason: "process not running".into(),
                });
            }
            sys.process(sys_pid).map(|p| p.start_time()).unwrap_or(0)
        };
        Ok(Self {
            system,
            pid,
            start_time,
        })
    }
}

impl ProcessWatch for PolledWatch {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn has_exited(&self) -> bool {
        let mut sys = self.system.lock();
        let sys_pid = Pid::from_u32(self.pid);
        if !sys.refresh_process(sys_pid) {
            return true;
        }
        match sys.process(sys_pid) {
            Some(p) => p.start_time() != self.start_time,
            None => true,
        }
    }
}

// ============================================================================
// Windows Handle Watch
// ============================================================================

#[cfg(windows)]
mod win32 {
    use windows::Win32::Foundation::{CloseHandle, HANDLE, WAIT_TIMEOUT};
    use windows::Win32::System::Threading::{OpenProcess, WaitForSingleObject, PROCESS_SYNCHRONIZE};

    use crate::{ProcessError, ProcessWatch};

    /// Holds a synchronize handle; a signalled process handle means the process
    /// has exited. The handle also pins the PID against reuse.
    pub(super) struct HandleWatch {
        pid: u32,
        handle: HANDLE,
    }

    // SAFETY: process handles may be waited on and closed from any thread.
    unsafe impl Send for HandleWatch {}

    impl HandleWatch {
        pub(super) fn open(pid: u32) -> Result<Self, ProcessError> {
            let handle = unsafe { OpenProcess(PROCESS_SYNCHRONIZE, false, pid) }.map_err(|e| {
                ProcessError::Watch {
                    pid,
                    reason: e.to_string(),
                }
            })?;
            Ok(Self { pid, handle })
        }
    }

    impl ProcessWatch for HandleWatch {
        fn pid(&self) -> u32 {
            self.pid
        }

        fn has_exited(&self) -> bool {
            unsafe { WaitForSingleObject(self.handle, 0) != WAIT_TIMEOUT }
        }
    }

    impl Drop for HandleWatch {
        fn drop(&mut self) {
            unsafe {
                let _ = CloseHandle(self.handle);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_contains_this_process() {
        let table = SystemProcessTable::new();
        let me = table.current_pid();
        let entries = table.snapshot().unwrap();
        assert!(entries.iter().any(|e| e.pid == me));
    }

    #[test]
    fn this_process_is_alive() {
        let table = SystemProcessTable::new();
        let watch = table.watch(table.current_pid()).unwrap();
        assert!(!watch.has_exited());
    }
}
