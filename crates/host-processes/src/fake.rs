use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

use crate::{ProcessEntry, ProcessError, ProcessTable, ProcessWatch};

#[derive(Default)]
struct FakeState {
    processes: RwLock<BTreeMap<u32, Process>>,
    snapshots: AtomicUsize,
    fail_snapshots: AtomicBool,
    generation: AtomicU32,
}

#[derive(Clone)]
struct Process {
    name: String,
    generation: u32,
}

/// In-memory process table for driving discovery in tests.
///
/// Clones share state, so a test can keep one handle to spawn and kill
/// processes while the broker owns another.
#[derive(Clone)]
pub struct FakeProcessTable {
    state: Arc<FakeState>,
    current_pid: u32,
}

impl FakeProcessTable {
    /// `current_pid` is what the table reports as the calling process.
    pub fn new(current_pid: u32) -> Self {
        let table = Self {
            state: Arc::new(FakeState::default()),
            current_pid,
        };
        table.spawn(current_pid, "framebroker-host.exe");
        table
    }

    /// Start (or replace) a process. Replacing a PID counts as PID reuse, so
    /// existing watches on it report exit.
    pub fn spawn(&self, pid: u32, name: &str) {
        let generation = self.state.generation.fetch_add(1, Ordering::Relaxed) + 1;
        self.state.processes.write().insert(
            pid,
            Process {
                name: name.to_string(),
                generation,
            },
        );
    }

    pub fn kill(&self, pid: u32) {
        self.state.processes.write().remove(&pid);
    }

    pub fn is_running(&self, pid: u32) -> bool {
        self.state.processes.read().contains_key(&pid)
    }

    /// Number of snapshots taken so far.
    pub fn snapshot_count(&self) -> usize {
        self.state.snapshots.load(Ordering::Relaxed)
    }

    /// Make subsequent snapshots fail until reset.
    pub fn set_snapshot_failure(&self, fail: bool) {
        self.state.fail_snapshots.store(fail, Ordering::Relaxed);
    }
}

impl ProcessTable for FakeProcessTable {
    fn snapshot(&self) -> Result<Vec<ProcessEntry>, ProcessError> {
        self.state.snapshots.fetch_add(1, Ordering::Relaxed);
        if self.state.fail_snapshots.load(Ordering::Relaxed) {
            return Err(ProcessError::Snapshot("injected failure".into()));
        }
        Ok(self
            .state
            .processes
            .read()
            .iter()
            .map(|(&pid, p)| ProcessEntry {
                pid,
                name: p.name.clone(),
            })
            .collect())
    }

    fn watch(&self, pid: u32) -> Result<Box<dyn ProcessWatch>, ProcessError> {
        let generation = self
            .state
            .processes
            .read()
            .get(&pid)
            .map(|p| p.generation)
            .ok_or_else(|| ProcessError::Watch {
                pid,
                reason: "process not running".into(),
            })?;
        Ok(Box::new(FakeWatch {
            state: self.state.clone(),
            pid,
            generation,
        }))
    }

    fn current_pid(&self) -> u32 {
        self.current_pid
    }
}

struct FakeWatch {
    state: Arc<FakeState>,
    pid: u32,
    generation: u32,
}

impl ProcessWatch for FakeWatch {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn has_exited(&self) -> bool {
        match self.state.processes.read().get(&self.pid) {
            Some(p) => p.generation != self.generation,
            None => true,
        }
    }
}
