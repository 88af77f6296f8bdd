//! Host process enumeration and liveness checks.
//!
//! Discovery needs two things from the operating system: a snapshot of the
//! running processes (PID and executable name) and a way to tell whether a
//! particular process has exited. Both sit behind traits so the broker can be
//! driven by [`FakeProcessTable`] in tests.

mod error;
mod fake;
mod system;

pub use error::ProcessError;
pub use fake::FakeProcessTable;
pub use system::SystemProcessTable;

/// One running process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessEntry {
    pub pid: u32,
    /// Executable file name, e.g. `obs64.exe`.
    pub name: String,
}

/// Source of process snapshots.
pub trait ProcessTable: Send + Sync {
    /// Enumerate the processes currently running on the host.
    fn snapshot(&self) -> Result<Vec<ProcessEntry>, ProcessError>;

    /// Start watching `pid` for exit.
    fn watch(&self, pid: u32) -> Result<Box<dyn ProcessWatch>, ProcessError>;

    /// PID of the calling process. Discovery skips it.
    fn current_pid(&self) -> u32 {
        std::process::id()
    }
}

/// Exit watch on a single process.
pub trait ProcessWatch: Send {
    fn pid(&self) -> u32;

    /// True once the process has terminated. A process that cannot be queried
    /// any more counts as exited.
    fn has_exited(&self) -> bool;
}
