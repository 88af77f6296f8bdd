use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProcessError {
    /// The process list could not be read.
    #[error("process snapshot failed: {0}")]
    Snapshot(String),

    /// The process is gone or access was denied.
    #[error("cannot watch process {pid}: {reason}")]
    Watch { pid: u32, reason: String },
}
