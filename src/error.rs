//! Central error types for the frame broker.
//!
//! Every fallible broker operation returns [`BrokerResult`]. Errors from the
//! helper crates convert through `#[from]`, and [`ResultExt`] attaches
//! a short description of what was being attempted.

use thiserror::Error;

/// Main error type for broker operations.
#[derive(Error, Debug)]
pub enum BrokerError {
    /// Process enumeration or manifest probing failed
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Producer runs on a different GPU adapter than the consumer
    #[error("Producer {pid} is on a different GPU adapter")]
    AdapterMismatch { pid: u32 },

    /// Creating or opening a GPU object failed
    #[error("GPU resource error: {0}")]
    ResourceCreation(String),

    /// GPU device removed or reset (requires re-initialization)
    #[error("GPU device lost: {0}")]
    DeviceLost(String),

    /// Shared-memory namespace error
    #[error("Shared memory error: {0}")]
    SharedMemory(#[from] frame_manifest::ManifestError),

    /// Process table error
    #[error("Process error: {0}")]
    Process(#[from] host_processes::ProcessError),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Broker entry point called before initialization
    #[error("Broker is not initialized")]
    NotInitialized,

    /// Generic error with message
    #[error("{0}")]
    Other(String),
}

impl BrokerError {
    /// True when the broker must tear down and be re-initialized.
    pub fn is_fatal(&self) -> bool {
        matches!(self, BrokerError::DeviceLost(_))
    }
}

/// Extension trait for adding context to Results.
///
/// # Example
/// ```ignore
/// use crate::error::{ResultExt, BrokerResult};
///
/// fn load(path: &Path) -> BrokerResult<String> {
///     std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
/// }
/// ```
pub trait ResultExt<T> {
    /// Prefix the error with a lazily built description, as BrokerError::Other.
    fn with_context<F: FnOnce() -> String>(self, f: F) -> BrokerResult<T>;
}

impl<T, E: std::fmt::Display> ResultExt<T> for Result<T, E> {
    fn with_context<F: FnOnce() -> String>(self, f: F) -> BrokerResult<T> {
        self.map_err(|e| BrokerError::Other(format!("{}: {}", f(), e)))
    }
}

/// Type alias for Results using BrokerError.
pub type BrokerResult<T> = Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = BrokerError::AdapterMismatch { pid: 4242 };
        assert_eq!(
            err.to_string(),
            "Producer 4242 is on a different GPU adapter"
        );
    }

    #[test]
    fn test_only_device_loss_is_fatal() {
        assert!(BrokerError::DeviceLost("removed".into()).is_fatal());
        let open_failed = BrokerError::ResourceCreation("open failed".into());
        assert!(!open_failed.is_fatal());
        assert!(!BrokerError::AdapterMismatch { pid: 1 }.is_fatal());
        assert!(!BrokerError::NotInitialized.is_fatal());
    }

    #[test]
    fn test_from_manifest_error() {
        let err: BrokerError =
            frame_manifest::ManifestError::NotFound("FrameBroker_1".into()).into();
        assert!(matches!(err, BrokerError::SharedMemory(_)));
        assert!(err.to_string().contains("FrameBroker_1"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: BrokerError = io_err.into();
        assert!(matches!(err, BrokerError::Io(_)));
    }

    #[test]
    fn test_result_ext_with_context() {
        let result: Result<(), &str> = Err("inner");
        let msg = result
            .with_context(|| format!("ctx-{}", 42))
            .unwrap_err()
            .to_string();
        assert!(msg.contains("ctx-42"));
        assert!(msg.contains("inner"));
    }
}
