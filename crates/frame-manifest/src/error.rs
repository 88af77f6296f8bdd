use thiserror::Error;

/// Errors raised while building, publishing or opening shared records.
#[derive(Error, Debug)]
pub enum ManifestError {
    /// Object name does not fit the fixed-size name field.
    #[error("object name is {len} UTF-16 units, limit is {limit}")]
    NameTooLong { len: usize, limit: usize },

    /// No shared object exists under that name.
    #[error("shared object not found: {0}")]
    NotFound(String),

    /// The shared object exists but is smaller than the record it should hold.
    #[error("shared object {name} holds {actual} bytes, expected at least {expected}")]
    Truncated {
        name: String,
        actual: usize,
        expected: usize,
    },

    /// Attempted to write through a read-only mapping.
    #[error("mapping of {0} is read-only")]
    ReadOnly(String),

    /// Filesystem-backed namespace failed.
    #[error("shared memory I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// OS shared-memory call failed.
    #[error("{context}: {message}")]
    Os { context: String, message: String },
}

impl ManifestError {
    /// True when the failure just means "nobody publishes under that name".
    pub fn is_not_found(&self) -> bool {
        match self {
            ManifestError::NotFound(_) => true,
            ManifestError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type ManifestResult<T> = Result<T, ManifestError>;
