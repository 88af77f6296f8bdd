use memmap2::{Mmap, MmapMut, MmapOptions};
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use super::{MappedRegion, SharedMemory};
use crate::error::{ManifestError, ManifestResult};

/// Directory of memory-mapped files standing in for a named shared-memory
/// namespace. Every process pointing at the same directory sees the same
/// objects.
#[derive(Debug, Clone)]
pub struct FileNamespace {
    root: PathBuf,
}

impl FileNamespace {
    pub fn new(root: impl Into<PathBuf>) -> ManifestResult<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    /// `/dev/shm/framebroker` when tmpfs is available, the temp dir otherwise.
    pub fn host_default() -> ManifestResult<Self> {
        let shm = Path::new("/dev/shm");
        let root = if shm.is_dir() {
            shm.join("framebroker")
        } else {
            std::env::temp_dir().join("framebroker")
        };
        Self::new(root)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Maps an object name onto a file path. Namespace separators become `_`.
    pub fn path_for(&self, name: &str) -> PathBuf {
        let file: String = name
            .chars()
            .map(|c| match c {
                '\\' | '/' | ':' => '_',
                c => c,
            })
            .collect();
        self.root.join(file)
    }
}

impl SharedMemory for FileNamespace {
    fn create(&self, name: &str, len: usize) -> ManifestResult<Box<dyn MappedRegion>> {
        let path = self.path_for(name);

        // A stale object from a crashed publisher may still be mapped by
        // readers; unlink it rather than truncating under them.
        match fs::remove_file(&path) {
            Ok(()) => tracing::debug!(name, "replaced stale shared object"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut options = OpenOptions::new();
        options.read(true).write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o644);
        }
        let file = options.open(&path)?;
        file.set_len(len as u64)?;

        // SAFETY: the file was just created by us and sized to `len`.
        let map = unsafe { MmapOptions::new().len(len).map_mut(&file)? };

        Ok(Box::new(OwnedFileRegion {
            name: name.to_string(),
            path,
            map,
            _file: file,
        }))
    }

    fn open_read(&self, name: &str, len: usize) -> ManifestResult<Box<dyn MappedRegion>> {
        let path = self.path_for(name);
        let file = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(ManifestError::NotFound(name.to_string()))
            }
            Err(e) => return Err(e.into()),
        };

        let actual = file.metadata()?.len() as usize;
        if actual < len {
            return Err(ManifestError::Truncated {
                name: name.to_string(),
                actual,
                expected: len,
            });
        }

        // SAFETY: the mapping is read-only and never outlives the file handle.
        let map = unsafe { MmapOptions::new().len(len).map(&file)? };

        Ok(Box::new(ReadFileRegion {
            name: name.to_string(),
            map,
            _file: file,
        }))
    }
}

// ============================================================================
// Regions
// ============================================================================

struct OwnedFileRegion {
    name: String,
    path: PathBuf,
    map: MmapMut,
    _file: File,
}

impl MappedRegion for OwnedFileRegion {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn as_ptr(&self) -> *const u8 {
        self.map.as_ptr()
    }

    fn as_mut_ptr(&mut self) -> Option<*mut u8> {
        Some(self.map.as_mut_ptr())
    }
}

impl Drop for OwnedFileRegion {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            tracing::debug!(
                name = %self.name,
                error = %e,
                "failed to unlink shared object"
            );
        }
    }
}

struct ReadFileRegion {
    name: String,
    map: Mmap,
    _file: File,
}

impl MappedRegion for ReadFileRegion {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.map.len()
    }

    fn as_ptr(&self) -> *const u8 {
        self.map.as_ptr()
    }

    fn as_mut_ptr(&mut self) -> Option<*mut u8> {
        None
    }
}
