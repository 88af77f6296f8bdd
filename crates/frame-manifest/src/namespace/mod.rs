//! Named shared-memory namespaces and typed views over them.
//!
//! A [`SharedMemory`] namespace creates or opens named regions. On Windows the
//! host-global file-mapping namespace is used ([`win32::GlobalNamespace`]);
//! everywhere else (and in tests) a directory of memory-mapped files plays that
//! role ([`FileNamespace`]).

mod file;
#[cfg(windows)]
pub mod win32;

pub use file::FileNamespace;

use bytemuck::Pod;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{ManifestError, ManifestResult};
use crate::layout::{FrameManifest, MANIFEST_SIZE};

/// A mapped view of a named shared region. Dropping it unmaps the view; the
/// creating side also unlinks the name.
pub trait MappedRegion: Send {
    fn name(&self) -> &str;
    fn len(&self) -> usize;
    fn as_ptr(&self) -> *const u8;
    /// `None` when the view is read-only.
    fn as_mut_ptr(&mut self) -> Option<*mut u8>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A namespace of named shared-memory regions.
pub trait SharedMemory: Send + Sync {
    /// Create (or recreate) a zero-filled region writable by this process and
    /// readable by every other process on the host.
    fn create(&self, name: &str, len: usize) -> ManifestResult<Box<dyn MappedRegion>>;

    /// Open an existing region read-only.
    fn open_read(&self, name: &str, len: usize) -> ManifestResult<Box<dyn MappedRegion>>;
}

// ============================================================================
// Typed Records
// ============================================================================

/// A single `T` living in a shared region.
pub struct SharedRecord<T: Pod> {
    region: Box<dyn MappedRegion>,
    _marker: PhantomData<T>,
}

impl<T: Pod> SharedRecord<T> {
    /// Create the region and store `initial` in it.
    pub fn create(ns: &dyn SharedMemory, name: &str, initial: &T) -> ManifestResult<Self> {
        let mut region = ns.create(name, std::mem::size_of::<T>())?;
        let ptr = region
            .as_mut_ptr()
            .ok_or_else(|| ManifestError::ReadOnly(name.to_string()))?;
        let bytes = bytemuck::bytes_of(initial);
        // SAFETY: the region is at least size_of::<T>() bytes and exclusively ours.
        unsafe { std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr, bytes.len()) };
        Ok(Self {
            region,
            _marker: PhantomData,
        })
    }

    pub fn open_read(ns: &dyn SharedMemory, name: &str) -> ManifestResult<Self> {
        let region = ns.open_read(name, std::mem::size_of::<T>())?;
        if region.len() < std::mem::size_of::<T>() {
            return Err(ManifestError::Truncated {
                name: name.to_string(),
                actual: region.len(),
                expected: std::mem::size_of::<T>(),
            });
        }
        Ok(Self {
            region,
            _marker: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        self.region.name()
    }

    /// Copy the current contents out of shared memory.
    pub fn read(&self) -> T {
        // SAFETY: length was checked on open/create; T is Pod so any bytes are valid.
        unsafe { std::ptr::read_unaligned(self.region.as_ptr() as *const T) }
    }

    pub fn write(&mut self, value: &T) -> ManifestResult<()> {
        let name = self.region.name().to_string();
        let ptr = self
            .region
            .as_mut_ptr()
            .ok_or(ManifestError::ReadOnly(name))?;
        // SAFETY: see `create`.
        unsafe { std::ptr::write_unaligned(ptr as *mut T, *value) };
        Ok(())
    }

    /// The 64-bit word at offset 0, viewed as an atomic.
    fn head_counter(&self) -> &AtomicU64 {
        // SAFETY: mappings are page aligned and at least 8 bytes long; every
        // record using this accessor starts with a u64.
        unsafe { &*(self.region.as_ptr() as *const AtomicU64) }
    }
}

// ============================================================================
// Manifest Views
// ============================================================================

/// Publisher-side manifest. Dropping it tears the manifest down.
pub struct ManifestWriter {
    record: SharedRecord<FrameManifest>,
}

impl ManifestWriter {
    /// Create the manifest with a zero frame counter.
    pub fn create(
        ns: &dyn SharedMemory,
        name: &str,
        manifest: &FrameManifest,
    ) -> ManifestResult<Self> {
        let mut initial = *manifest;
        initial.frame_counter = 0;
        let record = SharedRecord::create(ns, name, &initial)?;
        tracing::debug!(name, size = MANIFEST_SIZE, "manifest created");
        Ok(Self { record })
    }

    pub fn name(&self) -> &str {
        self.record.name()
    }

    /// Advertise a new frame. Must only be called after the matching fence
    /// signal has been submitted.
    pub fn publish_frame(&self, value: u64) {
        self.record.head_counter().store(value, Ordering::Release);
    }

    pub fn frame_counter(&self) -> u64 {
        self.record.head_counter().load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> FrameManifest {
        let mut m = self.record.read();
        m.frame_counter = self.frame_counter();
        m
    }
}

/// Consumer-side, read-only manifest view.
pub struct ManifestReader {
    record: SharedRecord<FrameManifest>,
}

impl ManifestReader {
    pub fn open(ns: &dyn SharedMemory, name: &str) -> ManifestResult<Self> {
        Ok(Self {
            record: SharedRecord::open_read(ns, name)?,
        })
    }

    pub fn name(&self) -> &str {
        self.record.name()
    }

    /// Lock-free read of the publisher's frame counter.
    pub fn frame_counter(&self) -> u64 {
        self.record.head_counter().load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> FrameManifest {
        let mut m = self.record.read();
        m.frame_counter = self.frame_counter();
        m
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::{AdapterId, ControlsBlock, PixelFormat};

    fn manifest() -> FrameManifest {
        FrameManifest::new(
            640,
            480,
            PixelFormat::Bgra8Unorm,
            AdapterId::new(0, 9),
            "tex",
            "fence",
        )
        .unwrap()
    }

    #[test]
    fn reader_sees_writer_counter() {
        let dir = tempfile::tempdir().unwrap();
        let ns = FileNamespace::new(dir.path()).unwrap();

        let writer = ManifestWriter::create(&ns, "FB_1", &manifest()).unwrap();
        let reader = ManifestReader::open(&ns, "FB_1").unwrap();
        assert_eq!(reader.frame_counter(), 0);

        writer.publish_frame(5);
        assert_eq!(reader.frame_counter(), 5);

        let snap = reader.snapshot();
        assert_eq!(snap.frame_counter, 5);
        assert_eq!(snap.width, 640);
        assert_eq!(snap.texture_name(), "tex");
        assert_eq!(snap.adapter_id(), AdapterId::new(0, 9));
    }

    #[test]
    fn writer_starts_from_zero_even_if_given_a_counter() {
        let dir = tempfile::tempdir().unwrap();
        let ns = FileNamespace::new(dir.path()).unwrap();
        let mut m = manifest();
        m.frame_counter = 77;

        let writer = ManifestWriter::create(&ns, "FB_2", &m).unwrap();
        assert_eq!(writer.frame_counter(), 0);
    }

    #[test]
    fn readers_cannot_write() {
        let dir = tempfile::tempdir().unwrap();
        let ns = FileNamespace::new(dir.path()).unwrap();
        let _owner = SharedRecord::create(&ns, "controls", &ControlsBlock::default()).unwrap();

        let mut reader = SharedRecord::<ControlsBlock>::open_read(&ns, "controls").unwrap();
        assert_eq!(reader.read(), ControlsBlock::default());
        assert!(matches!(
            reader.write(&ControlsBlock::default()),
            Err(ManifestError::ReadOnly(_))
        ));
    }

    #[test]
    fn record_updates_are_visible() {
        let dir = tempfile::tempdir().unwrap();
        let ns = FileNamespace::new(dir.path()).unwrap();
        let mut owner = SharedRecord::create(&ns, "controls", &ControlsBlock::default()).unwrap();
        let reader = SharedRecord::<ControlsBlock>::open_read(&ns, "controls").unwrap();

        owner
            .write(&ControlsBlock {
                brightness: 10,
                contrast: 120,
                saturation: 0,
            })
            .unwrap();
        assert_eq!(reader.read().contrast, 120);
        assert_eq!(reader.read().saturation, 0);
    }
}
