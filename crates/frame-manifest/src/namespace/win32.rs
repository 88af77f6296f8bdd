//! Host-global file-mapping namespace.

use windows::core::PCWSTR;
use windows::Win32::Foundation::{CloseHandle, ERROR_FILE_NOT_FOUND, HANDLE, INVALID_HANDLE_VALUE};
use windows::Win32::System::Memory::{
    CreateFileMappingW, MapViewOfFile, OpenFileMappingW, UnmapViewOfFile, FILE_MAP_ALL_ACCESS,
    FILE_MAP_READ, MEMORY_MAPPED_VIEW_ADDRESS, PAGE_READWRITE,
};

use super::{MappedRegion, SharedMemory};
use crate::error::{ManifestError, ManifestResult};
use crate::security::{SecurityAttributes, SDDL_OWNER_WRITE_USERS_READ};

/// A kernel handle closed on drop.
#[derive(Debug)]
pub struct OwnedHandle(HANDLE);

// SAFETY: kernel handles are process-wide and may be closed from any thread.
unsafe impl Send for OwnedHandle {}
unsafe impl Sync for OwnedHandle {}

impl OwnedHandle {
    /// Takes ownership of `handle`.
    ///
    /// # Safety
    /// The handle must be valid and not owned elsewhere.
    pub unsafe fn from_raw(handle: HANDLE) -> Self {
        Self(handle)
    }

    pub fn raw(&self) -> HANDLE {
        self.0
    }
}

impl Drop for OwnedHandle {
    fn drop(&mut self) {
        if !self.0.is_invalid() {
            unsafe {
                let _ = CloseHandle(self.0);
            }
        }
    }
}

pub(crate) fn wide(name: &str) -> Vec<u16> {
    name.encode_utf16().chain(std::iter::once(0)).collect()
}

/// Win32 named file mappings. Names carrying `Global\` are visible across
/// sessions.
#[derive(Debug, Clone, Default)]
pub struct GlobalNamespace;

impl GlobalNamespace {
    pub fn new() -> Self {
        Self
    }
}

impl SharedMemory for GlobalNamespace {
    fn create(&self, name: &str, len: usize) -> ManifestResult<Box<dyn MappedRegion>> {
        let security = SecurityAttributes::from_sddl(SDDL_OWNER_WRITE_USERS_READ)?;
        let wide_name = wide(name);

        let handle = unsafe {
            CreateFileMappingW(
                INVALID_HANDLE_VALUE,
                Some(security.as_ptr()),
                PAGE_READWRITE,
                0,
                len as u32,
                PCWSTR(wide_name.as_ptr()),
            )
        }
        .map_err(|e| os_error(format!("CreateFileMapping {}", name), e))?;
        let handle = unsafe { OwnedHandle::from_raw(handle) };

        let view = unsafe { MapViewOfFile(handle.raw(), FILE_MAP_ALL_ACCESS, 0, 0, len) };
        if view.Value.is_null() {
            return Err(os_error(
                format!("MapViewOfFile {}", name),
                windows::core::Error::from_win32(),
            ));
        }

        // Pagefile-backed mappings are zero-filled, but a stale mapping with the
        // same name keeps its old contents.
        unsafe { std::ptr::write_bytes(view.Value as *mut u8, 0, len) };

        Ok(Box::new(ViewRegion {
            name: name.to_string(),
            view,
            len,
            writable: true,
            _handle: handle,
        }))
    }

    fn open_read(&self, name: &str, len: usize) -> ManifestResult<Box<dyn MappedRegion>> {
        let wide_name = wide(name);
        let handle = unsafe { OpenFileMappingW(FILE_MAP_READ.0, false, PCWSTR(wide_name.as_ptr())) }
            .map_err(|e| {
                if e.code() == ERROR_FILE_NOT_FOUND.to_hresult() {
                    ManifestError::NotFound(name.to_string())
                } else {
                    os_error(format!("OpenFileMapping {}", name), e)
                }
            })?;
        let handle = unsafe { OwnedHandle::from_raw(handle) };

        let view = unsafe { MapViewOfFile(handle.raw(), FILE_MAP_READ, 0, 0, len) };
        if view.Value.is_null() {
            // Mapping smaller than requested
            return Err(ManifestError::Truncated {
                name: name.to_string(),
                actual: 0,
                expected: len,
            });
        }

        Ok(Box::new(ViewRegion {
            name: name.to_string(),
            view,
            len,
            writable: false,
            _handle: handle,
        }))
    }
}

fn os_error(context: String, e: windows::core::Error) -> ManifestError {
    ManifestError::Os {
        context,
        message: e.to_string(),
    }
}

struct ViewRegion {
    name: String,
    view: MEMORY_MAPPED_VIEW_ADDRESS,
    len: usize,
    writable: bool,
    _handle: OwnedHandle,
}

// SAFETY: the view is plain shared memory owned by this region.
unsafe impl Send for ViewRegion {}

impl MappedRegion for ViewRegion {
    fn name(&self) -> &str {
        &self.name
    }

    fn len(&self) -> usize {
        self.len
    }

    fn as_ptr(&self) -> *const u8 {
        self.view.Value as *const u8
    }

    fn as_mut_ptr(&mut self) -> Option<*mut u8> {
        self.writable.then(|| self.view.Value as *mut u8)
    }
}

impl Drop for ViewRegion {
    fn drop(&mut self) {
        unsafe {
            let _ = UnmapViewOfFile(self.view);
        }
    }
}
