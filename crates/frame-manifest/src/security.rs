//! Security descriptors for host-global named objects.

use std::ffi::c_void;

use windows::core::PCWSTR;
use windows::Win32::Foundation::{LocalFree, BOOL, HLOCAL};
use windows::Win32::Security::Authorization::{
    ConvertStringSecurityDescriptorToSecurityDescriptorW, SDDL_REVISION_1,
};
use windows::Win32::Security::{PSECURITY_DESCRIPTOR, SECURITY_ATTRIBUTES};

use crate::error::{ManifestError, ManifestResult};

/// Owner gets full access, authenticated users may read.
pub const SDDL_OWNER_WRITE_USERS_READ: &str = "D:P(A;;GA;;;OW)(A;;GR;;;AU)";

/// Full access for every authenticated user. Needed for GPU objects, which are
/// opened for read-write by every consumer.
pub const SDDL_USERS_ALL: &str = "D:P(A;;GA;;;AU)";

/// A parsed security descriptor and the attributes pointing at it.
pub struct SecurityAttributes {
    descriptor: PSECURITY_DESCRIPTOR,
    attributes: SECURITY_ATTRIBUTES,
}

impl SecurityAttributes {
    pub fn from_sddl(sddl: &str) -> ManifestResult<Self> {
        let wide: Vec<u16> = sddl.encode_utf16().chain(std::iter::once(0)).collect();
        let mut descriptor = PSECURITY_DESCRIPTOR::default();

        unsafe {
            ConvertStringSecurityDescriptorToSecurityDescriptorW(
                PCWSTR(wide.as_ptr()),
                SDDL_REVISION_1,
                &mut descriptor,
                None,
            )
        }
        .map_err(|e| ManifestError::Os {
            context: format!("parse security descriptor {}", sddl),
            message: e.to_string(),
        })?;

        Ok(Self {
            descriptor,
            attributes: SECURITY_ATTRIBUTES {
                nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
                lpSecurityDescriptor: descriptor.0,
                bInheritHandle: BOOL(0),
            },
        })
    }

    /// Pointer valid for as long as `self` lives.
    pub fn as_ptr(&self) -> *const SECURITY_ATTRIBUTES {
        &self.attributes
    }
}

impl Drop for SecurityAttributes {
    fn drop(&mut self) {
        if !self.descriptor.0.is_null() {
            unsafe {
                let _ = LocalFree(HLOCAL(self.descriptor.0 as *mut c_void));
            }
        }
    }
}
