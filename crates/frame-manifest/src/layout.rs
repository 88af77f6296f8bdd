//! Fixed binary layouts shared between processes.
//!
//! These structs are `#[repr(C)]` and must keep the same byte layout in every
//! participating process, whatever language it is written in.

use bytemuck::{Pod, Zeroable};
use std::fmt;

use crate::error::{ManifestError, ManifestResult};

/// Capacity of the texture/fence name fields, in UTF-16 units (NUL included).
pub const NAME_CAPACITY: usize = 256;

/// Size in bytes of a [`FrameManifest`].
pub const MANIFEST_SIZE: usize = std::mem::size_of::<FrameManifest>();

const _: () = assert!(MANIFEST_SIZE == 1064);
const _: () = assert!(std::mem::size_of::<ControlsBlock>() == 12);

// ============================================================================
// Pixel Formats
// ============================================================================

/// GPU surface format advertised in the manifest.
///
/// Raw values match `DXGI_FORMAT` so Windows publishers can store their
/// native format unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum PixelFormat {
    Unknown = 0,
    Rgba8Unorm = 28,
    Bgra8Unorm = 87,
    Nv12 = 103,
}

impl PixelFormat {
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            28 => PixelFormat::Rgba8Unorm,
            87 => PixelFormat::Bgra8Unorm,
            103 => PixelFormat::Nv12,
            _ => PixelFormat::Unknown,
        }
    }

    pub fn raw(self) -> u32 {
        self as u32
    }

    /// Bytes per pixel for packed formats, `None` for planar or unknown ones.
    pub fn bytes_per_pixel(self) -> Option<usize> {
        match self {
            PixelFormat::Rgba8Unorm | PixelFormat::Bgra8Unorm => Some(4),
            PixelFormat::Nv12 | PixelFormat::Unknown => None,
        }
    }
}

impl Default for PixelFormat {
    fn default() -> Self {
        PixelFormat::Bgra8Unorm
    }
}

// ============================================================================
// Adapter Identity
// ============================================================================

/// 128-bit GPU adapter identity.
///
/// GPU handles can only be imported by a process running on the same adapter,
/// so consumers compare this against their own adapter before opening anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AdapterId {
    pub high: u64,
    pub low: u64,
}

impl AdapterId {
    pub const fn new(high: u64, low: u64) -> Self {
        Self { high, low }
    }

    /// Build from a Windows `LUID` (`LowPart`, `HighPart`).
    pub fn from_luid(low_part: u32, high_part: i32) -> Self {
        Self {
            high: 0,
            low: ((high_part as u32 as u64) << 32) | low_part as u64,
        }
    }
}

impl fmt::Display for AdapterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}{:016x}", self.high, self.low)
    }
}

// ============================================================================
// Frame Manifest
// ============================================================================

/// The shared descriptor every publisher places in shared memory.
///
/// `frame_counter` is only ever written by the publisher, with a single atomic
/// 64-bit store. It is the value consumers pass to their GPU fence wait; it is
/// not by itself proof that the pixels are visible.
#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
pub struct FrameManifest {
    pub frame_counter: u64,
    pub width: u32,
    pub height: u32,
    pub pixel_format: u32,
    // Keeps the adapter id 8-byte aligned, as a C compiler would.
    _reserved: u32,
    pub adapter_id_high: u64,
    pub adapter_id_low: u64,
    pub texture_name: [u16; NAME_CAPACITY],
    pub fence_name: [u16; NAME_CAPACITY],
}

impl FrameManifest {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        adapter: AdapterId,
        texture_name: &str,
        fence_name: &str,
    ) -> ManifestResult<Self> {
        Ok(Self {
            frame_counter: 0,
            width,
            height,
            pixel_format: format.raw(),
            _reserved: 0,
            adapter_id_high: adapter.high,
            adapter_id_low: adapter.low,
            texture_name: encode_name(texture_name)?,
            fence_name: encode_name(fence_name)?,
        })
    }

    pub fn adapter_id(&self) -> AdapterId {
        AdapterId::new(self.adapter_id_high, self.adapter_id_low)
    }

    pub fn format(&self) -> PixelFormat {
        PixelFormat::from_raw(self.pixel_format)
    }

    pub fn texture_name(&self) -> String {
        decode_name(&self.texture_name)
    }

    pub fn fence_name(&self) -> String {
        decode_name(&self.fence_name)
    }

    /// False while the publisher has mapped the manifest but not filled it in
    /// yet. Fresh mappings are zeroed.
    pub fn is_populated(&self) -> bool {
        self.adapter_id() != AdapterId::default()
            && self.width != 0
            && self.height != 0
            && self.texture_name[0] != 0
            && self.fence_name[0] != 0
    }
}

impl fmt::Debug for FrameManifest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameManifest")
            .field("frame_counter", &self.frame_counter)
            .field("width", &self.width)
            .field("height", &self.height)
            .field("format", &self.format())
            .field("adapter", &self.adapter_id())
            .field("texture_name", &self.texture_name())
            .field("fence_name", &self.fence_name())
            .finish()
    }
}

fn encode_name(name: &str) -> ManifestResult<[u16; NAME_CAPACITY]> {
    let units: Vec<u16> = name.encode_utf16().collect();
    if units.len() >= NAME_CAPACITY {
        return Err(ManifestError::NameTooLong {
            len: units.len(),
            limit: NAME_CAPACITY - 1,
        });
    }
    let mut out = [0u16; NAME_CAPACITY];
    out[..units.len()].copy_from_slice(&units);
    Ok(out)
}

fn decode_name(raw: &[u16]) -> String {
    let end = raw.iter().position(|&c| c == 0).unwrap_or(raw.len());
    String::from_utf16_lossy(&raw[..end])
}

// ============================================================================
// Color Controls
// ============================================================================

/// Color-control block the controlling application may publish for the broker.
///
/// Values are percentages: brightness is an offset (0 = unchanged), contrast
/// and saturation are gains (100 = unchanged).
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ControlsBlock {
    pub brightness: i32,
    pub contrast: i32,
    pub saturation: i32,
}

impl Default for ControlsBlock {
    fn default() -> Self {
        Self {
            brightness: 0,
            contrast: 100,
            saturation: 100,
        }
    }
}
