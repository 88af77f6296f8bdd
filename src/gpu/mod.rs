//! GPU device abstraction.
//!
//! The broker only needs a handful of GPU operations: named shared textures and
//! fences, queued fence waits/signals, copies, clears and a textured
//! full-screen-triangle draw. [`GpuDevice`] captures exactly those, with two
//! backends:
//!
//! - `d3d11` (Windows): Direct3D 11.4 with NT-handle sharing.
//! - [`soft`]: a software device over an in-process named-object table, used on
//!   other platforms and by the test suite.
//!
//! All commands are queued; nothing runs until [`GpuDevice::flush`]. A queued
//! fence wait whose value has not been reached holds back everything queued
//! after it, which is what makes the counter-then-fence protocol safe.

#[cfg(windows)]
pub mod d3d11;
pub mod soft;

use bytemuck::{Pod, Zeroable};
use frame_manifest::{AdapterId, ControlsBlock, PixelFormat};
use std::ffi::c_void;

use crate::error::BrokerResult;

/// Size and format of a 2D texture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TextureDesc {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

impl TextureDesc {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            format,
        }
    }

    pub fn bgra(width: u32, height: u32) -> Self {
        Self::new(width, height, PixelFormat::Bgra8Unorm)
    }
}

/// Destination rectangle in target pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Viewport {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
}

impl Viewport {
    pub fn new(x: f32, y: f32, width: f32, height: f32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    /// The whole target.
    pub fn full(width: u32, height: u32) -> Self {
        Self::new(0.0, 0.0, width as f32, height as f32)
    }
}

/// Per-draw color adjustment, laid out as the shader's 16-byte constant buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ColorControls {
    /// Added after contrast, in normalized units.
    pub brightness: f32,
    /// Gain around mid-grey.
    pub contrast: f32,
    /// 0 = greyscale, 1 = unchanged.
    pub saturation: f32,
    _pad: f32,
}

impl ColorControls {
    pub const IDENTITY: ColorControls = ColorControls {
        brightness: 0.0,
        contrast: 1.0,
        saturation: 1.0,
        _pad: 1.0,
    };

    pub fn new(brightness: f32, contrast: f32, saturation: f32) -> Self {
        Self {
            brightness,
            contrast,
            saturation,
            _pad: 1.0,
        }
    }

    /// Percent values from the shared controls block.
    pub fn from_block(block: &ControlsBlock) -> Self {
        Self::new(
            block.brightness as f32 / 100.0,
            block.contrast as f32 / 100.0,
            block.saturation as f32 / 100.0,
        )
    }

    pub fn is_identity(&self) -> bool {
        self.brightness == 0.0 && self.contrast == 1.0 && self.saturation == 1.0
    }

    /// CPU version of the pixel shader's adjustment, on normalized RGB.
    pub fn apply(&self, rgb: [f32; 3]) -> [f32; 3] {
        let mut c = rgb.map(|v| (v - 0.5) * self.contrast + 0.5 + self.brightness);
        let luma = c[0] * 0.299 + c[1] * 0.587 + c[2] * 0.114;
        for v in &mut c {
            *v = (luma + (*v - luma) * self.saturation).clamp(0.0, 1.0);
        }
        c
    }
}

impl Default for ColorControls {
    fn default() -> Self {
        Self::IDENTITY
    }
}

/// Clear color of the composite target (dark blue).
pub const CLEAR_COLOR: [f32; 4] = [0.0, 0.1, 0.2, 1.0];

/// The idle pattern drawn when no main source is live: a blue gradient with a
/// bright bar sweeping left to right every four seconds.
pub fn fallback_color(u: f32, v: f32, time: f32) -> [f32; 4] {
    let sweep = (time * 0.25).fract();
    if (u - sweep).abs() < 0.02 {
        [0.9, 0.9, 0.9, 1.0]
    } else {
        [0.1 + u * 0.2, 0.1 + v * 0.2, 0.4, 1.0]
    }
}

/// Operations the broker, publishers and subscribers need from a GPU.
///
/// Textures and fences are owning values: dropping one releases the GPU object
/// and any OS handle it carries.
pub trait GpuDevice {
    type Texture;
    type Fence;

    /// Identity of the adapter this device runs on.
    fn adapter_id(&self) -> AdapterId;

    /// Private render target / shader resource.
    fn create_texture(&self, desc: &TextureDesc) -> BrokerResult<Self::Texture>;

    /// Texture exported under `name` for other processes on the host.
    fn create_shared_texture(&self, desc: &TextureDesc, name: &str) -> BrokerResult<Self::Texture>;

    /// Fence starting at 0, exported under `name`.
    fn create_shared_fence(&self, name: &str) -> BrokerResult<Self::Fence>;

    fn open_shared_texture(&self, name: &str) -> BrokerResult<Self::Texture>;

    fn open_shared_fence(&self, name: &str) -> BrokerResult<Self::Fence>;

    fn texture_desc(&self, texture: &Self::Texture) -> TextureDesc;

    /// Queue an upload of tightly packed 4-byte pixels.
    fn update_texture(&self, texture: &Self::Texture, pixels: &[u8]) -> BrokerResult<()>;

    /// Queue a GPU-side wait until `fence` reaches `value`. Does not block the CPU.
    fn queue_wait(&self, fence: &Self::Fence, value: u64);

    /// Queue a GPU-side signal of `fence` to `value`.
    fn queue_signal(&self, fence: &Self::Fence, value: u64);

    /// Highest value the fence's timeline has reached.
    fn completed_value(&self, fence: &Self::Fence) -> u64;

    fn copy_texture(&self, dst: &Self::Texture, src: &Self::Texture);

    fn clear(&self, target: &Self::Texture, color: [f32; 4]);

    /// Full-screen-triangle blit of `src` into `viewport` of `target`.
    fn draw_texture(
        &self,
        target: &Self::Texture,
        src: &Self::Texture,
        viewport: Viewport,
        controls: &ColorControls,
    );

    /// Draw the animated idle pattern into `viewport`.
    fn draw_fallback(&self, target: &Self::Texture, viewport: Viewport, time: f32);

    /// Submit queued work. Fails with `DeviceLost` when the device is gone.
    fn flush(&self) -> BrokerResult<()>;

    /// `DeviceLost` if the device has been removed or reset.
    fn check_device(&self) -> BrokerResult<()>;

    /// OS handle of a shared texture, if it has one.
    fn shared_handle(&self, texture: &Self::Texture) -> Option<isize>;

    /// Native texture object pointer for hosts on the same device. The pointer
    /// carries its own reference; the caller releases it.
    fn native_texture(&self, texture: &Self::Texture) -> *mut c_void;
}
