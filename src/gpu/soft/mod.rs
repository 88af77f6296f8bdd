//! Software GPU device.
//!
//! Executes the broker's GPU command stream on the CPU. Devices created over
//! the same [`SoftHost`] can share textures and fences by name, so producer,
//! broker and subscriber can all run in one test process while keeping the
//! exact cross-process semantics: commands queue until `flush`, and a fence
//! wait on a value not yet signalled holds back every later command.

mod host;
mod image;

pub use host::SoftHost;
pub use image::{pack_color, unpack_color, SoftImage};

use frame_manifest::AdapterId;
use parking_lot::{Mutex, RwLock};
use std::collections::VecDeque;
use std::ffi::c_void;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use super::{ColorControls, GpuDevice, TextureDesc, Viewport};
use crate::error::{BrokerError, BrokerResult};
use host::{FenceCell, ImageCell, Registration};

/// Texture owned by a [`SoftDevice`].
pub struct SoftTexture {
    cell: ImageCell,
    shared: bool,
    _registration: Option<Registration>,
}

impl SoftTexture {
    /// Copy of the current contents (after the last flush).
    pub fn snapshot(&self) -> SoftImage {
        self.cell.read().clone()
    }

    pub fn pixel(&self, x: u32, y: u32) -> u32 {
        self.cell.read().pixel(x, y)
    }
}

/// Fence owned by a [`SoftDevice`].
pub struct SoftFence {
    cell: FenceCell,
    _registration: Option<Registration>,
}

impl SoftFence {
    /// Last value the GPU timeline signalled.
    pub fn completed_value(&self) -> u64 {
        self.cell.load(Ordering::Acquire)
    }
}

enum Command {
    Wait { fence: FenceCell, value: u64 },
    Signal { fence: FenceCell, value: u64 },
    Upload {
        target: ImageCell,
        bytes: Vec<u8>,
    },
    Copy { dst: ImageCell, src: ImageCell },
    Clear {
        target: ImageCell,
        color: [f32; 4],
    },
    Draw {
        target: ImageCell,
        src: ImageCell,
        viewport: Viewport,
        controls: ColorControls,
    },
    Fallback {
        target: ImageCell,
        viewport: Viewport,
        time: f32,
    },
}

/// Counts of commands submitted to a device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SoftStats {
    pub waits: usize,
    pub signals: usize,
    pub uploads: usize,
    pub copies: usize,
    pub clears: usize,
    pub draws: usize,
    pub fallback_draws: usize,
}

pub struct SoftDevice {
    host: SoftHost,
    adapter: AdapterId,
    queue: Mutex<VecDeque<Command>>,
    stats: Mutex<SoftStats>,
    lost: AtomicBool,
}

impl SoftDevice {
    pub fn new(host: SoftHost, adapter: AdapterId) -> Self {
        Self {
            host,
            adapter,
            queue: Mutex::new(VecDeque::new()),
            stats: Mutex::new(SoftStats::default()),
            lost: AtomicBool::new(false),
        }
    }

    pub fn host(&self) -> &SoftHost {
        &self.host
    }

    pub fn stats(&self) -> SoftStats {
        *self.stats.lock()
    }

    /// Commands still waiting on the timeline.
    pub fn pending_commands(&self) -> usize {
        self.queue.lock().len()
    }

    /// Behave as if the adapter was removed.
    pub fn simulate_device_loss(&self) {
        self.lost.store(true, Ordering::Release);
    }

    /// Drop the reference handed out by [`GpuDevice::native_texture`].
    ///
    /// # Safety
    /// `ptr` must come from `native_texture` on a `SoftDevice` and be released
    /// only once.
    pub unsafe fn release_native_texture(ptr: *mut c_void) {
        drop(Arc::from_raw(ptr as *const RwLock<SoftImage>));
    }

    fn push(&self, command: Command) {
        {
            let mut stats = self.stats.lock();
            match &command {
                Command::Wait { .. } => stats.waits += 1,
                Command::Signal { .. } => stats.signals += 1,
                Command::Upload { .. } => stats.uploads += 1,
                Command::Copy { .. } => stats.copies += 1,
                Command::Clear { .. } => stats.clears += 1,
                Command::Draw { .. } => stats.draws += 1,
                Command::Fallback { .. } => stats.fallback_draws += 1,
            }
        }
        self.queue.lock().push_back(command);
    }

    fn execute(command: Command) {
        match command {
            Command::Wait { .. } => {}
            Command::Signal { fence, value } => fence.store(value, Ordering::Release),
            Command::Upload { target, bytes } => target.write().upload(&bytes),
            Command::Copy { dst, src } => {
                if Arc::ptr_eq(&dst, &src) {
                    return;
                }
                let src = src.read();
                dst.write().copy_from(&src);
            }
            Command::Clear { target, color } => target.write().fill(color),
            Command::Draw {
                target,
                src,
                viewport,
                controls,
            } => {
                if Arc::ptr_eq(&target, &src) {
                    let copy = src.read().clone();
                    target.write().draw(&copy, viewport, &controls);
                } else {
                    let src = src.read();
                    target.write().draw(&src, viewport, &controls);
                }
            }
            Command::Fallback {
                target,
                viewport,
                time,
            } => target.write().draw_fallback(viewport, time),
        }
    }

    fn new_cell(desc: &TextureDesc) -> ImageCell {
        Arc::new(RwLock::new(SoftImage::new(*desc)))
    }
}

impl GpuDevice for SoftDevice {
    type Texture = SoftTexture;
    type Fence = SoftFence;

    fn adapter_id(&self) -> AdapterId {
        self.adapter
    }

    fn create_texture(&self, desc: &TextureDesc) -> BrokerResult<SoftTexture> {
        self.check_device()?;
        Ok(SoftTexture {
            cell: Self::new_cell(desc),
            shared: false,
            _registration: None,
        })
    }

    fn create_shared_texture(&self, desc: &TextureDesc, name: &str) -> BrokerResult<SoftTexture> {
        self.check_device()?;
        let cell = Self::new_cell(desc);
        let registration = self.host.register_texture(name, &cell);
        Ok(SoftTexture {
            cell,
            shared: true,
            _registration: Some(registration),
        })
    }

    fn create_shared_fence(&self, name: &str) -> BrokerResult<SoftFence> {
        self.check_device()?;
        let cell: FenceCell = Arc::new(AtomicU64::new(0));
        let registration = self.host.register_fence(name, &cell);
        Ok(SoftFence {
            cell,
            _registration: Some(registration),
        })
    }

    fn open_shared_texture(&self, name: &str) -> BrokerResult<SoftTexture> {
        self.check_device()?;
        let cell = self
            .host
            .lookup_texture(name)
            .ok_or_else(|| {
                BrokerError::ResourceCreation(format!("no shared texture named {}", name))
            })?;
        Ok(SoftTexture {
            cell,
            shared: true,
            _registration: None,
        })
    }

    fn open_shared_fence(&self, name: &str) -> BrokerResult<SoftFence> {
        self.check_device()?;
        let cell = self
            .host
            .lookup_fence(name)
            .ok_or_else(|| {
                BrokerError::ResourceCreation(format!("no shared fence named {}", name))
            })?;
        Ok(SoftFence {
            cell,
            _registration: None,
        })
    }

    fn texture_desc(&self, texture: &SoftTexture) -> TextureDesc {
        texture.cell.read().desc
    }

    fn update_texture(&self, texture: &SoftTexture, pixels: &[u8]) -> BrokerResult<()> {
        let desc = texture.cell.read().desc;
        let expected = desc.width as usize * desc.height as usize * 4;
        if pixels.len() < expected {
            return Err(BrokerError::ResourceCreation(format!(
                "upload of {} bytes into {}x{} texture",
                pixels.len(),
                desc.width,
                desc.height
            )));
        }
        self.push(Command::Upload {
            target: texture.cell.clone(),
            bytes: pixels[..expected].to_vec(),
        });
        Ok(())
    }

    fn queue_wait(&self, fence: &SoftFence, value: u64) {
        self.push(Command::Wait {
            fence: fence.cell.clone(),
            value,
        });
    }

    fn queue_signal(&self, fence: &SoftFence, value: u64) {
        self.push(Command::Signal {
            fence: fence.cell.clone(),
            value,
        });
    }

    fn completed_value(&self, fence: &SoftFence) -> u64 {
        fence.completed_value()
    }

    fn copy_texture(&self, dst: &SoftTexture, src: &SoftTexture) {
        self.push(Command::Copy {
            dst: dst.cell.clone(),
            src: src.cell.clone(),
        });
    }

    fn clear(&self, target: &SoftTexture, color: [f32; 4]) {
        self.push(Command::Clear {
            target: target.cell.clone(),
            color,
        });
    }

    fn draw_texture(
        &self,
        target: &SoftTexture,
        src: &SoftTexture,
        viewport: Viewport,
        controls: &ColorControls,
    ) {
        self.push(Command::Draw {
            target: target.cell.clone(),
            src: src.cell.clone(),
            viewport,
            controls: *controls,
        });
    }

    fn draw_fallback(&self, target: &SoftTexture, viewport: Viewport, time: f32) {
        self.push(Command::Fallback {
            target: target.cell.clone(),
            viewport,
            time,
        });
    }

    fn flush(&self) -> BrokerResult<()> {
        self.check_device()?;
        let mut queue = self.queue.lock();
        loop {
            let blocked = match queue.front() {
                None => break,
                Some(Command::Wait { fence, value }) => fence.load(Ordering::Acquire) < *value,
                Some(_) => false,
            };
            if blocked {
                log::trace!(
                    "[SOFT] Queue stalled on fence wait, {} commands pending",
                    queue.len()
                );
                break;
            }
            if let Some(command) = queue.pop_front() {
                Self::execute(command);
            }
        }
        Ok(())
    }

    fn check_device(&self) -> BrokerResult<()> {
        if self.lost.load(Ordering::Acquire) {
            return Err(BrokerError::DeviceLost("software adapter removed".into()));
        }
        Ok(())
    }

    fn shared_handle(&self, texture: &SoftTexture) -> Option<isize> {
        texture
            .shared
            .then(|| Arc::as_ptr(&texture.cell) as isize)
    }

    fn native_texture(&self, texture: &SoftTexture) -> *mut c_void {
        Arc::into_raw(Arc::clone(&texture.cell)) as *mut c_void
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ADAPTER: AdapterId = AdapterId::new(0, 1);

    #[test]
    fn test_shared_objects_open_by_name() {
        let host = SoftHost::new();
        let producer = SoftDevice::new(host.clone(), ADAPTER);
        let consumer = SoftDevice::new(host.clone(), ADAPTER);

        let tex = producer
            .create_shared_texture(&TextureDesc::bgra(2, 2), "tex")
            .unwrap();
        producer.clear(&tex, [1.0, 0.0, 0.0, 1.0]);
        producer.flush().unwrap();

        let opened = consumer.open_shared_texture("tex").unwrap();
        assert_eq!(opened.pixel(1, 1), pack_color([1.0, 0.0, 0.0, 1.0]));
        assert_eq!(host.open_attempts("tex"), 1);
        assert!(consumer.open_shared_texture("missing").is_err());
        assert_eq!(host.open_attempts("missing"), 1);
    }

    #[test]
    fn test_native_texture_holds_a_reference() {
        let device = SoftDevice::new(SoftHost::new(), ADAPTER);
        let tex = device.create_texture(&TextureDesc::bgra(2, 2)).unwrap();
        let before = Arc::strong_count(&tex.cell);

        let raw = device.native_texture(&tex);
        assert!(!raw.is_null());
        assert_eq!(Arc::strong_count(&tex.cell), before + 1);

        unsafe { SoftDevice::release_native_texture(raw) };
        assert_eq!(Arc::strong_count(&tex.cell), before);
    }

    #[test]
    fn test_dropping_creator_unpublishes_name() {
        let host = SoftHost::new();
        let device = SoftDevice::new(host.clone(), ADAPTER);
        let fence = device.create_shared_fence("fence").unwrap();
        let opened = device.open_shared_fence("fence").unwrap();

        drop(fence);
        assert!(!host.has_fence("fence"));
        assert!(device.open_shared_fence("fence").is_err());
        assert_eq!(opened.completed_value(), 0);
    }

    #[test]
    fn test_unmet_wait_stalls_the_queue() {
        let host = SoftHost::new();
        let producer = SoftDevice::new(host.clone(), ADAPTER);
        let consumer = SoftDevice::new(host.clone(), ADAPTER);

        let fence = producer.create_shared_fence("fence").unwrap();
        let theirs = consumer.open_shared_fence("fence").unwrap();
        let target = consumer.create_texture(&TextureDesc::bgra(1, 1)).unwrap();

        consumer.queue_wait(&theirs, 1);
        consumer.clear(&target, [1.0, 1.0, 1.0, 1.0]);
        consumer.flush().unwrap();
        assert_eq!(target.pixel(0, 0), 0);
        assert_eq!(consumer.pending_commands(), 2);

        producer.queue_signal(&fence, 1);
        producer.flush().unwrap();
        consumer.flush().unwrap();
        assert_eq!(target.pixel(0, 0), pack_color([1.0, 1.0, 1.0, 1.0]));
        assert_eq!(consumer.pending_commands(), 0);
    }

    #[test]
    fn test_device_loss() {
        let device = SoftDevice::new(SoftHost::new(), ADAPTER);
        device.simulate_device_loss();
        assert!(matches!(device.flush(), Err(BrokerError::DeviceLost(_))));
        assert!(device.create_texture(&TextureDesc::bgra(1, 1)).is_err());
    }

    #[test]
    fn test_upload_requires_full_frame() {
        let device = SoftDevice::new(SoftHost::new(), ADAPTER);
        let tex = device.create_texture(&TextureDesc::bgra(2, 2)).unwrap();
        assert!(device.update_texture(&tex, &[0u8; 8]).is_err());
        device.update_texture(&tex, &[0xFFu8; 16]).unwrap();
        device.flush().unwrap();
        assert_eq!(tex.pixel(1, 1), 0xFFFF_FFFF);
    }
}
