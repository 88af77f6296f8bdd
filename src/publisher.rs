//! Producer-side publication.
//!
//! Every producer, whatever its frame source, publishes the same way:
//!
//! 1. create a shared texture and a shared fence under PID-derived names
//! 2. create the manifest describing them, counter 0
//! 3. per frame: write the texture, signal the fence with the next value,
//!    submit, then store that value into the manifest counter
//!
//! Consumers read the counter and queue a GPU wait on the fence for it, so
//! the counter may be stored as soon as the signal is submitted.

use frame_manifest::{FrameManifest, ManifestWriter, ProtocolNames, PublishedNames, SharedMemory};

use crate::error::BrokerResult;
use crate::gpu::{soft::pack_color, GpuDevice, TextureDesc};

// ============================================================================
// Frame Publisher
// ============================================================================

/// Owns one published texture + fence + manifest triple.
pub struct FramePublisher<D: GpuDevice> {
    // Drop order is teardown order: manifest first so no consumer finds a
    // manifest whose objects are gone, then fence, then texture.
    manifest: ManifestWriter,
    fence: D::Fence,
    texture: D::Texture,
    names: PublishedNames,
    desc: TextureDesc,
    frame: u64,
}

impl<D: GpuDevice> FramePublisher<D> {
    /// Publish under explicit names.
    pub fn new(
        device: &D,
        ns: &dyn SharedMemory,
        names: PublishedNames,
        desc: TextureDesc,
    ) -> BrokerResult<Self> {
        let texture = device.create_shared_texture(&desc, &names.texture)?;
        let fence = device.create_shared_fence(&names.fence)?;

        let record = FrameManifest::new(
            desc.width,
            desc.height,
            desc.format,
            device.adapter_id(),
            &names.texture,
            &names.fence,
        )?;
        let manifest = ManifestWriter::create(ns, &names.manifest, &record)?;

        log::info!(
            "[PUBLISHER] Publishing {} ({}x{} {:?})",
            names.manifest,
            desc.width,
            desc.height,
            desc.format
        );

        Ok(Self {
            manifest,
            fence,
            texture,
            names,
            desc,
            frame: 0,
        })
    }

    /// Publish under the PID-derived names of `protocol`.
    pub fn for_process(
        device: &D,
        ns: &dyn SharedMemory,
        protocol: &ProtocolNames,
        pid: u32,
        desc: TextureDesc,
    ) -> BrokerResult<Self> {
        Self::new(device, ns, protocol.for_process(pid), desc)
    }

    /// Upload a frame of tightly packed pixels and advertise it.
    pub fn publish(&mut self, device: &D, pixels: &[u8]) -> BrokerResult<u64> {
        device.update_texture(&self.texture, pixels)?;
        self.present(device)
    }

    /// Copy a same-sized texture into the shared texture and advertise it.
    pub fn publish_from(&mut self, device: &D, source: &D::Texture) -> BrokerResult<u64> {
        device.copy_texture(&self.texture, source);
        self.present(device)
    }

    /// Advertise whatever was last written into [`Self::texture`].
    pub fn present(&mut self, device: &D) -> BrokerResult<u64> {
        let next = self.frame + 1;
        device.queue_signal(&self.fence, next);
        device.flush()?;
        self.manifest.publish_frame(next);
        self.frame = next;
        log::trace!("[PUBLISHER] {} frame {}", self.names.manifest, next);
        Ok(next)
    }

    /// Last advertised counter value.
    pub fn frame_counter(&self) -> u64 {
        self.frame
    }

    pub fn texture(&self) -> &D::Texture {
        &self.texture
    }

    pub fn names(&self) -> &PublishedNames {
        &self.names
    }

    pub fn desc(&self) -> TextureDesc {
        self.desc
    }
}

// ============================================================================
// Frame Sources
// ============================================================================

/// Something that yields frames: a camera, a window or screen capture, or a
/// synthetic pattern.
pub trait FrameSource {
    fn desc(&self) -> TextureDesc;

    /// The next frame as tightly packed 4-byte pixels, or `None` when nothing
    /// new is available.
    fn next_frame(&mut self) -> BrokerResult<Option<Vec<u8>>>;
}

/// Solid frames whose color encodes the frame number.
pub struct TestPatternSource {
    desc: TextureDesc,
    frame: u64,
}

impl TestPatternSource {
    pub fn new(desc: TextureDesc) -> Self {
        Self { desc, frame: 0 }
    }

    /// Frames produced so far.
    pub fn frames(&self) -> u64 {
        self.frame
    }
}

/// BGRA8 pixel identifying frame `n`: blue and green carry the low 16 bits.
pub fn marker_color(n: u64) -> u32 {
    let b = (n & 0xFF) as f32 / 255.0;
    let g = ((n >> 8) & 0xFF) as f32 / 255.0;
    pack_color([0.5, g, b, 1.0])
}

/// Inverse of [`marker_color`] for the low 16 bits of a frame number.
pub fn marker_frame(pixel: u32) -> u64 {
    (pixel & 0xFFFF) as u64
}

impl FrameSource for TestPatternSource {
    fn desc(&self) -> TextureDesc {
        self.desc
    }

    fn next_frame(&mut self) -> BrokerResult<Option<Vec<u8>>> {
        self.frame += 1;
        let pixel = marker_color(self.frame).to_le_bytes();
        let count = self.desc.width as usize * self.desc.height as usize;
        Ok(Some(pixel.repeat(count)))
    }
}

// ============================================================================
// Producer
// ============================================================================

/// A frame source wired to a publisher.
pub struct Producer<D: GpuDevice, S: FrameSource> {
    publisher: FramePublisher<D>,
    source: S,
}

impl<D: GpuDevice, S: FrameSource> Producer<D, S> {
    pub fn new(
        device: &D,
        ns: &dyn SharedMemory,
        protocol: &ProtocolNames,
        pid: u32,
        source: S,
    ) -> BrokerResult<Self> {
        let publisher = FramePublisher::for_process(device, ns, protocol, pid, source.desc())?;
        Ok(Self { publisher, source })
    }

    /// Pull one frame from the source and publish it. Returns the new counter,
    /// or `None` when the source had nothing.
    pub fn tick(&mut self, device: &D) -> BrokerResult<Option<u64>> {
        match self.source.next_frame()? {
            Some(pixels) => self.publisher.publish(device, &pixels).map(Some),
            None => Ok(None),
        }
    }

    pub fn publisher(&self) -> &FramePublisher<D> {
        &self.publisher
    }

    pub fn source(&self) -> &S {
        &self.source
    }
}
