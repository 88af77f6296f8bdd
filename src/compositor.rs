//! Composite pass.
//!
//! Each pass syncs every connection, draws the routed sources into a private
//! target, then republishes the target through the broker's own
//! [`FramePublisher`]. The output counter advances by one every pass, with or
//! without sources, so consumers can tell an idle broker from a dead one.

use frame_manifest::{ControlsBlock, PublishedNames, SharedMemory, SharedRecord};
use std::time::Instant;

use crate::connection::ConnectionPool;
use crate::error::BrokerResult;
use crate::gpu::{ColorControls, GpuDevice, TextureDesc, Viewport, CLEAR_COLOR};
use crate::publisher::FramePublisher;
use crate::routing::{grid_cells, RoutingTable};

/// What one pass drew.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompositeReport {
    /// Output counter after the pass.
    pub frame: u64,
    /// Connections that queued a copy.
    pub synced: usize,
    /// Sources drawn, in draw order.
    pub drawn: Vec<u32>,
    pub fallback: bool,
}

pub struct Compositor<D: GpuDevice> {
    target: D::Texture,
    output: FramePublisher<D>,
    controls_name: Option<String>,
    controls: Option<SharedRecord<ControlsBlock>>,
    started: Instant,
}

impl<D: GpuDevice> Compositor<D> {
    /// Create the composite target and publish the output under `names`.
    pub fn new(
        device: &D,
        ns: &dyn SharedMemory,
        names: PublishedNames,
        desc: TextureDesc,
        controls_name: Option<String>,
    ) -> BrokerResult<Self> {
        let target = device.create_texture(&desc)?;
        let output = FramePublisher::new(device, ns, names, desc)?;
        Ok(Self {
            target,
            output,
            controls_name,
            controls: None,
            started: Instant::now(),
        })
    }

    pub fn output(&self) -> &FramePublisher<D> {
        &self.output
    }

    pub fn desc(&self) -> TextureDesc {
        self.output.desc()
    }

    /// Run one pass.
    pub fn composite_frames(
        &mut self,
        device: &D,
        ns: &dyn SharedMemory,
        pool: &mut ConnectionPool<D>,
        routing: &RoutingTable,
        now: Instant,
    ) -> BrokerResult<CompositeReport> {
        let mut report = CompositeReport {
            synced: pool.sync_all(device, now),
            ..Default::default()
        };

        let desc = self.output.desc();
        let full = Viewport::full(desc.width, desc.height);
        let time = now.saturating_duration_since(self.started).as_secs_f32();
        let controls = self.read_controls(ns);

        device.clear(&self.target, CLEAR_COLOR);

        if routing.is_grid() {
            let pids = pool.connected_pids();
            if pids.is_empty() {
                device.draw_fallback(&self.target, full, time);
                report.fallback = true;
            }
            let cells = grid_cells(pids.len(), desc.width, desc.height);
            for (pid, cell) in pids.iter().zip(cells) {
                if let Some(mirror) = pool.mirror(*pid) {
                    device.draw_texture(&self.target, mirror, cell, &controls);
                    report.drawn.push(*pid);
                }
            }
        } else {
            let main = routing
                .main()
                .and_then(|pid| pool.mirror(pid).map(|m| (pid, m)));
            match main {
                Some((pid, mirror)) => {
                    device.draw_texture(&self.target, mirror, full, &controls);
                    report.drawn.push(pid);
                }
                None => {
                    device.draw_fallback(&self.target, full, time);
                    report.fallback = true;
                }
            }
            for (corner, pid) in routing.pips() {
                if let Some(mirror) = pool.mirror(pid) {
                    let viewport = corner.viewport(desc.width, desc.height);
                    device.draw_texture(&self.target, mirror, viewport, &controls);
                    report.drawn.push(pid);
                }
            }
        }

        report.frame = self.output.publish_from(device, &self.target)?;
        log::trace!(
            "[MUX] Frame {} drew {:?}{}",
            report.frame,
            report.drawn,
            if report.fallback { " + fallback" } else { "" }
        );
        Ok(report)
    }

    /// Current color controls. The block is looked up lazily and may appear at
    /// any time.
    fn read_controls(&mut self, ns: &dyn SharedMemory) -> ColorControls {
        if self.controls.is_none() {
            if let Some(name) = &self.controls_name {
                match SharedRecord::<ControlsBlock>::open_read(ns, name) {
                    Ok(record) => {
                        log::info!("[MUX] Using color controls from {}", name);
                        self.controls = Some(record);
                    }
                    Err(e) if e.is_not_found() => {}
                    Err(e) => log::debug!("[MUX] Color controls unavailable: {}", e),
                }
            }
        }
        self.controls
            .as_ref()
            .map(|record| ColorControls::from_block(&record.read()))
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::soft::{pack_color, SoftDevice, SoftHost};
    use frame_manifest::{AdapterId, FileNamespace, ManifestReader, ProtocolNames};

    const ADAPTER: AdapterId = AdapterId::new(0, 2);

    fn compositor(
        ns: &FileNamespace,
        device: &SoftDevice,
        controls: Option<&str>,
    ) -> Compositor<SoftDevice> {
        Compositor::new(
            device,
            ns,
            ProtocolNames::new("FrameBroker_", false).well_known("Broker"),
            TextureDesc::bgra(64, 36),
            controls.map(str::to_string),
        )
        .unwrap()
    }

    #[test]
    fn test_idle_pass_draws_fallback_and_advances() {
        let dir = tempfile::tempdir().unwrap();
        let ns = FileNamespace::new(dir.path()).unwrap();
        let device = SoftDevice::new(SoftHost::new(), ADAPTER);
        let mut compositor = compositor(&ns, &device, None);
        let mut pool = ConnectionPool::new();
        let reader = ManifestReader::open(&ns, "FrameBroker_Broker").unwrap();

        for n in 1..=3 {
            let report = compositor
                .composite_frames(
                    &device,
                    &ns,
                    &mut pool,
                    &RoutingTable::new(),
                    Instant::now(),
                )
                .unwrap();
            assert_eq!(report.frame, n);
            assert!(report.fallback);
            assert!(report.drawn.is_empty());
            assert_eq!(reader.frame_counter(), n);
        }
        assert_eq!(device.stats().fallback_draws, 3);

        let output = device.open_shared_texture("FrameBroker_Texture_Broker").unwrap();
        assert_ne!(output.pixel(32, 18), pack_color(CLEAR_COLOR));
    }

    #[test]
    fn test_grid_without_sources_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let ns = FileNamespace::new(dir.path()).unwrap();
        let device = SoftDevice::new(SoftHost::new(), ADAPTER);
        let mut compositor = compositor(&ns, &device, None);
        let mut routing = RoutingTable::new();
        routing.set_grid(true);

        let report = compositor
            .composite_frames(
                &device,
                &ns,
                &mut ConnectionPool::new(),
                &routing,
                Instant::now(),
            )
            .unwrap();
        assert!(report.fallback);
    }

    #[test]
    fn test_controls_block_is_picked_up_late() {
        let dir = tempfile::tempdir().unwrap();
        let ns = FileNamespace::new(dir.path()).unwrap();
        let device = SoftDevice::new(SoftHost::new(), ADAPTER);
        let mut compositor = compositor(&ns, &device, Some("FrameBroker_Controls"));

        assert!(compositor.read_controls(&ns).is_identity());

        let mut block = SharedRecord::create(&ns, "FrameBroker_Controls", &ControlsBlock::default())
            .unwrap();
        assert!(compositor.read_controls(&ns).is_identity());

        block
            .write(&ControlsBlock {
                brightness: 10,
                contrast: 100,
                saturation: 0,
            })
            .unwrap();
        let controls = compositor.read_controls(&ns);
        assert_eq!(controls.brightness, 0.1);
        assert_eq!(controls.saturation, 0.0);
    }
}
