//! The broker: discovery, connections, routing and the composite output,
//! driven one pass at a time from a single render thread.

use frame_manifest::{PixelFormat, SharedMemory};
use host_processes::ProcessTable;
use std::ffi::c_void;
use std::sync::Arc;
use std::time::Instant;

use crate::compositor::{CompositeReport, Compositor};
use crate::config::BrokerConfig;
use crate::connection::ConnectionPool;
use crate::discovery::Discovery;
use crate::error::{BrokerError, BrokerResult};
use crate::gpu::{GpuDevice, TextureDesc};
use crate::routing::{PipCorner, RoutingTable};

/// Aggregate health reported to the controlling application.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BrokerState {
    /// Producers exist but none of the routed ones is live.
    Searching = 0,
    /// A routed source is live.
    Connected = 1,
    /// No producers at all, or the broker lost its device.
    Failed = 2,
}

/// Corner [`BrokerFacade::set_pip_producer_pid`] binds.
pub const DEFAULT_PIP_CORNER: PipCorner = PipCorner::BottomRight;

/// The operations the controlling application drives. Initialization is
/// construction of the implementing type.
pub trait BrokerFacade {
    /// One discovery-aware composite pass.
    fn render_frame(&mut self) -> BrokerResult<()>;

    /// OS handle of the composite output texture.
    fn shared_texture_handle(&self) -> Option<isize>;

    /// Native pointer to the composite output texture, with a reference the
    /// caller owns.
    fn shared_texture(&self) -> *mut c_void;

    fn state(&self) -> BrokerState;

    /// Entry 0 is main, entries 1..=4 the PIP corners; 0 leaves a slot empty.
    fn update_producer_priority_list(&mut self, pids: &[u32]);

    fn set_preferred_producer_pid(&mut self, pid: u32);

    fn set_pip_producer_pid(&mut self, pid: u32);

    fn set_compositing_mode(&mut self, grid: bool);

    /// Release everything. Further passes fail with `NotInitialized`.
    fn shutdown(&mut self);
}

/// Device-dependent state. Released as a unit on shutdown or device loss.
struct Running<D: GpuDevice> {
    // Connections go before the output publication.
    pool: ConnectionPool<D>,
    compositor: Compositor<D>,
}

pub struct Broker<D: GpuDevice> {
    running: Option<Running<D>>,
    discovery: Discovery,
    routing: RoutingTable,
    processes: Arc<dyn ProcessTable>,
    ns: Arc<dyn SharedMemory>,
    state: BrokerState,
    // Dropped last.
    device: D,
}

impl<D: GpuDevice> Broker<D> {
    /// Publish the composite output and get ready to discover producers.
    pub fn new(
        device: D,
        ns: Arc<dyn SharedMemory>,
        processes: Arc<dyn ProcessTable>,
        config: &BrokerConfig,
    ) -> BrokerResult<Self> {
        config.validate()?;

        let desc = TextureDesc::new(
            config.output_width,
            config.output_height,
            config.output_format.pixel_format(),
        );
        let protocol = config.protocol_names();
        let names = protocol.well_known(&config.output_tag);
        let controls = config
            .controls_block_name
            .as_deref()
            .map(|name| protocol.object_name(name));

        let compositor = Compositor::new(&device, ns.as_ref(), names, desc, controls)?;
        let discovery = Discovery::new(processes.clone(), device.adapter_id(), config);

        log::info!(
            "[BROKER] Initialized: output {} {}x{} on adapter {}",
            compositor.output().names().manifest,
            desc.width,
            desc.height,
            device.adapter_id()
        );

        Ok(Self {
            running: Some(Running {
                pool: ConnectionPool::new(),
                compositor,
            }),
            discovery,
            routing: RoutingTable::new(),
            processes,
            ns,
            state: BrokerState::Failed,
            device,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    pub fn routing(&self) -> &RoutingTable {
        &self.routing
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn connections(&self) -> Option<&ConnectionPool<D>> {
        self.running.as_ref().map(|r| &r.pool)
    }

    /// Output counter, 0 once torn down.
    pub fn frame_counter(&self) -> u64 {
        self.running
            .as_ref()
            .map_or(0, |r| r.compositor.output().frame_counter())
    }

    pub fn output_texture(&self) -> Option<&D::Texture> {
        self.running.as_ref().map(|r| r.compositor.output().texture())
    }

    pub fn output_format(&self) -> Option<PixelFormat> {
        self.running.as_ref().map(|r| r.compositor.desc().format)
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// One pass at `now`.
    ///
    /// Liveness pruning runs every pass; scanning and connecting only when the
    /// discovery cadence has elapsed. A fatal error tears the broker down.
    pub fn render_frame_at(&mut self, now: Instant) -> BrokerResult<CompositeReport> {
        let result = self.pass(now);
        if let Err(e) = &result {
            if e.is_fatal() {
                log::error!("[BROKER] {}; tearing down", e);
                self.teardown();
            }
        }
        self.state = self.compute_state();
        result
    }

    fn pass(&mut self, now: Instant) -> BrokerResult<CompositeReport> {
        let running = self.running.as_mut().ok_or(BrokerError::NotInitialized)?;
        self.device.check_device()?;

        for pid in running.pool.prune_exited() {
            log::debug!("[BROKER] Producer {} exited", pid);
        }

        if self.discovery.poll(self.ns.as_ref(), now) {
            running.pool.prune_connections(self.discovery.streams());

            let streams = self.discovery.streams().to_vec();
            for stream in &streams {
                if running.pool.contains(stream.pid) {
                    continue;
                }
                match running.pool.update_connection(
                    &self.device,
                    self.ns.as_ref(),
                    self.processes.as_ref(),
                    stream,
                ) {
                    Ok(_) => {}
                    Err(BrokerError::AdapterMismatch { pid }) => {
                        self.discovery.record_adapter_mismatch(pid)
                    }
                    Err(e) if e.is_fatal() => return Err(e),
                    Err(_) => self.discovery.record_open_failure(stream.pid),
                }
            }
        }

        running.compositor.composite_frames(
            &self.device,
            self.ns.as_ref(),
            &mut running.pool,
            &self.routing,
            now,
        )
    }

    fn compute_state(&self) -> BrokerState {
        let Some(running) = &self.running else {
            return BrokerState::Failed;
        };
        if self.discovery.streams().is_empty() {
            return BrokerState::Failed;
        }
        let live = if self.routing.is_grid() {
            !running.pool.connected_pids().is_empty()
        } else {
            self.routing
                .routed_pids()
                .any(|pid| running.pool.mirror(pid).is_some())
        };
        if live {
            BrokerState::Connected
        } else {
            BrokerState::Searching
        }
    }

    fn teardown(&mut self) {
        if let Some(mut running) = self.running.take() {
            running.pool.clear();
            drop(running);
            log::info!("[BROKER] Released GPU resources");
        }
    }
}

impl<D: GpuDevice> BrokerFacade for Broker<D> {
    fn render_frame(&mut self) -> BrokerResult<()> {
        self.render_frame_at(Instant::now()).map(|_| ())
    }

    fn shared_texture_handle(&self) -> Option<isize> {
        self.output_texture()
            .and_then(|texture| self.device.shared_handle(texture))
    }

    fn shared_texture(&self) -> *mut c_void {
        self.output_texture().map_or(std::ptr::null_mut(), |texture| {
            self.device.native_texture(texture)
        })
    }

    fn state(&self) -> BrokerState {
        self.state
    }

    fn update_producer_priority_list(&mut self, pids: &[u32]) {
        log::debug!("[BROKER] Priority list {:?}", pids);
        self.routing.set_priority_list(pids);
    }

    fn set_preferred_producer_pid(&mut self, pid: u32) {
        log::debug!("[BROKER] Main source {}", pid);
        self.routing.set_main(pid);
    }

    fn set_pip_producer_pid(&mut self, pid: u32) {
        log::debug!("[BROKER] PIP source {}", pid);
        self.routing.set_pip(DEFAULT_PIP_CORNER, pid);
    }

    fn set_compositing_mode(&mut self, grid: bool) {
        log::debug!("[BROKER] Grid mode {}", grid);
        self.routing.set_grid(grid);
    }

    fn shutdown(&mut self) {
        self.teardown();
        self.state = BrokerState::Failed;
        log::info!("[BROKER] Shut down");
    }
}

impl<D: GpuDevice> Drop for Broker<D> {
    fn drop(&mut self) {
        self.teardown();
    }
}
