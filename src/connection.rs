//! Producer connections.
//!
//! A [`FrameLink`] is the consumer half of the manifest protocol: the manifest
//! mapping, the opened shared texture and fence, and a private mirror texture
//! the compositor draws from. [`ConnectionPool`] owns one link per producer
//! PID together with an exit watch on the producer process.
//!
//! Syncing is the one place cross-process data moves. The manifest counter is
//! a cheap dirty check; the queued fence wait orders the copy after the
//! producer's write.

use frame_manifest::{ManifestReader, SharedMemory};
use host_processes::{ProcessTable, ProcessWatch};
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::discovery::DiscoveredStream;
use crate::error::{BrokerError, BrokerResult};
use crate::gpu::{GpuDevice, TextureDesc};

/// How long an advertised frame may stay unsignalled before it is reported.
pub const FENCE_STALL_WARNING: Duration = Duration::from_secs(2);

// ============================================================================
// Frame Link
// ============================================================================

/// Consumer-side view of one publisher.
pub struct FrameLink<D: GpuDevice> {
    // Field order is release order: mirror, then the shared objects, then the
    // manifest mapping.
    mirror: D::Texture,
    fence: D::Fence,
    texture: D::Texture,
    manifest: ManifestReader,
    last_seen: u64,
    stalled_since: Option<Instant>,
    stall_reported: bool,
}

impl<D: GpuDevice> FrameLink<D> {
    /// Open the publisher's texture and fence named in `manifest` and create a
    /// mirror of the same size. The caller has already checked the adapter.
    pub fn open(device: &D, manifest: ManifestReader) -> BrokerResult<Self> {
        let snapshot = manifest.snapshot();
        let texture = device.open_shared_texture(&snapshot.texture_name())?;
        let fence = device.open_shared_fence(&snapshot.fence_name())?;

        // The opened texture is authoritative for size and format.
        let desc = device.texture_desc(&texture);
        let mirror =
            device.create_texture(&TextureDesc::new(desc.width, desc.height, desc.format))?;

        Ok(Self {
            mirror,
            fence,
            texture,
            manifest,
            last_seen: 0,
            stalled_since: None,
            stall_reported: false,
        })
    }

    /// Last counter value synced against.
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    pub fn manifest_name(&self) -> &str {
        self.manifest.name()
    }

    /// The publisher's current counter.
    pub fn frame_counter(&self) -> u64 {
        self.manifest.frame_counter()
    }

    pub fn mirror(&self) -> &D::Texture {
        &self.mirror
    }

    /// Queue a wait for the advertised frame and a copy into the mirror when
    /// the counter moved. Returns true when a copy was queued.
    pub fn sync(&mut self, device: &D, now: Instant) -> bool {
        let counter = self.manifest.frame_counter();
        self.check_stall(device, now);
        if counter <= self.last_seen {
            return false;
        }

        device.queue_wait(&self.fence, counter);
        device.copy_texture(&self.mirror, &self.texture);
        self.last_seen = counter;
        log::trace!("[MUX] Synced {} to frame {}", self.manifest.name(), counter);
        true
    }

    // A publisher that advertises a value but never signals it leaves every
    // later command on our queue waiting. This is reported, not recovered.
    fn check_stall(&mut self, device: &D, now: Instant) {
        if device.completed_value(&self.fence) >= self.last_seen {
            if self.stall_reported {
                log::info!("[MUX] {} fence caught up", self.manifest.name());
            }
            self.stalled_since = None;
            self.stall_reported = false;
            return;
        }
        let since = *self.stalled_since.get_or_insert(now);
        if !self.stall_reported && now.saturating_duration_since(since) >= FENCE_STALL_WARNING {
            log::warn!(
                "[MUX] {} advertised frame {} but its fence is still at {}",
                self.manifest.name(),
                self.last_seen,
                device.completed_value(&self.fence)
            );
            self.stall_reported = true;
        }
    }

    /// True while an advertised frame has gone unsignalled for longer than
    /// [`FENCE_STALL_WARNING`].
    pub fn is_stalled(&self) -> bool {
        self.stall_reported
    }
}

// ============================================================================
// Producer Connection
// ============================================================================

/// Lifecycle of a producer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
    /// Terminal. Every handle has been released.
    Disconnected,
}

/// Broker-side state for one producer.
pub struct ProducerConnection<D: GpuDevice> {
    pid: u32,
    producer_type: String,
    process_name: String,
    state: ConnectionState,
    link: Option<FrameLink<D>>,
    watch: Option<Box<dyn ProcessWatch>>,
}

impl<D: GpuDevice> ProducerConnection<D> {
    fn new(stream: &DiscoveredStream) -> Self {
        Self {
            pid: stream.pid,
            producer_type: stream.producer_type.clone(),
            process_name: stream.process_name.clone(),
            state: ConnectionState::Unconnected,
            link: None,
            watch: None,
        }
    }

    fn connect(
        &mut self,
        device: &D,
        ns: &dyn SharedMemory,
        processes: &dyn ProcessTable,
        stream: &DiscoveredStream,
    ) -> BrokerResult<()> {
        self.state = ConnectionState::Connecting;

        let manifest = ManifestReader::open(ns, &stream.manifest_name)?;
        if manifest.snapshot().adapter_id() != device.adapter_id() {
            return Err(BrokerError::AdapterMismatch { pid: self.pid });
        }
        let watch = processes.watch(self.pid)?;
        let link = FrameLink::open(device, manifest)?;

        self.watch = Some(watch);
        self.link = Some(link);
        self.state = ConnectionState::Connected;
        Ok(())
    }

    fn disconnect(&mut self) {
        self.link = None;
        self.watch = None;
        self.state = ConnectionState::Disconnected;
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn producer_type(&self) -> &str {
        &self.producer_type
    }

    pub fn process_name(&self) -> &str {
        &self.process_name
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn last_seen_frame(&self) -> u64 {
        self.link.as_ref().map_or(0, |l| l.last_seen())
    }

    pub fn mirror(&self) -> Option<&D::Texture> {
        self.link.as_ref().map(|l| l.mirror())
    }

    pub fn link(&self) -> Option<&FrameLink<D>> {
        self.link.as_ref()
    }

    fn has_exited(&self) -> bool {
        self.watch.as_ref().map_or(true, |w| w.has_exited())
    }
}

// ============================================================================
// Pool
// ============================================================================

/// Live producer connections keyed by PID.
pub struct ConnectionPool<D: GpuDevice> {
    connections: BTreeMap<u32, ProducerConnection<D>>,
}

impl<D: GpuDevice> Default for ConnectionPool<D> {
    fn default() -> Self {
        Self {
            connections: BTreeMap::new(),
        }
    }
}

impl<D: GpuDevice> ConnectionPool<D> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connect to `stream` unless already connected. On failure nothing is
    /// registered and the error tells the caller why.
    ///
    /// Returns true when a new connection was made.
    pub fn update_connection(
        &mut self,
        device: &D,
        ns: &dyn SharedMemory,
        processes: &dyn ProcessTable,
        stream: &DiscoveredStream,
    ) -> BrokerResult<bool> {
        if self.connections.contains_key(&stream.pid) {
            return Ok(false);
        }

        let mut connection = ProducerConnection::new(stream);
        if let Err(e) = connection.connect(device, ns, processes, stream) {
            connection.disconnect();
            log::debug!(
                "[MUX] Could not connect to {} ({}): {}",
                stream.process_name,
                stream.pid,
                e
            );
            return Err(e);
        }

        log::info!(
            "[MUX] Connected to {} {} ({}) {}x{}",
            stream.producer_type,
            stream.process_name,
            stream.pid,
            stream.width,
            stream.height
        );
        self.connections.insert(stream.pid, connection);
        Ok(true)
    }

    /// Drop connections whose PID the latest scan no longer reports or whose
    /// process has exited. Returns the removed PIDs.
    pub fn prune_connections(&mut self, discovered: &[DiscoveredStream]) -> Vec<u32> {
        self.remove_where(|c| {
            c.has_exited() || !discovered.iter().any(|s| s.pid == c.pid)
        })
    }

    /// Liveness-only pruning, cheap enough for every frame.
    pub fn prune_exited(&mut self) -> Vec<u32> {
        self.remove_where(|c| c.has_exited())
    }

    fn remove_where(&mut self, pred: impl Fn(&ProducerConnection<D>) -> bool) -> Vec<u32> {
        let gone: Vec<u32> = self
            .connections
            .values()
            .filter(|c| pred(c))
            .map(|c| c.pid)
            .collect();
        for pid in &gone {
            if let Some(mut connection) = self.connections.remove(pid) {
                connection.disconnect();
                log::info!("[MUX] Disconnected {} ({})", connection.process_name, pid);
            }
        }
        gone
    }

    /// Sync every connection. Returns how many queued a copy.
    pub fn sync_all(&mut self, device: &D, now: Instant) -> usize {
        self.connections
            .values_mut()
            .filter_map(|c| c.link.as_mut())
            .map(|link| link.sync(device, now))
            .filter(|&copied| copied)
            .count()
    }

    pub fn get(&self, pid: u32) -> Option<&ProducerConnection<D>> {
        self.connections.get(&pid)
    }

    pub fn contains(&self, pid: u32) -> bool {
        self.connections.contains_key(&pid)
    }

    /// Mirror texture of a connected producer.
    pub fn mirror(&self, pid: u32) -> Option<&D::Texture> {
        self.connections
            .get(&pid)
            .filter(|c| c.is_connected())
            .and_then(|c| c.mirror())
    }

    /// Connected PIDs in ascending order.
    pub fn connected_pids(&self) -> Vec<u32> {
        self.connections
            .values()
            .filter(|c| c.is_connected())
            .map(|c| c.pid)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Release every connection.
    pub fn clear(&mut self) {
        for connection in self.connections.values_mut() {
            connection.disconnect();
        }
        self.connections.clear();
    }
}

#[cfg(test)]
mod tests;
