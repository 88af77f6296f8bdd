//! Consumer side of the broker output.
//!
//! A [`BrokerSubscriber`] is what a virtual-camera shim embeds: it finds the
//! broker's well-known manifest, mirrors the composite output with the same
//! counter-then-fence protocol the broker uses for its producers, and keeps
//! its own [`BrokerState`].

use frame_manifest::{ManifestReader, PublishedNames, SharedMemory};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::broker::BrokerState;
use crate::connection::FrameLink;
use crate::error::{BrokerError, BrokerResult};
use crate::gpu::GpuDevice;

/// Minimum spacing between two searches for the broker.
pub const SEARCH_RETRY_INTERVAL: Duration = Duration::from_secs(2);

/// The broker advances its counter every pass. A counter frozen this long
/// means the broker is gone.
pub const STALE_TIMEOUT: Duration = Duration::from_secs(2);

pub struct BrokerSubscriber<D: GpuDevice> {
    link: Option<FrameLink<D>>,
    ns: Arc<dyn SharedMemory>,
    names: PublishedNames,
    state: BrokerState,
    last_attempt: Option<Instant>,
    attempts: u64,
    last_counter: u64,
    last_change: Option<Instant>,
}

impl<D: GpuDevice> BrokerSubscriber<D> {
    /// Subscribe to the output published under `names`. Nothing is opened
    /// until the first [`poll`](Self::poll).
    pub fn new(ns: Arc<dyn SharedMemory>, names: PublishedNames) -> Self {
        Self {
            link: None,
            ns,
            names,
            state: BrokerState::Searching,
            last_attempt: None,
            attempts: 0,
            last_counter: 0,
            last_change: None,
        }
    }

    pub fn state(&self) -> BrokerState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    /// How many times the broker has been searched for.
    pub fn search_attempts(&self) -> u64 {
        self.attempts
    }

    /// Output counter last synced against, 0 while disconnected.
    pub fn frame_counter(&self) -> u64 {
        self.link.as_ref().map_or(0, |l| l.last_seen())
    }

    /// Private copy of the latest output frame.
    pub fn frame(&self) -> Option<&D::Texture> {
        self.link.as_ref().map(|l| l.mirror())
    }

    /// Connect if due, detect a vanished broker, and queue a copy of any new
    /// output frame.
    pub fn poll(&mut self, device: &D, now: Instant) -> BrokerState {
        if self.link.is_none() {
            let due = self.last_attempt.map_or(true, |t| {
                now.saturating_duration_since(t) >= SEARCH_RETRY_INTERVAL
            });
            if due {
                self.search(device, now);
            }
        }

        if let Some(link) = self.link.as_mut() {
            let counter = link.frame_counter();
            if counter != self.last_counter {
                self.last_counter = counter;
                self.last_change = Some(now);
            }
            let frozen = self
                .last_change
                .map_or(false, |t| now.saturating_duration_since(t) >= STALE_TIMEOUT);
            if frozen {
                log::warn!(
                    "[SUBSCRIBER] {} stopped advancing at frame {}",
                    self.names.manifest,
                    counter
                );
                self.disconnect(now);
            } else {
                link.sync(device, now);
            }
        }

        self.state
    }

    fn search(&mut self, device: &D, now: Instant) {
        self.last_attempt = Some(now);
        self.attempts += 1;

        match self.open(device) {
            Ok(Some(link)) => {
                log::info!("[SUBSCRIBER] Connected to {}", self.names.manifest);
                self.last_counter = link.frame_counter();
                self.last_change = Some(now);
                self.link = Some(link);
                self.state = BrokerState::Connected;
            }
            Ok(None) => {
                log::warn!(
                    "[SUBSCRIBER] {} is on a different GPU adapter",
                    self.names.manifest
                );
                self.state = BrokerState::Failed;
            }
            Err(BrokerError::SharedMemory(e)) if e.is_not_found() => {
                log::trace!("[SUBSCRIBER] {} not published yet", self.names.manifest);
                self.state = BrokerState::Searching;
            }
            Err(e) => {
                log::debug!(
                    "[SUBSCRIBER] Could not open {}: {}",
                    self.names.manifest,
                    e
                );
                self.state = BrokerState::Searching;
            }
        }
    }

    /// `Ok(None)` when the output lives on another adapter.
    fn open(&self, device: &D) -> BrokerResult<Option<FrameLink<D>>> {
        let manifest = ManifestReader::open(self.ns.as_ref(), &self.names.manifest)?;
        let snapshot = manifest.snapshot();
        if !snapshot.is_populated() {
            return Err(BrokerError::Discovery(format!(
                "{} is not filled in yet",
                self.names.manifest
            )));
        }
        if snapshot.adapter_id() != device.adapter_id() {
            return Ok(None);
        }
        FrameLink::open(device, manifest).map(Some)
    }

    fn disconnect(&mut self, now: Instant) {
        self.link = None;
        self.last_change = None;
        self.last_counter = 0;
        self.last_attempt = Some(now);
        self.state = BrokerState::Searching;
    }
}
