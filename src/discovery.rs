//! Producer discovery.
//!
//! A scan snapshots the host process list and probes every process for a
//! manifest under each configured producer signature (`<prefix><pid>`). A
//! manifest on another GPU adapter is skipped. Scans run on a fixed cadence;
//! between scans [`Discovery::streams`] keeps returning the last result.
//!
//! Failed candidates go into a per-PID negative cache when enabled:
//! - adapter mismatch: skipped for as long as the PID stays in the process list
//! - connection open failure: skipped for [`OPEN_RETRY_PASSES`] scans
//!
//! A PID that leaves the process list loses its cache entry, so a reused PID
//! is probed afresh.

use frame_manifest::{AdapterId, ManifestReader, PixelFormat, ProtocolNames, SharedMemory};
use host_processes::{ProcessEntry, ProcessTable};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{BrokerConfig, ProducerSignature};
use crate::error::{BrokerError, BrokerResult};

/// Scans to skip a PID whose shared texture or fence could not be opened.
pub const OPEN_RETRY_PASSES: u64 = 3;

/// One live producer found by a scan. Owns nothing; the manifest mapping used
/// to build it is already released.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredStream {
    pub pid: u32,
    pub process_name: String,
    pub producer_type: String,
    pub manifest_name: String,
    pub texture_name: String,
    pub fence_name: String,
    pub adapter: AdapterId,
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejection {
    AdapterMismatch,
    OpenFailed { retry_at: u64 },
}

enum Probe {
    Found(DiscoveredStream),
    WrongAdapter,
    Absent,
}

struct Signature {
    names: ProtocolNames,
    producer_type: String,
}

pub struct Discovery {
    processes: Arc<dyn ProcessTable>,
    signatures: Vec<Signature>,
    adapter: AdapterId,
    interval: Duration,
    last_scan: Option<Instant>,
    streams: Vec<DiscoveredStream>,
    use_negative_cache: bool,
    rejected: HashMap<u32, Rejection>,
    passes: u64,
}

impl Discovery {
    pub fn new(
        processes: Arc<dyn ProcessTable>,
        adapter: AdapterId,
        config: &BrokerConfig,
    ) -> Self {
        let signatures = config
            .producer_signatures
            .iter()
            .map(|sig: &ProducerSignature| Signature {
                names: config.signature_names(sig),
                producer_type: sig.producer_type.clone(),
            })
            .collect();

        Self {
            processes,
            signatures,
            adapter,
            interval: config.discovery_interval(),
            last_scan: None,
            streams: Vec::new(),
            use_negative_cache: config.negative_cache,
            rejected: HashMap::new(),
            passes: 0,
        }
    }

    /// Result of the most recent scan.
    pub fn streams(&self) -> &[DiscoveredStream] {
        &self.streams
    }

    pub fn stream(&self, pid: u32) -> Option<&DiscoveredStream> {
        self.streams.iter().find(|s| s.pid == pid)
    }

    /// Completed scans.
    pub fn passes(&self) -> u64 {
        self.passes
    }

    pub fn is_due(&self, now: Instant) -> bool {
        match self.last_scan {
            None => true,
            Some(last) => now.saturating_duration_since(last) >= self.interval,
        }
    }

    /// Scan if the cadence has elapsed. Returns true when a scan ran.
    ///
    /// A failed process snapshot keeps the previous list and is retried on the
    /// next cadence tick.
    pub fn poll(&mut self, ns: &dyn SharedMemory, now: Instant) -> bool {
        if !self.is_due(now) {
            return false;
        }
        self.last_scan = Some(now);
        if let Err(e) = self.discover_streams(ns) {
            log::warn!(
                "[DISCOVERY] Scan failed, keeping {} streams: {}",
                self.streams.len(),
                e
            );
        }
        true
    }

    /// Scan now, regardless of cadence.
    pub fn discover_streams(&mut self, ns: &dyn SharedMemory) -> BrokerResult<&[DiscoveredStream]> {
        let snapshot = self
            .processes
            .snapshot()
            .map_err(|e| BrokerError::Discovery(e.to_string()))?;
        self.passes += 1;

        let live: HashSet<u32> = snapshot.iter().map(|p| p.pid).collect();
        self.rejected.retain(|pid, _| live.contains(pid));

        let self_pid = self.processes.current_pid();
        let mut streams = Vec::new();

        for process in &snapshot {
            if process.pid == self_pid || self.is_rejected(process.pid) {
                continue;
            }
            match self.probe(ns, process) {
                Probe::Found(stream) => streams.push(stream),
                Probe::WrongAdapter => self.record_adapter_mismatch(process.pid),
                Probe::Absent => {}
            }
        }

        if streams.len() != self.streams.len() {
            log::info!(
                "[DISCOVERY] {} producer stream(s) on adapter {}",
                streams.len(),
                self.adapter
            );
        }
        self.streams = streams;
        Ok(&self.streams)
    }

    /// First signature whose manifest exists for `process` wins.
    fn probe(&self, ns: &dyn SharedMemory, process: &ProcessEntry) -> Probe {
        for signature in &self.signatures {
            let manifest_name = signature.names.manifest_name(process.pid);
            let reader = match ManifestReader::open(ns, &manifest_name) {
                Ok(reader) => reader,
                Err(e) if e.is_not_found() => continue,
                Err(e) => {
                    log::debug!("[DISCOVERY] Skipping {}: {}", manifest_name, e);
                    continue;
                }
            };

            let manifest = reader.snapshot();
            if !manifest.is_populated() {
                // Mapped but not written yet; look again next pass.
                log::trace!("[DISCOVERY] {} is not filled in yet", manifest_name);
                return Probe::Absent;
            }
            if manifest.adapter_id() != self.adapter {
                log::debug!(
                    "[DISCOVERY] {} ({}) is on adapter {}, not {}",
                    process.name,
                    process.pid,
                    manifest.adapter_id(),
                    self.adapter
                );
                return Probe::WrongAdapter;
            }

            return Probe::Found(DiscoveredStream {
                pid: process.pid,
                process_name: process.name.clone(),
                producer_type: signature.producer_type.clone(),
                manifest_name,
                texture_name: manifest.texture_name(),
                fence_name: manifest.fence_name(),
                adapter: manifest.adapter_id(),
                width: manifest.width,
                height: manifest.height,
                format: manifest.format(),
            });
        }
        Probe::Absent
    }

    fn is_rejected(&self, pid: u32) -> bool {
        match self.rejected.get(&pid) {
            Some(Rejection::AdapterMismatch) => true,
            Some(Rejection::OpenFailed { retry_at }) => self.passes < *retry_at,
            None => false,
        }
    }

    /// Stop probing `pid` until it leaves the process list.
    pub fn record_adapter_mismatch(&mut self, pid: u32) {
        if self.use_negative_cache {
            self.rejected.insert(pid, Rejection::AdapterMismatch);
        }
    }

    /// Skip `pid` for the next [`OPEN_RETRY_PASSES`] scans.
    pub fn record_open_failure(&mut self, pid: u32) {
        if self.use_negative_cache {
            self.rejected.insert(
                pid,
                Rejection::OpenFailed {
                    retry_at: self.passes + OPEN_RETRY_PASSES + 1,
                },
            );
        }
    }

    /// Number of PIDs currently in the negative cache.
    pub fn rejected_count(&self) -> usize {
        self.rejected.len()
    }
}
