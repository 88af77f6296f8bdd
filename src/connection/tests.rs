use super::*;
use crate::gpu::soft::{SoftDevice, SoftFence, SoftHost};
use crate::publisher::{marker_color, marker_frame, FramePublisher};
use frame_manifest::{AdapterId, FileNamespace, PixelFormat, ProtocolNames};
use host_processes::FakeProcessTable;

const BROKER_PID: u32 = 1;
const ADAPTER: AdapterId = AdapterId::new(0, 5);

struct Rig {
    _dir: tempfile::TempDir,
    ns: FileNamespace,
    host: SoftHost,
    broker: SoftDevice,
    processes: FakeProcessTable,
}

impl Rig {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let ns = FileNamespace::new(dir.path()).unwrap();
        let host = SoftHost::new();
        Self {
            broker: SoftDevice::new(host.clone(), ADAPTER),
            processes: FakeProcessTable::new(BROKER_PID),
            _dir: dir,
            ns,
            host,
        }
    }

    fn producer(&self, pid: u32, adapter: AdapterId) -> (SoftDevice, FramePublisher<SoftDevice>) {
        self.processes.spawn(pid, "producer.exe");
        let device = SoftDevice::new(self.host.clone(), adapter);
        let publisher = FramePublisher::for_process(
            &device,
            &self.ns,
            &ProtocolNames::new("FrameBroker_", false),
            pid,
            TextureDesc::bgra(4, 4),
        )
        .unwrap();
        (device, publisher)
    }

    fn stream(&self, pid: u32) -> DiscoveredStream {
        DiscoveredStream {
            pid,
            process_name: "producer.exe".to_string(),
            producer_type: "FrameBroker".to_string(),
            manifest_name: format!("FrameBroker_{}", pid),
            texture_name: format!("FrameBroker_Texture_{}", pid),
            fence_name: format!("FrameBroker_Fence_{}", pid),
            adapter: ADAPTER,
            width: 4,
            height: 4,
            format: PixelFormat::Bgra8Unorm,
        }
    }

    fn connect(&self, pool: &mut ConnectionPool<SoftDevice>, pid: u32) {
        pool.update_connection(&self.broker, &self.ns, &self.processes, &self.stream(pid))
            .unwrap();
    }

    /// Make `device`'s queue stall until the returned fence reaches 1, so a
    /// publish advertises its counter before the GPU has signalled it.
    fn hold(&self, device: &SoftDevice, name: &str) -> (SoftDevice, SoftFence) {
        let owner = SoftDevice::new(self.host.clone(), ADAPTER);
        let fence = owner.create_shared_fence(name).unwrap();
        device.queue_wait(&device.open_shared_fence(name).unwrap(), 1);
        (owner, fence)
    }
}

fn frame(n: u64) -> Vec<u8> {
    marker_color(n).to_le_bytes().repeat(16)
}

fn mirror_frame(pool: &ConnectionPool<SoftDevice>, pid: u32) -> u64 {
    marker_frame(pool.mirror(pid).unwrap().pixel(0, 0))
}

#[test]
fn test_connect_and_sync() {
    let rig = Rig::new();
    let (device, mut publisher) = rig.producer(100, ADAPTER);
    let mut pool = ConnectionPool::<SoftDevice>::new();

    assert!(pool
        .update_connection(&rig.broker, &rig.ns, &rig.processes, &rig.stream(100))
        .unwrap());
    assert!(!pool
        .update_connection(&rig.broker, &rig.ns, &rig.processes, &rig.stream(100))
        .unwrap());
    assert_eq!(pool.get(100).unwrap().state(), ConnectionState::Connected);

    publisher.publish(&device, &frame(1)).unwrap();
    assert_eq!(pool.sync_all(&rig.broker, Instant::now()), 1);
    rig.broker.flush().unwrap();
    assert_eq!(pool.get(100).unwrap().last_seen_frame(), 1);
    assert_eq!(mirror_frame(&pool, 100), 1);
}

#[test]
fn test_unchanged_counter_issues_no_work() {
    let rig = Rig::new();
    let (device, mut publisher) = rig.producer(100, ADAPTER);
    let mut pool = ConnectionPool::<SoftDevice>::new();
    rig.connect(&mut pool, 100);

    publisher.publish(&device, &frame(1)).unwrap();
    pool.sync_all(&rig.broker, Instant::now());
    let before = rig.broker.stats();
    assert_eq!(pool.sync_all(&rig.broker, Instant::now()), 0);
    assert_eq!(rig.broker.stats(), before);
}

#[test]
fn test_copy_waits_for_the_fence() {
    let rig = Rig::new();
    let (device, mut publisher) = rig.producer(100, ADAPTER);
    let mut pool = ConnectionPool::<SoftDevice>::new();
    rig.connect(&mut pool, 100);

    publisher.publish(&device, &frame(1)).unwrap();
    pool.sync_all(&rig.broker, Instant::now());
    rig.broker.flush().unwrap();
    assert_eq!(mirror_frame(&pool, 100), 1);

    // Frame 2 is advertised while the producer's GPU is still busy.
    let (owner, gate) = rig.hold(&device, "gate");
    publisher.publish(&device, &frame(2)).unwrap();
    assert_eq!(pool.get(100).unwrap().link().unwrap().frame_counter(), 2);

    pool.sync_all(&rig.broker, Instant::now());
    rig.broker.flush().unwrap();
    assert_eq!(pool.get(100).unwrap().last_seen_frame(), 2);
    assert_eq!(mirror_frame(&pool, 100), 1);
    assert!(rig.broker.pending_commands() > 0);

    owner.queue_signal(&gate, 1);
    owner.flush().unwrap();
    device.flush().unwrap();
    rig.broker.flush().unwrap();
    assert_eq!(mirror_frame(&pool, 100), 2);
    assert_eq!(rig.broker.pending_commands(), 0);
}

#[test]
fn test_last_seen_never_decreases_or_runs_ahead() {
    let rig = Rig::new();
    let (device, mut publisher) = rig.producer(100, ADAPTER);
    let mut pool = ConnectionPool::<SoftDevice>::new();
    rig.connect(&mut pool, 100);

    let mut previous = 0;
    for n in 1..=20u64 {
        if n % 3 != 0 {
            publisher.publish(&device, &frame(n)).unwrap();
        }
        pool.sync_all(&rig.broker, Instant::now());
        let seen = pool.get(100).unwrap().last_seen_frame();
        assert!(seen >= previous);
        assert!(seen <= publisher.frame_counter());
        previous = seen;
    }
}

#[test]
fn test_stalled_fence_is_reported() {
    let rig = Rig::new();
    let (device, mut publisher) = rig.producer(100, ADAPTER);
    let mut pool = ConnectionPool::<SoftDevice>::new();
    rig.connect(&mut pool, 100);

    let (owner, gate) = rig.hold(&device, "gate");
    publisher.publish(&device, &frame(1)).unwrap();

    let t0 = Instant::now();
    pool.sync_all(&rig.broker, t0);
    pool.sync_all(&rig.broker, t0 + Duration::from_millis(100));
    assert!(!pool.get(100).unwrap().link().unwrap().is_stalled());

    let late = t0 + FENCE_STALL_WARNING + Duration::from_millis(200);
    pool.sync_all(&rig.broker, late);
    assert!(pool.get(100).unwrap().link().unwrap().is_stalled());

    owner.queue_signal(&gate, 1);
    owner.flush().unwrap();
    device.flush().unwrap();
    pool.sync_all(&rig.broker, t0 + FENCE_STALL_WARNING * 2);
    assert!(!pool.get(100).unwrap().link().unwrap().is_stalled());
}

#[test]
fn test_adapter_mismatch_never_opens_gpu_objects() {
    let rig = Rig::new();
    let (_device, _publisher) = rig.producer(300, AdapterId::new(1, 1));
    let mut pool = ConnectionPool::<SoftDevice>::new();

    let err = pool
        .update_connection(&rig.broker, &rig.ns, &rig.processes, &rig.stream(300))
        .unwrap_err();
    assert!(matches!(err, BrokerError::AdapterMismatch { pid: 300 }));
    assert_eq!(rig.host.open_attempts("FrameBroker_Texture_300"), 0);
    assert_eq!(rig.host.open_attempts("FrameBroker_Fence_300"), 0);
    assert!(pool.is_empty());
}

#[test]
fn test_missing_objects_register_nothing() {
    let rig = Rig::new();
    rig.processes.spawn(100, "producer.exe");
    let mut pool = ConnectionPool::<SoftDevice>::new();

    assert!(pool
        .update_connection(&rig.broker, &rig.ns, &rig.processes, &rig.stream(100))
        .is_err());
    assert!(pool.is_empty());
}

#[test]
fn test_prune_on_exit_and_on_disappearance() {
    let rig = Rig::new();
    let (_d1, _p1) = rig.producer(100, ADAPTER);
    let (_d2, _p2) = rig.producer(200, ADAPTER);
    let mut pool = ConnectionPool::<SoftDevice>::new();
    rig.connect(&mut pool, 100);
    rig.connect(&mut pool, 200);
    assert_eq!(pool.connected_pids(), vec![100, 200]);

    rig.processes.kill(100);
    assert_eq!(pool.prune_exited(), vec![100]);
    assert_eq!(pool.connected_pids(), vec![200]);

    assert_eq!(pool.prune_connections(&[]), vec![200]);
    assert!(pool.is_empty());
}

#[test]
fn test_clear_releases_everything() {
    let rig = Rig::new();
    let (_device, _publisher) = rig.producer(100, ADAPTER);
    let mut pool = ConnectionPool::<SoftDevice>::new();
    rig.connect(&mut pool, 100);

    pool.clear();
    assert!(pool.is_empty());
    assert!(pool.mirror(100).is_none());
}
