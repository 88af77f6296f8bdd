//! End-to-end broker scenarios: producers, broker and subscriber share one
//! software GPU host, a temp-dir namespace and a scripted process table.

use framebroker_lib::gpu::soft::{SoftDevice, SoftHost};
use framebroker_lib::gpu::{GpuDevice, TextureDesc};
use framebroker_lib::publisher::{marker_color, marker_frame};
use framebroker_lib::{
    Broker, BrokerConfig, BrokerFacade, BrokerState, BrokerSubscriber, Producer, TestPatternSource,
};
use frame_manifest::{AdapterId, FileNamespace, ManifestReader, ProtocolNames, SharedMemory};
use host_processes::FakeProcessTable;
use std::sync::Arc;
use std::time::{Duration, Instant};

const BROKER_PID: u32 = 1;
const ADAPTER: AdapterId = AdapterId::new(0, 42);
const FRAME: Duration = Duration::from_millis(16);
const WIDTH: u32 = 640;
const HEIGHT: u32 = 360;

struct Host {
    _dir: tempfile::TempDir,
    ns: Arc<FileNamespace>,
    gpu: SoftHost,
    processes: FakeProcessTable,
    config: BrokerConfig,
}

struct Source {
    device: SoftDevice,
    producer: Producer<SoftDevice, TestPatternSource>,
}

impl Source {
    /// Publish frames until the producer's counter reaches `n`.
    fn advance_to(&mut self, n: u64) {
        while self.producer.publisher().frame_counter() < n {
            self.producer.tick(&self.device).unwrap();
        }
    }

    fn counter(&self) -> u64 {
        self.producer.publisher().frame_counter()
    }
}

impl Host {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        Self {
            ns: Arc::new(FileNamespace::new(dir.path()).unwrap()),
            gpu: SoftHost::new(),
            processes: FakeProcessTable::new(BROKER_PID),
            config: BrokerConfig {
                output_width: WIDTH,
                output_height: HEIGHT,
                use_global_namespace: false,
                ..Default::default()
            },
            _dir: dir,
        }
    }

    fn broker(&self) -> Broker<SoftDevice> {
        let ns: Arc<dyn SharedMemory> = self.ns.clone();
        Broker::new(
            SoftDevice::new(self.gpu.clone(), ADAPTER),
            ns,
            Arc::new(self.processes.clone()),
            &self.config,
        )
        .unwrap()
    }

    fn source(&self, pid: u32, adapter: AdapterId) -> Source {
        self.processes.spawn(pid, &format!("producer-{}.exe", pid));
        let device = SoftDevice::new(self.gpu.clone(), adapter);
        let producer = Producer::new(
            &device,
            self.ns.as_ref(),
            &ProtocolNames::new("FrameBroker_", false),
            pid,
            TestPatternSource::new(TextureDesc::bgra(16, 9)),
        )
        .unwrap();
        Source { device, producer }
    }

    fn subscriber(&self) -> (SoftDevice, BrokerSubscriber<SoftDevice>) {
        let ns: Arc<dyn SharedMemory> = self.ns.clone();
        let names = ProtocolNames::new("FrameBroker_", false).well_known("Broker");
        (
            SoftDevice::new(self.gpu.clone(), ADAPTER),
            BrokerSubscriber::new(ns, names),
        )
    }
}

fn output_marker(broker: &Broker<SoftDevice>, x: u32, y: u32) -> u64 {
    marker_frame(broker.output_texture().unwrap().pixel(x, y))
}

fn output_pixel(broker: &Broker<SoftDevice>, x: u32, y: u32) -> u32 {
    broker.output_texture().unwrap().pixel(x, y)
}

#[test]
fn idle_broker_advances_output_and_reports_failed() {
    let host = Host::new();
    let mut broker = host.broker();
    let output = ManifestReader::open(host.ns.as_ref(), "FrameBroker_Broker").unwrap();
    let t0 = Instant::now();

    for n in 1..=5u64 {
        let report = broker.render_frame_at(t0 + FRAME * n as u32).unwrap();
        assert_eq!(report.frame, n);
        assert!(report.fallback);
        assert!(report.drawn.is_empty());
        assert_eq!(broker.frame_counter(), n);
        assert_eq!(output.frame_counter(), n);
        assert_eq!(broker.state(), BrokerState::Failed);
    }
}

#[test]
fn output_advances_once_per_pass_with_producers() {
    let host = Host::new();
    let mut a = host.source(100, ADAPTER);
    a.advance_to(1);
    let mut broker = host.broker();
    broker.set_preferred_producer_pid(100);
    let t0 = Instant::now();

    for n in 1..=10u64 {
        if n % 2 == 0 {
            a.advance_to(a.counter() + 1);
        }
        let before = broker.frame_counter();
        broker.render_frame_at(t0 + FRAME * n as u32).unwrap();
        assert_eq!(broker.frame_counter(), before + 1);
    }
    assert_eq!(broker.state(), BrokerState::Connected);
}

#[test]
fn main_full_frame_and_top_right_pip() {
    let host = Host::new();
    let mut a = host.source(100, ADAPTER);
    let mut b = host.source(200, ADAPTER);
    a.advance_to(1);
    b.advance_to(2);

    let mut broker = host.broker();
    broker.update_producer_priority_list(&[100, 0, 200]);
    let report = broker.render_frame_at(Instant::now()).unwrap();

    assert_eq!(report.drawn, vec![100, 200]);
    assert!(!report.fallback);
    assert_eq!(broker.state(), BrokerState::Connected);

    // PIP viewport is (640 - 160 - 10, 10, 160, 90).
    let a_px = marker_color(1);
    let b_px = marker_color(2);
    assert_eq!(output_pixel(&broker, 0, 0), a_px);
    assert_eq!(output_pixel(&broker, 320, 300), a_px);
    assert_eq!(output_pixel(&broker, 470, 10), b_px);
    assert_eq!(output_pixel(&broker, 629, 99), b_px);
    assert_eq!(output_pixel(&broker, 550, 50), b_px);
    assert_eq!(output_pixel(&broker, 469, 50), a_px);
    assert_eq!(output_pixel(&broker, 630, 50), a_px);
    assert_eq!(output_pixel(&broker, 550, 9), a_px);
    assert_eq!(output_pixel(&broker, 550, 100), a_px);
}

#[test]
fn copies_wait_for_the_producer_fence() {
    let host = Host::new();
    let mut a = host.source(100, ADAPTER);
    a.advance_to(1);
    let mut broker = host.broker();
    broker.set_preferred_producer_pid(100);
    let t0 = Instant::now();

    broker.render_frame_at(t0).unwrap();
    assert_eq!(output_marker(&broker, 320, 180), 1);

    // Stall the producer's GPU so frame 2 is advertised before it is signalled.
    let gate_owner = SoftDevice::new(host.gpu.clone(), ADAPTER);
    let gate = gate_owner.create_shared_fence("gate").unwrap();
    a.device
        .queue_wait(&a.device.open_shared_fence("gate").unwrap(), 1);
    a.advance_to(2);

    for n in 1..=3u32 {
        broker.render_frame_at(t0 + FRAME * n).unwrap();
        assert_eq!(
            broker.connections().unwrap().get(100).unwrap().last_seen_frame(),
            2
        );
        assert_eq!(output_marker(&broker, 320, 180), 1);
    }

    gate_owner.queue_signal(&gate, 1);
    gate_owner.flush().unwrap();
    a.device.flush().unwrap();
    broker.render_frame_at(t0 + FRAME * 4).unwrap();
    assert_eq!(output_marker(&broker, 320, 180), 2);
    assert_eq!(broker.device().pending_commands(), 0);
}

#[test]
fn last_seen_is_monotonic_and_bounded() {
    let host = Host::new();
    let mut a = host.source(100, ADAPTER);
    let mut b = host.source(200, ADAPTER);
    a.advance_to(1);
    b.advance_to(1);
    let mut broker = host.broker();
    broker.set_compositing_mode(true);
    let t0 = Instant::now();

    let mut seen = [0u64; 2];
    for n in 1..=40u32 {
        if n % 3 == 0 {
            a.advance_to(a.counter() + 1);
        }
        if n % 5 == 0 {
            b.advance_to(b.counter() + 2);
        }
        broker.render_frame_at(t0 + FRAME * n).unwrap();

        let pool = broker.connections().unwrap();
        for (i, source) in [&a, &b].into_iter().enumerate() {
            let pid = if i == 0 { 100 } else { 200 };
            let now_seen = pool.get(pid).unwrap().last_seen_frame();
            assert!(now_seen >= seen[i]);
            assert!(now_seen <= source.counter());
            seen[i] = now_seen;
        }
    }
    assert_eq!(seen, [a.counter(), b.counter()]);
}

#[test]
fn killed_producer_is_pruned_on_next_pass() {
    let host = Host::new();
    let mut a = host.source(100, ADAPTER);
    a.advance_to(1);
    let mut broker = host.broker();
    broker.set_preferred_producer_pid(100);
    let t0 = Instant::now();

    broker.render_frame_at(t0).unwrap();
    assert!(broker.connections().unwrap().contains(100));

    host.processes.kill(100);
    drop(a);

    // Liveness runs every pass; the discovery cadence has not elapsed yet.
    let report = broker.render_frame_at(t0 + FRAME).unwrap();
    assert!(!broker.connections().unwrap().contains(100));
    assert!(report.fallback);
    assert_eq!(broker.state(), BrokerState::Searching);

    // The next scan no longer reports it at all.
    broker.render_frame_at(t0 + Duration::from_millis(1100)).unwrap();
    assert!(broker.discovery().streams().is_empty());
    assert_eq!(broker.state(), BrokerState::Failed);
}

#[test]
fn stopped_publisher_is_pruned_within_one_discovery_interval() {
    let host = Host::new();
    let mut a = host.source(100, ADAPTER);
    a.advance_to(1);
    let mut broker = host.broker();
    let t0 = Instant::now();

    broker.render_frame_at(t0).unwrap();
    assert!(broker.connections().unwrap().contains(100));

    // The process stays alive but stops publishing.
    drop(a);
    broker.render_frame_at(t0 + FRAME).unwrap();
    assert!(broker.connections().unwrap().contains(100));

    broker.render_frame_at(t0 + Duration::from_millis(1000)).unwrap();
    assert!(!broker.connections().unwrap().contains(100));
    assert!(!host.gpu.has_texture("FrameBroker_Texture_100"));
}

#[test]
fn other_adapter_is_never_opened() {
    let host = Host::new();
    let mut remote = host.source(300, AdapterId::new(9, 9));
    remote.advance_to(1);
    let mut broker = host.broker();
    broker.set_preferred_producer_pid(300);
    let t0 = Instant::now();

    for n in 0..10u32 {
        broker
            .render_frame_at(t0 + Duration::from_millis(1100) * n)
            .unwrap();
    }

    assert!(broker.discovery().passes() >= 10);
    assert_eq!(host.gpu.open_attempts("FrameBroker_Texture_300"), 0);
    assert_eq!(host.gpu.open_attempts("FrameBroker_Fence_300"), 0);
    assert!(broker.connections().unwrap().is_empty());
    assert_eq!(broker.state(), BrokerState::Failed);
}

#[test]
fn broker_on_a_private_gpu_host_only_shows_the_fallback() {
    let host = Host::new();
    let mut camera = host.source(100, ADAPTER);
    camera.advance_to(1);

    let private = SoftHost::new();
    let ns: Arc<dyn SharedMemory> = host.ns.clone();
    let mut broker = Broker::new(
        SoftDevice::new(private.clone(), ADAPTER),
        ns,
        Arc::new(host.processes.clone()),
        &host.config,
    )
    .unwrap();
    broker.set_preferred_producer_pid(100);
    let t0 = Instant::now();

    for n in 0..5u32 {
        let report = broker
            .render_frame_at(t0 + Duration::from_millis(1100) * n)
            .unwrap();
        assert!(report.fallback);
        assert!(report.drawn.is_empty());
    }

    // The texture lives on another GPU host: tried on the first scan, backed
    // off, then tried again when the backoff ran out.
    assert_eq!(broker.discovery().streams().len(), 1);
    assert_eq!(private.open_attempts("FrameBroker_Texture_100"), 2);
    assert!(broker.connections().unwrap().is_empty());
    assert_eq!(broker.state(), BrokerState::Searching);
}

#[test]
fn grid_tiles_connected_producers_and_shrinks() {
    let host = Host::new();
    let mut a = host.source(100, ADAPTER);
    let mut b = host.source(200, ADAPTER);
    let mut c = host.source(300, ADAPTER);
    a.advance_to(1);
    b.advance_to(2);
    c.advance_to(3);

    let mut broker = host.broker();
    broker.set_compositing_mode(true);
    let t0 = Instant::now();

    // Three tiles: 2x2 cells of 320x180, filled row by row.
    let report = broker.render_frame_at(t0).unwrap();
    assert_eq!(report.drawn, vec![100, 200, 300]);
    assert_eq!(output_marker(&broker, 160, 90), 1);
    assert_eq!(output_marker(&broker, 480, 90), 2);
    assert_eq!(output_marker(&broker, 160, 270), 3);
    assert_eq!(broker.state(), BrokerState::Connected);

    drop(c);
    broker.render_frame_at(t0 + Duration::from_millis(1000)).unwrap();

    // Two tiles: side by side, full height.
    let report = broker.render_frame_at(t0 + Duration::from_millis(1016)).unwrap();
    assert_eq!(report.drawn, vec![100, 200]);
    assert_eq!(output_marker(&broker, 160, 270), 1);
    assert_eq!(output_marker(&broker, 480, 270), 2);
}

#[test]
fn unrouted_producers_leave_broker_searching() {
    let host = Host::new();
    let mut a = host.source(100, ADAPTER);
    a.advance_to(1);
    let mut broker = host.broker();

    broker.render_frame_at(Instant::now()).unwrap();
    assert_eq!(broker.state(), BrokerState::Searching);

    broker.set_preferred_producer_pid(999);
    broker.render_frame_at(Instant::now()).unwrap();
    assert_eq!(broker.state(), BrokerState::Searching);

    broker.set_pip_producer_pid(100);
    broker.render_frame_at(Instant::now()).unwrap();
    assert_eq!(broker.state(), BrokerState::Connected);
}

#[test]
fn subscriber_follows_broker_output() {
    let host = Host::new();
    let mut a = host.source(100, ADAPTER);
    a.advance_to(1);
    let mut broker = host.broker();
    broker.set_preferred_producer_pid(100);
    let (device, mut subscriber) = host.subscriber();
    let t0 = Instant::now();

    for n in 1..=3u32 {
        let now = t0 + FRAME * n;
        broker.render_frame_at(now).unwrap();
        assert_eq!(subscriber.poll(&device, now), BrokerState::Connected);
        device.flush().unwrap();
        assert_eq!(subscriber.frame_counter(), n as u64);
        assert_eq!(marker_frame(subscriber.frame().unwrap().pixel(320, 180)), 1);
    }

    broker.shutdown();
    let later = t0 + Duration::from_secs(5);
    assert_eq!(subscriber.poll(&device, later), BrokerState::Searching);
    assert!(subscriber.frame().is_none());
}

#[test]
fn device_loss_tears_down_and_fails() {
    let host = Host::new();
    let mut a = host.source(100, ADAPTER);
    a.advance_to(1);
    let mut broker = host.broker();
    broker.set_preferred_producer_pid(100);
    broker.render_frame_at(Instant::now()).unwrap();
    assert_eq!(broker.state(), BrokerState::Connected);

    broker.device().simulate_device_loss();
    assert!(broker.render_frame().is_err());
    assert!(broker.connections().is_none());
    assert_eq!(broker.state(), BrokerState::Failed);
    assert!(!host.gpu.has_texture("FrameBroker_Texture_Broker"));

    // Producers are unaffected.
    a.advance_to(2);
    assert_eq!(a.counter(), 2);
}
