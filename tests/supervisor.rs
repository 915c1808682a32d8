use async_trait::async_trait;
use dalybms_monitor::events::{Event, EventKind, Subscription};
use dalybms_monitor::protocol::{Frame, CMD_BASIC, CMD_CELL_VOLTAGES};
use dalybms_monitor::supervisor::ConnectionSupervisor;
use dalybms_monitor::transport::{ConnectFilter, DeviceInfo, Link, LinkWriter, Transport};
use dalybms_monitor::{Config, Error};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

#[derive(Default)]
struct Wire {
    written: Mutex<Vec<Vec<u8>>>,
    disconnected: AtomicBool,
    refuse_writes: AtomicBool,
}

struct FakeWriter(Arc<Wire>);

#[async_trait]
impl LinkWriter for FakeWriter {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        if self.0.disconnected.load(Ordering::SeqCst) {
            return Err(Error::Disconnected);
        }
        if self.0.refuse_writes.load(Ordering::SeqCst) {
            return Err(Error::Io(std::io::Error::other("write refused")));
        }
        self.0.written.lock().unwrap().push(bytes.to_vec());
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), Error> {
        self.0.disconnected.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out prepared links in order, then fails every attempt.
#[derive(Default)]
struct FakeTransport {
    links: Mutex<VecDeque<Link>>,
    attempts: Mutex<Vec<Instant>>,
}

impl FakeTransport {
    fn with_link() -> (Arc<Self>, mpsc::Sender<Vec<u8>>, Arc<Wire>) {
        let (tx, incoming) = mpsc::channel(16);
        let wire = Arc::new(Wire::default());
        let link = Link {
            device: device(),
            incoming,
            writer: Box::new(FakeWriter(wire.clone())),
        };
        let transport = Self::default();
        transport.links.lock().unwrap().push_back(link);
        (Arc::new(transport), tx, wire)
    }

    fn attempts(&self) -> Vec<Instant> {
        self.attempts.lock().unwrap().clone()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn connect(&self, filter: &ConnectFilter) -> Result<Link, Error> {
        self.attempts.lock().unwrap().push(Instant::now());
        let link = self.links.lock().unwrap().pop_front();
        link.ok_or_else(|| Error::DeviceNotFound(filter.to_string()))
    }
}

fn device() -> DeviceInfo {
    DeviceInfo {
        address: "/dev/ttyFAKE0".into(),
        id: "fake".into(),
        name: "DL-FAKE".into(),
        flavor: "serial".into(),
    }
}

fn basic_frame() -> Vec<u8> {
    // 50.0 V, capacity raw 1000, 0.5 A, 80.0 %
    Frame::new(
        0x01,
        CMD_BASIC,
        vec![0x01, 0xf4, 0x03, 0xe8, 0x75, 0x35, 0x03, 0x20],
    )
    .to_bytes()
}

fn cells_frame() -> Vec<u8> {
    Frame::new(0x01, CMD_CELL_VOLTAGES, vec![0x00, 0x0c, 0xe4, 0x0c, 0xee]).to_bytes()
}

async fn next_matching(
    subscription: &mut Subscription,
    predicate: impl Fn(&EventKind) -> bool,
) -> Event {
    tokio::time::timeout(Duration::from_secs(300), async {
        loop {
            let event = subscription.recv().await.expect("bus closed");
            if predicate(&event.kind) {
                return event;
            }
        }
    })
    .await
    .expect("event not seen")
}

#[tokio::test(start_paused = true)]
async fn failed_connects_back_off_exponentially() {
    let transport = Arc::new(FakeTransport::default());
    let handle = ConnectionSupervisor::spawn(transport.clone(), Config::default());
    let mut subscription = handle.subscribe();

    for _ in 0..5 {
        next_matching(&mut subscription, |kind| *kind == EventKind::Connecting).await;
        let event = next_matching(&mut subscription, |kind| {
            matches!(kind, EventKind::Disconnected { .. })
        })
        .await;
        assert!(matches!(
            event.kind,
            EventKind::Disconnected { reason: Some(_) }
        ));
    }

    let attempts = transport.attempts();
    let gaps: Vec<u128> = attempts
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).as_millis())
        .collect();
    assert_eq!(gaps, vec![1000, 2000, 4000, 8000]);
    assert!(!handle.is_connected());
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn telemetry_flows_into_snapshot() {
    let (transport, tx, wire) = FakeTransport::with_link();
    let handle = ConnectionSupervisor::spawn(transport, Config::default());
    let mut subscription = handle.subscribe();

    let event = next_matching(&mut subscription, |kind| {
        matches!(kind, EventKind::Connected { .. })
    })
    .await;
    assert_eq!(event.kind, EventKind::Connected { device: device() });

    // The first poll cycle goes out right away.
    let event = next_matching(&mut subscription, |kind| matches!(kind, EventKind::Tx { .. })).await;
    assert_eq!(
        event.kind,
        EventKind::Tx {
            frame_hex: "a540900800000000000000007d".into()
        }
    );
    assert!(handle.is_connected());
    assert!(!handle.is_ready());

    let mut bytes = basic_frame();
    bytes.extend(cells_frame());
    tx.send(bytes).await.unwrap();

    next_matching(&mut subscription, |kind| *kind == EventKind::Ready).await;
    next_matching(&mut subscription, |kind| {
        matches!(kind, EventKind::State { snapshot } if !snapshot.cells_v.is_empty())
    })
    .await;

    assert!(handle.is_ready());
    let snapshot = handle.last_snapshot().unwrap();
    assert_eq!(snapshot.voltage_v, Some(50.0));
    assert_eq!(snapshot.current_a, Some(0.5));
    assert_eq!(snapshot.soc_pct, Some(80.0));
    assert_eq!(snapshot.cells_v, vec![3.3, 3.31]);
    assert_eq!(snapshot.cell_delta_mv, Some(10));
    assert_eq!(handle.device_info().unwrap().name, "DL-FAKE");

    // A late subscriber catches up from the seed.
    let mut late = handle.subscribe();
    assert_eq!(late.try_recv().unwrap().kind, EventKind::Hello);
    assert_eq!(late.try_recv().unwrap().kind, EventKind::Ready);
    assert!(matches!(
        late.try_recv().unwrap().kind,
        EventKind::State { .. }
    ));

    assert!(!wire.written.lock().unwrap().is_empty());
    handle.shutdown().await;
    assert!(wire.disconnected.load(Ordering::SeqCst));
}

#[tokio::test(start_paused = true)]
async fn silence_triggers_no_data_and_reconnect() {
    let (transport, _tx, wire) = FakeTransport::with_link();
    let handle = ConnectionSupervisor::spawn(transport.clone(), Config::default());
    let mut subscription = handle.subscribe();

    next_matching(&mut subscription, |kind| {
        matches!(kind, EventKind::Connected { .. })
    })
    .await;
    let event = next_matching(&mut subscription, |kind| {
        matches!(kind, EventKind::NoData { .. })
    })
    .await;
    let EventKind::NoData { idle_ms } = event.kind else {
        unreachable!()
    };
    assert!(idle_ms >= 15000);

    next_matching(&mut subscription, |kind| {
        matches!(kind, EventKind::Disconnected { .. })
    })
    .await;
    assert!(wire.disconnected.load(Ordering::SeqCst));
    assert!(!handle.is_connected());
    assert!(handle.device_info().is_none());

    // The next attempt follows after the initial backoff.
    next_matching(&mut subscription, |kind| *kind == EventKind::Connecting).await;
    next_matching(&mut subscription, |kind| {
        matches!(kind, EventKind::Disconnected { .. })
    })
    .await;
    let attempts = transport.attempts();
    assert_eq!(attempts.len(), 2);
    assert_eq!((attempts[1] - attempts[0]).as_secs(), 16);
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn closed_link_is_a_disconnect() {
    let (transport, tx, _wire) = FakeTransport::with_link();
    let handle = ConnectionSupervisor::spawn(transport, Config::default());
    let mut subscription = handle.subscribe();

    next_matching(&mut subscription, |kind| {
        matches!(kind, EventKind::Connected { .. })
    })
    .await;
    drop(tx);
    let event = next_matching(&mut subscription, |kind| {
        matches!(kind, EventKind::Disconnected { .. })
    })
    .await;
    assert_eq!(
        event.kind,
        EventKind::Disconnected {
            reason: Some(Error::Disconnected.to_string())
        }
    );
    handle.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_retrying() {
    let transport = Arc::new(FakeTransport::default());
    let handle = ConnectionSupervisor::spawn(transport.clone(), Config::default());
    let mut subscription = handle.subscribe();
    next_matching(&mut subscription, |kind| {
        matches!(kind, EventKind::Disconnected { reason: Some(_) })
    })
    .await;

    handle.shutdown().await;
    let attempts = transport.attempts().len();
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(transport.attempts().len(), attempts);
}

#[tokio::test(start_paused = true)]
async fn shutdown_is_not_reported_as_disconnect() {
    let (transport, _tx, wire) = FakeTransport::with_link();
    let handle = ConnectionSupervisor::spawn(transport, Config::default());
    let mut subscription = handle.subscribe();

    next_matching(&mut subscription, |kind| {
        matches!(kind, EventKind::Connected { .. })
    })
    .await;
    tokio::time::sleep(Duration::from_millis(500)).await;
    handle.shutdown().await;
    assert!(wire.disconnected.load(Ordering::SeqCst));

    let mut rest = Vec::new();
    while let Some(event) = subscription.try_recv() {
        rest.push(event.kind);
    }
    assert!(rest.iter().any(|kind| matches!(kind, EventKind::Tx { .. })));
    assert!(!rest
        .iter()
        .any(|kind| matches!(kind, EventKind::Disconnected { .. })));
}

#[tokio::test(start_paused = true)]
async fn write_failures_are_reported_and_polling_continues() {
    let (transport, _tx, wire) = FakeTransport::with_link();
    wire.refuse_writes.store(true, Ordering::SeqCst);
    let start = Instant::now();
    let handle = ConnectionSupervisor::spawn(transport, Config::default());
    let mut subscription = handle.subscribe();

    next_matching(&mut subscription, |kind| {
        matches!(kind, EventKind::Connected { .. })
    })
    .await;
    let is_write =
        |kind: &EventKind| matches!(kind, EventKind::Tx { .. } | EventKind::TxError { .. });

    for _ in 0..6 {
        let event = next_matching(&mut subscription, is_write).await;
        assert_eq!(
            event.kind,
            EventKind::TxError {
                message: "IO error: write refused".into()
            }
        );
    }
    assert!(start.elapsed() < Duration::from_secs(1));

    let event = next_matching(&mut subscription, is_write).await;
    assert!(matches!(event.kind, EventKind::TxError { .. }));
    assert!(start.elapsed() >= Duration::from_secs(6));
    assert!(handle.is_connected());
    assert!(wire.written.lock().unwrap().is_empty());
    handle.shutdown().await;
}
