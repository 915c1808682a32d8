//! Connection supervision: connect, poll, watch for silence, reconnect.
//!
//! [`ConnectionSupervisor::spawn`] moves the supervisor into a task and
//! returns a [`SupervisorHandle`]. The handle answers status queries without
//! waiting on the task and hands out event subscriptions.

use crate::config::Config;
use crate::events::{Event, EventBus, EventKind, Subscription};
use crate::protocol::{self, poll_set};
use crate::session::Session;
use crate::state::Snapshot;
use crate::transport::{DeviceInfo, Link, LinkWriter, Transport};
use crate::Error;
use arc_swap::ArcSwapOption;
use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

type SharedWriter = Arc<Mutex<Box<dyn LinkWriter>>>;

/// Reconnect delays: 1 s doubling up to 30 s, without jitter.
pub fn reconnect_backoff() -> ExponentialBackoff {
    ExponentialBackoff {
        current_interval: BACKOFF_INITIAL,
        initial_interval: BACKOFF_INITIAL,
        randomization_factor: 0.0,
        multiplier: 2.0,
        max_interval: BACKOFF_MAX,
        max_elapsed_time: None,
        ..ExponentialBackoff::default()
    }
}

#[derive(Debug, Default)]
struct Shared {
    snapshot: ArcSwapOption<Snapshot>,
    device: ArcSwapOption<DeviceInfo>,
    connected: AtomicBool,
    ready: AtomicBool,
}

pub struct ConnectionSupervisor {
    transport: Arc<dyn Transport>,
    config: Config,
    bus: EventBus,
    shared: Arc<Shared>,
    cancel: CancellationToken,
}

impl ConnectionSupervisor {
    /// Starts supervising on the current Tokio runtime.
    pub fn spawn(transport: Arc<dyn Transport>, config: Config) -> SupervisorHandle {
        let bus = EventBus::new(config.event_capacity);
        let shared = Arc::new(Shared::default());
        let cancel = CancellationToken::new();
        let supervisor = Self {
            transport,
            config,
            bus: bus.clone(),
            shared: shared.clone(),
            cancel: cancel.clone(),
        };
        SupervisorHandle {
            bus,
            shared,
            cancel,
            task: tokio::spawn(supervisor.run()),
        }
    }

    async fn run(self) {
        let filter = self.config.connect_filter();
        let mut backoff = reconnect_backoff();
        log::info!("supervising device {filter}");

        loop {
            self.bus.publish(EventKind::Connecting);
            let connect = tokio::time::timeout(
                self.config.connect_timeout,
                self.transport.connect(&filter),
            );
            let result = tokio::select! {
                _ = self.cancel.cancelled() => break,
                result = connect => result,
            };
            let reason = match result {
                Ok(Ok(link)) => {
                    backoff.reset();
                    self.run_session(link).await
                }
                Ok(Err(err)) => {
                    log::warn!("connect failed: {err}");
                    Some(err.to_string())
                }
                Err(_) => {
                    let err = Error::ConnectTimeout(self.config.connect_timeout);
                    log::warn!("{err}");
                    Some(err.to_string())
                }
            };

            self.shared.connected.store(false, Ordering::SeqCst);
            self.shared.ready.store(false, Ordering::SeqCst);
            self.shared.device.store(None);
            if self.cancel.is_cancelled() {
                break;
            }
            self.bus.publish(EventKind::Disconnected { reason });

            let delay = backoff.next_backoff().unwrap_or(BACKOFF_MAX);
            log::info!("reconnecting in {delay:?}");
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        log::info!("supervisor stopped");
    }

    /// Runs one connection until it drops, goes silent or shutdown is requested.
    async fn run_session(&self, link: Link) -> Option<String> {
        let Link {
            device,
            mut incoming,
            writer,
        } = link;
        log::info!("connected to {} at {}", device.name, device.address);
        self.shared.device.store(Some(Arc::new(device.clone())));
        self.shared.connected.store(true, Ordering::SeqCst);
        self.bus.publish(EventKind::Connected { device });

        let token = self.cancel.child_token();
        let writer: SharedWriter = Arc::new(Mutex::new(writer));
        let poller = tokio::spawn(poll_loop(
            writer.clone(),
            poll_set(
                self.config.temperature_command,
                self.config.request_balance_flags,
            ),
            self.config.poll_interval,
            self.config.inter_frame_delay,
            self.bus.clone(),
            token.clone(),
        ));

        let mut session = Session::new(&self.config);
        let mut last_rx = Instant::now();
        let mut watchdog = tokio::time::interval(self.config.watchdog_period());
        watchdog.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let reason = loop {
            tokio::select! {
                _ = token.cancelled() => break Some("shutdown".to_string()),
                chunk = incoming.recv() => match chunk {
                    Some(chunk) => {
                        last_rx = Instant::now();
                        self.handle_chunk(&mut session, &chunk);
                    }
                    None => {
                        log::warn!("link closed by transport");
                        break Some(Error::Disconnected.to_string());
                    }
                },
                _ = watchdog.tick() => {
                    let idle = last_rx.elapsed();
                    if idle >= self.config.rx_timeout {
                        log::warn!("no data for {idle:?}, dropping link");
                        self.bus.publish(EventKind::NoData {
                            idle_ms: idle.as_millis() as u64,
                        });
                        break Some("no data".to_string());
                    }
                }
            }
        };

        token.cancel();
        if let Err(err) = poller.await {
            log::warn!("poll task failed: {err}");
        }
        let mut writer = writer.lock().await;
        match tokio::time::timeout(DISCONNECT_GRACE, writer.disconnect()).await {
            Ok(Ok(())) => log::debug!("link disconnected"),
            Ok(Err(err)) => log::warn!("disconnect failed: {err}"),
            Err(_) => log::warn!("disconnect did not finish within {DISCONNECT_GRACE:?}"),
        }
        reason
    }

    fn handle_chunk(&self, session: &mut Session, chunk: &[u8]) {
        session.ingest_with(chunk, |session, message| {
            if !self.shared.ready.swap(true, Ordering::SeqCst) {
                log::info!("receiving telemetry");
                self.bus.publish(EventKind::Ready);
            }
            let snapshot = Arc::new(session.snapshot());
            self.shared.snapshot.store(Some(snapshot.clone()));
            self.bus.publish(EventKind::Decoded { message });
            self.bus.publish(EventKind::State { snapshot });
        });
    }
}

async fn poll_loop(
    writer: SharedWriter,
    requests: Vec<Vec<u8>>,
    interval: Duration,
    inter_frame_delay: Duration,
    bus: EventBus,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval.max(MIN_POLL_INTERVAL));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = ticker.tick() => {}
        }
        for request in &requests {
            let result = tokio::select! {
                _ = token.cancelled() => return,
                result = async { writer.lock().await.write(request).await } => result,
            };
            match result {
                Ok(()) => {
                    bus.publish(EventKind::Tx {
                        frame_hex: protocol::to_hex(request),
                    });
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = tokio::time::sleep(inter_frame_delay) => {}
                    }
                }
                Err(err) => {
                    log::warn!("write failed: {err}");
                    bus.publish(EventKind::TxError {
                        message: err.to_string(),
                    });
                }
            }
        }
    }
}

/// Control and query side of a running [`ConnectionSupervisor`].
#[derive(Debug)]
pub struct SupervisorHandle {
    bus: EventBus,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    /// Subscribes to events.
    ///
    /// The subscription first yields `hello`, the current link status
    /// (`ready`, `connected` or `disconnected`) and the last snapshot, if any.
    pub fn subscribe(&self) -> Subscription {
        let subscription = self.bus.subscribe();
        let mut seed = vec![Event::now(EventKind::Hello)];
        let device = self.shared.device.load_full();
        let status = match device {
            _ if self.is_ready() => EventKind::Ready,
            Some(device) if self.is_connected() => EventKind::Connected {
                device: (*device).clone(),
            },
            _ => EventKind::Disconnected { reason: None },
        };
        seed.push(Event::now(status));
        if let Some(snapshot) = self.last_snapshot() {
            seed.push(Event::now(EventKind::State { snapshot }));
        }
        subscription.with_seed(seed)
    }

    pub fn last_snapshot(&self) -> Option<Arc<Snapshot>> {
        self.shared.snapshot.load_full()
    }

    pub fn device_info(&self) -> Option<Arc<DeviceInfo>> {
        self.shared.device.load_full()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    pub fn is_ready(&self) -> bool {
        self.shared.ready.load(Ordering::SeqCst)
    }

    /// Stops reconnecting, closes the current link and waits for the task.
    pub async fn shutdown(self) {
        log::info!("shutting down supervisor");
        self.cancel.cancel();
        if let Err(err) = self.task.await {
            log::error!("supervisor task failed: {err}");
        }
    }
}
