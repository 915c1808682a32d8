//! Lifecycle and telemetry events and their in-process fan-out.
//!
//! The bus is a `tokio::sync::broadcast` channel: publishing never waits for
//! subscribers. A subscriber that falls behind loses the oldest events and
//! continues with the newest; a dropped subscriber simply detaches.

use crate::decoder::DecodedMessage;
use crate::state::Snapshot;
use crate::transport::DeviceInfo;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;

pub const DEFAULT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EventKind {
    Hello,
    Connecting,
    Connected { device: DeviceInfo },
    /// First message decoded in the current session.
    Ready,
    NoData { idle_ms: u64 },
    Disconnected {
        #[serde(skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    State { snapshot: Arc<Snapshot> },
    Tx { frame_hex: String },
    TxError { message: String },
    Decoded { message: DecodedMessage },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl Event {
    pub fn now(kind: EventKind) -> Self {
        Self {
            ts: Utc::now(),
            kind,
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<Event>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn publish(&self, kind: EventKind) {
        log::trace!("publish {kind:?}");
        // Having no subscriber is not an error.
        let _ = self.sender.send(Event::now(kind));
    }

    pub fn subscribe(&self) -> Subscription {
        Subscription {
            seed: VecDeque::new(),
            receiver: self.sender.subscribe(),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

/// Receiving end of the bus, optionally seeded with events to deliver first.
#[derive(Debug)]
pub struct Subscription {
    seed: VecDeque<Event>,
    receiver: broadcast::Receiver<Event>,
}

impl Subscription {
    pub(crate) fn with_seed(mut self, seed: impl IntoIterator<Item = Event>) -> Self {
        self.seed.extend(seed);
        self
    }

    /// Next event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        if let Some(event) = self.seed.pop_front() {
            return Some(event);
        }
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("subscriber lagging, skipped {skipped} events");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking variant of [`Subscription::recv`].
    pub fn try_recv(&mut self) -> Option<Event> {
        if let Some(event) = self.seed.pop_front() {
            return Some(event);
        }
        loop {
            match self.receiver.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    log::warn!("subscriber lagging, skipped {skipped} events");
                }
                Err(_) => return None,
            }
        }
    }
}
