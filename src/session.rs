//! Per-connection pipeline from raw bytes to decoded messages and state.

use crate::balancing::BalancingDetector;
use crate::config::Config;
use crate::decoder::{self, BalanceReason, CurrentSign, DecodedMessage};
use crate::framer::Framer;
use crate::state::{Snapshot, StateAggregator};

/// Framer, decoder, balancing detector and aggregator of one connection.
///
/// A new connection starts a new session; nothing carries over.
#[derive(Debug)]
pub struct Session {
    framer: Framer,
    sign: CurrentSign,
    detector: BalancingDetector,
    aggregator: StateAggregator,
    explicit_flags: bool,
}

impl Session {
    pub fn new(config: &Config) -> Self {
        Self {
            framer: Framer::new(),
            sign: config.current_sign,
            detector: BalancingDetector::new(config.balancing.clone()),
            aggregator: StateAggregator::new(config.rated_capacity_ah),
            explicit_flags: false,
        }
    }

    /// Feeds a chunk of received bytes.
    ///
    /// Returns every message decoded from it, including balancing verdicts
    /// inferred from cell voltage pages, each already folded into the state.
    pub fn ingest(&mut self, chunk: &[u8]) -> Vec<DecodedMessage> {
        let mut messages = Vec::new();
        self.ingest_with(chunk, |_, message| messages.push(message));
        messages
    }

    /// Like [`Session::ingest`], but hands each message to `on_message` as
    /// soon as it is folded in, so `session.snapshot()` reflects exactly the
    /// messages up to and including it.
    pub fn ingest_with(
        &mut self,
        chunk: &[u8],
        mut on_message: impl FnMut(&Self, DecodedMessage),
    ) {
        for frame in self.framer.push(chunk) {
            let Some(mut message) = decoder::decode(&frame, self.sign) else {
                continue;
            };
            let inferred = self.observe(&mut message);
            for message in std::iter::once(message).chain(inferred) {
                self.aggregator.update(&message);
                on_message(self, message);
            }
        }
    }

    fn observe(&mut self, message: &mut DecodedMessage) -> Option<DecodedMessage> {
        match message {
            DecodedMessage::Basic { current_a, .. } => {
                self.detector.set_current(current_a.unwrap_or(0.0));
                None
            }
            DecodedMessage::BalanceFlags {
                mask,
                per_cell,
                reason: BalanceReason::Flags,
            } => {
                if !self.explicit_flags {
                    log::debug!("device reports balance flags, trend inference disabled");
                    self.explicit_flags = true;
                }
                let report = self.detector.detect_from_flags(*mask, per_cell.as_deref());
                log::trace!("balance flags: {:?}", report.active_cells);
                if per_cell.is_none() {
                    *per_cell = Some(per_cell_flags(&report.active_cells));
                }
                None
            }
            DecodedMessage::Cells { page, cells_mv } if !self.explicit_flags => {
                let report = self.detector.feed_cell_page(*page, cells_mv)?;
                Some(DecodedMessage::BalanceFlags {
                    mask: None,
                    per_cell: Some(per_cell_flags(&report.active_cells)),
                    reason: BalanceReason::Trend,
                })
            }
            _ => None,
        }
    }

    pub fn snapshot(&self) -> Snapshot {
        self.aggregator.snapshot()
    }
}

/// One flag per cell up to the highest active index.
fn per_cell_flags(active_cells: &[usize]) -> Vec<bool> {
    let len = active_cells.iter().max().map_or(0, |max| max + 1);
    let mut per_cell = vec![false; len];
    for index in active_cells {
        per_cell[*index] = true;
    }
    per_cell
}
