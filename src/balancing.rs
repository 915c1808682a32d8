//! Cell balancing inference.
//!
//! Explicit device flags always win. Without them, balancing is guessed from
//! a short voltage history per cell: a bleeding cell is one of the highest
//! cells whose voltage keeps dropping while the pack is close to idle.
//!
//! The thresholds are empirical and have not been validated against
//! hardware; treat a `trend` report as an approximation.

use crate::decoder::BalanceReason;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};

/// Tunables of the trend heuristic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BalancingConfig {
    /// Samples kept per cell.
    pub max_samples: usize,
    /// Minimum voltage drop over the window, in mV.
    pub drop_threshold_mv: u16,
    /// Number of highest cells considered.
    pub top_k: usize,
    pub min_samples_to_decide: usize,
    /// Trend detection is suppressed above this absolute pack current.
    pub current_suppress_threshold_a: f64,
}

impl Default for BalancingConfig {
    fn default() -> Self {
        Self {
            max_samples: 6,
            drop_threshold_mv: 3,
            top_k: 3,
            min_samples_to_decide: 3,
            current_suppress_threshold_a: 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BalancingReport {
    pub balancing: bool,
    /// 0-based cell indices.
    pub active_cells: Vec<usize>,
    pub reason: BalanceReason,
    pub timestamp: DateTime<Utc>,
}

/// Active cell indices from a per-cell list (preferred when non-empty) or a bitmask.
pub fn active_cells_from_flags(mask: Option<u64>, per_cell: Option<&[bool]>) -> Vec<usize> {
    match (per_cell, mask) {
        (Some(per_cell), _) if !per_cell.is_empty() => per_cell
            .iter()
            .enumerate()
            .filter_map(|(i, active)| (*active).then_some(i))
            .collect(),
        (_, Some(mask)) => (0..u64::BITS as usize)
            .filter(|i| mask & (1u64 << i) != 0)
            .collect(),
        _ => Vec::new(),
    }
}

struct Candidate {
    index: usize,
    delta: i32,
    latest: u16,
}

#[derive(Debug, Default)]
pub struct BalancingDetector {
    config: BalancingConfig,
    history: BTreeMap<usize, VecDeque<u16>>,
    current_a: f64,
}

impl BalancingDetector {
    pub fn new(config: BalancingConfig) -> Self {
        Self {
            config,
            history: BTreeMap::new(),
            current_a: 0.0,
        }
    }

    pub fn set_current(&mut self, current_a: f64) {
        self.current_a = current_a;
    }

    pub fn detect_from_flags(&self, mask: Option<u64>, per_cell: Option<&[bool]>) -> BalancingReport {
        let active_cells = active_cells_from_flags(mask, per_cell);
        BalancingReport {
            balancing: !active_cells.is_empty(),
            active_cells,
            reason: BalanceReason::Flags,
            timestamp: Utc::now(),
        }
    }

    /// Feeds one page of cell voltages and reports the trend verdict.
    ///
    /// Returns `None` while the pack current masks the balancing signature,
    /// or while no cell has collected enough samples.
    pub fn feed_cell_page(&mut self, page: u8, cells_mv: &[u16]) -> Option<BalancingReport> {
        if self.current_a.abs() > self.config.current_suppress_threshold_a {
            log::trace!("trend detection suppressed at {} A", self.current_a);
            return None;
        }

        let base = page as usize * cells_mv.len();
        for (offset, mv) in cells_mv.iter().enumerate() {
            let samples = self.history.entry(base + offset).or_default();
            samples.push_back(*mv);
            while samples.len() > self.config.max_samples {
                samples.pop_front();
            }
        }

        let mut candidates: Vec<Candidate> = self
            .history
            .iter()
            .filter(|(_, samples)| samples.len() >= self.config.min_samples_to_decide)
            .filter_map(|(index, samples)| {
                let earliest = *samples.front()?;
                let latest = *samples.back()?;
                Some(Candidate {
                    index: *index,
                    delta: latest as i32 - earliest as i32,
                    latest,
                })
            })
            .collect();
        if candidates.is_empty() {
            return None;
        }

        candidates.sort_by(|a, b| b.latest.cmp(&a.latest));
        candidates.truncate(self.config.top_k.min(candidates.len()));

        let drop = -(self.config.drop_threshold_mv as i32);
        let active_cells: Vec<usize> = candidates
            .iter()
            .filter(|c| c.delta <= drop)
            .map(|c| c.index)
            .collect();
        let balancing = active_cells.len() >= candidates.len().div_ceil(2);
        log::debug!(
            "balancing trend: top={:?} active={:?} balancing={}",
            candidates.iter().map(|c| c.index).collect::<Vec<_>>(),
            active_cells,
            balancing
        );

        Some(BalancingReport {
            balancing,
            active_cells: if balancing { active_cells } else { Vec::new() },
            reason: BalanceReason::Trend,
            timestamp: Utc::now(),
        })
    }

    /// Drops all history, e.g. on a new connection.
    pub fn reset(&mut self) {
        self.history.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_are_authoritative() {
        let detector = BalancingDetector::default();
        let report = detector.detect_from_flags(Some(0b1010), None);
        assert!(report.balancing);
        assert_eq!(report.active_cells, vec![1, 3]);
        assert_eq!(report.reason, BalanceReason::Flags);

        let report = detector.detect_from_flags(Some(0b1), Some(&[false, false, true][..]));
        assert_eq!(report.active_cells, vec![2]);

        let report = detector.detect_from_flags(None, None);
        assert!(!report.balancing);
    }

    #[test]
    fn suppressed_under_load() {
        let mut detector = BalancingDetector::new(BalancingConfig::default());
        detector.set_current(5.0);
        for mv in [3400, 3390, 3380, 3370] {
            assert_eq!(detector.feed_cell_page(0, &[mv, 3300]), None);
        }
    }

    #[test]
    fn dropping_top_cell_is_balancing() {
        let mut detector = BalancingDetector::new(BalancingConfig::default());
        detector.set_current(0.0);
        assert_eq!(detector.feed_cell_page(0, &[3400, 3300]), None);
        assert_eq!(detector.feed_cell_page(0, &[3395, 3300]), None);
        let report = detector.feed_cell_page(0, &[3390, 3300]).unwrap();
        assert!(report.balancing);
        assert_eq!(report.active_cells, vec![0]);
        assert_eq!(report.reason, BalanceReason::Trend);
    }

    #[test]
    fn majority_of_top_cells_required() {
        let mut detector = BalancingDetector::new(BalancingConfig::default());
        // Four cells, top three are 0, 1, 2; only cell 0 drops.
        for step in 0..3u16 {
            detector.feed_cell_page(0, &[3400 - step * 5, 3390, 3380, 3300]);
        }
        let report = detector.feed_cell_page(0, &[3385, 3390, 3380, 3300]).unwrap();
        assert!(!report.balancing);
        assert!(report.active_cells.is_empty());
    }

    #[test]
    fn history_window_is_capped() {
        let mut detector = BalancingDetector::new(BalancingConfig::default());
        // An early drop falls out of the six sample window.
        for mv in [3420, 3400, 3400, 3400, 3400, 3400, 3400] {
            detector.feed_cell_page(0, &[mv]);
        }
        let report = detector.feed_cell_page(0, &[3400]).unwrap();
        assert!(!report.balancing);
    }

    #[test]
    fn pages_map_to_absolute_indices() {
        let mut detector = BalancingDetector::new(BalancingConfig {
            top_k: 1,
            ..Default::default()
        });
        for mv in [3400, 3396, 3392] {
            detector.feed_cell_page(0, &[3300, 3300, 3300]);
            detector.feed_cell_page(1, &[3300, mv, 3300]);
        }
        let report = detector.feed_cell_page(1, &[3300, 3390, 3300]).unwrap();
        assert!(report.balancing);
        assert_eq!(report.active_cells, vec![4]);
    }

    #[test]
    fn reset_discards_history() {
        let mut detector = BalancingDetector::new(BalancingConfig::default());
        for mv in [3400, 3395, 3390] {
            detector.feed_cell_page(0, &[mv]);
        }
        detector.reset();
        assert_eq!(detector.feed_cell_page(0, &[3385]), None);
    }
}
