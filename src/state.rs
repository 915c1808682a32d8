//! Aggregation of decoded messages into one device snapshot.

use crate::balancing::active_cells_from_flags;
use crate::decoder::{CapacityCandidates, DecodedMessage};
use crate::protocol::round_dp;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const CAPACITY_AH_MIN: f64 = 5.0;
const CAPACITY_AH_MAX: f64 = 1000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurrentSource {
    /// Reported by the BMS in the basic message.
    Direct,
    #[default]
    None,
}

/// Immutable view of the best known pack state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Snapshot {
    pub voltage_v: Option<f64>,
    pub current_a: Option<f64>,
    pub current_source: CurrentSource,
    pub soc_pct: Option<f64>,
    pub rated_capacity_ah: Option<f64>,
    pub remain_capacity_ah: Option<f64>,
    pub cell_count: Option<u8>,
    pub ntc_count: Option<u8>,
    pub temps_c: Vec<i16>,
    pub cells_mv: Vec<u16>,
    pub cells_v: Vec<f64>,
    pub pack_from_cells_v: Option<f64>,
    pub cell_min_mv: Option<u16>,
    pub cell_max_mv: Option<u16>,
    pub cell_delta_mv: Option<u16>,
    /// 1-based.
    pub cell_min_index: Option<usize>,
    pub cell_max_index: Option<usize>,
    pub cell_min_v: Option<f64>,
    pub cell_max_v: Option<f64>,
    pub cell_delta_v: Option<f64>,
    pub system_state: Option<u8>,
    pub charge_mos: Option<bool>,
    pub discharge_mos: Option<bool>,
    pub balancing: bool,
    pub balancing_cells: Vec<usize>,
}

#[derive(Debug, Clone, Copy)]
struct CellRange {
    min_mv: u16,
    min_index: usize,
    max_mv: u16,
    max_index: usize,
    delta_mv: u16,
}

/// Folds one session's decoded messages into a [`Snapshot`].
///
/// Only raw values are stored; every derived quantity is computed when a
/// snapshot is taken.
#[derive(Debug, Default)]
pub struct StateAggregator {
    cell_count: Option<u8>,
    ntc_count: Option<u8>,
    voltage_v: Option<f64>,
    current_a: Option<f64>,
    current_source: CurrentSource,
    soc_pct: Option<f64>,
    rated_capacity_ah: Option<f64>,
    temps_c: Vec<i16>,
    cell_pages: BTreeMap<u8, Vec<u16>>,
    cells_mv: Vec<u16>,
    cell_range: Option<CellRange>,
    system_state: Option<u8>,
    charge_mos: Option<u8>,
    discharge_mos: Option<u8>,
    balancing_cells: Vec<usize>,
}

impl StateAggregator {
    /// `rated_capacity_ah` pins the rated capacity instead of inferring it.
    pub fn new(rated_capacity_ah: Option<f64>) -> Self {
        Self {
            rated_capacity_ah: rated_capacity_ah.filter(|c| c.is_finite() && *c > 0.0),
            ..Default::default()
        }
    }

    /// Chooses the candidate within [5, 1000] Ah that is closest to a whole number.
    ///
    /// Real packs are rated in whole amp hours. When both scales look whole,
    /// the 0.1 Ah reading wins.
    pub fn pick_capacity_candidate(candidates: &CapacityCandidates) -> Option<f64> {
        let fraction = |v: f64| (v.round() - v).abs();
        [candidates.by0p01, candidates.by0p1]
            .into_iter()
            .filter(|v| v.is_finite() && (CAPACITY_AH_MIN..=CAPACITY_AH_MAX).contains(v))
            .fold(None, |best: Option<f64>, v| match best {
                Some(b) if fraction(b) < fraction(v) => Some(b),
                _ => Some(v),
            })
    }

    pub fn update(&mut self, message: &DecodedMessage) {
        match message {
            DecodedMessage::Counts {
                cell_count,
                ntc_count,
            } => {
                self.cell_count = Some(*cell_count);
                self.ntc_count = Some(*ntc_count);
            }
            DecodedMessage::Basic {
                voltage_v,
                current_a,
                capacity_candidates,
                soc_pct,
            } => {
                self.voltage_v = Some(*voltage_v);
                match current_a.filter(|c| c.is_finite()) {
                    Some(current) => {
                        self.current_a = Some(current);
                        self.current_source = CurrentSource::Direct;
                    }
                    None => {
                        self.current_a = None;
                        self.current_source = CurrentSource::None;
                    }
                }
                if soc_pct.is_finite() {
                    self.soc_pct = Some(soc_pct.clamp(0.0, 100.0));
                }
                if self.rated_capacity_ah.is_none() {
                    self.rated_capacity_ah = Self::pick_capacity_candidate(capacity_candidates)
                        .map(|capacity| round_dp(capacity, 2));
                    if let Some(capacity) = self.rated_capacity_ah {
                        log::info!("rated capacity resolved to {capacity} Ah");
                    }
                }
            }
            DecodedMessage::CellStats {
                max_mv,
                max_index,
                min_mv,
                min_index,
                delta_mv,
            } => {
                self.cell_range = Some(CellRange {
                    min_mv: *min_mv,
                    min_index: usize::from(*min_index),
                    max_mv: *max_mv,
                    max_index: usize::from(*max_index),
                    delta_mv: *delta_mv,
                });
            }
            DecodedMessage::Temps { temps_c, .. } => self.temps_c = temps_c.clone(),
            DecodedMessage::Cells { page, cells_mv } => {
                self.cell_pages.insert(*page, cells_mv.clone());
                self.flatten_cells();
            }
            DecodedMessage::Status {
                state,
                charge_mos,
                discharge_mos,
            } => {
                self.system_state = Some(*state);
                self.charge_mos = Some(*charge_mos);
                self.discharge_mos = Some(*discharge_mos);
            }
            DecodedMessage::BalanceFlags { mask, per_cell, .. } => {
                self.balancing_cells = active_cells_from_flags(*mask, per_cell.as_deref());
            }
        }
    }

    fn flatten_cells(&mut self) {
        let flat = self.cell_pages.values().flatten().copied();
        self.cells_mv = match self.cell_count {
            Some(count) => flat.take(count as usize).collect(),
            None => flat.collect(),
        };

        let Some(first) = self.cells_mv.first().copied() else {
            return;
        };
        let mut range = CellRange {
            min_mv: first,
            min_index: 1,
            max_mv: first,
            max_index: 1,
            delta_mv: 0,
        };
        for (i, mv) in self.cells_mv.iter().enumerate().skip(1) {
            if *mv < range.min_mv {
                range.min_mv = *mv;
                range.min_index = i + 1;
            }
            if *mv > range.max_mv {
                range.max_mv = *mv;
                range.max_index = i + 1;
            }
        }
        range.delta_mv = range.max_mv - range.min_mv;
        self.cell_range = Some(range);
    }

    pub fn snapshot(&self) -> Snapshot {
        let cells_v: Vec<f64> = self
            .cells_mv
            .iter()
            .map(|mv| round_dp(*mv as f64 / 1000.0, 3))
            .collect();
        let pack_from_cells_v =
            (!cells_v.is_empty()).then(|| round_dp(cells_v.iter().sum::<f64>(), 2));
        let remain_capacity_ah = self
            .rated_capacity_ah
            .zip(self.soc_pct)
            .map(|(rated, soc)| round_dp(rated * soc / 100.0, 2));
        let to_v = |mv: u16| round_dp(mv as f64 / 1000.0, 3);
        let range = self.cell_range;

        Snapshot {
            voltage_v: self.voltage_v,
            current_a: self.current_a,
            current_source: self.current_source,
            soc_pct: self.soc_pct.map(|soc| round_dp(soc, 1)),
            rated_capacity_ah: self.rated_capacity_ah,
            remain_capacity_ah,
            cell_count: self.cell_count,
            ntc_count: self.ntc_count,
            temps_c: self.temps_c.clone(),
            cells_mv: self.cells_mv.clone(),
            cells_v,
            pack_from_cells_v,
            cell_min_mv: range.map(|r| r.min_mv),
            cell_max_mv: range.map(|r| r.max_mv),
            cell_delta_mv: range.map(|r| r.delta_mv),
            cell_min_index: range.map(|r| r.min_index),
            cell_max_index: range.map(|r| r.max_index),
            cell_min_v: range.map(|r| to_v(r.min_mv)),
            cell_max_v: range.map(|r| to_v(r.max_mv)),
            cell_delta_v: range.map(|r| to_v(r.delta_mv)),
            system_state: self.system_state,
            charge_mos: self.charge_mos.map(|b| b != 0),
            discharge_mos: self.discharge_mos.map(|b| b != 0),
            balancing: !self.balancing_cells.is_empty(),
            balancing_cells: self.balancing_cells.clone(),
        }
    }
}
