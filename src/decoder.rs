//! Typed interpretation of frame payloads.
//!
//! Decoding never fails loudly: unknown commands, short payloads and values
//! outside physical bounds simply yield `None`.

use crate::protocol::{
    round_dp, Frame, CMD_BALANCE_FLAGS, CMD_BASIC, CMD_CELL_STATS, CMD_CELL_VOLTAGES, CMD_COUNTS,
    CMD_STATUS, CMD_TEMPERATURES, CMD_TEMPERATURES_ALT,
};
use serde::{Deserialize, Serialize};

const CELL_MV_MIN: u16 = 1500;
const CELL_MV_MAX: u16 = 5000;
const CELL_DELTA_MV_MAX: u16 = 1000;
const MAX_CELLS: u8 = 32;
// An offset of 40 is added by the BMS to avoid having to deal with negative numbers
const TEMPERATURE_OFFSET: i16 = 40;
const CURRENT_OFFSET: i32 = 30000;
const CURRENT_PLAUSIBLE_A: f64 = 500.0;

/// Sign convention applied to the decoded pack current.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurrentSign {
    #[default]
    Normal,
    Invert,
}

impl CurrentSign {
    pub fn apply(self, current: f64) -> f64 {
        match self {
            CurrentSign::Normal => current,
            CurrentSign::Invert => -current,
        }
    }
}

/// The capacity field of `0x90` is scaled differently across firmware.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CapacityCandidates {
    pub by0p01: f64,
    pub by0p1: f64,
}

/// Where balancing information came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BalanceReason {
    /// Reported by the device.
    Flags,
    /// Inferred from cell voltage trends.
    Trend,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DecodedMessage {
    Basic {
        voltage_v: f64,
        current_a: Option<f64>,
        capacity_candidates: CapacityCandidates,
        soc_pct: f64,
    },
    CellStats {
        max_mv: u16,
        max_index: u8,
        min_mv: u16,
        min_index: u8,
        delta_mv: u16,
    },
    Counts {
        cell_count: u8,
        ntc_count: u8,
    },
    Temps {
        command: u8,
        temps_c: Vec<i16>,
    },
    Cells {
        page: u8,
        cells_mv: Vec<u16>,
    },
    Status {
        state: u8,
        charge_mos: u8,
        discharge_mos: u8,
    },
    BalanceFlags {
        mask: Option<u64>,
        per_cell: Option<Vec<bool>>,
        reason: BalanceReason,
    },
}

fn be16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn plausible_cell_mv(mv: u16) -> bool {
    (CELL_MV_MIN..=CELL_MV_MAX).contains(&mv)
}

/// Resolves the ambiguous 16 bit current field.
///
/// Depending on firmware the field is offset by 30000, unsigned, or two's
/// complement, all in 0.1 A units. Every plausible interpretation (at most
/// 500 A) is collected and the one closest to zero wins.
pub fn decode_current_smart(raw: u16, sign: CurrentSign) -> f64 {
    if raw == 0x0000 || raw == 0xffff {
        return 0.0;
    }

    let offset = (raw as i32 - CURRENT_OFFSET) as f64 / 10.0;
    let direct = raw as f64 / 10.0;
    let signed = raw as i16 as f64 / 10.0;

    let mut candidates = Vec::with_capacity(6);
    if (20000..=40000).contains(&raw) {
        candidates.push(offset);
    }
    if raw <= 5000 {
        candidates.push(direct);
        candidates.push(signed);
    }
    candidates.extend([offset, direct, signed]);

    let best = candidates
        .into_iter()
        .filter(|c| c.is_finite() && c.abs() <= CURRENT_PLAUSIBLE_A)
        .fold(None, |best: Option<f64>, c| match best {
            Some(b) if b.abs() <= c.abs() => Some(b),
            _ => Some(c),
        });

    match best {
        Some(current) => sign.apply(round_dp(current, 2)),
        None => 0.0,
    }
}

/// Decodes a frame into a typed message, or `None` when the command is unknown
/// or the payload fails a plausibility check.
pub fn decode(frame: &Frame, sign: CurrentSign) -> Option<DecodedMessage> {
    let data = frame.payload.as_slice();
    let message = match frame.command {
        CMD_BASIC if data.len() >= 8 => {
            let capacity_raw = be16(data, 2) as f64;
            let current = decode_current_smart(be16(data, 4), sign);
            Some(DecodedMessage::Basic {
                voltage_v: round_dp(be16(data, 0) as f64 / 10.0, 2),
                current_a: Some(current).filter(|c| c.is_finite()),
                capacity_candidates: CapacityCandidates {
                    by0p01: capacity_raw / 100.0,
                    by0p1: capacity_raw / 10.0,
                },
                soc_pct: (be16(data, 6) as f64 / 10.0).clamp(0.0, 100.0),
            })
        }
        CMD_CELL_STATS if data.len() >= 8 => {
            let max_mv = be16(data, 0);
            let min_mv = be16(data, 3);
            let delta_mv = be16(data, 6);
            if plausible_cell_mv(max_mv)
                && plausible_cell_mv(min_mv)
                && delta_mv <= CELL_DELTA_MV_MAX
            {
                Some(DecodedMessage::CellStats {
                    max_mv,
                    max_index: data[2],
                    min_mv,
                    min_index: data[5],
                    delta_mv,
                })
            } else {
                log::trace!("implausible cell stats max={max_mv} min={min_mv} delta={delta_mv}");
                None
            }
        }
        CMD_STATUS if data.len() >= 4 => Some(DecodedMessage::Status {
            state: data[0],
            charge_mos: data[1],
            discharge_mos: data[2],
        }),
        CMD_COUNTS if data.len() >= 2 => {
            if (1..=MAX_CELLS).contains(&data[0]) {
                Some(DecodedMessage::Counts {
                    cell_count: data[0],
                    ntc_count: data[1],
                })
            } else {
                log::trace!("implausible cell count {}", data[0]);
                None
            }
        }
        CMD_TEMPERATURES | CMD_TEMPERATURES_ALT if data.len() >= 2 => {
            let temps_c = data[1..]
                .iter()
                .filter(|b| **b != 0x00 && **b != 0xff)
                .map(|b| *b as i16 - TEMPERATURE_OFFSET)
                .filter(|t| *t > -50 && *t < 120)
                .collect();
            Some(DecodedMessage::Temps {
                command: frame.command,
                temps_c,
            })
        }
        CMD_CELL_VOLTAGES if data.len() >= 3 => {
            let cells_mv = data[1..]
                .chunks_exact(2)
                .filter(|pair| !matches!(pair, [0x00, 0x00] | [0xff, 0xff]))
                .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
                .filter(|mv| plausible_cell_mv(*mv))
                .collect();
            Some(DecodedMessage::Cells {
                page: data[0],
                cells_mv,
            })
        }
        CMD_BALANCE_FLAGS if data.len() >= 6 => {
            let mask = data[..6]
                .iter()
                .enumerate()
                .fold(0u64, |mask, (i, byte)| mask | (u64::from(*byte) << (8 * i)));
            Some(DecodedMessage::BalanceFlags {
                mask: Some(mask),
                per_cell: None,
                reason: BalanceReason::Flags,
            })
        }
        _ => None,
    };
    if message.is_none() {
        log::trace!("no message for {frame}");
    }
    message
}
