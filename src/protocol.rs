use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy)]
#[repr(u8)]
pub enum Address {
    Host = 0x40,
}

pub const START_BYTE: u8 = 0xa5;
/// Start, source, command and length bytes.
pub const HEADER_LENGTH: usize = 4;
/// Smallest buffer the framer will try to interpret: header plus checksum.
pub const MIN_FRAME_LENGTH: usize = HEADER_LENGTH + 1;

const REQUEST_DATA_LENGTH: usize = 0x08;

pub const CMD_BASIC: u8 = 0x90;
pub const CMD_CELL_STATS: u8 = 0x91;
pub const CMD_TEMPERATURES_ALT: u8 = 0x92;
pub const CMD_STATUS: u8 = 0x93;
pub const CMD_COUNTS: u8 = 0x94;
pub const CMD_CELL_VOLTAGES: u8 = 0x95;
pub const CMD_TEMPERATURES: u8 = 0x96;
pub const CMD_BALANCE_FLAGS: u8 = 0x97;

/// Wrapping byte sum used as the frame checksum.
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Rounds half away from zero to the given number of decimal places.
pub(crate) fn round_dp(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

/// One checksum-validated protocol frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub source: u8,
    pub command: u8,
    pub length: u8,
    pub payload: Vec<u8>,
}

impl Frame {
    pub fn new(source: u8, command: u8, payload: Vec<u8>) -> Self {
        Self {
            source,
            command,
            length: payload.len() as u8,
            payload,
        }
    }

    /// Encodes the frame including start byte and trailing checksum.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(MIN_FRAME_LENGTH + self.payload.len());
        buffer.push(START_BYTE);
        buffer.push(self.source);
        buffer.push(self.command);
        buffer.push(self.length);
        buffer.extend_from_slice(&self.payload);
        buffer.push(checksum(&buffer));
        buffer
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "src={:02X} cmd={:02X} len={} payload={:02X?}",
            self.source, self.command, self.length, self.payload
        )
    }
}

pub fn to_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Builds the 13 byte read request for `command`.
pub fn build_request(command: u8) -> Vec<u8> {
    Frame::new(Address::Host as u8, command, vec![0; REQUEST_DATA_LENGTH]).to_bytes()
}

/// Command used to query per-sensor temperatures. Firmware variants disagree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TemperatureCommand {
    #[default]
    #[serde(rename = "0x96", alias = "96")]
    Cmd96,
    #[serde(rename = "0x92", alias = "92")]
    Cmd92,
}

impl TemperatureCommand {
    pub fn command(self) -> u8 {
        match self {
            TemperatureCommand::Cmd96 => CMD_TEMPERATURES,
            TemperatureCommand::Cmd92 => CMD_TEMPERATURES_ALT,
        }
    }
}

/// Ordered list of requests sent on every poll cycle.
pub fn poll_set(temperature: TemperatureCommand, balance_flags: bool) -> Vec<Vec<u8>> {
    let mut commands = vec![
        CMD_BASIC,
        CMD_CELL_STATS,
        CMD_STATUS,
        CMD_COUNTS,
        temperature.command(),
        CMD_CELL_VOLTAGES,
    ];
    if balance_flags {
        commands.push(CMD_BALANCE_FLAGS);
    }
    commands.into_iter().map(build_request).collect()
}
