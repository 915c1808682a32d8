use crate::balancing::BalancingConfig;
use crate::decoder::CurrentSign;
use crate::events::DEFAULT_CAPACITY;
use crate::protocol::TemperatureCommand;
use crate::transport::ConnectFilter;
use crate::Error;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Monitor settings.
///
/// Every field has a default, so a YAML file only lists what it changes:
///
/// ```yaml
/// address: /dev/ttyUSB0
/// poll_interval: 10s
/// rated_capacity_ah: 280
/// temperature_command: "0x92"
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Device address, e.g. a serial port path.
    pub address: Option<String>,
    /// Case-insensitive part of the device name.
    pub name: Option<String>,
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Silence after which the link is considered dead.
    #[serde(with = "humantime_serde")]
    pub rx_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// Pause after each request of a poll cycle.
    #[serde(with = "humantime_serde")]
    pub inter_frame_delay: Duration,
    pub rated_capacity_ah: Option<f64>,
    pub current_sign: CurrentSign,
    pub temperature_command: TemperatureCommand,
    /// Also poll the explicit balance flags (`0x97`).
    pub request_balance_flags: bool,
    #[serde(with = "humantime_serde")]
    pub sample_interval: Duration,
    pub event_capacity: usize,
    pub balancing: BalancingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            address: None,
            name: None,
            poll_interval: Duration::from_secs(6),
            rx_timeout: Duration::from_secs(15),
            connect_timeout: Duration::from_secs(15),
            inter_frame_delay: Duration::from_millis(120),
            rated_capacity_ah: None,
            current_sign: CurrentSign::Normal,
            temperature_command: TemperatureCommand::Cmd96,
            request_balance_flags: false,
            sample_interval: Duration::from_secs(15),
            event_capacity: DEFAULT_CAPACITY,
            balancing: BalancingConfig::default(),
        }
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        log::debug!("Loading config file from {path:?}");
        let file = std::fs::File::open(path)?;
        serde_yaml::from_reader(file).map_err(|source| Error::Config {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Watchdog tick: a third of the RX timeout, kept within 1..=5 seconds.
    pub fn watchdog_period(&self) -> Duration {
        (self.rx_timeout / 3).clamp(Duration::from_secs(1), Duration::from_secs(5))
    }

    pub fn connect_filter(&self) -> ConnectFilter {
        ConnectFilter::new(self.address.clone(), self.name.clone())
    }
}
