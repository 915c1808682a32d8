use crate::mqtt;
use clap::{Parser, Subcommand};
use clap_verbosity_flag::{InfoLevel, Verbosity};
use dalybms_monitor::Config;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum CliCommands {
    /// Run in daemon mode, supervising the BMS link and forwarding telemetry
    Daemon {
        /// Output destination for events and samples
        #[command(subcommand)]
        output: DaemonOutput,
    },
    /// Decode captured bytes offline and print messages and the resulting snapshot
    Decode {
        /// Hex encoded bytes (whitespace, ':' and '-' separators are ignored)
        hex: Vec<String>,
    },
}

#[derive(clap::ValueEnum, Debug, Clone, PartialEq)]
pub enum MqttFormat {
    Simple,
    Json,
}

#[derive(Subcommand, Debug, Clone, PartialEq)]
pub enum DaemonOutput {
    /// Print events to the standard output as JSON lines.
    Console {
        /// Print every event, including polling and decoded messages
        #[arg(long)]
        all_events: bool,
    },
    /// Publish events and periodic snapshot samples to an MQTT broker.
    Mqtt {
        /// The configuration file for the MQTT broker
        #[arg(long, default_value_t = mqtt::MqttConfig::DEFAULT_CONFIG_FILE.to_string())]
        config_file: String,
        /// Output format for MQTT messages
        #[arg(long, value_enum, default_value_t = MqttFormat::Simple)]
        format: MqttFormat,
    },
}

const fn about_text() -> &'static str {
    "daly bms telemetry monitor"
}

#[derive(Parser, Debug)]
#[command(version, about=about_text(), long_about = None)]
pub struct CliArgs {
    #[command(flatten)]
    pub verbose: Verbosity<InfoLevel>,

    /// YAML configuration file; command line options take precedence
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Serial port device path (e.g., /dev/ttyUSB0 on Linux, COM1 on Windows)
    #[arg(short, long)]
    pub device: Option<String>,

    /// Part of the device name to look for when no device path is given
    #[arg(short, long)]
    pub name: Option<String>,

    #[command(subcommand)]
    pub command: CliCommands,

    /// Interval between poll cycles (e.g., "6s", "1m")
    #[arg(value_parser = humantime::parse_duration, long)]
    pub poll_interval: Option<Duration>,

    /// Silence after which the link is dropped and re-established (e.g., "15s")
    #[arg(value_parser = humantime::parse_duration, long)]
    pub rx_timeout: Option<Duration>,

    /// Time allowed for opening the link (e.g., "15s")
    #[arg(value_parser = humantime::parse_duration, long)]
    pub connect_timeout: Option<Duration>,

    /// Rated pack capacity in Ah, instead of reading it from the BMS
    #[arg(long)]
    pub rated_ah: Option<f64>,

    /// Invert the sign of the reported current
    #[arg(long)]
    pub invert_current: bool,
}

impl CliArgs {
    /// Applies command line overrides on top of `config`.
    pub fn apply(&self, config: &mut Config) {
        if let Some(device) = &self.device {
            config.address = Some(device.clone());
        }
        if let Some(name) = &self.name {
            config.name = Some(name.clone());
        }
        if let Some(interval) = self.poll_interval {
            config.poll_interval = interval;
        }
        if let Some(timeout) = self.rx_timeout {
            config.rx_timeout = timeout;
        }
        if let Some(timeout) = self.connect_timeout {
            config.connect_timeout = timeout;
        }
        if let Some(rated) = self.rated_ah {
            config.rated_capacity_ah = Some(rated);
        }
        if self.invert_current {
            config.current_sign = dalybms_monitor::decoder::CurrentSign::Invert;
        }
    }
}
