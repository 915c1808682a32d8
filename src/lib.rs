#![cfg_attr(docsrs, feature(doc_cfg))]
//! # dalybms_monitor
//!
//! Telemetry monitor for Daly Smart BMS devices speaking the UART protocol.
//!
//! Bytes from a transport are cut into checksummed frames ([`framer`]),
//! decoded into typed messages ([`decoder`]) and folded into one device
//! [`state::Snapshot`]. Cell balancing is taken from the device flags when
//! available and otherwise inferred from voltage trends ([`balancing`]).
//! The [`supervisor`] owns the connection: it polls the device, watches for
//! silence and reconnects with exponential backoff, publishing everything on
//! an [`events::EventBus`].
//!
//! ## Features
//!
//! - `default`: Enables `bin-dependencies`, used to build the `dalybms-monitor` tool.
//! - `tokio-serial-async`: Enables the serial transport using `tokio-serial`.
//! - `bin-dependencies`: Everything the binary needs (serial transport, CLI, logging, MQTT).

mod error;

pub mod balancing;
pub mod config;
pub mod decoder;
pub mod events;
pub mod framer;
/// Frame layout, command codes and request building.
pub mod protocol;
pub mod session;
pub mod state;
pub mod supervisor;
pub mod transport;

pub use config::Config;
pub use error::{Error, Result};

/// Serial transport for a BMS on a UART adapter.
#[cfg_attr(docsrs, doc(cfg(feature = "tokio-serial-async")))]
#[cfg(feature = "tokio-serial-async")]
pub mod tokio_serial_async;
