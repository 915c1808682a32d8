//! Boundary to the byte-stream transport.
//!
//! A transport finds a device and opens a [`Link`]. Incoming bytes arrive on
//! the link's channel; the channel closing means the device disconnected.

use crate::Error;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Selects the device to connect to. Empty strings are treated as absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectFilter {
    pub address: Option<String>,
    pub name_part: Option<String>,
}

impl ConnectFilter {
    pub fn new(address: Option<String>, name_part: Option<String>) -> Self {
        let normalize = |value: Option<String>| {
            value
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            address: normalize(address),
            name_part: normalize(name_part),
        }
    }

    /// Case-insensitive match on address equality or name containment.
    pub fn matches(&self, address: &str, name: &str) -> bool {
        if let Some(wanted) = &self.address {
            if address.eq_ignore_ascii_case(wanted) {
                return true;
            }
        }
        if let Some(part) = &self.name_part {
            if name.to_lowercase().contains(&part.to_lowercase()) {
                return true;
            }
        }
        false
    }
}

impl std::fmt::Display for ConnectFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "address={} name={}",
            self.address.as_deref().unwrap_or("*"),
            self.name_part.as_deref().unwrap_or("*")
        )
    }
}

/// Connection metadata, fixed for the lifetime of a link.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub address: String,
    pub id: String,
    pub name: String,
    /// Kind of UART bridge the link runs over.
    pub flavor: String,
}

#[async_trait]
pub trait LinkWriter: Send {
    async fn write(&mut self, bytes: &[u8]) -> Result<(), Error>;

    /// Closes the link. Calling it on a closed link is not an error.
    async fn disconnect(&mut self) -> Result<(), Error>;
}

/// An open connection to one device.
pub struct Link {
    pub device: DeviceInfo,
    pub incoming: mpsc::Receiver<Vec<u8>>,
    pub writer: Box<dyn LinkWriter>,
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link").field("device", &self.device).finish()
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Finds a device matching `filter` and opens a link to it.
    async fn connect(&self, filter: &ConnectFilter) -> Result<Link, Error>;
}
