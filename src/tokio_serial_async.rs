//! Serial transport for a Daly BMS wired to a USB UART adapter, using Tokio
//! and the `tokio-serial` crate.
//!
//! # Example
//!
//! ```no_run
//! use dalybms_monitor::tokio_serial_async::SerialTransport;
//! use dalybms_monitor::transport::{ConnectFilter, Transport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), dalybms_monitor::Error> {
//!     let transport = SerialTransport::default();
//!     let filter = ConnectFilter::new(Some("/dev/ttyUSB0".into()), None);
//!     let mut link = transport.connect(&filter).await?;
//!     link.writer
//!         .write(&dalybms_monitor::protocol::build_request(0x90))
//!         .await?;
//!     if let Some(bytes) = link.incoming.recv().await {
//!         println!("{bytes:02X?}");
//!     }
//!     Ok(())
//! }
//! ```

use crate::transport::{ConnectFilter, DeviceInfo, Link, LinkWriter, Transport};
use crate::{Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_serial::{SerialPortBuilderExt, SerialPortType, SerialStream};

const BAUD_RATE: u32 = 9600;
const READ_CHUNK: usize = 256;
const CHANNEL_DEPTH: usize = 64;
const WRITE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Default)]
pub struct SerialTransport;

impl SerialTransport {
    fn find_port(filter: &ConnectFilter) -> Result<DeviceInfo> {
        let ports = tokio_serial::available_ports()?;
        log::trace!("available ports: {ports:?}");
        for port in ports {
            let (id, name) = match &port.port_type {
                SerialPortType::UsbPort(usb) => (
                    usb.serial_number
                        .clone()
                        .unwrap_or_else(|| format!("{:04x}:{:04x}", usb.vid, usb.pid)),
                    usb.product.clone().unwrap_or_else(|| port.port_name.clone()),
                ),
                _ => (port.port_name.clone(), port.port_name.clone()),
            };
            let names = format!("{} {}", port.port_name, name);
            if filter.matches(&port.port_name, &names) {
                return Ok(DeviceInfo {
                    address: port.port_name,
                    id,
                    name,
                    flavor: "serial".into(),
                });
            }
        }
        // Not every device node shows up in the listing, e.g. ptys.
        match &filter.address {
            Some(address) => Ok(DeviceInfo {
                address: address.clone(),
                id: address.clone(),
                name: address.clone(),
                flavor: "serial".into(),
            }),
            None => Err(Error::DeviceNotFound(filter.to_string())),
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    async fn connect(&self, filter: &ConnectFilter) -> Result<Link> {
        let device = Self::find_port(filter)?;
        log::debug!("open {} at {BAUD_RATE} baud", device.address);
        let serial = tokio_serial::new(&device.address, BAUD_RATE)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()?;

        let (reader, writer) = tokio::io::split(serial);
        let (tx, incoming) = mpsc::channel(CHANNEL_DEPTH);
        let reader = tokio::spawn(read_loop(reader, tx));

        Ok(Link {
            device,
            incoming,
            writer: Box::new(SerialWriter { writer, reader }),
        })
    }
}

async fn read_loop(mut reader: ReadHalf<SerialStream>, tx: mpsc::Sender<Vec<u8>>) {
    let mut buf = [0u8; READ_CHUNK];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => {
                log::debug!("serial port closed");
                break;
            }
            Ok(n) => {
                log::trace!("receive bytes: {:02X?}", &buf[..n]);
                if tx.send(buf[..n].to_vec()).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                log::warn!("serial read failed: {err}");
                break;
            }
        }
    }
}

struct SerialWriter {
    writer: WriteHalf<SerialStream>,
    reader: JoinHandle<()>,
}

#[async_trait]
impl LinkWriter for SerialWriter {
    async fn write(&mut self, tx_buffer: &[u8]) -> Result<()> {
        if self.reader.is_finished() {
            return Err(Error::Disconnected);
        }
        log::trace!("write bytes: {tx_buffer:02X?}");
        tokio::time::timeout(WRITE_TIMEOUT, self.writer.write_all(tx_buffer)).await??;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        // Stopping the reader drops the sender, which closes the link.
        self.reader.abort();
        Ok(())
    }
}

impl Drop for SerialWriter {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
