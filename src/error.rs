use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cannot load config file {path:?}: {source}")]
    Config {
        path: PathBuf,
        source: serde_yaml::Error,
    },
    #[error("no device matching {0}")]
    DeviceNotFound(String),
    #[error("connect timed out after {0:?}")]
    ConnectTimeout(Duration),
    #[error("link is disconnected")]
    Disconnected,
    #[error("timeout elapsed: {0}")]
    Timeout(#[from] tokio::time::error::Elapsed),
    #[cfg(feature = "tokio-serial-async")]
    #[error("serial port error: {0}")]
    Serial(#[from] tokio_serial::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
