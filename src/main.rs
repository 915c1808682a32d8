use anyhow::{bail, Context, Result};
use clap::Parser;
use dalybms_monitor::session::Session;
use dalybms_monitor::supervisor::ConnectionSupervisor;
use dalybms_monitor::tokio_serial_async::SerialTransport;
use dalybms_monitor::Config;
use flexi_logger::{Logger, LoggerHandle};
use log::*;
use std::{ops::Deref, panic, sync::Arc};

mod commandline;
mod daemon;
mod mqtt;

use commandline::{CliArgs, CliCommands};

fn logging_init(loglevel: LevelFilter) -> LoggerHandle {
    let log_handle = Logger::try_with_env_or_str(loglevel.as_str())
        .expect("Cannot init logging")
        .start()
        .expect("Cannot start logging");

    panic::set_hook(Box::new(|panic_info| {
        let (filename, line, column) = panic_info
            .location()
            .map(|loc| (loc.file(), loc.line(), loc.column()))
            .unwrap_or(("<unknown>", 0, 0));
        let cause = panic_info
            .payload()
            .downcast_ref::<String>()
            .map(String::deref);
        let cause = cause.unwrap_or_else(|| {
            panic_info
                .payload()
                .downcast_ref::<&str>()
                .copied()
                .unwrap_or("<cause unknown>")
        });

        error!(
            "Thread '{}' panicked at {}:{}:{}: {}",
            std::thread::current().name().unwrap_or("<unknown>"),
            filename,
            line,
            column,
            cause
        );
    }));
    log_handle
}

/// Parses hex words, ignoring whitespace and ':' or '-' separators.
fn parse_hex(words: &[String]) -> Result<Vec<u8>> {
    let digits: String = words
        .iter()
        .flat_map(|word| word.chars())
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != '-')
        .collect();
    if !digits.is_ascii() {
        bail!("Input is not hex");
    }
    if digits.len() % 2 != 0 {
        bail!("Odd number of hex digits in input");
    }
    (0..digits.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&digits[i..i + 2], 16)
                .with_context(|| format!("Invalid hex byte '{}'", &digits[i..i + 2]))
        })
        .collect()
}

fn decode(config: &Config, words: &[String]) -> Result<()> {
    let bytes = parse_hex(words)?;
    info!("Decoding {} bytes", bytes.len());
    let mut session = Session::new(config);
    for message in session.ingest(&bytes) {
        println!(
            "{}",
            serde_json::to_string(&message).context("Cannot serialize message")?
        );
    }
    println!(
        "{}",
        serde_json::to_string_pretty(&session.snapshot()).context("Cannot serialize snapshot")?
    );
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let _log_handle = logging_init(args.verbose.log_level_filter());

    let mut config = match &args.config {
        Some(path) => {
            Config::load(path).with_context(|| format!("Cannot load config file {path:?}"))?
        }
        None => Config::default(),
    };
    args.apply(&mut config);
    debug!("Effective config: {config:?}");

    match &args.command {
        CliCommands::Decode { hex } => decode(&config, hex),
        CliCommands::Daemon { output } => {
            let transport = Arc::new(SerialTransport::default());
            let sample_interval = config.sample_interval;
            let handle = ConnectionSupervisor::spawn(transport, config);
            let result = tokio::select! {
                result = daemon::run(&handle, output.clone(), sample_interval) => result,
                signal = tokio::signal::ctrl_c() => {
                    info!("Received Ctrl-C, stopping");
                    signal.context("Cannot listen for Ctrl-C")
                }
            };
            handle.shutdown().await;
            result
        }
    }
}
