//! Command-line tool for Nextion-class HMI displays: list ports, monitor a
//! live display, or reflash it from an HTTP-served TFT image.

use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use hmilink_core::prelude::*;

#[derive(Parser)]
#[command(name = "hmilink", about = "Serial driver for Nextion-class HMI displays")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List available serial ports
    Ports {
        /// Emit machine-readable JSON
        #[arg(long)]
        json: bool,
    },
    /// Connect to a display and print every event it reports
    Monitor {
        /// Serial port name, e.g. /dev/ttyUSB0
        port: String,
        /// Line speed
        #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
        baud: u32,
    },
    /// Flash a TFT firmware image served over HTTP
    Upload {
        /// Serial port name, e.g. /dev/ttyUSB0
        port: String,
        /// Image URL, e.g. http://host/display.tft
        url: String,
        /// Line speed
        #[arg(long, default_value_t = DEFAULT_BAUD_RATE)]
        baud: u32,
    },
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    match Cli::parse().command {
        Command::Ports { json } => ports(json),
        Command::Monitor { port, baud } => monitor(&port, baud),
        Command::Upload { port, url, baud } => upload(&port, &url, baud),
    }
}

fn ports(json: bool) -> anyhow::Result<()> {
    let ports = list_ports();
    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }
    if ports.is_empty() {
        println!("no serial ports found");
        return Ok(());
    }
    for port in ports {
        let product = port.product.as_deref().unwrap_or("-");
        let manufacturer = port.manufacturer.as_deref().unwrap_or("-");
        println!("{}\t{product}\t{manufacturer}", port.name);
    }
    Ok(())
}

fn connect(port: &str, baud: u32) -> anyhow::Result<Engine<SerialChannel>> {
    let channel = SerialChannel::open(port, Some(baud))
        .with_context(|| format!("opening serial port {port}"))?;
    let config = EngineConfig {
        baud_rate: baud,
        ..Default::default()
    };
    let mut engine = Engine::new(channel, config);
    engine.begin_setup().context("display setup handshake")?;
    Ok(engine)
}

fn monitor(port: &str, baud: u32) -> anyhow::Result<()> {
    let mut engine = connect(port, baud)?;
    if let Some(info) = engine.connect_info() {
        println!(
            "connected: model={} firmware={} serial={} flash={}",
            info.device_model, info.firmware_version, info.serial_number, info.flash_size
        );
    } else {
        println!("connected (no identity banner)");
    }

    engine.add_touch_callback(Box::new(|page, component, pressed| {
        let action = if pressed { "press" } else { "release" };
        println!("touch: page={page} component={component} {action}");
    }));
    engine.add_sleep_callback(Box::new(|_| println!("display went to sleep")));
    engine.add_wake_callback(Box::new(|_| println!("display woke up")));
    engine.add_state_listener(Box::new(|key, value| {
        println!("state: component #{} = {value:?}", key.index());
    }));

    loop {
        engine.poll().context("polling display")?;
        thread::sleep(Duration::from_millis(20));
    }
}

fn upload(port: &str, url: &str, baud: u32) -> anyhow::Result<()> {
    let mut engine = connect(port, baud)?;
    let mut client = HttpRangeClient::new();
    let total = engine
        .upload_tft(UploadConfig::new(url), &mut client)
        .context("firmware upload")?;
    println!("uploaded {total} bytes; the display is restarting");
    println!("reconnect after the display finishes flashing");
    Ok(())
}
