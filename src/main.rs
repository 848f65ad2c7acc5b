use std::io::{BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, ValueEnum};
use tracing::{error, info};

use leo_link::config::ClientConfig;
use leo_link::device::Device;
use leo_link::transport::{Transport, TransportManager};
use leo_link::transport_btleplug::BleManager;
use leo_link::transport_serial::SerialManager;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum ScanKind {
    Bluetooth,
    Serial,
}

/// Talk to a Leo over Bluetooth or its USB serial bridge
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(group(ArgGroup::new("target").required(true).args(["bluetooth", "serial", "scan"])))]
struct Args {
    /// Connect to a Bluetooth device (e.g. EVNCLM8KZ)
    #[arg(long)]
    bluetooth: Option<String>,

    /// Connect to a serial device (e.g. /dev/ttyUSB0)
    #[arg(long)]
    serial: Option<String>,

    /// Scan for available devices
    #[arg(long, value_enum, ignore_case = true)]
    scan: Option<ScanKind>,

    /// Firmware image for an OTA update
    #[arg(long, conflicts_with = "update")]
    ota: Option<PathBuf>,

    /// Script to upload with py_ldx
    #[arg(long)]
    update: Option<PathBuf>,

    /// TOML file overriding the client defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::builder()
                .with_default_directive(if args.verbose {
                    tracing::Level::DEBUG.into()
                } else {
                    tracing::Level::INFO.into()
                })
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("setting default subscriber failed")?;

    let config = match &args.config {
        Some(path) => ClientConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ClientConfig::default(),
    };

    if let Some(kind) = args.scan {
        return scan(kind, config);
    }

    if let Some(id) = &args.bluetooth {
        let mut manager = BleManager::new(config.clone()).context("Failed to start Bluetooth")?;
        let connection = manager.connect(id)?;
        run(Device::new(connection, config.command_timeout()), &args)
    } else if let Some(port) = &args.serial {
        let mut manager = SerialManager::new(config.clone());
        let connection = manager
            .connect(port)
            .with_context(|| format!("Failed to open {}", port))?;
        run(Device::new(connection, config.command_timeout()), &args)
    } else {
        Ok(())
    }
}

fn scan(kind: ScanKind, config: ClientConfig) -> Result<()> {
    let found = match kind {
        ScanKind::Bluetooth => BleManager::new(config)?.discover()?,
        ScanKind::Serial => SerialManager::new(config).discover()?,
    };
    if found.is_empty() {
        println!("❌ No {:?} devices found.", kind);
        return Ok(());
    }
    println!();
    match kind {
        ScanKind::Bluetooth => println!("📡 Available Bluetooth devices:"),
        ScanKind::Serial => println!("🔌 Available Serial devices:"),
    }
    for candidate in found {
        println!("  🔹 '{}' ({})", candidate.name, candidate.address);
    }
    Ok(())
}

fn run<T: Transport>(mut device: Device<T>, args: &Args) -> Result<()> {
    if let Some(image) = &args.ota {
        if !device.ota(image) {
            error!("OTA update with {} failed", image.display());
        }
    } else if let Some(script) = &args.update {
        if !device.py_ldx(script) {
            error!("Upload of {} failed", script.display());
        }
    } else {
        interactive_session(&device)?;
    }
    device.disconnect();
    Ok(())
}

/// Read commands from stdin until `exit`, EOF or the link drops
fn interactive_session<T: Transport>(device: &Device<T>) -> Result<()> {
    let stdin = std::io::stdin();
    let mut lines = stdin.lock().lines();
    while device.is_connected() {
        print!("> ");
        std::io::stdout().flush()?;
        let Some(line) = lines.next() else {
            break;
        };
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line.eq_ignore_ascii_case("exit") {
            break;
        }
        if let Some(reply) = device.invoke_line(line) {
            println!("{}", reply);
        }
    }
    info!("Leaving interactive session");
    Ok(())
}
