//! ISM330DHCX gyro logger
//!
//! Brings up every listed sensor and records gyro samples to
//! `<folder>/sensor<index>.csv` until Ctrl+C or the optional duration elapses.
//!
//! Usage:
//!   gyro-logger data 300 --addresses 0x6A,0x6B --duration 60

use clap::{Parser, ValueEnum};
use gyro_sensor_interface::logging::init_tracing;
use gyro_sensor_interface::sink::clear_directory;
use gyro_sensor_interface::{read_records, sink_path, BusConfig, GyroError, GyroLogger, LoggerConfig};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum BusArg {
    Linux,
    Ftdi,
    Mock,
}

#[derive(Parser, Debug)]
#[command(name = "gyro-logger")]
#[command(about = "Record ISM330DHCX gyro data to per-sensor CSV files", long_about = None)]
struct Args {
    /// Output folder (created if missing)
    folder: Option<PathBuf>,

    /// Target sample rate per sensor in Hz
    frequency: Option<u32>,

    /// TOML configuration file; command-line values override it
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bus binding
    #[arg(short, long, value_enum)]
    bus: Option<BusArg>,

    /// I2C device file for the linux binding
    #[arg(long)]
    device: Option<PathBuf>,

    /// FT232H channel index for the ftdi binding
    #[arg(long, default_value = "0")]
    channel: u32,

    /// Sensor addresses, comma separated (e.g. 0x6A,0x6B)
    #[arg(short, long, value_delimiter = ',', value_parser = parse_address)]
    addresses: Option<Vec<u8>>,

    /// Duration in seconds (optional, runs until Ctrl+C if omitted)
    #[arg(short, long)]
    duration: Option<u64>,

    /// Remove sensor CSV files left in the folder by an earlier run
    #[arg(long)]
    clear: bool,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn parse_address(s: &str) -> Result<u8, String> {
    let s = s.trim();
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse::<u8>(),
    };
    match parsed {
        Ok(address) if address <= 0x7F => Ok(address),
        Ok(address) => Err(format!("0x{:02X} is not a 7-bit I2C address", address)),
        Err(e) => Err(format!("invalid address '{}': {}", s, e)),
    }
}

/// Merge the config file (if any) with command-line overrides
fn resolve_config(args: &Args) -> Result<LoggerConfig, GyroError> {
    let mut config = match &args.config {
        Some(path) => LoggerConfig::load(path)?,
        None => LoggerConfig::default(),
    };

    if let Some(folder) = &args.folder {
        config.output_dir = folder.clone();
    }
    if let Some(frequency) = args.frequency {
        config.rate_hz = frequency;
    }
    if let Some(addresses) = &args.addresses {
        config.addresses = addresses.clone();
    }
    match args.bus {
        Some(BusArg::Linux) => {
            config.bus = match &args.device {
                Some(path) => BusConfig::Linux { path: path.clone() },
                None => BusConfig::default(),
            };
        }
        Some(BusArg::Ftdi) => {
            config.bus = BusConfig::Ftdi {
                channel: args.channel,
                clock_hz: 400_000,
            };
        }
        Some(BusArg::Mock) => {
            config.bus = BusConfig::Mock {
                identity: gyro_sensor_interface::ism330dhcx::WHO_AM_I_VALUE,
                data_ready: true,
            };
        }
        None => {
            if let (Some(path), BusConfig::Linux { .. }) = (&args.device, &config.bus) {
                config.bus = BusConfig::Linux { path: path.clone() };
            }
        }
    }

    config.validate()?;
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.json_logs, args.verbose);

    let config = resolve_config(&args)?;

    println!("ISM330DHCX Gyro Logger");
    println!("======================");
    println!("Bus: {}", config.bus.name());
    println!("Target rate: {} Hz", config.rate_hz);
    println!("Output folder: {}", config.output_dir.display());
    if let Some(duration) = args.duration {
        println!("Duration: {} seconds", duration);
    } else {
        println!("Duration: continuous (Ctrl+C to stop)");
    }
    println!();

    if config.output_dir.exists() {
        if args.clear {
            let removed = clear_directory(&config.output_dir)?;
            info!(removed, "Cleared previous sensor files");
        } else {
            warn!(
                dir = %config.output_dir.display(),
                "Output folder exists; data will be appended"
            );
        }
    }
    std::fs::create_dir_all(&config.output_dir)?;

    let mut logger = GyroLogger::from_config(&config)?;
    for &address in &config.addresses {
        if let Err(e) = logger.register_device(address) {
            eprintln!("Failed to initialize ISM330DHCX at 0x{:02X}: {}", address, e);
        }
    }

    if !logger.health_check() {
        eprintln!("Error: ISM330DHCX devices are not healthy.");
        eprintln!("Please check:");
        eprintln!("  1. The sensors are wired to the selected I2C bus");
        eprintln!("  2. The SDO/SA0 pins match the requested addresses");
        eprintln!("  3. No other process is using the bus");
        return Err(Box::new(GyroError::CommunicationError(
            "no healthy devices".to_string(),
        )));
    }
    println!("{} device(s) ready: {:02X?}\n", logger.device_count(), logger.addresses());

    // Setup Ctrl+C handler
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        println!("\nReceived Ctrl+C, stopping collection...");
        r.store(false, Ordering::SeqCst);
    })?;

    let end_time = args.duration.map(|d| Instant::now() + Duration::from_secs(d));

    logger.configure_recording(true, config.rate_hz)?;
    logger.start_session(&config.output_dir)?;
    println!("Recording... Press Ctrl+C to stop\n");

    while running.load(Ordering::SeqCst) {
        if end_time.map_or(false, |end| Instant::now() >= end) {
            break;
        }
        thread::sleep(Duration::from_millis(100));
    }

    logger.configure_recording(false, config.rate_hz)?;
    let Some(summary) = logger.stop_session()? else {
        return Ok(());
    };

    println!("\nCollection complete!");
    println!("Elapsed time: {:.2} seconds", summary.elapsed.as_secs_f64());
    let rates = summary.rates_hz();
    for (index, (&address, &samples)) in summary
        .addresses
        .iter()
        .zip(&summary.samples_per_device)
        .enumerate()
    {
        let path = sink_path(&summary.output_dir, index);
        let rows = read_records(&path).map(|r| r.len()).unwrap_or(0);
        println!(
            "  sensor{} (0x{:02X}): {} samples, {:.1} Hz, {} rows in {}",
            index,
            address,
            samples,
            rates[index],
            rows,
            path.display()
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_address() {
        assert_eq!(parse_address("0x6A"), Ok(0x6A));
        assert_eq!(parse_address("0X6b"), Ok(0x6B));
        assert_eq!(parse_address("107"), Ok(0x6B));
        assert!(parse_address("0x80").is_err());
        assert!(parse_address("zz").is_err());
    }

    #[test]
    fn test_cli_overrides_defaults() {
        let args = Args::parse_from([
            "gyro-logger",
            "run1",
            "150",
            "--bus",
            "mock",
            "--addresses",
            "0x6B",
        ]);
        let config = resolve_config(&args).unwrap();
        assert_eq!(config.output_dir, PathBuf::from("run1"));
        assert_eq!(config.rate_hz, 150);
        assert_eq!(config.addresses, vec![0x6B]);
        assert_eq!(config.bus.name(), "mock");
    }

    #[test]
    fn test_zero_frequency_rejected() {
        let args = Args::parse_from(["gyro-logger", "run1", "0"]);
        assert!(resolve_config(&args).is_err());
    }
}
