//! Gyro recording server
//!
//! Listens for JSON commands from an acquisition controller:
//!
//! ```text
//! {"command": "setup", "folder": "trial_01", "duration": 5.0}  -> {"status":"ready"}
//! {"command": "start"}                                         -> {"status":"Recording started"}
//! ```
//!
//! `start` records into the folder from the last `setup` for the requested
//! duration, then stops. Sensors are brought up again whenever a client connects
//! while the registry is unhealthy.
//!
//! Usage:
//!   gyro-server 300 --port 9999

use clap::Parser;
use gyro_sensor_interface::logging::init_tracing;
use gyro_sensor_interface::{GyroLogger, LoggerConfig};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::TcpListener;
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "gyro-server")]
#[command(about = "TCP-controlled ISM330DHCX gyro recorder", long_about = None)]
struct Args {
    /// Target sample rate per sensor in Hz
    frequency: u32,

    /// TCP port to listen on
    #[arg(short, long, default_value = "9999")]
    port: u16,

    /// TOML configuration file (bus, addresses, bring-up settings)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long)]
    json_logs: bool,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "command", rename_all = "snake_case")]
enum Command {
    Setup {
        folder: PathBuf,
        /// Seconds
        #[serde(default)]
        duration: f64,
    },
    Start,
}

#[derive(Debug, Serialize)]
struct Reply {
    status: String,
}

impl Reply {
    fn new(status: impl Into<String>) -> Self {
        Self {
            status: status.into(),
        }
    }
}

struct GyroServer {
    config: LoggerConfig,
    logger: Option<GyroLogger>,
    folder: Option<PathBuf>,
    duration: Duration,
}

impl GyroServer {
    fn new(config: LoggerConfig) -> Self {
        let mut server = Self {
            config,
            logger: None,
            folder: None,
            duration: Duration::ZERO,
        };
        server.setup_gyro();
        server
    }

    /// Rebuild the logger and register every configured address
    fn setup_gyro(&mut self) -> bool {
        // The old logger must release the bus before a new one opens it
        self.logger = None;

        let mut logger = match GyroLogger::from_config(&self.config) {
            Ok(logger) => logger,
            Err(e) => {
                error!(error = %e, bus = self.config.bus.name(), "failed to open bus");
                return false;
            }
        };
        for &address in &self.config.addresses {
            if let Err(e) = logger.register_device(address) {
                warn!(address = format_args!("0x{:02X}", address), error = %e, "device not added");
            }
        }

        let healthy = logger.health_check();
        if healthy {
            if let Err(e) = logger.configure_recording(true, self.config.rate_hz) {
                error!(error = %e, "failed to configure recording");
            }
        }
        self.logger = Some(logger);
        healthy
    }

    fn is_healthy(&mut self) -> bool {
        self.logger.as_mut().map_or(false, GyroLogger::health_check)
    }

    fn serve(&mut self, listener: TcpListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "Server listening");
        for stream in listener.incoming() {
            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    thread::sleep(Duration::from_millis(500));
                    continue;
                }
            };
            let peer = stream.peer_addr().ok();
            info!(?peer, "Client connected");

            if !self.is_healthy() {
                info!("Devices unhealthy; resetting connection");
                self.setup_gyro();
            }

            let writer = match stream.try_clone() {
                Ok(writer) => writer,
                Err(e) => {
                    warn!(error = %e, "failed to clone client stream");
                    continue;
                }
            };
            if let Err(e) = self.handle_client(stream, writer) {
                warn!(error = %e, "client session ended with error");
            }
            info!(?peer, "Client disconnected");
        }
        Ok(())
    }

    /// Process JSON commands from `reader` until the peer closes the connection
    fn handle_client<R: Read, W: Write>(&mut self, reader: R, mut writer: W) -> std::io::Result<()> {
        let values = serde_json::Deserializer::from_reader(reader).into_iter::<serde_json::Value>();
        for value in values {
            let value = match value {
                Ok(value) => value,
                Err(e) if e.is_eof() || e.is_io() => break,
                Err(e) => {
                    send(&mut writer, &Reply::new(format!("error: {}", e)))?;
                    break;
                }
            };

            match serde_json::from_value::<Command>(value) {
                Ok(command) => self.handle_command(command, &mut writer)?,
                Err(e) => {
                    warn!(error = %e, "unrecognised command");
                    send(&mut writer, &Reply::new(format!("error: {}", e)))?;
                }
            }
        }
        Ok(())
    }

    fn handle_command<W: Write>(&mut self, command: Command, writer: &mut W) -> std::io::Result<()> {
        match command {
            Command::Setup { folder, duration } => {
                info!(folder = %folder.display(), duration, "Received SETUP command");
                self.folder = Some(folder);
                self.duration = Duration::try_from_secs_f64(duration).unwrap_or(Duration::ZERO);
                send(writer, &Reply::new("ready"))
            }
            Command::Start => {
                info!("Received START command");
                send(writer, &Reply::new("Recording started"))?;
                self.record();
                Ok(())
            }
        }
    }

    /// Record into the configured folder for the configured duration
    fn record(&mut self) {
        let (Some(logger), Some(folder)) = (self.logger.as_mut(), self.folder.as_ref()) else {
            warn!("Cannot start recording: gyro not initialized or folder not set");
            return;
        };

        let started = Instant::now();
        if let Err(e) = logger.start_session(folder) {
            error!(error = %e, "failed to start recording");
            return;
        }
        thread::sleep(self.duration);
        match logger.stop_session() {
            Ok(Some(summary)) => info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                samples = ?summary.samples_per_device,
                "Recording stopped"
            ),
            Ok(None) => {}
            Err(e) => error!(error = %e, "failed to stop recording"),
        }
    }
}

fn send<W: Write>(writer: &mut W, reply: &Reply) -> std::io::Result<()> {
    serde_json::to_writer(&mut *writer, reply)?;
    writer.write_all(b"\n")?;
    writer.flush()
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    init_tracing(args.json_logs, args.verbose);

    let mut config = match &args.config {
        Some(path) => LoggerConfig::load(path)?,
        None => LoggerConfig::default(),
    };
    config.rate_hz = args.frequency;
    config.validate()?;

    info!(rate_hz = config.rate_hz, bus = config.bus.name(), "Starting server");
    let mut server = GyroServer::new(config);
    let listener = TcpListener::bind(("0.0.0.0", args.port))?;
    server.serve(listener)?;
    Ok(())
}
