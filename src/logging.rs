use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence; otherwise `verbosity` picks the crate's level
/// (0 = info, 1 = debug, 2+ = trace). Calling it twice is harmless.
pub fn init_tracing(json_output: bool, verbosity: u8) {
    let level = match verbosity {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("warn,gyro_sensor_interface={level},gyro_logger={level},gyro_server={level}")));

    let result = if json_output {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .try_init()
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(false))
            .try_init()
    };

    if let Err(e) = result {
        eprintln!("tracing already initialised: {}", e);
    }
}
