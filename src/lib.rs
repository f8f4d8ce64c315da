//! Multi-device ISM330DHCX gyroscope logger
//!
//! Several ISM330DHCX sensors share one I2C bus, reached either through an
//! FT232H USB bridge (feature `ftdi`) or a native Linux I2C adapter. Each
//! device is brought up (reset, identity check, configuration) on the caller's
//! thread, then a background worker samples every device at a bounded rate and
//! appends `time,x,y,z` rows to `sensor<index>.csv`.
//!
//! # Quick Start
//! ```no_run
//! use gyro_sensor_interface::{GyroLogger, LoggerConfig};
//! use std::time::Duration;
//!
//! let config = LoggerConfig::default();
//! let mut logger = GyroLogger::from_config(&config)?;
//! for &address in &config.addresses {
//!     logger.register_device(address)?;
//! }
//! assert!(logger.health_check());
//!
//! logger.configure_recording(true, 300)?;
//! logger.start_session("data")?;
//! std::thread::sleep(Duration::from_secs(10));
//! if let Some(summary) = logger.stop_session()? {
//!     println!("{} samples", summary.total_samples());
//! }
//! # Ok::<(), gyro_sensor_interface::GyroError>(())
//! ```
//!
//! # Testing without hardware
//! ```
//! use gyro_sensor_interface::transport::mock::MockBus;
//! use gyro_sensor_interface::{BringUpConfig, GyroLogger, SamplingConfig, Transport};
//!
//! let bus = MockBus::new();
//! bus.add_sensor(0x6A, 0x6B);
//! let mut logger = GyroLogger::new(
//!     Transport::new(Box::new(bus)),
//!     BringUpConfig::immediate(),
//!     SamplingConfig::default(),
//! );
//! assert_eq!(logger.register_device(0x6A)?, 0);
//! assert!(logger.health_check());
//! # Ok::<(), gyro_sensor_interface::GyroError>(())
//! ```

pub mod clock;
pub mod config;
pub mod error;
#[cfg(feature = "ftdi")]
mod ffi;
pub mod ism330dhcx;
pub mod logger;
pub mod logging;
pub mod registry;
pub mod sampler;
pub mod sink;
pub mod transport;

// Re-export public API
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::LoggerConfig;
pub use error::{GyroError, Result};
pub use ism330dhcx::{GyroReading, Ism330dhcx, ISM330DHCX_ADDRESS_HIGH, ISM330DHCX_ADDRESS_LOW};
pub use logger::GyroLogger;
pub use registry::{BringUpConfig, DeviceRegistry};
pub use sampler::{SamplingConfig, SessionSummary};
pub use sink::{read_records, sink_path, SampleRecord};
pub use transport::{open_bus, BusConfig, Transport};
