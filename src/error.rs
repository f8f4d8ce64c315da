//! Error types for the gyro sensor interface

use thiserror::Error;

#[cfg(feature = "ftdi")]
use crate::ffi::{status_to_string, FT_STATUS, FT_OK};

/// Error type for bus, device and session operations
#[derive(Error, Debug)]
pub enum GyroError {
    /// FTDI driver error
    #[cfg(feature = "ftdi")]
    #[error("FTDI error: {status} ({description})")]
    FtdiError {
        status: FT_STATUS,
        description: String,
    },

    /// No I2C channels found on the USB bridge
    #[error("No I2C channels found")]
    NoChannelsFound,

    /// Invalid channel index
    #[error("Invalid channel index: {0}")]
    InvalidChannel(u32),

    /// Platform bus failure (device file, ioctl, NACK)
    #[error("Bus error: {0}")]
    Bus(String),

    /// Device communication error
    #[error("Device communication error: {0}")]
    CommunicationError(String),

    /// Operation attempted on a closed transport
    #[error("Transport is not open")]
    NotOpen,

    /// The configured binding is not compiled into this build
    #[error("Bus binding '{0}' is not available in this build")]
    UnsupportedBus(&'static str),

    /// Invalid WHO_AM_I response
    #[error("Invalid WHO_AM_I response at 0x{address:02X}: expected 0x6B, got 0x{found:02X}")]
    InvalidDeviceId { address: u8, found: u8 },

    /// A bring-up step failed for one device
    #[error("Bring-up of device 0x{address:02X} failed during {stage}: {source}")]
    BringUp {
        address: u8,
        stage: &'static str,
        #[source]
        source: Box<GyroError>,
    },

    /// Data transfer error
    #[error("Data transfer error: expected {expected} bytes, transferred {actual}")]
    TransferError { expected: usize, actual: usize },

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Operation needs exclusive bus access but a sampling session is running
    #[error("A sampling session is active")]
    SessionActive,

    /// The sampling worker panicked; the device registry is lost
    #[error("Sampling worker panicked")]
    WorkerPanicked,

    /// The registry did not come back from a failed or panicked session
    #[error("Device registry is no longer available")]
    RegistryLost,

    /// Sink file I/O
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration file could not be parsed
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),
}

impl GyroError {
    /// Wrap an error as a failed bring-up stage for `address`
    pub(crate) fn bring_up(address: u8, stage: &'static str, source: GyroError) -> Self {
        GyroError::BringUp {
            address,
            stage,
            source: Box::new(source),
        }
    }
}

#[cfg(feature = "ftdi")]
impl From<FT_STATUS> for GyroError {
    fn from(status: FT_STATUS) -> Self {
        debug_assert_ne!(status, FT_OK, "FT_OK is not an error");
        GyroError::FtdiError {
            status,
            description: status_to_string(status).to_string(),
        }
    }
}

/// Result type for gyro sensor operations
pub type Result<T> = std::result::Result<T, GyroError>;
