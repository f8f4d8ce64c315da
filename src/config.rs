//! Logger configuration file
//!
//! ```toml
//! addresses = [0x6A, 0x6B]
//! rate_hz = 300
//! output_dir = "data"
//!
//! [bus]
//! kind = "linux"
//! path = "/dev/i2c-16"
//!
//! [bring_up]
//! data_rate = "hz3332"
//! full_scale = "dps250"
//!
//! [sampling]
//! max_missed_polls = 32
//! ```

use crate::error::{GyroError, Result};
use crate::ism330dhcx::{ISM330DHCX_ADDRESS_HIGH, ISM330DHCX_ADDRESS_LOW};
use crate::registry::BringUpConfig;
use crate::sampler::{SamplingConfig, DEFAULT_RATE_HZ};
use crate::transport::BusConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct LoggerConfig {
    pub bus: BusConfig,
    /// Devices to register, in logging-index order
    pub addresses: Vec<u8>,
    pub rate_hz: u32,
    pub output_dir: PathBuf,
    pub bring_up: BringUpConfig,
    pub sampling: SamplingConfig,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            bus: BusConfig::default(),
            addresses: vec![ISM330DHCX_ADDRESS_LOW, ISM330DHCX_ADDRESS_HIGH],
            rate_hz: DEFAULT_RATE_HZ,
            output_dir: PathBuf::from("data"),
            bring_up: BringUpConfig::default(),
            sampling: SamplingConfig::default(),
        }
    }
}

impl LoggerConfig {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.rate_hz == 0 {
            return Err(GyroError::InvalidParameter("rate_hz must be at least 1".to_string()));
        }
        if let Some(address) = self.addresses.iter().find(|&&a| a > 0x7F) {
            return Err(GyroError::InvalidParameter(format!(
                "0x{:02X} is not a 7-bit I2C address",
                address
            )));
        }
        Ok(())
    }
}
