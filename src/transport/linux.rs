//! Native I2C binding over a Linux `/dev/i2c-N` device file

use super::{BusDriver, BusKind};
use crate::error::{GyroError, Result};
use i2cdev::core::I2CDevice;
use i2cdev::linux::{LinuxI2CDevice, LinuxI2CError};
use std::path::PathBuf;

pub struct LinuxI2cBus {
    path: PathBuf,
    device: Option<LinuxI2CDevice>,
    slave: u16,
}

fn bus_error(address: u8, e: LinuxI2CError) -> GyroError {
    GyroError::Bus(format!("0x{:02X}: {}", address, e))
}

impl LinuxI2cBus {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            device: None,
            slave: 0,
        }
    }

    /// Point the device file at `address` (I2C_SLAVE ioctl) when it changed
    fn select(&mut self, address: u8) -> Result<&mut LinuxI2CDevice> {
        let device = self.device.as_mut().ok_or(GyroError::NotOpen)?;
        if self.slave != u16::from(address) {
            device
                .set_slave_address(u16::from(address))
                .map_err(|e| bus_error(address, e))?;
            self.slave = u16::from(address);
        }
        Ok(device)
    }
}

impl BusDriver for LinuxI2cBus {
    fn kind(&self) -> BusKind {
        BusKind::Native
    }

    fn open(&mut self) -> Result<()> {
        if self.device.is_some() {
            return Ok(());
        }
        let device = LinuxI2CDevice::new(&self.path, 0).map_err(|e| {
            GyroError::Bus(format!("failed to open {}: {}", self.path.display(), e))
        })?;
        self.device = Some(device);
        self.slave = 0;
        Ok(())
    }

    fn close(&mut self) {
        // Dropping the device closes the file descriptor
        self.device = None;
    }

    fn is_open(&self) -> bool {
        self.device.is_some()
    }

    fn probe(&mut self, address: u8) -> Result<()> {
        self.select(address)?
            .smbus_write_quick(false)
            .map_err(|e| bus_error(address, e))
    }

    fn write_register(&mut self, address: u8, reg: u8, value: u8) -> Result<()> {
        self.select(address)?
            .smbus_write_byte_data(reg, value)
            .map_err(|e| bus_error(address, e))
    }

    fn read_register(&mut self, address: u8, reg: u8) -> Result<u8> {
        self.select(address)?
            .smbus_read_byte_data(reg)
            .map_err(|e| bus_error(address, e))
    }

    /// One register-pointer write followed by a single block read; the sensor
    /// auto-increments the register address itself
    fn read_block(&mut self, address: u8, start: u8, buf: &mut [u8]) -> Result<usize> {
        let device = self.select(address)?;
        device.write(&[start]).map_err(|e| bus_error(address, e))?;
        device.read(buf).map_err(|e| bus_error(address, e))?;
        Ok(buf.len())
    }
}
