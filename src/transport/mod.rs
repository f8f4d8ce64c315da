//! Buffered write-then-read bus transport
//!
//! [`Transport`] keeps the request/response state every binding shares (target
//! address, pending write buffer, read queue, register cursor) and delegates the
//! actual bus cycles to a [`BusDriver`]. Bindings:
//!
//! * [`ftdi::FtdiBus`] - FT232H USB-to-I2C bridge via libMPSSE (feature `ftdi`)
//! * [`linux::LinuxI2cBus`] - native `/dev/i2c-N` device file (Linux)
//! * [`mock::MockBus`] - simulated ISM330DHCX sensors for tests and dry runs

#[cfg(feature = "ftdi")]
pub mod ftdi;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod mock;

use crate::error::{GyroError, Result};
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::PathBuf;
use tracing::{trace, warn};

/// Byte returned by [`Transport::read`] when the read queue is empty
pub const READ_SENTINEL: u8 = 0xFF;

/// Default device file for the native binding
pub const DEFAULT_I2C_PATH: &str = "/dev/i2c-16";

/// Physical nature of a bus binding
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusKind {
    /// Host-driven USB bridge; needs settle time after enumeration
    UsbBridge,
    /// Kernel bus driver
    Native,
    /// In-memory simulation
    Simulated,
}

/// Platform layer of a bus binding
///
/// Implementations report every failure as an error value; none of these
/// calls may panic on bus errors. A driver is owned by exactly one thread at a
/// time, hence `Send` but not `Sync`.
pub trait BusDriver: Send {
    fn kind(&self) -> BusKind;

    fn open(&mut self) -> Result<()>;

    /// Release the connection. Must be a no-op when already closed.
    fn close(&mut self);

    fn is_open(&self) -> bool;

    /// Zero-length write to `address`; succeeds if the device acknowledges
    fn probe(&mut self, address: u8) -> Result<()>;

    fn write_register(&mut self, address: u8, reg: u8, value: u8) -> Result<()>;

    fn read_register(&mut self, address: u8, reg: u8) -> Result<u8>;

    /// Read `buf.len()` consecutive registers starting at `start`
    ///
    /// The default issues one single-register read per byte and advances the
    /// register on the host, which is how a bridge without repeated-start
    /// block reads emulates the sensor's auto-increment.
    fn read_block(&mut self, address: u8, start: u8, buf: &mut [u8]) -> Result<usize> {
        let mut reg = start;
        for byte in buf.iter_mut() {
            *byte = self.read_register(address, reg)?;
            reg = reg.wrapping_add(1);
        }
        Ok(buf.len())
    }
}

/// Bus binding selection, as read from the configuration file
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BusConfig {
    /// FT232H channel driven through libMPSSE
    Ftdi {
        #[serde(default)]
        channel: u32,
        #[serde(default = "default_clock_hz")]
        clock_hz: u32,
    },
    /// Native I2C device file
    Linux {
        #[serde(default = "default_i2c_path")]
        path: PathBuf,
    },
    /// Simulated sensors at the standard addresses
    Mock {
        #[serde(default = "default_mock_identity")]
        identity: u8,
        #[serde(default = "default_true")]
        data_ready: bool,
    },
}

fn default_clock_hz() -> u32 {
    400_000
}

fn default_i2c_path() -> PathBuf {
    PathBuf::from(DEFAULT_I2C_PATH)
}

fn default_mock_identity() -> u8 {
    crate::ism330dhcx::WHO_AM_I_VALUE
}

fn default_true() -> bool {
    true
}

impl Default for BusConfig {
    fn default() -> Self {
        BusConfig::Linux {
            path: default_i2c_path(),
        }
    }
}

impl BusConfig {
    /// Short binding name used in logs and errors
    pub fn name(&self) -> &'static str {
        match self {
            BusConfig::Ftdi { .. } => "ftdi",
            BusConfig::Linux { .. } => "linux",
            BusConfig::Mock { .. } => "mock",
        }
    }
}

/// Build the driver selected by `config`. The driver is returned closed.
pub fn open_bus(config: &BusConfig) -> Result<Box<dyn BusDriver>> {
    match config {
        #[cfg(feature = "ftdi")]
        BusConfig::Ftdi { channel, clock_hz } => Ok(Box::new(ftdi::FtdiBus::new(*channel, *clock_hz))),
        #[cfg(target_os = "linux")]
        BusConfig::Linux { path } => Ok(Box::new(linux::LinuxI2cBus::new(path.clone()))),
        BusConfig::Mock { identity, data_ready } => {
            let bus = mock::MockBus::new();
            for address in [
                crate::ism330dhcx::ISM330DHCX_ADDRESS_LOW,
                crate::ism330dhcx::ISM330DHCX_ADDRESS_HIGH,
            ] {
                bus.add_sensor(address, *identity);
            }
            bus.set_data_ready(*data_ready);
            Ok(Box::new(bus))
        }
        #[allow(unreachable_patterns)]
        other => Err(GyroError::UnsupportedBus(other.name())),
    }
}

/// Request/response transport shared by all bindings
pub struct Transport {
    driver: Box<dyn BusDriver>,
    target: u8,
    tx: Vec<u8>,
    rx: VecDeque<u8>,
    cursor: u8,
}

impl Transport {
    /// Wrap a driver. The transport starts closed.
    pub fn new(driver: Box<dyn BusDriver>) -> Self {
        Self {
            driver,
            target: 0,
            tx: Vec::new(),
            rx: VecDeque::new(),
            cursor: 0,
        }
    }

    pub fn kind(&self) -> BusKind {
        self.driver.kind()
    }

    pub fn is_open(&self) -> bool {
        self.driver.is_open()
    }

    /// Acquire the bus connection and start from empty buffers
    pub fn open(&mut self) -> Result<()> {
        self.reset_buffers();
        if self.driver.is_open() {
            return Ok(());
        }
        self.driver.open()
    }

    /// Release the bus connection; safe to call repeatedly
    pub fn close(&mut self) {
        if self.driver.is_open() {
            self.driver.close();
        }
        self.reset_buffers();
    }

    fn reset_buffers(&mut self) {
        self.tx.clear();
        self.rx.clear();
        self.cursor = 0;
    }

    /// Select the device targeted by the next write sequence
    pub fn begin_transmission(&mut self, address: u8) {
        self.target = address;
        self.tx.clear();
    }

    pub fn queue_byte(&mut self, byte: u8) {
        self.tx.push(byte);
    }

    pub fn queue_bytes(&mut self, bytes: &[u8]) {
        self.tx.extend_from_slice(bytes);
    }

    /// Transmit the pending write buffer
    ///
    /// * empty buffer - zero-length write, a liveness probe
    /// * one byte - selects the register for the next [`request_from`](Self::request_from);
    ///   nothing goes on the bus
    /// * `[reg, data..]` - one write of each data byte to `reg`; every byte is
    ///   attempted and the first failure is returned
    pub fn end_transmission(&mut self) -> Result<()> {
        let tx = std::mem::take(&mut self.tx);
        if !self.driver.is_open() {
            return Err(GyroError::NotOpen);
        }

        match tx.as_slice() {
            [] => self.driver.probe(self.target),
            [reg] => {
                self.cursor = *reg;
                Ok(())
            }
            [reg, data @ ..] => {
                let mut first_error = None;
                for &value in data {
                    if let Err(e) = self.driver.write_register(self.target, *reg, value) {
                        warn!(
                            address = format_args!("0x{:02X}", self.target),
                            reg = format_args!("0x{:02X}", reg),
                            error = %e,
                            "register write failed"
                        );
                        first_error.get_or_insert(e);
                    }
                }
                match first_error {
                    Some(e) => Err(e),
                    None => Ok(()),
                }
            }
        }
    }

    /// Read `count` bytes starting at the register cursor into the read queue
    ///
    /// Returns the number of bytes queued; 0 when closed or on bus failure.
    pub fn request_from(&mut self, address: u8, count: usize) -> usize {
        if count == 0 || !self.driver.is_open() {
            return 0;
        }

        let mut buf = vec![0u8; count];
        match self.driver.read_block(address, self.cursor, &mut buf) {
            Ok(read) => {
                let read = read.min(count);
                self.rx.extend(&buf[..read]);
                self.cursor = self.cursor.wrapping_add((read % 256) as u8);
                trace!(address = format_args!("0x{:02X}", address), read, "request_from");
                read
            }
            Err(e) => {
                warn!(
                    address = format_args!("0x{:02X}", address),
                    reg = format_args!("0x{:02X}", self.cursor),
                    error = %e,
                    "register read failed"
                );
                0
            }
        }
    }

    /// Pop one byte from the read queue, or [`READ_SENTINEL`] when empty
    pub fn read(&mut self) -> u8 {
        self.rx.pop_front().unwrap_or(READ_SENTINEL)
    }

    /// Bytes waiting in the read queue
    pub fn available(&self) -> usize {
        self.rx.len()
    }

    /// Current register cursor
    pub fn cursor(&self) -> u8 {
        self.cursor
    }

    /// Write one register: `begin_transmission` + `[reg, value]` + `end_transmission`
    pub fn write_register(&mut self, address: u8, reg: u8, value: u8) -> Result<()> {
        self.begin_transmission(address);
        self.queue_bytes(&[reg, value]);
        self.end_transmission()
    }

    /// Fill `buf` from consecutive registers starting at `reg`
    pub fn read_registers(&mut self, address: u8, reg: u8, buf: &mut [u8]) -> Result<()> {
        self.begin_transmission(address);
        self.queue_byte(reg);
        self.end_transmission()?;

        // Leftovers from an earlier partial request would shift the result
        self.rx.clear();
        let read = self.request_from(address, buf.len());
        if read != buf.len() {
            self.rx.clear();
            return Err(GyroError::TransferError {
                expected: buf.len(),
                actual: read,
            });
        }
        for byte in buf.iter_mut() {
            *byte = self.read();
        }
        Ok(())
    }

    pub fn read_register(&mut self, address: u8, reg: u8) -> Result<u8> {
        let mut value = [0u8];
        self.read_registers(address, reg, &mut value)?;
        Ok(value[0])
    }

    /// Liveness probe: empty write sequence to `address`
    pub fn probe(&mut self, address: u8) -> Result<()> {
        self.begin_transmission(address);
        self.end_transmission()
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}
