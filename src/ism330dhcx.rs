//! ISM330DHCX gyroscope driver over the buffered [`Transport`]
//!
//! A device handle does not own the bus. Every operation borrows the
//! transport, which lets the registry (and later the sampling worker) hold the
//! single transport next to all of its devices.

use crate::error::{GyroError, Result};
use crate::transport::Transport;
use serde::Deserialize;
use std::fmt;

/// I2C address with SDO/SA0 pulled low
pub const ISM330DHCX_ADDRESS_LOW: u8 = 0x6A;
/// I2C address with SDO/SA0 pulled high (board default)
pub const ISM330DHCX_ADDRESS_HIGH: u8 = 0x6B;

/// Expected WHO_AM_I value
pub const WHO_AM_I_VALUE: u8 = 0x6B;

/// Register map (the subset this crate uses)
pub mod registers {
    pub const WHO_AM_I: u8 = 0x0F;
    pub const CTRL2_G: u8 = 0x11;
    pub const CTRL3_C: u8 = 0x12;
    pub const CTRL4_C: u8 = 0x13;
    pub const CTRL6_C: u8 = 0x15;
    pub const CTRL9_XL: u8 = 0x18;
    pub const STATUS_REG: u8 = 0x1E;
    pub const OUTX_L_G: u8 = 0x22;

    // CTRL3_C bits
    pub const CTRL3_C_SW_RESET: u8 = 0x01;
    pub const CTRL3_C_IF_INC: u8 = 0x04;
    pub const CTRL3_C_BDU: u8 = 0x40;
    pub const CTRL3_C_DEFAULT: u8 = CTRL3_C_IF_INC;

    // CTRL2_G fields
    pub const CTRL2_G_ODR_MASK: u8 = 0xF0;
    pub const CTRL2_G_FS_MASK: u8 = 0x0F;

    // CTRL4_C bits
    pub const CTRL4_C_LPF1_SEL_G: u8 = 0x02;

    // CTRL6_C fields
    pub const CTRL6_C_FTYPE_MASK: u8 = 0x07;

    // CTRL9_XL bits
    pub const CTRL9_XL_DEVICE_CONF: u8 = 0x02;
    pub const CTRL9_XL_DEFAULT: u8 = 0xE0;

    // STATUS_REG bits
    pub const STATUS_XLDA: u8 = 0x01;
    pub const STATUS_GDA: u8 = 0x02;
}

use registers::*;

/// Gyroscope output data rate (CTRL2_G ODR_G)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GyroDataRate {
    Off = 0,
    Hz12_5 = 1,
    Hz26 = 2,
    Hz52 = 3,
    Hz104 = 4,
    Hz208 = 5,
    Hz416 = 6,
    Hz833 = 7,
    Hz1666 = 8,
    Hz3332 = 9,
    Hz6667 = 10,
}

/// Gyroscope full-scale range (CTRL2_G FS_G, including FS_125 and FS_4000)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GyroFullScale {
    Dps125 = 0x02,
    Dps250 = 0x00,
    Dps500 = 0x04,
    Dps1000 = 0x08,
    Dps2000 = 0x0C,
    Dps4000 = 0x01,
}

/// First-stage gyro low-pass bandwidth (CTRL6_C FTYPE)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lp1Bandwidth {
    UltraLight = 0,
    VeryLight = 1,
    Light = 2,
    Medium = 3,
    Strong = 4,
    VeryStrong = 5,
    Aggressive = 6,
    Xtreme = 7,
}

/// Bring-up progress of one device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BringUpState {
    Unregistered,
    Identified,
    Configured,
    Ready,
    Failed,
}

impl fmt::Display for BringUpState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BringUpState::Unregistered => "unregistered",
            BringUpState::Identified => "identified",
            BringUpState::Configured => "configured",
            BringUpState::Ready => "ready",
            BringUpState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Raw 3-axis angular-rate reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GyroReading {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

impl GyroReading {
    /// Decode the six little-endian output registers OUTX_L_G..OUTZ_H_G
    pub fn from_le_bytes(data: [u8; 6]) -> Self {
        Self {
            x: i16::from_le_bytes([data[0], data[1]]),
            y: i16::from_le_bytes([data[2], data[3]]),
            z: i16::from_le_bytes([data[4], data[5]]),
        }
    }
}

/// One ISM330DHCX on the bus
#[derive(Debug)]
pub struct Ism330dhcx {
    address: u8,
    state: BringUpState,
    identity: Option<u8>,
    connected: bool,
}

impl Ism330dhcx {
    /// Bind a device handle to `address`. Nothing is sent on the bus.
    pub fn new(address: u8) -> Self {
        Self {
            address,
            state: BringUpState::Unregistered,
            identity: None,
            connected: false,
        }
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    pub fn state(&self) -> BringUpState {
        self.state
    }

    /// WHO_AM_I byte read during bring-up
    pub fn identity(&self) -> Option<u8> {
        self.identity
    }

    /// Result of the most recent liveness probe
    pub fn last_known_connected(&self) -> bool {
        self.connected
    }

    pub(crate) fn mark_configured(&mut self) {
        self.state = BringUpState::Configured;
    }

    pub(crate) fn mark_ready(&mut self) {
        self.state = BringUpState::Ready;
    }

    pub(crate) fn mark_failed(&mut self) {
        self.state = BringUpState::Failed;
    }

    fn ensure_configurable(&self) -> Result<()> {
        if self.state == BringUpState::Ready {
            return Err(GyroError::InvalidParameter(format!(
                "device 0x{:02X} is ready; configuration is frozen",
                self.address
            )));
        }
        Ok(())
    }

    fn write_register(&self, bus: &mut Transport, reg: u8, value: u8) -> Result<()> {
        bus.write_register(self.address, reg, value)
    }

    /// Read a register
    pub fn read_register(&self, bus: &mut Transport, reg: u8) -> Result<u8> {
        bus.read_register(self.address, reg)
    }

    /// Read-modify-write of the bits selected by `mask`
    fn update_register(&self, bus: &mut Transport, reg: u8, mask: u8, value: u8) -> Result<()> {
        let current = self.read_register(bus, reg)?;
        self.write_register(bus, reg, (current & !mask) | (value & mask))
    }

    /// Software reset; waits for SW_RESET to self-clear
    ///
    /// Polls CTRL3_C at most `poll_attempts` times after issuing the reset.
    pub fn device_reset(&mut self, bus: &mut Transport, poll_attempts: u32) -> Result<()> {
        self.update_register(bus, CTRL3_C, CTRL3_C_SW_RESET, CTRL3_C_SW_RESET)?;

        for _ in 0..poll_attempts.max(1) {
            if self.read_register(bus, CTRL3_C)? & CTRL3_C_SW_RESET == 0 {
                return Ok(());
            }
            std::thread::sleep(std::time::Duration::from_millis(1));
        }
        Err(GyroError::CommunicationError(format!(
            "software reset of 0x{:02X} did not complete",
            self.address
        )))
    }

    /// Read WHO_AM_I and check it against [`WHO_AM_I_VALUE`]
    pub fn identify(&mut self, bus: &mut Transport) -> Result<u8> {
        let who_am_i = self.read_register(bus, WHO_AM_I)?;
        self.identity = Some(who_am_i);
        if who_am_i != WHO_AM_I_VALUE {
            return Err(GyroError::InvalidDeviceId {
                address: self.address,
                found: who_am_i,
            });
        }
        self.state = BringUpState::Identified;
        Ok(who_am_i)
    }

    /// Enable the extended device configuration (CTRL9_XL DEVICE_CONF)
    pub fn set_device_config(&mut self, bus: &mut Transport) -> Result<()> {
        self.ensure_configurable()?;
        self.update_register(bus, CTRL9_XL, CTRL9_XL_DEVICE_CONF, CTRL9_XL_DEVICE_CONF)
    }

    /// Output registers are not updated until both bytes have been read
    pub fn set_block_data_update(&mut self, bus: &mut Transport) -> Result<()> {
        self.ensure_configurable()?;
        self.update_register(bus, CTRL3_C, CTRL3_C_BDU, CTRL3_C_BDU)
    }

    pub fn set_gyro_data_rate(&mut self, bus: &mut Transport, rate: GyroDataRate) -> Result<()> {
        self.ensure_configurable()?;
        self.update_register(bus, CTRL2_G, CTRL2_G_ODR_MASK, (rate as u8) << 4)
    }

    pub fn set_gyro_full_scale(&mut self, bus: &mut Transport, scale: GyroFullScale) -> Result<()> {
        self.ensure_configurable()?;
        self.update_register(bus, CTRL2_G, CTRL2_G_FS_MASK, scale as u8)
    }

    /// Route the gyro through the first-stage low-pass filter
    pub fn set_gyro_filter_lp1(&mut self, bus: &mut Transport) -> Result<()> {
        self.ensure_configurable()?;
        self.update_register(bus, CTRL4_C, CTRL4_C_LPF1_SEL_G, CTRL4_C_LPF1_SEL_G)
    }

    pub fn set_gyro_lp1_bandwidth(&mut self, bus: &mut Transport, bandwidth: Lp1Bandwidth) -> Result<()> {
        self.ensure_configurable()?;
        self.update_register(bus, CTRL6_C, CTRL6_C_FTYPE_MASK, bandwidth as u8)
    }

    /// Lightweight liveness probe (empty write), not a re-identification
    pub fn is_connected(&mut self, bus: &mut Transport) -> bool {
        self.connected = bus.probe(self.address).is_ok();
        self.connected
    }

    /// True when a new gyro sample is available (STATUS_REG GDA)
    pub fn gyro_data_ready(&self, bus: &mut Transport) -> Result<bool> {
        Ok(self.read_register(bus, STATUS_REG)? & STATUS_GDA != 0)
    }

    /// Read the raw gyro output registers in one sequential request
    pub fn read_gyro(&self, bus: &mut Transport) -> Result<GyroReading> {
        let mut data = [0u8; 6];
        bus.read_registers(self.address, OUTX_L_G, &mut data)?;
        Ok(GyroReading::from_le_bytes(data))
    }
}
