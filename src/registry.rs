//! Device registry and per-device bring-up sequence

use crate::error::{GyroError, Result};
use crate::ism330dhcx::{
    registers, BringUpState, GyroDataRate, GyroFullScale, Ism330dhcx, Lp1Bandwidth,
};
use crate::transport::{BusKind, Transport};
use serde::Deserialize;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Timing and register settings applied to every device during bring-up
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BringUpConfig {
    /// Pause before talking to a device behind a USB bridge
    pub bridge_settle_ms: u64,
    /// Pause after each configuration write
    pub step_settle_ms: u64,
    /// CTRL3_C polls while waiting for a software reset to finish
    pub reset_poll_attempts: u32,
    /// Read back CTRL9_XL, CTRL2_G and CTRL6_C after writing them
    pub verify_registers: bool,
    pub data_rate: GyroDataRate,
    pub full_scale: GyroFullScale,
    pub lp1_bandwidth: Lp1Bandwidth,
}

impl Default for BringUpConfig {
    fn default() -> Self {
        Self {
            bridge_settle_ms: 100,
            step_settle_ms: 50,
            reset_poll_attempts: 10,
            verify_registers: true,
            data_rate: GyroDataRate::Hz3332,
            full_scale: GyroFullScale::Dps250,
            lp1_bandwidth: Lp1Bandwidth::Medium,
        }
    }
}

impl BringUpConfig {
    /// Default register settings without any settle delays
    pub fn immediate() -> Self {
        Self {
            bridge_settle_ms: 0,
            step_settle_ms: 0,
            ..Self::default()
        }
    }

    fn settle(&self) {
        if self.step_settle_ms > 0 {
            thread::sleep(Duration::from_millis(self.step_settle_ms));
        }
    }
}

/// Ordered set of ready devices sharing one transport
///
/// Insertion order is the logging index: the first device registered writes to
/// `sensor0.csv`. Dropping the registry resets every device and closes the bus.
pub struct DeviceRegistry {
    transport: Transport,
    devices: Vec<Ism330dhcx>,
    config: BringUpConfig,
}

impl DeviceRegistry {
    /// The transport is opened lazily by the first registration
    pub fn new(transport: Transport, config: BringUpConfig) -> Self {
        Self {
            transport,
            devices: Vec::new(),
            config,
        }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn devices(&self) -> &[Ism330dhcx] {
        &self.devices
    }

    /// Bus addresses in logging-index order
    pub fn addresses(&self) -> Vec<u8> {
        self.devices.iter().map(Ism330dhcx::address).collect()
    }

    /// Bring up the device at `address` and append it on success
    ///
    /// Returns the logging index. Any failure leaves the registry untouched.
    pub fn register_device(&mut self, address: u8) -> Result<usize> {
        if self.devices.iter().any(|d| d.address() == address) {
            return Err(GyroError::InvalidParameter(format!(
                "device 0x{:02X} is already registered",
                address
            )));
        }

        if !self.transport.is_open() {
            self.transport.open()?;
        }

        let mut device = Ism330dhcx::new(address);
        if let Err(e) = self.bring_up(&mut device) {
            device.mark_failed();
            warn!(
                address = format_args!("0x{:02X}", address),
                state = %device.state(),
                error = %e,
                "device bring-up failed; device discarded"
            );
            return Err(e);
        }

        device.mark_ready();
        self.devices.push(device);
        let index = self.devices.len() - 1;
        info!(
            address = format_args!("0x{:02X}", address),
            index,
            "Added device; logging to sensor{}.csv",
            index
        );
        Ok(index)
    }

    fn bring_up(&mut self, device: &mut Ism330dhcx) -> Result<()> {
        let address = device.address();
        let config = self.config.clone();
        let bus = &mut self.transport;

        if bus.kind() == BusKind::UsbBridge && config.bridge_settle_ms > 0 {
            thread::sleep(Duration::from_millis(config.bridge_settle_ms));
        }

        device
            .device_reset(bus, config.reset_poll_attempts)
            .map_err(|e| GyroError::bring_up(address, "reset", e))?;
        config.settle();

        device
            .identify(bus)
            .map_err(|e| GyroError::bring_up(address, "identify", e))?;
        debug_assert_eq!(device.state(), BringUpState::Identified);
        config.settle();

        device
            .set_device_config(bus)
            .map_err(|e| GyroError::bring_up(address, "device config", e))?;
        config.settle();
        if config.verify_registers {
            check_register(bus, address, registers::CTRL9_XL, 0xE2);
        }

        device
            .set_block_data_update(bus)
            .map_err(|e| GyroError::bring_up(address, "block data update", e))?;
        config.settle();

        device
            .set_gyro_data_rate(bus, config.data_rate)
            .map_err(|e| GyroError::bring_up(address, "gyro data rate", e))?;
        config.settle();

        device
            .set_gyro_full_scale(bus, config.full_scale)
            .map_err(|e| GyroError::bring_up(address, "gyro full scale", e))?;
        config.settle();
        if config.verify_registers {
            let expected = ((config.data_rate as u8) << 4) | config.full_scale as u8;
            check_register(bus, address, registers::CTRL2_G, expected);
        }

        device
            .set_gyro_filter_lp1(bus)
            .map_err(|e| GyroError::bring_up(address, "gyro LP1 filter", e))?;
        config.settle();

        device
            .set_gyro_lp1_bandwidth(bus, config.lp1_bandwidth)
            .map_err(|e| GyroError::bring_up(address, "gyro LP1 bandwidth", e))?;
        config.settle();
        if config.verify_registers {
            check_register(bus, address, registers::CTRL6_C, config.lp1_bandwidth as u8);
        }

        device.mark_configured();
        Ok(())
    }

    /// True iff at least one device is registered and every device answers a probe
    pub fn status_check(&mut self) -> bool {
        if self.devices.is_empty() {
            warn!("No ISM330DHCX devices registered. Please check connections.");
            return false;
        }
        let transport = &mut self.transport;
        // Probe every device so each handle's connected flag is current
        self.devices
            .iter_mut()
            .fold(true, |all, device| device.is_connected(transport) && all)
    }

    /// Diagnostic read-back of one register; mismatches are only logged
    pub fn check_register(&mut self, address: u8, reg: u8, expected: u8) -> bool {
        check_register(&mut self.transport, address, reg, expected)
    }

    /// Transport and devices, borrowed together by the sampling loop
    pub(crate) fn parts_mut(&mut self) -> (&mut Transport, &mut [Ism330dhcx]) {
        (&mut self.transport, &mut self.devices)
    }
}

fn check_register(bus: &mut Transport, address: u8, reg: u8, expected: u8) -> bool {
    match bus.read_register(address, reg) {
        Ok(value) if value == expected => {
            debug!(
                address = format_args!("0x{:02X}", address),
                reg = format_args!("0x{:02X}", reg),
                value = format_args!("0x{:02X}", value),
                "register check passed"
            );
            true
        }
        Ok(value) => {
            warn!(
                address = format_args!("0x{:02X}", address),
                reg = format_args!("0x{:02X}", reg),
                read = format_args!("0x{:02X}", value),
                expected = format_args!("0x{:02X}", expected),
                "register check mismatch"
            );
            false
        }
        Err(e) => {
            warn!(
                address = format_args!("0x{:02X}", address),
                reg = format_args!("0x{:02X}", reg),
                error = %e,
                "register check failed"
            );
            false
        }
    }
}

impl Drop for DeviceRegistry {
    fn drop(&mut self) {
        let poll_attempts = self.config.reset_poll_attempts;
        for device in &mut self.devices {
            if let Err(e) = device.device_reset(&mut self.transport, poll_attempts) {
                warn!(
                    address = format_args!("0x{:02X}", device.address()),
                    error = %e,
                    "reset on release failed"
                );
            }
        }
        self.transport.close();
    }
}
