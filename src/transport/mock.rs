//! Simulated bus with ISM330DHCX register files
//!
//! Records every bus cycle for test verification and models the parts of the
//! sensor the bring-up and sampling code touch: identity, software reset,
//! register storage, the gyro data-ready flag and the gyro output registers.
//! Clones share state, so a test can keep a handle while the transport owns
//! the driver.

use super::{BusDriver, BusKind};
use crate::error::{GyroError, Result};
use crate::ism330dhcx::registers::*;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};

/// One bus cycle as seen by the simulated bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusTransaction {
    Probe { address: u8 },
    WriteRegister { address: u8, reg: u8, value: u8 },
    ReadRegister { address: u8, reg: u8 },
    ReadBlock { address: u8, start: u8, len: usize },
}

struct SimulatedSensor {
    identity: u8,
    registers: [u8; 256],
}

impl SimulatedSensor {
    fn new(identity: u8) -> Self {
        let mut sensor = Self {
            identity,
            registers: [0; 256],
        };
        sensor.power_on_reset();
        sensor
    }

    fn power_on_reset(&mut self) {
        let gyro = [
            self.registers[OUTX_L_G as usize],
            self.registers[OUTX_L_G as usize + 1],
            self.registers[OUTX_L_G as usize + 2],
            self.registers[OUTX_L_G as usize + 3],
            self.registers[OUTX_L_G as usize + 4],
            self.registers[OUTX_L_G as usize + 5],
        ];
        self.registers = [0; 256];
        self.registers[WHO_AM_I as usize] = self.identity;
        self.registers[CTRL3_C as usize] = CTRL3_C_DEFAULT;
        self.registers[CTRL9_XL as usize] = CTRL9_XL_DEFAULT;
        // Output registers keep the last conversion
        self.registers[OUTX_L_G as usize..OUTX_L_G as usize + 6].copy_from_slice(&gyro);
    }
}

#[derive(Default)]
struct MockState {
    open: bool,
    fail_open: bool,
    block_reads: bool,
    data_ready: bool,
    sensors: BTreeMap<u8, SimulatedSensor>,
    failing_writes: HashSet<(u8, u8)>,
    transactions: Vec<BusTransaction>,
}

impl MockState {
    fn sensor(&mut self, address: u8) -> Result<&mut SimulatedSensor> {
        self.sensors
            .get_mut(&address)
            .ok_or_else(|| GyroError::Bus(format!("NACK from 0x{:02X}", address)))
    }

    fn read(&mut self, address: u8, reg: u8) -> Result<u8> {
        let data_ready = self.data_ready;
        let sensor = self.sensor(address)?;
        Ok(match reg {
            STATUS_REG if data_ready => STATUS_GDA | STATUS_XLDA,
            STATUS_REG => 0x00,
            _ => sensor.registers[reg as usize],
        })
    }
}

/// Cloneable handle to a simulated bus
#[derive(Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<MockState>>,
}

impl MockBus {
    /// Empty bus; data-ready reported as set
    pub fn new() -> Self {
        let bus = Self::default();
        bus.lock().data_ready = true;
        bus
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Attach a sensor answering WHO_AM_I with `identity`
    pub fn add_sensor(&self, address: u8, identity: u8) {
        self.lock().sensors.insert(address, SimulatedSensor::new(identity));
    }

    /// Detach a sensor; further cycles to `address` are NACKed
    pub fn remove_sensor(&self, address: u8) {
        self.lock().sensors.remove(&address);
    }

    pub fn set_data_ready(&self, ready: bool) {
        self.lock().data_ready = ready;
    }

    /// Store a gyro conversion result in the output registers
    pub fn set_gyro(&self, address: u8, xyz: [i16; 3]) {
        let mut state = self.lock();
        if let Some(sensor) = state.sensors.get_mut(&address) {
            for (axis, value) in xyz.iter().enumerate() {
                let offset = OUTX_L_G as usize + axis * 2;
                sensor.registers[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
            }
        }
    }

    /// Make every write to `reg` on `address` fail
    pub fn fail_register_writes(&self, address: u8, reg: u8) {
        self.lock().failing_writes.insert((address, reg));
    }

    /// Make the next `open` fail
    pub fn set_open_failure(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    /// Serve multi-byte reads as one block transfer, like a kernel bus driver
    pub fn set_block_reads(&self, block: bool) {
        self.lock().block_reads = block;
    }

    pub fn register(&self, address: u8, reg: u8) -> Option<u8> {
        self.lock()
            .sensors
            .get(&address)
            .map(|sensor| sensor.registers[reg as usize])
    }

    pub fn transactions(&self) -> Vec<BusTransaction> {
        self.lock().transactions.clone()
    }

    pub fn clear_transactions(&self) {
        self.lock().transactions.clear();
    }

    pub fn is_open(&self) -> bool {
        self.lock().open
    }
}

impl BusDriver for MockBus {
    fn kind(&self) -> BusKind {
        BusKind::Simulated
    }

    fn open(&mut self) -> Result<()> {
        let mut state = self.lock();
        if state.fail_open {
            return Err(GyroError::Bus("simulated bus unavailable".to_string()));
        }
        state.open = true;
        Ok(())
    }

    fn close(&mut self) {
        self.lock().open = false;
    }

    fn is_open(&self) -> bool {
        self.lock().open
    }

    fn probe(&mut self, address: u8) -> Result<()> {
        let mut state = self.lock();
        state.transactions.push(BusTransaction::Probe { address });
        state.sensor(address).map(|_| ())
    }

    fn write_register(&mut self, address: u8, reg: u8, value: u8) -> Result<()> {
        let mut state = self.lock();
        state
            .transactions
            .push(BusTransaction::WriteRegister { address, reg, value });
        if state.failing_writes.contains(&(address, reg)) {
            return Err(GyroError::Bus(format!(
                "simulated write failure at 0x{:02X} reg 0x{:02X}",
                address, reg
            )));
        }

        let sensor = state.sensor(address)?;
        match reg {
            WHO_AM_I | STATUS_REG => {}
            // Software reset completes immediately and self-clears
            CTRL3_C if value & CTRL3_C_SW_RESET != 0 => sensor.power_on_reset(),
            _ => sensor.registers[reg as usize] = value,
        }
        Ok(())
    }

    fn read_register(&mut self, address: u8, reg: u8) -> Result<u8> {
        let mut state = self.lock();
        state.transactions.push(BusTransaction::ReadRegister { address, reg });
        state.read(address, reg)
    }

    fn read_block(&mut self, address: u8, start: u8, buf: &mut [u8]) -> Result<usize> {
        let mut state = self.lock();
        if state.block_reads {
            state.transactions.push(BusTransaction::ReadBlock {
                address,
                start,
                len: buf.len(),
            });
        }

        let mut reg = start;
        for byte in buf.iter_mut() {
            if !state.block_reads {
                state.transactions.push(BusTransaction::ReadRegister { address, reg });
            }
            *byte = state.read(address, reg)?;
            reg = reg.wrapping_add(1);
        }
        Ok(buf.len())
    }
}
