//! FT232H USB-to-I2C bridge binding through FTDI libMPSSE

use super::{BusDriver, BusKind};
use crate::error::{GyroError, Result};
use crate::ffi::*;
use std::ptr;

/// One MPSSE channel of an FT232H configured for I2C
pub struct FtdiBus {
    channel: u32,
    clock_hz: u32,
    handle: Option<FT_HANDLE>,
}

// The handle is an opaque pointer owned by this struct and only ever used by
// the thread that currently owns the bus.
unsafe impl Send for FtdiBus {}

impl FtdiBus {
    pub fn new(channel: u32, clock_hz: u32) -> Self {
        Self {
            channel,
            clock_hz,
            handle: None,
        }
    }

    fn handle(&self) -> Result<FT_HANDLE> {
        self.handle.ok_or(GyroError::NotOpen)
    }
}

fn check(status: FT_STATUS) -> Result<()> {
    if status == FT_OK {
        Ok(())
    } else {
        Err(status.into())
    }
}

impl BusDriver for FtdiBus {
    fn kind(&self) -> BusKind {
        BusKind::UsbBridge
    }

    fn open(&mut self) -> Result<()> {
        if self.handle.is_some() {
            return Ok(());
        }

        let mut num_channels: DWORD = 0;
        check(unsafe { I2C_GetNumChannels(&mut num_channels) })?;
        if num_channels == 0 {
            return Err(GyroError::NoChannelsFound);
        }
        if self.channel >= num_channels {
            return Err(GyroError::InvalidChannel(self.channel));
        }

        let mut handle: FT_HANDLE = ptr::null_mut();
        check(unsafe { I2C_OpenChannel(self.channel, &mut handle) })?;

        let mut config = ChannelConfig::with_clock(self.clock_hz);
        let status = unsafe { I2C_InitChannel(handle, &mut config) };
        if status != FT_OK {
            unsafe { I2C_CloseChannel(handle) };
            return Err(status.into());
        }

        self.handle = Some(handle);
        Ok(())
    }

    fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            unsafe { I2C_CloseChannel(handle) };
        }
    }

    fn is_open(&self) -> bool {
        self.handle.is_some()
    }

    fn probe(&mut self, address: u8) -> Result<()> {
        let handle = self.handle()?;
        let mut transferred: DWORD = 0;
        let options = I2C_TRANSFER_OPTIONS_START_BIT
            | I2C_TRANSFER_OPTIONS_STOP_BIT
            | I2C_TRANSFER_OPTIONS_BREAK_ON_NACK;

        check(unsafe {
            I2C_DeviceWrite(handle, address, 0, ptr::null(), &mut transferred, options)
        })
    }

    fn write_register(&mut self, address: u8, reg: u8, value: u8) -> Result<()> {
        let handle = self.handle()?;
        let buffer = [reg, value];
        let mut transferred: DWORD = 0;
        let options = I2C_TRANSFER_OPTIONS_START_BIT
            | I2C_TRANSFER_OPTIONS_STOP_BIT
            | I2C_TRANSFER_OPTIONS_FAST_TRANSFER_BYTES;

        // With FAST_TRANSFER_BYTES the transferred count is in bits; status is authoritative
        check(unsafe {
            I2C_DeviceWrite(handle, address, 2, buffer.as_ptr(), &mut transferred, options)
        })
    }

    fn read_register(&mut self, address: u8, reg: u8) -> Result<u8> {
        let handle = self.handle()?;
        let reg_buf = [reg];
        let mut transferred: DWORD = 0;

        let options = I2C_TRANSFER_OPTIONS_START_BIT | I2C_TRANSFER_OPTIONS_BREAK_ON_NACK;
        check(unsafe {
            I2C_DeviceWrite(handle, address, 1, reg_buf.as_ptr(), &mut transferred, options)
        })?;

        let mut data = [0u8];
        transferred = 0;
        let options = I2C_TRANSFER_OPTIONS_START_BIT
            | I2C_TRANSFER_OPTIONS_STOP_BIT
            | I2C_TRANSFER_OPTIONS_NACK_LAST_BYTE;
        check(unsafe {
            I2C_DeviceRead(handle, address, 1, data.as_mut_ptr(), &mut transferred, options)
        })?;

        if transferred != 1 {
            return Err(GyroError::TransferError {
                expected: 1,
                actual: transferred as usize,
            });
        }
        Ok(data[0])
    }
}

impl Drop for FtdiBus {
    fn drop(&mut self) {
        self.close();
    }
}
