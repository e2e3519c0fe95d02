// Register-addressed two-wire bus
//
// Every transaction is a synchronous request/response against a 7-bit
// peripheral address. No retries happen here: a failed transaction is
// reported to the caller, which owns the retry policy.

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::{Error as _, ErrorKind, I2c};
use std::time::Duration;
use tracing::debug;

/// Highest valid 7-bit peripheral address
pub const MAX_7BIT_ADDR: u8 = 0x7F;

/// Error types for register bus transactions
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum BusError {
    #[error("No acknowledge from device 0x{addr:02X} (register 0x{reg:02X})")]
    Nack { addr: u8, reg: u8 },

    #[error("Timeout talking to device 0x{addr:02X}")]
    Timeout { addr: u8 },

    #[error("Arbitration lost while addressing device 0x{addr:02X}")]
    ArbitrationLoss { addr: u8 },

    #[error("Address 0x{addr:02X} is not a 7-bit address")]
    InvalidAddress { addr: u8 },

    #[error("Short read from device 0x{addr:02X}: expected {expected} bytes, got {got}")]
    ShortRead { addr: u8, expected: usize, got: usize },

    #[error("Bus transaction with device 0x{addr:02X} failed: {reason}")]
    Transaction { addr: u8, reason: String },
}

pub type Result<T> = std::result::Result<T, BusError>;

/// Byte-level register access to a device on an addressed bus
pub trait RegisterBus {
    /// Write one byte to register `reg` of the device at `addr`
    fn write_register(&mut self, addr: u8, reg: u8, value: u8) -> Result<()>;

    /// Read `count` consecutive registers starting at `reg`, in the order received
    fn read_registers(&mut self, addr: u8, reg: u8, count: usize) -> Result<Vec<u8>>;

    /// Read a single register
    fn read_register(&mut self, addr: u8, reg: u8) -> Result<u8> {
        let bytes = self.read_registers(addr, reg, 1)?;
        bytes.first().copied().ok_or(BusError::ShortRead {
            addr,
            expected: 1,
            got: 0,
        })
    }
}

impl<B: RegisterBus + ?Sized> RegisterBus for &mut B {
    fn write_register(&mut self, addr: u8, reg: u8, value: u8) -> Result<()> {
        (**self).write_register(addr, reg, value)
    }

    fn read_registers(&mut self, addr: u8, reg: u8, count: usize) -> Result<Vec<u8>> {
        (**self).read_registers(addr, reg, count)
    }
}

pub(crate) fn check_address(addr: u8) -> Result<()> {
    if addr > MAX_7BIT_ADDR {
        return Err(BusError::InvalidAddress { addr });
    }
    Ok(())
}

/// Register bus on top of any blocking `embedded-hal` I2C master
///
/// The peripheral itself (pins, clock, bus timeout) is set up by the HAL
/// before it is handed over here.
pub struct I2cBus<I> {
    i2c: I,
}

impl<I: I2c> I2cBus<I> {
    pub fn new(i2c: I) -> Self {
        Self { i2c }
    }

    /// Give the underlying I2C peripheral back
    pub fn release(self) -> I {
        self.i2c
    }

    fn map_error(err: I::Error, addr: u8, reg: u8) -> BusError {
        match err.kind() {
            ErrorKind::NoAcknowledge(_) => BusError::Nack { addr, reg },
            ErrorKind::ArbitrationLoss => BusError::ArbitrationLoss { addr },
            kind => BusError::Transaction {
                addr,
                reason: format!("{:?}", kind),
            },
        }
    }
}

impl<I: I2c> RegisterBus for I2cBus<I> {
    fn write_register(&mut self, addr: u8, reg: u8, value: u8) -> Result<()> {
        check_address(addr)?;
        debug!("I2C write 0x{:02X}: reg=0x{:02X} value=0x{:02X}", addr, reg, value);
        self.i2c
            .write(addr, &[reg, value])
            .map_err(|e| Self::map_error(e, addr, reg))
    }

    fn read_registers(&mut self, addr: u8, reg: u8, count: usize) -> Result<Vec<u8>> {
        check_address(addr)?;
        let mut buf = vec![0u8; count];
        self.i2c
            .write_read(addr, &[reg], &mut buf)
            .map_err(|e| Self::map_error(e, addr, reg))?;
        Ok(buf)
    }
}

/// Blocking delay backed by `std::thread::sleep`
#[derive(Debug, Clone, Copy, Default)]
pub struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(Duration::from_nanos(ns.into()));
    }
}
