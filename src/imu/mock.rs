// In-memory register bus for tests and simulation
//
// Each attached device is a 256-byte register file. Writes land in the file
// and reads return consecutive registers, so a write followed by a read of
// the same register loops the value back.

use std::collections::{BTreeMap, VecDeque};

use super::bus::{check_address, BusError, RegisterBus, Result};

const REGISTER_FILE_SIZE: usize = 256;

/// A bus transaction as seen by the mock
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transaction {
    Write { addr: u8, reg: u8, value: u8 },
    Read { addr: u8, reg: u8, count: usize },
}

/// Mock register bus
///
/// Records every transaction and lets a test queue up failures.
#[derive(Debug, Default)]
pub struct MockBus {
    devices: BTreeMap<u8, [u8; REGISTER_FILE_SIZE]>,
    transactions: Vec<Transaction>,
    pending_faults: VecDeque<BusError>,
    read_only: Vec<(u8, u8)>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a device with all registers zeroed
    pub fn with_device(mut self, addr: u8) -> Self {
        self.attach(addr);
        self
    }

    pub fn attach(&mut self, addr: u8) {
        self.devices.entry(addr).or_insert([0u8; REGISTER_FILE_SIZE]);
    }

    /// Remove a device; later transactions to it are not acknowledged
    pub fn detach(&mut self, addr: u8) {
        self.devices.remove(&addr);
    }

    /// Preset a run of registers (attaches the device if needed)
    pub fn set_registers(&mut self, addr: u8, start: u8, values: &[u8]) {
        self.attach(addr);
        if let Some(file) = self.devices.get_mut(&addr) {
            for (offset, &value) in values.iter().enumerate() {
                file[(start as usize + offset) % REGISTER_FILE_SIZE] = value;
            }
        }
    }

    pub fn set_register(&mut self, addr: u8, reg: u8, value: u8) {
        self.set_registers(addr, reg, &[value]);
    }

    /// Current content of a register, `None` if the device is not attached
    pub fn register(&self, addr: u8, reg: u8) -> Option<u8> {
        self.devices.get(&addr).map(|file| file[reg as usize])
    }

    /// Writes to this register are acknowledged but ignored
    pub fn make_read_only(&mut self, addr: u8, reg: u8) {
        self.read_only.push((addr, reg));
    }

    /// Fail the next transaction with `err`; queued faults fire in order
    pub fn inject_fault(&mut self, err: BusError) {
        self.pending_faults.push_back(err);
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    pub fn clear_transactions(&mut self) {
        self.transactions.clear();
    }

    fn begin(&mut self, addr: u8, reg: u8) -> Result<&mut [u8; REGISTER_FILE_SIZE]> {
        check_address(addr)?;
        if let Some(err) = self.pending_faults.pop_front() {
            return Err(err);
        }
        self.devices
            .get_mut(&addr)
            .ok_or(BusError::Nack { addr, reg })
    }
}

impl RegisterBus for MockBus {
    fn write_register(&mut self, addr: u8, reg: u8, value: u8) -> Result<()> {
        self.transactions.push(Transaction::Write { addr, reg, value });
        let read_only = self.read_only.contains(&(addr, reg));
        let file = self.begin(addr, reg)?;
        if !read_only {
            file[reg as usize] = value;
        }
        Ok(())
    }

    fn read_registers(&mut self, addr: u8, reg: u8, count: usize) -> Result<Vec<u8>> {
        self.transactions.push(Transaction::Read { addr, reg, count });
        let file = self.begin(addr, reg)?;
        Ok((0..count)
            .map(|i| file[(reg as usize + i) % REGISTER_FILE_SIZE])
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_loops_back() {
        let mut bus = MockBus::new().with_device(0x53);
        bus.write_register(0x53, 0x31, 0x08).unwrap();
        assert_eq!(bus.read_register(0x53, 0x31).unwrap(), 0x08);
    }

    #[test]
    fn test_multi_byte_read_reconstructs_signed_values() {
        // -2 little-endian, 256 little-endian, i16::MIN little-endian
        let mut bus = MockBus::new().with_device(0x53);
        for (i, byte) in [0xFE, 0xFF, 0x00, 0x01, 0x00, 0x80].into_iter().enumerate() {
            bus.write_register(0x53, 0x32 + i as u8, byte).unwrap();
        }

        let raw = bus.read_registers(0x53, 0x32, 6).unwrap();
        let values: Vec<i16> = raw
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        assert_eq!(values, vec![-2, 256, i16::MIN]);
    }

    #[test]
    fn test_absent_device_is_not_acknowledged() {
        let mut bus = MockBus::new();
        let err = bus.write_register(0x53, 0x2D, 0x08).unwrap_err();
        assert_eq!(err, BusError::Nack { addr: 0x53, reg: 0x2D });
    }

    #[test]
    fn test_injected_fault_fires_once() {
        let mut bus = MockBus::new().with_device(0x68);
        bus.inject_fault(BusError::Timeout { addr: 0x68 });

        assert_eq!(
            bus.read_registers(0x68, 0x1D, 6).unwrap_err(),
            BusError::Timeout { addr: 0x68 }
        );
        assert!(bus.read_registers(0x68, 0x1D, 6).is_ok());
        assert_eq!(bus.transactions().len(), 2);
    }

    #[test]
    fn test_read_only_register_keeps_value() {
        let mut bus = MockBus::new();
        bus.set_register(0x53, 0x00, 0xE5);
        bus.make_read_only(0x53, 0x00);
        bus.write_register(0x53, 0x00, 0x11).unwrap();
        assert_eq!(bus.register(0x53, 0x00), Some(0xE5));
    }
}
