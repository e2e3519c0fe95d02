// GY-85 inertial board driver
//
// The board carries an ADXL345 accelerometer and an ITG-3205 gyroscope on the
// same two-wire bus. Only these two sensors are used; the magnetometer stays idle.

use embedded_hal::delay::DelayNs;
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;
use tracing::{debug, info, warn};

use super::bus::{BusError, RegisterBus};
use crate::config::ImuConfig;

/// ADXL345 accelerometer address (ALT ADDRESS pin low)
pub const GY85_ADDR: u8 = 0x53;
/// ITG-3205 gyroscope address (AD0 pin low)
pub const ITG3205_ADDR: u8 = 0x68;

pub const ADXL345_DEVICE_ID: u8 = 0xE5;
pub const ITG3205_WHO_AM_I: u8 = 0x68;

/// Full-resolution accelerometer sensitivity
pub const ACCEL_G_PER_LSB: f64 = 0.0039;
/// Gyroscope sensitivity at the ±2000 °/s range
pub const GYRO_LSB_PER_DPS: f64 = 14.375;

const RAD_TO_DEG: f64 = 180.0 / PI;

/// ADXL345 register addresses
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum AccelRegister {
    DeviceId = 0x00,
    BwRate = 0x2C,
    PowerCtl = 0x2D,
    DataFormat = 0x31,
    DataX0 = 0x32, // 6 bytes, little-endian X/Y/Z
}

/// ITG-3205 register addresses
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum GyroRegister {
    WhoAmI = 0x00,
    SampleRateDivider = 0x15,
    DlpfFs = 0x16,
    GyroXoutH = 0x1D, // 6 bytes, big-endian X/Y/Z
    PowerManagement = 0x3E,
}

// ADXL345 configuration values
const POWER_CTL_STANDBY: u8 = 0x00;
const POWER_CTL_MEASURE: u8 = 0x08;
const BW_RATE_100HZ: u8 = 0x0A;
const DATA_FORMAT_FULL_RES_2G: u8 = 0x08;

// ITG-3205 configuration values
const PWR_MGM_H_RESET: u8 = 0x80;
const PWR_MGM_CLK_PLL_X: u8 = 0x01;
const DLPF_FS_2000DPS_42HZ: u8 = 0x1B; // FS_SEL=3, DLPF_CFG=3
const SAMPLE_RATE_DIV_125HZ: u8 = 0x07; // 1 kHz / (7 + 1)
const WHO_AM_I_MASK: u8 = 0x7E;
const GYRO_STARTUP_MS: u32 = 50;

/// Sensor axis selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Axis {
    X,
    #[default]
    Y,
    Z,
}

/// Raw signed counts for the three axes
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawAxes {
    pub x: i16,
    pub y: i16,
    pub z: i16,
}

impl RawAxes {
    fn from_le(bytes: &[u8]) -> Self {
        Self {
            x: i16::from_le_bytes([bytes[0], bytes[1]]),
            y: i16::from_le_bytes([bytes[2], bytes[3]]),
            z: i16::from_le_bytes([bytes[4], bytes[5]]),
        }
    }

    fn from_be(bytes: &[u8]) -> Self {
        Self {
            x: i16::from_be_bytes([bytes[0], bytes[1]]),
            y: i16::from_be_bytes([bytes[2], bytes[3]]),
            z: i16::from_be_bytes([bytes[4], bytes[5]]),
        }
    }

    fn get(&self, axis: Axis) -> i16 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }
}

/// Three-axis reading in physical units
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Vector3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Vector3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn get(&self, axis: Axis) -> f64 {
        match axis {
            Axis::X => self.x,
            Axis::Y => self.y,
            Axis::Z => self.z,
        }
    }

    fn is_finite(&self) -> bool {
        self.x.is_finite() && self.y.is_finite() && self.z.is_finite()
    }
}

/// One accelerometer + gyroscope reading, produced fresh every tick
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ImuSample {
    /// Acceleration in g
    pub accel: Vector3,
    /// Angular rate in deg/s, zero-rate offset removed
    pub gyro: Vector3,
}

/// Degenerate or out-of-range sensor readings
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SensorFault {
    #[error("Accelerometer reported a zero gravity vector")]
    ZeroGravityVector,

    #[error("Non-finite {quantity} reading")]
    NonFinite { quantity: &'static str },

    #[error("Gyroscope saturated on {axis:?} axis (raw {raw})")]
    GyroSaturated { axis: Axis, raw: i16 },
}

/// Error types for the GY-85 driver
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ImuError {
    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error(
        "Init verification failed on device 0x{addr:02X} register 0x{reg:02X}: expected 0x{expected:02X}, read 0x{actual:02X}"
    )]
    Init {
        addr: u8,
        reg: u8,
        expected: u8,
        actual: u8,
    },

    #[error("Sensor fault: {0}")]
    SensorFault(#[from] SensorFault),
}

pub type Result<T> = std::result::Result<T, ImuError>;

/// Geometric pitch angle in degrees from a gravity vector
///
/// `pitch = atan2(-x, sqrt(y² + z²))`, so a flat board reads 0 and a board
/// with +X pointing down reads -90. A zero vector has no direction and is
/// reported as a fault instead of producing a meaningless angle.
pub fn calculate_pitch(
    accel_x: f64,
    accel_y: f64,
    accel_z: f64,
) -> std::result::Result<f64, SensorFault> {
    if !(accel_x.is_finite() && accel_y.is_finite() && accel_z.is_finite()) {
        return Err(SensorFault::NonFinite {
            quantity: "acceleration",
        });
    }
    if accel_x == 0.0 && accel_y == 0.0 && accel_z == 0.0 {
        return Err(SensorFault::ZeroGravityVector);
    }

    let horizontal = (accel_y * accel_y + accel_z * accel_z).sqrt();
    Ok((-accel_x).atan2(horizontal) * RAD_TO_DEG)
}

/// GY-85 driver; owns the register bus exclusively
pub struct Gy85<B> {
    bus: B,
    config: ImuConfig,
}

impl<B: RegisterBus> Gy85<B> {
    pub fn new(bus: B, config: ImuConfig) -> Self {
        Self { bus, config }
    }

    /// Bring both sensors up and verify their configuration
    ///
    /// A failed read-back means the device is absent, unresponsive or not
    /// the part we expect, and is reported as an init error.
    pub fn init(&mut self, delay: &mut impl DelayNs) -> Result<()> {
        info!(
            "Initializing GY-85 (accel 0x{:02X}, gyro 0x{:02X})",
            self.config.accel_addr, self.config.gyro_addr
        );
        self.init_accelerometer()?;
        self.init_gyroscope(delay)?;
        info!("GY-85 initialized");
        Ok(())
    }

    fn init_accelerometer(&mut self) -> Result<()> {
        let addr = self.config.accel_addr;
        self.verify(addr, AccelRegister::DeviceId as u8, ADXL345_DEVICE_ID, 0xFF)?;

        // Configuration registers may only change in standby
        self.bus
            .write_register(addr, AccelRegister::PowerCtl as u8, POWER_CTL_STANDBY)?;
        self.write_verified(addr, AccelRegister::BwRate as u8, BW_RATE_100HZ)?;
        self.write_verified(addr, AccelRegister::DataFormat as u8, DATA_FORMAT_FULL_RES_2G)?;
        self.write_verified(addr, AccelRegister::PowerCtl as u8, POWER_CTL_MEASURE)?;
        debug!("ADXL345 in measurement mode, full resolution ±2 g");
        Ok(())
    }

    fn init_gyroscope(&mut self, delay: &mut impl DelayNs) -> Result<()> {
        let addr = self.config.gyro_addr;
        self.verify(addr, GyroRegister::WhoAmI as u8, ITG3205_WHO_AM_I, WHO_AM_I_MASK)?;

        self.bus
            .write_register(addr, GyroRegister::PowerManagement as u8, PWR_MGM_H_RESET)?;
        delay.delay_ms(GYRO_STARTUP_MS);
        self.write_verified(addr, GyroRegister::PowerManagement as u8, PWR_MGM_CLK_PLL_X)?;
        self.write_verified(
            addr,
            GyroRegister::SampleRateDivider as u8,
            SAMPLE_RATE_DIV_125HZ,
        )?;
        self.write_verified(addr, GyroRegister::DlpfFs as u8, DLPF_FS_2000DPS_42HZ)?;
        debug!("ITG-3205 running at ±2000 °/s, 42 Hz low-pass");
        Ok(())
    }

    fn write_verified(&mut self, addr: u8, reg: u8, value: u8) -> Result<()> {
        self.bus.write_register(addr, reg, value)?;
        self.verify(addr, reg, value, 0xFF)
    }

    fn verify(&mut self, addr: u8, reg: u8, expected: u8, mask: u8) -> Result<()> {
        let actual = self.bus.read_register(addr, reg)?;
        if actual & mask != expected & mask {
            warn!(
                "Device 0x{:02X} register 0x{:02X}: expected 0x{:02X}, read 0x{:02X}",
                addr, reg, expected, actual
            );
            return Err(ImuError::Init {
                addr,
                reg,
                expected,
                actual,
            });
        }
        Ok(())
    }

    pub fn read_accelerometer_raw(&mut self) -> Result<RawAxes> {
        let addr = self.config.accel_addr;
        let bytes = self.read_block(addr, AccelRegister::DataX0 as u8, 6)?;
        Ok(RawAxes::from_le(&bytes))
    }

    /// Acceleration in g
    pub fn read_accelerometer(&mut self) -> Result<Vector3> {
        let raw = self.read_accelerometer_raw()?;
        Ok(Vector3::new(
            raw.x as f64 * ACCEL_G_PER_LSB,
            raw.y as f64 * ACCEL_G_PER_LSB,
            raw.z as f64 * ACCEL_G_PER_LSB,
        ))
    }

    pub fn read_gyroscope_raw(&mut self) -> Result<RawAxes> {
        let addr = self.config.gyro_addr;
        let bytes = self.read_block(addr, GyroRegister::GyroXoutH as u8, 6)?;
        Ok(RawAxes::from_be(&bytes))
    }

    /// Angular rate in deg/s with the calibrated zero-rate offset removed
    pub fn read_gyroscope(&mut self) -> Result<Vector3> {
        let raw = self.read_gyroscope_raw()?;
        for axis in [Axis::X, Axis::Y, Axis::Z] {
            let value = raw.get(axis);
            if value == i16::MAX || value == i16::MIN {
                return Err(SensorFault::GyroSaturated { axis, raw: value }.into());
            }
        }

        let offset = self.config.gyro_offset_dps;
        Ok(Vector3::new(
            raw.x as f64 / GYRO_LSB_PER_DPS - offset[0],
            raw.y as f64 / GYRO_LSB_PER_DPS - offset[1],
            raw.z as f64 / GYRO_LSB_PER_DPS - offset[2],
        ))
    }

    pub fn read_sample(&mut self) -> Result<ImuSample> {
        let accel = self.read_accelerometer()?;
        let gyro = self.read_gyroscope()?;
        if !gyro.is_finite() {
            return Err(SensorFault::NonFinite {
                quantity: "angular rate",
            }
            .into());
        }
        Ok(ImuSample { accel, gyro })
    }

    /// Accelerometer pitch in degrees, mounting trim applied
    pub fn pitch(&self, sample: &ImuSample) -> Result<f64> {
        let pitch = calculate_pitch(sample.accel.x, sample.accel.y, sample.accel.z)?;
        Ok(pitch + self.config.pitch_trim_deg)
    }

    /// Angular rate about the pitch axis in deg/s
    pub fn pitch_rate(&self, sample: &ImuSample) -> f64 {
        let rate = sample.gyro.get(self.config.pitch_rate_axis);
        if self.config.invert_pitch_rate { -rate } else { rate }
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn release(self) -> B {
        self.bus
    }

    fn read_block(&mut self, addr: u8, reg: u8, count: usize) -> Result<Vec<u8>> {
        let bytes = self.bus.read_registers(addr, reg, count)?;
        if bytes.len() < count {
            return Err(BusError::ShortRead {
                addr,
                expected: count,
                got: bytes.len(),
            }
            .into());
        }
        Ok(bytes)
    }
}

/// Preload a mock bus with the identification registers of a healthy GY-85
pub fn attach_gy85(bus: &mut super::mock::MockBus, config: &ImuConfig) {
    bus.set_register(
        config.accel_addr,
        AccelRegister::DeviceId as u8,
        ADXL345_DEVICE_ID,
    );
    bus.make_read_only(config.accel_addr, AccelRegister::DeviceId as u8);
    bus.set_register(config.gyro_addr, GyroRegister::WhoAmI as u8, ITG3205_WHO_AM_I);
    bus.make_read_only(config.gyro_addr, GyroRegister::WhoAmI as u8);
}
