// Simulated single-axis rig
//
// A body pivoting about its pitch axis whose angular rate follows the
// actuator command. SimBus serves GY-85 register contents derived from the
// body state and SimPwm turns duty writes back into a command, so the whole
// loop can run on a host without hardware.

use std::cell::RefCell;
use std::rc::Rc;
use tokio::time::Instant;
use tracing::debug;

use crate::actuator::{ActuatorError, PwmOutput};
use crate::config::{ActuatorConfig, Config, ImuConfig};
use crate::imu::bus::{self, RegisterBus};
use crate::imu::gy85::{
    attach_gy85, AccelRegister, GyroRegister, ACCEL_G_PER_LSB, GYRO_LSB_PER_DPS,
};
use crate::imu::{Axis, MockBus};

// 1 µs duty resolution at 50 Hz
const SIM_MAX_DUTY: u32 = 20_000;

/// Rigid-body pitch dynamics
#[derive(Debug, Clone)]
pub struct Plant {
    pub pitch_deg: f64,
    pub rate_dps: f64,
    /// Normalized actuator command in [-1, 1]
    pub command: f64,
    /// Pitch rate produced by a full-scale command
    pub authority_dps: f64,
    /// Constant external rate added on top of the actuator
    pub disturbance_dps: f64,
    /// Zero-rate error reported by the simulated gyroscope
    pub gyro_bias_dps: f64,
}

impl Plant {
    pub fn new(pitch_deg: f64) -> Self {
        Self {
            pitch_deg,
            rate_dps: 0.0,
            command: 0.0,
            authority_dps: 90.0,
            disturbance_dps: 0.0,
            gyro_bias_dps: 0.0,
        }
    }

    /// Integrate the body forward by `dt` seconds
    pub fn advance(&mut self, dt: f64) {
        self.rate_dps = self.authority_dps * self.command + self.disturbance_dps;
        self.pitch_deg = (self.pitch_deg + self.rate_dps * dt).clamp(-90.0, 90.0);
    }
}

pub type SharedPlant = Rc<RefCell<Plant>>;

/// Register bus backed by the simulated plant
///
/// Each accelerometer data read advances the plant by the time elapsed
/// since the previous one and refreshes both sensors' data registers.
pub struct SimBus {
    registers: MockBus,
    plant: SharedPlant,
    imu: ImuConfig,
    last_sample: Option<Instant>,
}

impl SimBus {
    pub fn new(plant: SharedPlant, imu: ImuConfig) -> Self {
        let mut registers = MockBus::new();
        attach_gy85(&mut registers, &imu);
        let mut sim = Self {
            registers,
            plant,
            imu,
            last_sample: None,
        };
        sim.refresh();
        sim
    }

    fn refresh(&mut self) {
        let plant = self.plant.borrow();
        let rad = plant.pitch_deg.to_radians();

        let accel = [-rad.sin(), 0.0, rad.cos()].map(|g| to_counts(g / ACCEL_G_PER_LSB));
        let mut bytes = Vec::with_capacity(6);
        for value in accel {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        self.registers
            .set_registers(self.imu.accel_addr, AccelRegister::DataX0 as u8, &bytes);

        let mut rate = plant.rate_dps + plant.gyro_bias_dps;
        if self.imu.invert_pitch_rate {
            rate = -rate;
        }
        let counts = to_counts(rate * GYRO_LSB_PER_DPS);
        let mut gyro = [0i16; 3];
        match self.imu.pitch_rate_axis {
            Axis::X => gyro[0] = counts,
            Axis::Y => gyro[1] = counts,
            Axis::Z => gyro[2] = counts,
        }
        let mut bytes = Vec::with_capacity(6);
        for value in gyro {
            bytes.extend_from_slice(&value.to_be_bytes());
        }
        self.registers
            .set_registers(self.imu.gyro_addr, GyroRegister::GyroXoutH as u8, &bytes);

        // Only the register contents matter here
        self.registers.clear_transactions();
    }

    /// Register file underneath, for fault injection
    pub fn registers_mut(&mut self) -> &mut MockBus {
        &mut self.registers
    }
}

// Saturating conversion that stays clear of the gyro's saturation codes
fn to_counts(value: f64) -> i16 {
    value
        .round()
        .clamp(i16::MIN as f64 + 1.0, i16::MAX as f64 - 1.0) as i16
}

impl RegisterBus for SimBus {
    fn write_register(&mut self, addr: u8, reg: u8, value: u8) -> bus::Result<()> {
        self.registers.write_register(addr, reg, value)
    }

    fn read_registers(&mut self, addr: u8, reg: u8, count: usize) -> bus::Result<Vec<u8>> {
        if addr == self.imu.accel_addr && reg == AccelRegister::DataX0 as u8 {
            let now = Instant::now();
            if let Some(previous) = self.last_sample.replace(now) {
                let dt = now.saturating_duration_since(previous).as_secs_f64();
                self.plant.borrow_mut().advance(dt);
            }
            self.refresh();
        }
        self.registers.read_registers(addr, reg, count)
    }
}

/// PWM channel that drives the plant command
pub struct SimPwm {
    plant: SharedPlant,
    config: ActuatorConfig,
    configured: Option<(u32, u8)>,
}

impl SimPwm {
    pub fn new(plant: SharedPlant, config: ActuatorConfig) -> Self {
        Self {
            plant,
            config,
            configured: None,
        }
    }
}

impl PwmOutput for SimPwm {
    fn configure(&mut self, frequency_hz: u32, channel: u8) -> Result<(), ActuatorError> {
        debug!("Sim PWM channel {} at {} Hz", channel, frequency_hz);
        self.configured = Some((frequency_hz, channel));
        Ok(())
    }

    fn max_duty(&self) -> u32 {
        SIM_MAX_DUTY
    }

    fn write_duty(&mut self, duty: u32) -> Result<(), ActuatorError> {
        if self.configured.is_none() {
            return Err(ActuatorError::NotConfigured);
        }
        if duty > SIM_MAX_DUTY {
            return Err(ActuatorError::DutyOverflow {
                duty,
                max: SIM_MAX_DUTY,
            });
        }

        let pct = duty as f64 * 100.0 / SIM_MAX_DUTY as f64;
        let c = &self.config;
        // Command sign follows the duty window direction around neutral
        let span = if pct >= c.neutral_pct {
            c.duty_max_pct - c.neutral_pct
        } else {
            c.neutral_pct - c.duty_min_pct
        };
        let command = if span == 0.0 {
            0.0
        } else {
            (pct - c.neutral_pct) / span.abs()
        };
        self.plant.borrow_mut().command = command.clamp(-1.0, 1.0);
        Ok(())
    }
}

/// Bus, PWM and the plant they share, wired for `config`
pub fn rig(config: &Config, plant: Plant) -> (SimBus, SimPwm, SharedPlant) {
    let plant = Rc::new(RefCell::new(plant));
    let bus = SimBus::new(plant.clone(), config.imu.clone());
    let pwm = SimPwm::new(plant.clone(), config.actuator.clone());
    (bus, pwm, plant)
}
