// PWM actuator output
//
// Maps the controller's output range linearly onto a duty window of a
// fixed-frequency PWM channel (by default a 1..2 ms servo pulse at 50 Hz).

use embedded_hal::pwm::{Error as _, SetDutyCycle};
use tracing::{debug, info};

use crate::config::ActuatorConfig;

/// Error types for the actuator output
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ActuatorError {
    #[error("Command {value} outside configured range [{min}, {max}]")]
    OutOfRange { value: f64, min: f64, max: f64 },

    #[error("Input range [{min}, {max}] is empty or not finite")]
    InvalidRange { min: f64, max: f64 },

    #[error("Duty {0}% is not a valid fraction of the period")]
    InvalidDuty(f64),

    #[error("PWM output used before it was configured")]
    NotConfigured,

    #[error("PWM runs at {actual} Hz, {requested} Hz requested")]
    FrequencyMismatch { requested: u32, actual: u32 },

    #[error("PWM channel {0} is not available")]
    InvalidChannel(u8),

    #[error("Duty {duty} exceeds full scale {max}")]
    DutyOverflow { duty: u32, max: u32 },

    #[error("PWM error: {0}")]
    Pwm(String),
}

pub type Result<T> = std::result::Result<T, ActuatorError>;

/// A frequency-configured PWM channel with duty domain `[0, max_duty]`
pub trait PwmOutput {
    fn configure(&mut self, frequency_hz: u32, channel: u8) -> Result<()>;

    /// Full-scale duty count (100 %)
    fn max_duty(&self) -> u32;

    fn write_duty(&mut self, duty: u32) -> Result<()>;
}

/// PID output → PWM duty mapping plus neutral handling
pub struct Actuator<P> {
    pwm: P,
    config: ActuatorConfig,
    input_min: f64,
    input_max: f64,
    configured: bool,
    last_duty: Option<u32>,
}

impl<P: PwmOutput> Actuator<P> {
    /// `input_min..=input_max` is the controller output range mapped onto the duty window
    pub fn new(pwm: P, config: ActuatorConfig, input_min: f64, input_max: f64) -> Result<Self> {
        if !(input_min.is_finite() && input_max.is_finite() && input_min < input_max) {
            return Err(ActuatorError::InvalidRange {
                min: input_min,
                max: input_max,
            });
        }
        Ok(Self {
            pwm,
            config,
            input_min,
            input_max,
            configured: false,
            last_duty: None,
        })
    }

    /// Configure the channel at the carrier frequency
    pub fn init(&mut self) -> Result<()> {
        info!(
            "Configuring PWM channel {} at {} Hz",
            self.config.channel, self.config.frequency_hz
        );
        self.pwm
            .configure(self.config.frequency_hz, self.config.channel)?;
        self.configured = true;
        Ok(())
    }

    /// Commit a controller output to the hardware, returning the duty count written
    ///
    /// Values outside the configured input range are rejected; upstream
    /// clamping should make that impossible.
    pub fn set_duty(&mut self, value: f64) -> Result<u32> {
        if !(value >= self.input_min && value <= self.input_max) {
            return Err(ActuatorError::OutOfRange {
                value,
                min: self.input_min,
                max: self.input_max,
            });
        }

        let fraction = (value - self.input_min) / (self.input_max - self.input_min);
        let pct = self.config.duty_min_pct
            + fraction * (self.config.duty_max_pct - self.config.duty_min_pct);
        self.write_pct(pct)
    }

    /// Drive the output to its safe neutral duty
    pub fn set_neutral(&mut self) -> Result<u32> {
        debug!("Commanding neutral duty {}%", self.config.neutral_pct);
        self.write_pct(self.config.neutral_pct)
    }

    fn write_pct(&mut self, pct: f64) -> Result<u32> {
        if !self.configured {
            return Err(ActuatorError::NotConfigured);
        }
        if !(0.0..=100.0).contains(&pct) {
            return Err(ActuatorError::InvalidDuty(pct));
        }
        let max = self.pwm.max_duty();
        let duty = ((pct / 100.0) * max as f64).round().clamp(0.0, max as f64) as u32;
        self.pwm.write_duty(duty)?;
        self.last_duty = Some(duty);
        Ok(duty)
    }

    /// Convert a duty count back to percent of the period
    pub fn duty_pct(&self, duty: u32) -> f64 {
        match self.pwm.max_duty() {
            0 => 0.0,
            max => duty as f64 * 100.0 / max as f64,
        }
    }

    pub fn is_configured(&self) -> bool {
        self.configured
    }

    pub fn last_duty(&self) -> Option<u32> {
        self.last_duty
    }

    pub fn pwm(&self) -> &P {
        &self.pwm
    }

    #[cfg(test)]
    pub(crate) fn pwm_mut(&mut self) -> &mut P {
        &mut self.pwm
    }
}

/// `PwmOutput` for any `embedded-hal` PWM channel
///
/// The HAL fixes the carrier frequency when the channel is created, so
/// `configure` only checks that the request matches it.
pub struct HalPwm<P> {
    pwm: P,
    frequency_hz: u32,
    channel: u8,
}

impl<P: SetDutyCycle> HalPwm<P> {
    pub fn new(pwm: P, frequency_hz: u32, channel: u8) -> Self {
        Self {
            pwm,
            frequency_hz,
            channel,
        }
    }

    pub fn release(self) -> P {
        self.pwm
    }
}

impl<P: SetDutyCycle> PwmOutput for HalPwm<P> {
    fn configure(&mut self, frequency_hz: u32, channel: u8) -> Result<()> {
        if channel != self.channel {
            return Err(ActuatorError::InvalidChannel(channel));
        }
        if frequency_hz != self.frequency_hz {
            return Err(ActuatorError::FrequencyMismatch {
                requested: frequency_hz,
                actual: self.frequency_hz,
            });
        }
        Ok(())
    }

    fn max_duty(&self) -> u32 {
        self.pwm.max_duty_cycle().into()
    }

    fn write_duty(&mut self, duty: u32) -> Result<()> {
        let max = self.max_duty();
        let duty = u16::try_from(duty)
            .ok()
            .filter(|&d| u32::from(d) <= max)
            .ok_or(ActuatorError::DutyOverflow { duty, max })?;
        self.pwm
            .set_duty_cycle(duty)
            .map_err(|e| ActuatorError::Pwm(format!("{:?}", e.kind())))
    }
}

/// PWM double that records every duty written
#[cfg(test)]
#[derive(Debug, Default)]
pub(crate) struct RecordingPwm {
    pub configured: Option<(u32, u8)>,
    pub writes: Vec<u32>,
    pub fail_writes: bool,
}

#[cfg(test)]
impl PwmOutput for RecordingPwm {
    fn configure(&mut self, frequency_hz: u32, channel: u8) -> Result<()> {
        self.configured = Some((frequency_hz, channel));
        Ok(())
    }

    fn max_duty(&self) -> u32 {
        u16::MAX as u32 + 1
    }

    fn write_duty(&mut self, duty: u32) -> Result<()> {
        if self.fail_writes {
            return Err(ActuatorError::Pwm("stuck".into()));
        }
        self.writes.push(duty);
        Ok(())
    }
}
