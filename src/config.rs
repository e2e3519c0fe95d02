// Loop timing, device addresses and tuning
//
// The constants are the defaults; a JSON file can override any field.
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::control::kalman::MAX_DT;
use crate::imu::bus::MAX_7BIT_ADDR;
use crate::imu::gy85::{Axis, GY85_ADDR, ITG3205_ADDR};

// Control loop frequency (20 ms period)
pub const LOOP_HZ: u64 = 50;

// Largest measured dt handed to the filter and controller; longer gaps are clamped
pub const MAX_TICK_DT: f64 = 0.1;

// Desired pitch in degrees
pub const SETPOINT_DEG: f64 = 0.0;

// Kalman filter tuning
pub const Q_ANGLE: f64 = 0.001;
pub const Q_BIAS: f64 = 0.003;
pub const R_MEASURE: f64 = 0.03;
// Initial covariance prior (diagonal)
pub const P0_ANGLE: f64 = 1.0;
pub const P0_BIAS: f64 = 1.0;

// PID tuning
pub const KP: f64 = 1.0;
pub const KI: f64 = 0.1;
pub const KD: f64 = 0.05;
pub const OUTPUT_LIMIT: f64 = 25.0;

// Servo PWM: 50 Hz carrier, 1 ms..2 ms pulse, 1.5 ms neutral
pub const PWM_FREQUENCY_HZ: u32 = 50;
pub const PWM_CHANNEL: u8 = 0;
pub const DUTY_MIN_PCT: f64 = 5.0;
pub const DUTY_MAX_PCT: f64 = 10.0;
pub const DUTY_NEUTRAL_PCT: f64 = 7.5;

/// Error types for configuration loading
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Full runtime configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub control: ControlConfig,
    pub imu: ImuConfig,
    pub kalman: KalmanConfig,
    pub pid: PidConfig,
    pub actuator: ActuatorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ControlConfig {
    pub loop_hz: u64,
    pub max_dt_s: f64,
    pub setpoint_deg: f64,
}

impl ControlConfig {
    pub fn period(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.loop_hz as f64)
    }
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            loop_hz: LOOP_HZ,
            max_dt_s: MAX_TICK_DT,
            setpoint_deg: SETPOINT_DEG,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ImuConfig {
    pub accel_addr: u8,
    pub gyro_addr: u8,
    /// Zero-rate gyro offset per axis in deg/s, from an external calibration
    pub gyro_offset_dps: [f64; 3],
    pub pitch_rate_axis: Axis,
    pub invert_pitch_rate: bool,
    /// Mounting trim added to the accelerometer pitch
    pub pitch_trim_deg: f64,
}

impl Default for ImuConfig {
    fn default() -> Self {
        Self {
            accel_addr: GY85_ADDR,
            gyro_addr: ITG3205_ADDR,
            gyro_offset_dps: [0.0; 3],
            pitch_rate_axis: Axis::Y,
            invert_pitch_rate: false,
            pitch_trim_deg: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KalmanConfig {
    pub q_angle: f64,
    pub q_bias: f64,
    pub r_measure: f64,
    /// Variance of the seeded angle (deg²)
    pub initial_angle_variance: f64,
    /// Variance of the zero initial bias ((deg/s)²)
    pub initial_bias_variance: f64,
}

impl Default for KalmanConfig {
    fn default() -> Self {
        Self {
            q_angle: Q_ANGLE,
            q_bias: Q_BIAS,
            r_measure: R_MEASURE,
            initial_angle_variance: P0_ANGLE,
            initial_bias_variance: P0_BIAS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PidConfig {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub output_min: f64,
    pub output_max: f64,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            kp: KP,
            ki: KI,
            kd: KD,
            output_min: -OUTPUT_LIMIT,
            output_max: OUTPUT_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ActuatorConfig {
    pub frequency_hz: u32,
    pub channel: u8,
    /// Duty (percent of period) commanded at `output_min`
    pub duty_min_pct: f64,
    /// Duty (percent of period) commanded at `output_max`
    pub duty_max_pct: f64,
    /// Safe duty used on fault and shutdown
    pub neutral_pct: f64,
}

impl Default for ActuatorConfig {
    fn default() -> Self {
        Self {
            frequency_hz: PWM_FREQUENCY_HZ,
            channel: PWM_CHANNEL,
            duty_min_pct: DUTY_MIN_PCT,
            duty_max_pct: DUTY_MAX_PCT,
            neutral_pct: DUTY_NEUTRAL_PCT,
        }
    }
}

impl Config {
    /// Load and validate a JSON config; missing fields keep their defaults
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: String| Err(ConfigError::Invalid(msg));

        let c = &self.control;
        if c.loop_hz == 0 {
            return invalid("control.loop_hz must be > 0".into());
        }
        if c.period().is_zero() {
            return invalid(format!("control.loop_hz {} is too high", c.loop_hz));
        }
        if !(c.max_dt_s > 0.0 && c.max_dt_s <= MAX_DT) {
            return invalid(format!("control.max_dt_s must be in (0, {}]", MAX_DT));
        }
        if c.period().as_secs_f64() > c.max_dt_s {
            return invalid("control.max_dt_s is shorter than the loop period".into());
        }
        if !c.setpoint_deg.is_finite() {
            return invalid("control.setpoint_deg must be finite".into());
        }

        let imu = &self.imu;
        for (name, addr) in [("accel_addr", imu.accel_addr), ("gyro_addr", imu.gyro_addr)] {
            if addr > MAX_7BIT_ADDR {
                return invalid(format!("imu.{} 0x{:02X} is not a 7-bit address", name, addr));
            }
        }
        if imu.accel_addr == imu.gyro_addr {
            return invalid("imu.accel_addr and imu.gyro_addr must differ".into());
        }
        if imu.gyro_offset_dps.iter().any(|v| !v.is_finite()) || !imu.pitch_trim_deg.is_finite()
        {
            return invalid("imu offsets must be finite".into());
        }

        let k = &self.kalman;
        for (name, value) in [
            ("q_angle", k.q_angle),
            ("q_bias", k.q_bias),
            ("r_measure", k.r_measure),
        ] {
            if !(value.is_finite() && value > 0.0) {
                return invalid(format!("kalman.{} must be > 0", name));
            }
        }
        for (name, value) in [
            ("initial_angle_variance", k.initial_angle_variance),
            ("initial_bias_variance", k.initial_bias_variance),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return invalid(format!("kalman.{} must be >= 0", name));
            }
        }

        let p = &self.pid;
        if [p.kp, p.ki, p.kd].iter().any(|g| !g.is_finite()) {
            return invalid("pid gains must be finite".into());
        }
        if !(p.output_min.is_finite() && p.output_max.is_finite() && p.output_min < p.output_max)
        {
            return invalid("pid.output_min must be below pid.output_max".into());
        }

        let a = &self.actuator;
        if a.frequency_hz == 0 {
            return invalid("actuator.frequency_hz must be > 0".into());
        }
        let in_range = |pct: f64| (0.0..=100.0).contains(&pct);
        if !(in_range(a.duty_min_pct) && in_range(a.duty_max_pct) && in_range(a.neutral_pct)) {
            return invalid("actuator duty percentages must be within 0..=100".into());
        }
        if a.duty_min_pct == a.duty_max_pct {
            return invalid("actuator duty window is empty".into());
        }
        let (lo, hi) = if a.duty_min_pct < a.duty_max_pct {
            (a.duty_min_pct, a.duty_max_pct)
        } else {
            (a.duty_max_pct, a.duty_min_pct)
        };
        if !(lo..=hi).contains(&a.neutral_pct) {
            return invalid("actuator.neutral_pct must lie inside the duty window".into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.control.period(), Duration::from_millis(20));
        assert_eq!(config.imu.accel_addr, 0x53);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = Config::from_json(
            r#"{ "pid": { "kp": 2.5 }, "imu": { "pitch_rate_axis": "x", "pitch_trim_deg": 3.0 } }"#,
        )
        .unwrap();

        assert_eq!(config.pid.kp, 2.5);
        assert_eq!(config.pid.ki, KI);
        assert_eq!(config.imu.pitch_rate_axis, Axis::X);
        assert_eq!(config.imu.pitch_trim_deg, 3.0);
        assert_eq!(config.kalman, KalmanConfig::default());
    }

    #[test]
    fn test_unknown_field_is_rejected() {
        let err = Config::from_json(r#"{ "pid": { "kq": 1.0 } }"#).unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)), "got {:?}", err);
    }

    #[test]
    fn test_invalid_values_are_rejected() {
        let cases = [
            r#"{ "kalman": { "r_measure": 0.0 } }"#,
            r#"{ "pid": { "output_min": 5.0, "output_max": -5.0 } }"#,
            r#"{ "control": { "max_dt_s": 2.0 } }"#,
            r#"{ "control": { "loop_hz": 0 } }"#,
            r#"{ "control": { "loop_hz": 3000000000 } }"#,
            r#"{ "kalman": { "initial_bias_variance": -1.0 } }"#,
            r#"{ "imu": { "accel_addr": 166 } }"#,
            r#"{ "actuator": { "neutral_pct": 12.0 } }"#,
        ];
        for case in cases {
            assert!(
                matches!(Config::from_json(case), Err(ConfigError::Invalid(_))),
                "accepted {}",
                case
            );
        }
    }

    #[test]
    fn test_missing_file_reports_path() {
        let err = Config::load("/nonexistent/pitch.json").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/pitch.json"));
    }
}
