// Records the control loop hands to its observers

use serde::{Deserialize, Serialize};

/// Per-tick values published to whoever supervises the loop
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Telemetry {
    pub tick: u64,
    /// Measured seconds since the previous tick
    pub dt: f64,
    /// Accelerometer pitch before filtering (degrees)
    pub raw_pitch: f64,
    /// Filtered pitch (degrees)
    pub pitch_estimate: f64,
    /// Estimated gyro bias (deg/s)
    pub gyro_bias: f64,
    pub pid_output: f64,
    /// Duty written to the PWM channel, percent of the period
    pub duty_pct: f64,
}

/// Control loop lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Uninitialized,
    Initializing,
    Running,
    Faulted,
    Stopped,
}
