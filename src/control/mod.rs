// Estimation and control for the pitch axis
//
// Provides:
// - Two-state Kalman filter (angle + gyro bias)
// - PID controller with anti-windup and output clamping

pub mod kalman;
pub mod pid;

pub use kalman::{FilterError, KalmanFilter};
pub use pid::{Gains, PidController};
