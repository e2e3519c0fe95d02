// Single-axis pitch stabilization
//
// GY-85 IMU -> Kalman filter -> PID controller -> PWM actuator, run at a
// fixed rate by the control loop in `runtime`.

pub mod actuator;
pub mod config;
pub mod control;
pub mod imu;
pub mod messages;
pub mod runtime;
pub mod sim;
