// Inertial sensing for the pitch axis
//
// Provides:
// - Register bus abstraction with an embedded-hal I2C implementation
// - In-memory mock bus for tests and simulation
// - GY-85 (ADXL345 + ITG-3205) driver and pitch geometry

pub mod bus;
pub mod gy85;
pub mod mock;

pub use bus::{BusError, I2cBus, RegisterBus, StdDelay};
pub use gy85::{
    calculate_pitch, Axis, Gy85, ImuError, ImuSample, SensorFault, Vector3, GY85_ADDR,
    ITG3205_ADDR,
};
pub use mock::MockBus;
