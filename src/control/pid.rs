// PID controller with output clamping and clamp-on-saturation anti-windup
//
// The integral is bounded so that ki * integral alone can never push the
// output past its limits; recovery after saturation therefore takes a
// bounded number of ticks regardless of how long the error persisted.

/// Time steps below this are treated as "no time has passed"
pub const DT_EPSILON: f64 = 1e-6;

/// PID gains
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Gains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

/// PID controller state and tuning
#[derive(Debug, Clone, PartialEq)]
pub struct PidController {
    gains: Gains,

    output_min: f64,
    output_max: f64,

    integral: f64,
    previous_error: f64,
    previous_output: f64,
}

impl PidController {
    /// Create a controller with zeroed integral and error history
    ///
    /// Bounds given in the wrong order are swapped.
    pub fn new(kp: f64, ki: f64, kd: f64, output_min: f64, output_max: f64) -> Self {
        Self {
            gains: Gains { kp, ki, kd },
            output_min: output_min.min(output_max),
            output_max: output_max.max(output_min),
            integral: 0.0,
            previous_error: 0.0,
            previous_output: 0.0,
        }
    }

    /// Compute the clamped correction for one tick
    ///
    /// A sub-epsilon (or non-finite) `dt` leaves the state untouched and
    /// returns the previous output.
    pub fn update(&mut self, setpoint: f64, measured_value: f64, dt: f64) -> f64 {
        if !(dt >= DT_EPSILON) || !dt.is_finite() {
            return self.previous_output;
        }

        let Gains { kp, ki, kd } = self.gains;
        let error = setpoint - measured_value;

        self.integral += error * dt;
        self.integral = self.clamp_integral(self.integral);

        let derivative = (error - self.previous_error) / dt;

        let raw = kp * error + ki * self.integral + kd * derivative;
        let output = raw.max(self.output_min).min(self.output_max);

        self.previous_error = error;
        self.previous_output = output;
        output
    }

    /// Bound the integral so `ki * integral` stays inside the output range
    fn clamp_integral(&self, integral: f64) -> f64 {
        let ki = self.gains.ki;
        if ki == 0.0 {
            // The term contributes nothing; keep it from growing without bound
            return 0.0;
        }
        let a = self.output_min / ki;
        let b = self.output_max / ki;
        integral.max(a.min(b)).min(a.max(b))
    }

    /// Clear integral and derivative history
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.previous_error = 0.0;
        self.previous_output = 0.0;
    }

    pub fn integral(&self) -> f64 {
        self.integral
    }

    pub fn previous_output(&self) -> f64 {
        self.previous_output
    }
}
