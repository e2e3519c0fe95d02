// Single-axis Kalman filter
//
// State is [angle, gyro_bias]. The gyro rate drives the prediction and the
// accelerometer angle corrects it. All arithmetic is f64.

/// Largest time step the filter accepts, in seconds
pub const MAX_DT: f64 = 1.0;

/// Error types for the Kalman filter
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum FilterError {
    #[error("Time step {dt} s is outside (0, {max}] s")]
    InvalidTimestep { dt: f64, max: f64 },

    #[error("Non-finite filter input: angle={angle}, rate={rate}")]
    NonFiniteInput { angle: f64, rate: f64 },

    #[error("Noise variance {name} must be finite and > 0, got {value}")]
    InvalidNoise { name: &'static str, value: f64 },
}

pub type Result<T> = std::result::Result<T, FilterError>;

/// Kalman filter fusing accelerometer angle and gyro rate
#[derive(Debug, Clone)]
pub struct KalmanFilter {
    /// Process noise variance of the angle
    q_angle: f64,
    /// Process noise variance of the gyro bias
    q_bias: f64,
    /// Measurement noise variance of the accelerometer angle
    r_measure: f64,

    angle: f64,
    bias: f64,

    /// Error covariance
    p: [[f64; 2]; 2],
}

impl KalmanFilter {
    /// Create a filter at `initial_angle` with zero bias and identity covariance
    pub fn new(
        initial_angle: f64,
        process_noise_angle: f64,
        process_noise_bias: f64,
        measurement_noise: f64,
    ) -> Result<Self> {
        check_noise("process_noise_angle", process_noise_angle)?;
        check_noise("process_noise_bias", process_noise_bias)?;
        check_noise("measurement_noise", measurement_noise)?;

        Ok(Self {
            q_angle: process_noise_angle,
            q_bias: process_noise_bias,
            r_measure: measurement_noise,
            angle: initial_angle,
            bias: 0.0,
            p: [[1.0, 0.0], [0.0, 1.0]],
        })
    }

    /// Replace the initial covariance prior (diagonal variances)
    pub fn with_initial_variance(mut self, angle_variance: f64, bias_variance: f64) -> Self {
        self.p = [[angle_variance.max(0.0), 0.0], [0.0, bias_variance.max(0.0)]];
        self
    }

    /// Run one predict/correct cycle and return the filtered angle
    ///
    /// `accel_angle` in degrees, `gyro_rate` in deg/s, `dt` the measured
    /// time since the previous update in seconds.
    pub fn update(&mut self, accel_angle: f64, gyro_rate: f64, dt: f64) -> Result<f64> {
        if !(dt > 0.0 && dt <= MAX_DT) {
            return Err(FilterError::InvalidTimestep { dt, max: MAX_DT });
        }
        if !accel_angle.is_finite() || !gyro_rate.is_finite() {
            return Err(FilterError::NonFiniteInput {
                angle: accel_angle,
                rate: gyro_rate,
            });
        }

        // Predict
        let rate = gyro_rate - self.bias;
        self.angle += dt * rate;

        let p = &mut self.p;
        p[0][0] += dt * (dt * p[1][1] - p[0][1] - p[1][0] + self.q_angle);
        p[0][1] -= dt * p[1][1];
        p[1][0] -= dt * p[1][1];
        p[1][1] += self.q_bias * dt;

        // Correct
        let s = p[0][0] + self.r_measure;
        let k = [p[0][0] / s, p[1][0] / s];

        let innovation = accel_angle - self.angle;
        self.angle += k[0] * innovation;
        self.bias += k[1] * innovation;

        let p00 = p[0][0];
        let p01 = p[0][1];
        p[0][0] -= k[0] * p00;
        p[0][1] -= k[0] * p01;
        p[1][0] -= k[1] * p00;
        p[1][1] -= k[1] * p01;

        self.condition_covariance();
        Ok(self.angle)
    }

    /// Keep P symmetric positive semi-definite against rounding drift
    fn condition_covariance(&mut self) {
        let p = &mut self.p;
        p[0][0] = p[0][0].max(0.0);
        p[1][1] = p[1][1].max(0.0);

        let bound = (p[0][0] * p[1][1]).sqrt();
        let off = ((p[0][1] + p[1][0]) * 0.5).clamp(-bound, bound);
        p[0][1] = off;
        p[1][0] = off;
    }

    pub fn angle(&self) -> f64 {
        self.angle
    }

    /// Estimated gyro bias in deg/s
    pub fn bias(&self) -> f64 {
        self.bias
    }

    pub fn covariance(&self) -> [[f64; 2]; 2] {
        self.p
    }
}

fn check_noise(name: &'static str, value: f64) -> Result<()> {
    if !(value.is_finite() && value > 0.0) {
        return Err(FilterError::InvalidNoise { name, value });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(initial: f64) -> KalmanFilter {
        KalmanFilter::new(initial, 0.001, 0.003, 0.03).unwrap()
    }

    #[test]
    fn test_converges_to_constant_angle() {
        let mut kf = filter(0.0);
        for _ in 0..2000 {
            kf.update(12.5, 0.0, 0.01).unwrap();
        }
        assert!((kf.angle() - 12.5).abs() < 1e-6, "angle {}", kf.angle());
        assert!(kf.bias().abs() < 1e-6, "bias {}", kf.bias());
    }

    #[test]
    fn test_ten_steps_approach_monotonically() {
        let mut kf = filter(0.0);
        let mut previous = kf.angle();
        for step in 0..10 {
            let angle = kf.update(5.0, 0.0, 0.02).unwrap();
            assert!(
                angle >= previous,
                "step {}: angle decreased from {} to {}",
                step,
                previous,
                angle
            );
            assert!(angle <= 5.05, "step {}: overshoot to {}", step, angle);
            previous = angle;
        }
        assert!((previous - 5.0).abs() < 0.05, "final angle {}", previous);
    }

    #[test]
    fn test_covariance_stays_symmetric_and_non_negative() {
        let mut kf = filter(0.0);
        // Deterministic, bounded pseudo-noise on both inputs with varying dt
        for i in 0..20_000u32 {
            let t = i as f64;
            let angle = 10.0 * (t * 0.01).sin() + 0.5 * (t * 1.7).sin();
            let rate = 0.3 * (t * 0.013).cos() + 2.0;
            let dt = 0.005 + 0.015 * ((t * 0.37).sin() * 0.5 + 0.5);
            kf.update(angle, rate, dt).unwrap();

            let p = kf.covariance();
            assert_eq!(p[0][1], p[1][0], "asymmetric at step {}", i);
            assert!(p[0][0] >= 0.0 && p[1][1] >= 0.0, "negative diagonal at step {}", i);
            assert!(p[0][1] * p[0][1] <= p[0][0] * p[1][1] + 1e-15);
        }
    }

    #[test]
    fn test_learns_constant_gyro_bias() {
        let mut kf = filter(0.0);
        // Board is still at 0° but the gyro reads a constant 2 °/s
        for _ in 0..5000 {
            kf.update(0.0, 2.0, 0.01).unwrap();
        }
        assert!((kf.bias() - 2.0).abs() < 0.01, "bias {}", kf.bias());
        assert!(kf.angle().abs() < 0.05, "angle {}", kf.angle());
    }

    #[test]
    fn test_identical_inputs_are_deterministic() {
        let mut a = filter(1.0);
        let mut b = filter(1.0);
        for i in 0..100 {
            let x = a.update(i as f64 * 0.1, 0.5, 0.02).unwrap();
            let y = b.update(i as f64 * 0.1, 0.5, 0.02).unwrap();
            assert_eq!(x.to_bits(), y.to_bits());
        }
    }

    #[test]
    fn test_rejects_invalid_dt() {
        let mut kf = filter(0.0);
        for dt in [0.0, -0.01, 1.5, f64::NAN] {
            assert!(
                matches!(kf.update(1.0, 0.0, dt), Err(FilterError::InvalidTimestep { .. })),
                "dt {} accepted",
                dt
            );
        }
        assert_eq!(kf.angle(), 0.0, "rejected update must not change state");
    }

    #[test]
    fn test_rejects_non_positive_noise() {
        assert!(matches!(
            KalmanFilter::new(0.0, 0.0, 0.003, 0.03),
            Err(FilterError::InvalidNoise { name: "process_noise_angle", .. })
        ));
        assert!(KalmanFilter::new(0.0, 0.001, 0.003, -1.0).is_err());
    }

    #[test]
    fn test_initial_variance_sets_trust_in_seed() {
        let mut confident = filter(0.0).with_initial_variance(1e-6, 1e-6);
        let mut unsure = filter(0.0).with_initial_variance(100.0, 1.0);
        assert_eq!(unsure.covariance(), [[100.0, 0.0], [0.0, 1.0]]);

        let a = confident.update(10.0, 0.0, 0.02).unwrap();
        let b = unsure.update(10.0, 0.0, 0.02).unwrap();
        assert!(a < 0.1, "confident filter jumped to {}", a);
        assert!(b > 9.9, "unsure filter only reached {}", b);
    }
}
