// Fixed-period pitch stabilization loop
//
// Each tick runs strictly in order: sensor read -> filter update ->
// controller update -> actuator write. dt is measured, not assumed.
// Any failure first drives the actuator to neutral, then surfaces the error;
// nothing is retried here (restart policy belongs to the supervisor).

use embedded_hal::delay::DelayNs;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::actuator::{Actuator, ActuatorError, PwmOutput};
use crate::config::Config;
use crate::control::{FilterError, KalmanFilter, PidController};
use crate::imu::{Gy85, ImuError, RegisterBus};
use crate::messages::{LoopState, Telemetry};

/// Fault classes reported upward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Bus,
    Init,
    Sensor,
    Actuator,
}

/// Error types for the control loop
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ControlError {
    #[error("IMU error: {0}")]
    Imu(#[from] ImuError),

    #[error("Filter error: {0}")]
    Filter(#[from] FilterError),

    #[error("Actuator error: {0}")]
    Actuator(#[from] ActuatorError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation not allowed in state {state:?}")]
    InvalidState { state: LoopState },
}

impl ControlError {
    /// Classify into bus / init / sensor / actuator faults
    pub fn kind(&self) -> Option<FaultKind> {
        match self {
            ControlError::Imu(ImuError::Bus(_)) => Some(FaultKind::Bus),
            ControlError::Imu(ImuError::Init { .. }) => Some(FaultKind::Init),
            ControlError::Imu(ImuError::SensorFault(_)) => Some(FaultKind::Sensor),
            ControlError::Filter(FilterError::InvalidNoise { .. }) => Some(FaultKind::Init),
            ControlError::Filter(_) => Some(FaultKind::Sensor),
            ControlError::Actuator(_) => Some(FaultKind::Actuator),
            ControlError::InvalidConfig(_) => Some(FaultKind::Init),
            ControlError::InvalidState { .. } => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, ControlError>;

/// Single-axis stabilization loop; owns the bus, filter, controller and PWM
pub struct ControlLoop<B, P> {
    state: LoopState,
    config: Config,
    imu: Gy85<B>,
    actuator: Actuator<P>,
    kalman: Option<KalmanFilter>,
    pid: PidController,
    tick_count: u64,
    last_tick: Option<Instant>,
    fault: Option<ControlError>,
}

impl<B: RegisterBus, P: PwmOutput> ControlLoop<B, P> {
    /// Build an idle loop; the config is validated first
    pub fn new(config: Config, bus: B, pwm: P) -> Result<Self> {
        config
            .validate()
            .map_err(|e| ControlError::InvalidConfig(e.to_string()))?;

        let pid_cfg = &config.pid;
        let pid = PidController::new(
            pid_cfg.kp,
            pid_cfg.ki,
            pid_cfg.kd,
            pid_cfg.output_min,
            pid_cfg.output_max,
        );
        let actuator = Actuator::new(
            pwm,
            config.actuator.clone(),
            pid_cfg.output_min,
            pid_cfg.output_max,
        )?;
        let imu = Gy85::new(bus, config.imu.clone());

        Ok(Self {
            state: LoopState::Uninitialized,
            config,
            imu,
            actuator,
            kalman: None,
            pid,
            tick_count: 0,
            last_tick: None,
            fault: None,
        })
    }

    /// Initialize sensor and actuator; on success the loop is `Running`
    pub fn start(&mut self, delay: &mut impl DelayNs) -> Result<()> {
        if self.state != LoopState::Uninitialized {
            return Err(ControlError::InvalidState { state: self.state });
        }
        self.transition(LoopState::Initializing);

        match self.initialize(delay) {
            Ok(()) => {
                self.transition(LoopState::Running);
                Ok(())
            }
            Err(e) => Err(self.enter_fault(e)),
        }
    }

    fn initialize(&mut self, delay: &mut impl DelayNs) -> Result<()> {
        self.imu.init(delay)?;
        self.actuator.init()?;
        self.actuator.set_neutral()?;

        // Seed the filter with the current accelerometer attitude
        let sample = self.imu.read_sample()?;
        let pitch = self.imu.pitch(&sample)?;
        let k = &self.config.kalman;
        let filter = KalmanFilter::new(pitch, k.q_angle, k.q_bias, k.r_measure)?
            .with_initial_variance(k.initial_angle_variance, k.initial_bias_variance);
        self.kalman = Some(filter);
        info!("Filter seeded at {:.2}°", pitch);

        self.pid.reset();
        self.tick_count = 0;
        self.last_tick = None;
        Ok(())
    }

    /// Run one control cycle with the measured `dt` in seconds
    pub fn tick(&mut self, dt: f64) -> Result<Telemetry> {
        if self.state != LoopState::Running {
            return Err(ControlError::InvalidState { state: self.state });
        }
        match self.step(dt) {
            Ok(telemetry) => Ok(telemetry),
            Err(e) => Err(self.enter_fault(e)),
        }
    }

    fn step(&mut self, dt: f64) -> Result<Telemetry> {
        let sample = self.imu.read_sample()?;
        let raw_pitch = self.imu.pitch(&sample)?;
        let rate = self.imu.pitch_rate(&sample);

        let kalman = self
            .kalman
            .as_mut()
            .ok_or(ControlError::InvalidState { state: self.state })?;
        let pitch = kalman.update(raw_pitch, rate, dt)?;
        let gyro_bias = kalman.bias();

        let output = self
            .pid
            .update(self.config.control.setpoint_deg, pitch, dt);
        let duty = self.actuator.set_duty(output)?;

        self.tick_count += 1;
        debug!(
            "tick {}: dt={:.4} raw={:.2} pitch={:.2} output={:.3} duty={}",
            self.tick_count, dt, raw_pitch, pitch, output, duty
        );

        Ok(Telemetry {
            tick: self.tick_count,
            dt,
            raw_pitch,
            pitch_estimate: pitch,
            gyro_bias,
            pid_output: output,
            duty_pct: self.actuator.duty_pct(duty),
        })
    }

    /// Command neutral, record the fault and hand it back for reporting
    fn enter_fault(&mut self, err: ControlError) -> ControlError {
        error!("Control loop fault: {}", err);
        if !self.actuator.is_configured() {
            debug!("Actuator not configured yet, no neutral command sent");
        } else if let Err(e) = self.actuator.set_neutral() {
            error!("Failed to command neutral output: {}", e);
        }
        self.transition(LoopState::Faulted);
        self.fault = Some(err.clone());
        err
    }

    /// Explicit shutdown: actuator to neutral, loop `Stopped`
    pub fn stop(&mut self) -> Result<()> {
        match self.state {
            LoopState::Stopped => return Ok(()),
            LoopState::Uninitialized => {
                self.transition(LoopState::Stopped);
                return Ok(());
            }
            _ => {}
        }
        let result = if self.actuator.is_configured() {
            self.actuator.set_neutral().map(|_| ())
        } else {
            Ok(())
        };
        self.transition(LoopState::Stopped);
        result?;
        Ok(())
    }

    /// Tick at the configured period until `stop` turns true
    ///
    /// The stop request is only observed while waiting between ticks.
    /// Dropping the sender also counts as a stop request.
    pub async fn run<F>(&mut self, mut stop: watch::Receiver<bool>, mut on_tick: F) -> Result<()>
    where
        F: FnMut(&Telemetry),
    {
        if self.state != LoopState::Running {
            return Err(ControlError::InvalidState { state: self.state });
        }

        let period = self.config.control.period();
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        self.last_tick = None;

        info!(
            "Control loop running: {}Hz, setpoint {}°",
            self.config.control.loop_hz, self.config.control.setpoint_deg
        );

        loop {
            tokio::select! {
                biased;
                _ = stop.wait_for(|&requested| requested) => break,
                _ = ticker.tick() => {}
            }

            let Some(dt) = self.measure_dt(Instant::now()) else {
                continue;
            };
            let telemetry = self.tick(dt)?;
            on_tick(&telemetry);
        }

        info!("Stop requested after {} ticks", self.tick_count);
        self.stop()
    }

    /// Seconds since the previous tick, clamped to `max_dt_s`
    ///
    /// The first tick after `run` starts uses the nominal period.
    fn measure_dt(&mut self, now: Instant) -> Option<f64> {
        let elapsed = match self.last_tick.replace(now) {
            Some(previous) => now.saturating_duration_since(previous),
            None => self.config.control.period(),
        };
        if elapsed == Duration::ZERO {
            debug!("Zero elapsed time since last tick, skipping");
            return None;
        }

        let dt = elapsed.as_secs_f64();
        let max = self.config.control.max_dt_s;
        if dt > max {
            warn!("Tick overran: dt={:.3}s, clamping to {:.3}s", dt, max);
            return Some(max);
        }
        Some(dt)
    }

    fn transition(&mut self, next: LoopState) {
        info!("Control loop {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    /// The fault that moved the loop to `Faulted`, if any
    pub fn fault(&self) -> Option<&ControlError> {
        self.fault.as_ref()
    }

    pub fn tick_count(&self) -> u64 {
        self.tick_count
    }

    pub fn kalman(&self) -> Option<&KalmanFilter> {
        self.kalman.as_ref()
    }

    pub fn pid(&self) -> &PidController {
        &self.pid
    }

    pub fn actuator(&self) -> &Actuator<P> {
        &self.actuator
    }

    pub fn imu_mut(&mut self) -> &mut Gy85<B> {
        &mut self.imu
    }

    #[cfg(test)]
    fn actuator_mut(&mut self) -> &mut Actuator<P> {
        &mut self.actuator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::actuator::RecordingPwm;
    use crate::config::ImuConfig;
    use crate::imu::gy85::{attach_gy85, ACCEL_G_PER_LSB};
    use crate::imu::{BusError, MockBus, SensorFault, GY85_ADDR, ITG3205_ADDR};

    // round(7.5 % of 65536)
    const NEUTRAL_DUTY: u32 = 4915;

    struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    fn set_pitch(bus: &mut MockBus, pitch_deg: f64) {
        let rad = pitch_deg.to_radians();
        let x = (-rad.sin() / ACCEL_G_PER_LSB).round() as i16;
        let z = (rad.cos() / ACCEL_G_PER_LSB).round() as i16;
        let mut bytes = Vec::new();
        for value in [x, 0, z] {
            bytes.extend_from_slice(&value.to_le_bytes());
        }
        bus.set_registers(GY85_ADDR, 0x32, &bytes);
    }

    fn rig(pitch_deg: f64) -> MockBus {
        let mut bus = MockBus::new();
        attach_gy85(&mut bus, &ImuConfig::default());
        set_pitch(&mut bus, pitch_deg);
        bus
    }

    fn running_loop(pitch_deg: f64) -> ControlLoop<MockBus, RecordingPwm> {
        let mut cl =
            ControlLoop::new(Config::default(), rig(pitch_deg), RecordingPwm::default()).unwrap();
        cl.start(&mut NoDelay).unwrap();
        cl
    }

    #[test]
    fn test_start_reaches_running_at_neutral() {
        let cl = running_loop(4.0);
        assert_eq!(cl.state(), LoopState::Running);
        assert_eq!(cl.actuator().pwm().writes, vec![NEUTRAL_DUTY]);
        assert_eq!(cl.actuator().pwm().configured, Some((50, 0)));

        let seeded = cl.kalman().unwrap().angle();
        assert!((seeded - 4.0).abs() < 0.5, "seeded at {}", seeded);
    }

    #[test]
    fn test_start_with_wrong_gyro_id_is_init_fault() {
        let mut bus = rig(0.0);
        bus.set_register(ITG3205_ADDR, 0x00, 0x00);
        let mut cl = ControlLoop::new(Config::default(), bus, RecordingPwm::default()).unwrap();

        let err = cl.start(&mut NoDelay).unwrap_err();
        assert_eq!(err.kind(), Some(FaultKind::Init));
        assert_eq!(cl.state(), LoopState::Faulted);
        // The PWM was never configured, so no neutral write is attempted
        assert_eq!(cl.actuator().pwm().configured, None);
        assert!(cl.actuator().pwm().writes.is_empty());
        assert_eq!(cl.fault(), Some(&err));
        assert!(matches!(
            cl.tick(0.02),
            Err(ControlError::InvalidState { state: LoopState::Faulted })
        ));
        assert!(matches!(
            cl.start(&mut NoDelay),
            Err(ControlError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_start_without_device_is_bus_fault() {
        let mut cl =
            ControlLoop::new(Config::default(), MockBus::new(), RecordingPwm::default()).unwrap();
        let err = cl.start(&mut NoDelay).unwrap_err();
        assert_eq!(err.kind(), Some(FaultKind::Bus));
        assert_eq!(cl.state(), LoopState::Faulted);
    }

    #[test]
    fn test_tick_corrects_towards_setpoint() {
        let mut cl = running_loop(10.0);
        let telemetry = cl.tick(0.02).unwrap();

        assert_eq!(telemetry.tick, 1);
        assert!((telemetry.raw_pitch - 10.0).abs() < 0.5);
        assert!(telemetry.pid_output < 0.0, "output {}", telemetry.pid_output);
        assert!(telemetry.duty_pct < 7.5, "duty {}", telemetry.duty_pct);
        assert!(telemetry.duty_pct >= 5.0);
        assert_eq!(cl.actuator().pwm().writes.len(), 2);
    }

    #[test]
    fn test_output_saturates_within_bounds() {
        let mut cl = running_loop(85.0);
        for _ in 0..200 {
            let telemetry = cl.tick(0.02).unwrap();
            assert!((-25.0..=25.0).contains(&telemetry.pid_output));
            assert!((5.0..=10.0).contains(&telemetry.duty_pct));
        }
        assert_eq!(cl.tick_count(), 200);
    }

    #[test]
    fn test_bus_error_mid_run_faults_to_neutral() {
        let mut cl = running_loop(10.0);
        cl.tick(0.02).unwrap();
        cl.imu_mut()
            .bus_mut()
            .inject_fault(BusError::Timeout { addr: GY85_ADDR });

        let err = cl.tick(0.02).unwrap_err();
        assert_eq!(err.kind(), Some(FaultKind::Bus));
        assert_eq!(cl.state(), LoopState::Faulted);
        assert_eq!(cl.actuator().pwm().writes.last(), Some(&NEUTRAL_DUTY));
        assert_eq!(cl.tick_count(), 1);
    }

    #[test]
    fn test_zero_accel_vector_is_sensor_fault() {
        let mut cl = running_loop(0.0);
        cl.imu_mut()
            .bus_mut()
            .set_registers(GY85_ADDR, 0x32, &[0; 6]);

        let err = cl.tick(0.02).unwrap_err();
        assert_eq!(
            err,
            ControlError::Imu(ImuError::SensorFault(SensorFault::ZeroGravityVector))
        );
        assert_eq!(err.kind(), Some(FaultKind::Sensor));
        assert_eq!(cl.actuator().pwm().writes.last(), Some(&NEUTRAL_DUTY));
    }

    #[test]
    fn test_invalid_config_is_rejected_before_start() {
        let mut equal_bounds = Config::default();
        equal_bounds.pid.output_min = 0.0;
        equal_bounds.pid.output_max = 0.0;
        let mut reversed_bounds = Config::default();
        reversed_bounds.pid.output_min = 5.0;
        reversed_bounds.pid.output_max = -5.0;
        let mut too_fast = Config::default();
        too_fast.control.loop_hz = 3_000_000_000;

        for config in [equal_bounds, reversed_bounds, too_fast] {
            let err = ControlLoop::new(config, rig(0.0), RecordingPwm::default())
                .err()
                .unwrap();
            assert!(matches!(err, ControlError::InvalidConfig(_)), "got {:?}", err);
            assert_eq!(err.kind(), Some(FaultKind::Init));
        }
    }

    #[test]
    fn test_pwm_write_failure_is_actuator_fault() {
        let mut cl = running_loop(10.0);
        cl.actuator_mut().pwm_mut().fail_writes = true;

        let err = cl.tick(0.02).unwrap_err();
        assert!(matches!(err, ControlError::Actuator(ActuatorError::Pwm(_))), "got {:?}", err);
        assert_eq!(err.kind(), Some(FaultKind::Actuator));
        assert_eq!(cl.state(), LoopState::Faulted);
        assert_eq!(cl.tick_count(), 0);
    }

    #[test]
    fn test_out_of_range_command_faults_to_neutral() {
        let mut cl = running_loop(10.0);
        // Narrower than the controller's ±25 output
        let mut narrow =
            Actuator::new(RecordingPwm::default(), Config::default().actuator, -1.0, 1.0).unwrap();
        narrow.init().unwrap();
        *cl.actuator_mut() = narrow;

        let err = cl.tick(0.02).unwrap_err();
        assert!(
            matches!(err, ControlError::Actuator(ActuatorError::OutOfRange { .. })),
            "got {:?}",
            err
        );
        assert_eq!(err.kind(), Some(FaultKind::Actuator));
        assert_eq!(cl.state(), LoopState::Faulted);
        assert_eq!(cl.actuator().pwm().writes, vec![NEUTRAL_DUTY]);
    }

    #[test]
    fn test_invalid_dt_faults() {
        let mut cl = running_loop(0.0);
        let err = cl.tick(0.0).unwrap_err();
        assert!(matches!(err, ControlError::Filter(FilterError::InvalidTimestep { .. })));
        assert_eq!(cl.state(), LoopState::Faulted);
    }

    #[test]
    fn test_stop_commands_neutral() {
        let mut cl = running_loop(20.0);
        cl.tick(0.02).unwrap();
        cl.stop().unwrap();

        assert_eq!(cl.state(), LoopState::Stopped);
        assert_eq!(cl.actuator().pwm().writes.last(), Some(&NEUTRAL_DUTY));
        assert!(cl.tick(0.02).is_err());
    }

    #[test]
    fn test_measure_dt_uses_period_first_then_clamps() {
        let mut cl = running_loop(0.0);
        let t0 = Instant::now();

        assert_eq!(cl.measure_dt(t0), Some(0.02));
        assert_eq!(cl.measure_dt(t0), None);
        let dt = cl.measure_dt(t0 + Duration::from_millis(15)).unwrap();
        assert!((dt - 0.015).abs() < 1e-9);
        assert_eq!(cl.measure_dt(t0 + Duration::from_secs(5)), Some(0.1));
    }

    #[tokio::test]
    async fn test_run_until_stop_requested() {
        let mut cl = running_loop(5.0);
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut seen = Vec::new();
        cl.run(stop_rx, |t| {
            seen.push(*t);
            if seen.len() == 5 {
                let _ = stop_tx.send(true);
            }
        })
        .await
        .unwrap();

        assert_eq!(seen.len(), 5);
        assert_eq!(cl.tick_count(), 5);
        assert_eq!(cl.state(), LoopState::Stopped);
        assert_eq!(cl.actuator().pwm().writes.last(), Some(&NEUTRAL_DUTY));
        assert!(seen.iter().all(|t| t.dt > 0.0 && t.dt <= 0.1));
        assert!(seen.windows(2).all(|w| w[1].tick == w[0].tick + 1));
    }

    #[tokio::test]
    async fn test_run_with_pending_stop_does_not_tick() {
        let mut cl = running_loop(5.0);
        let (_stop_tx, stop_rx) = watch::channel(true);

        cl.run(stop_rx, |_| panic!("ticked after stop")).await.unwrap();
        assert_eq!(cl.tick_count(), 0);
        assert_eq!(cl.state(), LoopState::Stopped);
    }

    #[tokio::test]
    async fn test_run_surfaces_fault() {
        let mut cl = running_loop(5.0);
        let (_stop_tx, stop_rx) = watch::channel(false);
        cl.imu_mut()
            .bus_mut()
            .inject_fault(BusError::Nack { addr: GY85_ADDR, reg: 0x32 });

        let err = cl.run(stop_rx, |_| {}).await.unwrap_err();
        assert_eq!(err.kind(), Some(FaultKind::Bus));
        assert_eq!(cl.state(), LoopState::Faulted);
    }
}
