use std::time::{Duration, Instant};

/// PID controller over the completed-queue fill fraction. The output is the
/// control signal shipped to the balancer, which nudges this worker's share
/// of the schedule up or down.
#[derive(Debug)]
pub struct PidController {
    pub kp: f64,        // proportional gain
    pub ki: f64,        // integral gain
    pub kd: f64,        // derivative gain
    pub set_point: f64, // target fill fraction
    pub epoch: Duration,

    integral: f64,
    prev_error: f64,
    accumulated: Duration,
    last_sample: Option<Instant>,
    signal: f64,
}

impl PidController {
    pub fn new(kp: f64, ki: f64, kd: f64, set_point: f64, epoch_ms: u64) -> Self {
        Self {
            kp,
            ki,
            kd,
            set_point,
            epoch: Duration::from_millis(epoch_ms),
            integral: 0.0,
            prev_error: 0.0,
            accumulated: Duration::ZERO,
            last_sample: None,
            signal: 0.0,
        }
    }

    // call site: reporting thread, once per report period
    //
    // Integrates continuously but only recomputes the output once per epoch,
    // so several reports in a row carry the same signal. All-zero gains pin
    // the output at exactly 0.0.
    pub fn sample(&mut self, fill: f64, now: Instant) -> f64 {
        let dt = match self.last_sample {
            Some(prev) => now.saturating_duration_since(prev),
            None => Duration::ZERO,
        };
        self.last_sample = Some(now);

        let error = self.set_point - fill;
        self.integral += error * dt.as_secs_f64();
        self.accumulated += dt;

        if self.accumulated >= self.epoch {
            let epoch_secs = self.epoch.as_secs_f64();
            self.signal = self.kp * error
                + self.ki * self.integral
                + self.kd * (error - self.prev_error) / epoch_secs;
            self.prev_error = error;
            self.accumulated = Duration::ZERO;
        }

        self.signal
    }

    /// Most recently computed output.
    pub fn control_signal(&self) -> f64 {
        self.signal
    }

    /// Forget all accumulated state.
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.prev_error = 0.0;
        self.accumulated = Duration::ZERO;
        self.last_sample = None;
        self.signal = 0.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_gains_hold_zero() {
        let mut pid = PidController::new(0.0, 0.0, 0.0, 0.0, 100);
        let start = Instant::now();
        for i in 0..50 {
            let signal = pid.sample(0.9, start + Duration::from_millis(i * 100));
            assert_eq!(signal, 0.0);
        }
    }

    #[test]
    fn test_proportional_response() {
        let mut pid = PidController::new(1.0, 0.0, 0.0, 0.0, 100);
        let start = Instant::now();

        // first sample is inside the first epoch, output not yet recomputed
        assert_eq!(pid.sample(0.8, start), 0.0);

        // crossing the epoch boundary picks up the error
        let signal = pid.sample(0.8, start + Duration::from_millis(100));
        assert!((signal - (-0.8)).abs() < 1e-9);

        // an empty queue sits on the set point, error collapses to zero
        let signal = pid.sample(0.0, start + Duration::from_millis(200));
        assert!(signal.abs() < 1e-9);
    }

    #[test]
    fn test_integral_accumulates() {
        let mut pid = PidController::new(0.0, 1.0, 0.0, 0.5, 100);
        let start = Instant::now();

        pid.sample(1.0, start);
        let first = pid.sample(1.0, start + Duration::from_millis(100));
        let second = pid.sample(1.0, start + Duration::from_millis(200));
        // fill stuck above the set point keeps pushing the signal down
        assert!(first < 0.0);
        assert!(second < first);
    }

    #[test]
    fn test_reset() {
        let mut pid = PidController::new(1.0, 1.0, 0.0, 0.0, 100);
        let start = Instant::now();
        pid.sample(0.9, start);
        pid.sample(0.9, start + Duration::from_millis(150));
        assert!(pid.control_signal() != 0.0);

        pid.reset();
        assert_eq!(pid.control_signal(), 0.0);
    }
}
