// klippy_nozzle_fan/src/extras/fan.rs
// Fan output adapter: duty writes to a PWM pin with a minimum toggle interval.

use std::sync::Arc;

use parking_lot::Mutex;

/// Delay before retrying a write the PWM pin refused, when the toggle
/// interval is shorter than this.
pub const FAULT_RETRY_DELAY: f64 = 0.25;

/// The PWM primitive refused a value.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputFault(pub String);

impl std::fmt::Display for OutputFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "fan output fault: {}", self.0)
    }
}

impl std::error::Error for OutputFault {}

// --- Hardware Abstraction Traits ---

pub trait PwmPin: Send {
    /// Schedules `value` (0.0..=1.0 of full PWM) at `print_time`.
    fn set_pwm(&mut self, print_time: f64, value: f64) -> Result<(), OutputFault>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PwmWrite {
    pub print_time: f64,
    pub value: f64,
}

/// PWM pin that logs every write and keeps a shared history of them. Stands
/// in for an MCU pin in the simulator and in integration tests.
#[derive(Clone, Default)]
pub struct LoggingPwmPin {
    name: String,
    writes: Arc<Mutex<Vec<PwmWrite>>>,
}

impl LoggingPwmPin {
    pub fn new(name: &str) -> Self {
        LoggingPwmPin {
            name: name.to_string(),
            writes: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn writes(&self) -> Vec<PwmWrite> {
        self.writes.lock().clone()
    }

    pub fn last_value(&self) -> Option<f64> {
        self.writes.lock().last().map(|w| w.value)
    }
}

impl PwmPin for LoggingPwmPin {
    fn set_pwm(&mut self, print_time: f64, value: f64) -> Result<(), OutputFault> {
        log::info!("pin {}: set_pwm value={:.3} at {:.3}", self.name, value, print_time);
        self.writes.lock().push(PwmWrite { print_time, value });
        Ok(())
    }
}

/// Outcome of a duty request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DutyWrite {
    /// Forwarded to the pin; carries the clamped duty.
    Applied(f64),
    /// Already at that duty, nothing written.
    Unchanged,
    /// Inside the toggle interval; held until `flush` at `retry_at`.
    Deferred { retry_at: f64 },
    /// The pin refused the write; held until `flush` at `retry_at`.
    Faulted { retry_at: f64 },
}

impl DutyWrite {
    pub fn retry_at(&self) -> Option<f64> {
        match *self {
            DutyWrite::Deferred { retry_at } | DutyWrite::Faulted { retry_at } => Some(retry_at),
            _ => None,
        }
    }
}

/// Clamps a requested fraction into [0, 1]. NaN reads as off.
pub fn clamp_fraction(fraction: f64) -> f64 {
    if fraction.is_nan() {
        0.0
    } else {
        fraction.clamp(0.0, 1.0)
    }
}

pub struct FanOutput {
    pin: Box<dyn PwmPin>,
    max_power: f64,
    min_toggle_interval: f64,
    current_duty: f64,
    last_change_time: Option<f64>,
    pending: Option<f64>,
}

impl FanOutput {
    pub fn new(pin: Box<dyn PwmPin>, max_power: f64, min_toggle_interval: f64) -> Self {
        FanOutput {
            pin,
            max_power: clamp_fraction(max_power),
            min_toggle_interval: min_toggle_interval.max(0.0),
            current_duty: 0.0,
            last_change_time: None,
            pending: None,
        }
    }

    pub fn current_duty(&self) -> f64 {
        self.current_duty
    }

    pub fn last_change_time(&self) -> Option<f64> {
        self.last_change_time
    }

    pub fn pending_duty(&self) -> Option<f64> {
        self.pending
    }

    /// Requests `fraction` at `now`. Never fails: out-of-range values are
    /// clamped, early or refused writes are held for a later `flush`.
    pub fn set_duty(&mut self, fraction: f64, now: f64) -> DutyWrite {
        let duty = clamp_fraction(fraction);
        if duty != fraction {
            log::debug!("FanOutput: clamped requested duty {} to {}", fraction, duty);
        }

        if duty == self.current_duty {
            self.pending = None;
            return DutyWrite::Unchanged;
        }

        if let Some(last) = self.last_change_time {
            let earliest = last + self.min_toggle_interval;
            if now < earliest {
                log::debug!("FanOutput: duty {:.3} held until {:.3}", duty, earliest);
                self.pending = Some(duty);
                return DutyWrite::Deferred { retry_at: earliest };
            }
        }

        match self.pin.set_pwm(now, duty * self.max_power) {
            Ok(()) => {
                self.current_duty = duty;
                self.last_change_time = Some(now);
                self.pending = None;
                DutyWrite::Applied(duty)
            }
            Err(fault) => {
                let retry_at = now + self.min_toggle_interval.max(FAULT_RETRY_DELAY);
                log::warn!("FanOutput: {} (duty {:.3}), retrying at {:.3}", fault, duty, retry_at);
                self.pending = Some(duty);
                DutyWrite::Faulted { retry_at }
            }
        }
    }

    /// Retries a held duty, if any.
    pub fn flush(&mut self, now: f64) -> DutyWrite {
        match self.pending.take() {
            Some(duty) => self.set_duty(duty, now),
            None => DutyWrite::Unchanged,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct MockPwmPinState {
        writes: Vec<PwmWrite>,
        failures_left: u32,
    }

    #[derive(Clone, Default)]
    struct MockPwmPin {
        state: Arc<Mutex<MockPwmPinState>>,
    }

    impl PwmPin for MockPwmPin {
        fn set_pwm(&mut self, print_time: f64, value: f64) -> Result<(), OutputFault> {
            let mut state = self.state.lock();
            if state.failures_left > 0 {
                state.failures_left -= 1;
                return Err(OutputFault("mcu queue full".to_string()));
            }
            state.writes.push(PwmWrite { print_time, value });
            Ok(())
        }
    }

    fn setup_output(
        max_power: f64,
        min_toggle_interval: f64,
    ) -> (FanOutput, Arc<Mutex<MockPwmPinState>>) {
        let pin = MockPwmPin::default();
        let state = pin.state.clone();
        (FanOutput::new(Box::new(pin), max_power, min_toggle_interval), state)
    }

    #[test]
    fn out_of_range_requests_are_clamped() {
        let (mut output, state) = setup_output(1.0, 0.0);

        assert_eq!(output.set_duty(1.7, 1.0), DutyWrite::Applied(1.0));
        assert_eq!(output.set_duty(-0.4, 2.0), DutyWrite::Applied(0.0));
        assert_eq!(output.set_duty(f64::INFINITY, 3.0), DutyWrite::Applied(1.0));
        assert_eq!(output.set_duty(f64::NAN, 4.0), DutyWrite::Applied(0.0));

        let values: Vec<f64> = state.lock().writes.iter().map(|w| w.value).collect();
        assert_eq!(values, vec![1.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn scales_by_max_power() {
        let (mut output, state) = setup_output(0.8, 0.0);
        output.set_duty(0.5, 1.0);
        assert_eq!(output.current_duty(), 0.5);
        assert_eq!(state.lock().writes[0].value, 0.4);
    }

    #[test]
    fn identical_duty_is_not_rewritten() {
        let (mut output, state) = setup_output(1.0, 0.0);
        output.set_duty(0.3, 1.0);
        assert_eq!(output.set_duty(0.3, 2.0), DutyWrite::Unchanged);
        assert_eq!(state.lock().writes.len(), 1);
        assert_eq!(output.last_change_time(), Some(1.0));
    }

    #[test]
    fn rapid_requests_coalesce_until_flush() {
        let (mut output, state) = setup_output(1.0, 0.5);

        assert_eq!(output.set_duty(1.0, 10.0), DutyWrite::Applied(1.0));
        assert_eq!(output.set_duty(0.2, 10.1), DutyWrite::Deferred { retry_at: 10.5 });
        assert_eq!(output.set_duty(0.6, 10.2), DutyWrite::Deferred { retry_at: 10.5 });
        assert_eq!(output.current_duty(), 1.0);
        assert_eq!(output.pending_duty(), Some(0.6));

        assert_eq!(output.flush(10.5), DutyWrite::Applied(0.6));
        assert_eq!(output.flush(10.6), DutyWrite::Unchanged);

        let writes = state.lock().writes.clone();
        assert_eq!(writes, vec![
            PwmWrite { print_time: 10.0, value: 1.0 },
            PwmWrite { print_time: 10.5, value: 0.6 },
        ]);
    }

    #[test]
    fn request_back_to_current_duty_drops_pending() {
        let (mut output, state) = setup_output(1.0, 0.5);
        output.set_duty(0.3, 1.0);
        output.set_duty(1.0, 1.1);
        assert_eq!(output.set_duty(0.3, 1.2), DutyWrite::Unchanged);
        assert_eq!(output.flush(1.5), DutyWrite::Unchanged);
        assert_eq!(state.lock().writes.len(), 1);
    }

    #[test]
    fn refused_write_is_retried_on_flush() {
        let (mut output, state) = setup_output(1.0, 0.1);
        state.lock().failures_left = 1;

        assert_eq!(
            output.set_duty(0.7, 2.0),
            DutyWrite::Faulted { retry_at: 2.0 + FAULT_RETRY_DELAY }
        );
        assert_eq!(output.current_duty(), 0.0);
        assert_eq!(output.last_change_time(), None);

        assert_eq!(output.flush(2.25), DutyWrite::Applied(0.7));
        assert_eq!(state.lock().writes.len(), 1);
    }

    #[test]
    fn logging_pin_keeps_history() {
        let pin = LoggingPwmPin::new("PA8");
        let mut output = FanOutput::new(Box::new(pin.clone()), 1.0, 0.0);
        output.set_duty(0.25, 0.5);
        assert_eq!(pin.last_value(), Some(0.25));
        assert_eq!(pin.writes().len(), 1);
    }
}
