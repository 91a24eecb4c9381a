// klippy_nozzle_fan/src/extras/fan_coordinator.rs
// Arbitrates the nozzle fan between the user's requested speed and the
// forced speeds needed while cleaning or probing.

use crate::extras::fan::{clamp_fraction, FanOutput};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    PreClean,
    Cleaning,
    Settling,
    ProbeActive,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::PreClean => "pre_clean",
            Phase::Cleaning => "cleaning",
            Phase::Settling => "settling",
            Phase::ProbeActive => "probe_active",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transition requests raised by the event listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Request {
    BeginClean,
    EndClean,
    BeginProbe,
    EndProbe,
}

impl std::fmt::Display for Request {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Request::BeginClean => "begin_clean",
            Request::EndClean => "end_clean",
            Request::BeginProbe => "begin_probe",
            Request::EndProbe => "end_probe",
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FanCoordinatorError {
    /// The physical action is already in progress; the request was dropped.
    ConflictingRequest { request: Request, phase: Phase },
    /// An end request with no matching window open.
    NotActive { request: Request, phase: Phase },
}

impl std::fmt::Display for FanCoordinatorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FanCoordinatorError::ConflictingRequest { request, phase } => {
                write!(f, "{} rejected: fan is already in {}", request, phase)
            }
            FanCoordinatorError::NotActive { request, phase } => {
                write!(f, "{} ignored: no matching window open (phase {})", request, phase)
            }
        }
    }
}

impl std::error::Error for FanCoordinatorError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowKind {
    Clean,
    Probe,
}

impl std::fmt::Display for WindowKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            WindowKind::Clean => "clean",
            WindowKind::Probe => "probe",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    RampComplete,
    SettleComplete,
    OutputFlush,
    Watchdog { window: WindowKind, token: u64 },
}

/// A deferred callback the host must schedule. `cycle` is the coordinator
/// cycle current when it was requested; a mismatch on firing means the
/// timer has been superseded.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimerRequest {
    pub kind: TimerKind,
    pub waketime: f64,
    pub cycle: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CleaningWindow {
    pub phase: Phase,
    pub started_at: f64,
    pub settle_deadline: Option<f64>,
    pub cycle: u64,
}

/// Snapshot of the fan's duty bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FanState {
    pub current_duty: f64,
    pub requested_duty: f64,
    pub override_active: bool,
    pub override_duty: f64,
    pub last_change_time: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinatorTiming {
    pub clean_speed: f64,
    /// Override duty while settling; `None` holds `clean_speed`.
    pub post_clean_speed: Option<f64>,
    pub ramp_time: f64,
    pub settle_time: f64,
}

pub struct FanCoordinator {
    timing: CoordinatorTiming,
    output: FanOutput,
    requested_duty: f64,
    override_active: bool,
    override_duty: f64,
    window: Option<CleaningWindow>,
    cycle: u64,
    timers: Vec<TimerRequest>,
}

impl FanCoordinator {
    pub fn new(timing: CoordinatorTiming, output: FanOutput) -> Self {
        FanCoordinator {
            timing,
            output,
            requested_duty: 0.0,
            override_active: false,
            override_duty: 0.0,
            window: None,
            cycle: 0,
            timers: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.window.map_or(Phase::Idle, |w| w.phase)
    }

    pub fn window(&self) -> Option<&CleaningWindow> {
        self.window.as_ref()
    }

    pub fn cycle(&self) -> u64 {
        self.cycle
    }

    pub fn timing(&self) -> &CoordinatorTiming {
        &self.timing
    }

    pub fn fan_state(&self) -> FanState {
        FanState {
            current_duty: self.output.current_duty(),
            requested_duty: self.requested_duty,
            override_active: self.override_active,
            override_duty: self.override_duty,
            last_change_time: self.output.last_change_time(),
        }
    }

    /// Drains the timers requested since the last call.
    pub fn take_timer_requests(&mut self) -> Vec<TimerRequest> {
        std::mem::take(&mut self.timers)
    }

    /// Records the user's fan speed. It reaches the fan now if no override
    /// is active, otherwise when the coordinator next returns to idle.
    pub fn set_requested_duty(&mut self, duty: f64, now: f64) {
        self.requested_duty = clamp_fraction(duty);
        if self.override_active {
            log::debug!(
                "nozzle_fan: requested duty {:.3} queued behind {} override",
                self.requested_duty,
                self.phase()
            );
            return;
        }
        self.write_duty(self.requested_duty, now);
    }

    pub fn begin_clean(&mut self, now: f64) -> Result<(), FanCoordinatorError> {
        let phase = self.phase();
        if !matches!(phase, Phase::Idle | Phase::Settling) {
            return Err(FanCoordinatorError::ConflictingRequest {
                request: Request::BeginClean,
                phase,
            });
        }
        self.open_window(Phase::PreClean, now);
        self.apply_override(self.timing.clean_speed, now);
        if self.timing.ramp_time > 0.0 {
            self.request_timer(TimerKind::RampComplete, now + self.timing.ramp_time);
        } else {
            self.set_phase(Phase::Cleaning, now);
        }
        Ok(())
    }

    pub fn end_clean(&mut self, now: f64) -> Result<(), FanCoordinatorError> {
        let phase = self.phase();
        if !matches!(phase, Phase::PreClean | Phase::Cleaning) {
            return Err(FanCoordinatorError::NotActive { request: Request::EndClean, phase });
        }
        let deadline = now + self.timing.settle_time;
        self.set_phase(Phase::Settling, now);
        if let Some(window) = self.window.as_mut() {
            window.settle_deadline = Some(deadline);
        }
        let post_clean = self.timing.post_clean_speed.unwrap_or(self.timing.clean_speed);
        self.apply_override(post_clean, now);
        if self.timing.settle_time > 0.0 {
            self.request_timer(TimerKind::SettleComplete, deadline);
        } else {
            self.restore_idle(now);
        }
        Ok(())
    }

    /// Probing takes priority over everything but another probe: any ramp,
    /// clean or settle in flight is abandoned.
    pub fn begin_probe(&mut self, now: f64) -> Result<(), FanCoordinatorError> {
        let phase = self.phase();
        if phase == Phase::ProbeActive {
            return Err(FanCoordinatorError::ConflictingRequest {
                request: Request::BeginProbe,
                phase,
            });
        }
        if phase != Phase::Idle {
            log::info!("nozzle_fan: probe preempts {} (cycle {})", phase, self.cycle);
        }
        self.open_window(Phase::ProbeActive, now);
        self.apply_override(0.0, now);
        Ok(())
    }

    pub fn end_probe(&mut self, now: f64) -> Result<(), FanCoordinatorError> {
        let phase = self.phase();
        if phase != Phase::ProbeActive {
            return Err(FanCoordinatorError::NotActive { request: Request::EndProbe, phase });
        }
        self.restore_idle(now);
        Ok(())
    }

    /// Handles a fired timer. Returns false when the timer was stale or not
    /// one of ours.
    pub fn handle_timer(&mut self, timer: TimerRequest, now: f64) -> bool {
        match timer.kind {
            TimerKind::OutputFlush => {
                let write = self.output.flush(now);
                self.track_retry(write.retry_at());
                write.retry_at().is_none()
            }
            TimerKind::RampComplete if self.is_current(timer, Phase::PreClean) => {
                self.set_phase(Phase::Cleaning, now);
                true
            }
            TimerKind::SettleComplete if self.is_current(timer, Phase::Settling) => {
                self.restore_idle(now);
                true
            }
            TimerKind::Watchdog { .. } => false,
            _ => {
                log::debug!(
                    "nozzle_fan: stale {:?} timer from cycle {} ignored (cycle {}, phase {})",
                    timer.kind,
                    timer.cycle,
                    self.cycle,
                    self.phase()
                );
                false
            }
        }
    }

    /// Abandons whatever window is open and hands the fan back to the
    /// requested duty. Returns the phase that was interrupted.
    pub fn force_idle(&mut self, now: f64, reason: &str) -> Option<Phase> {
        let phase = self.window?.phase;
        log::warn!(
            "nozzle_fan: forcing idle from {} (cycle {}): {}; restoring duty {:.3}",
            phase,
            self.cycle,
            reason,
            self.requested_duty
        );
        self.restore_idle(now);
        Some(phase)
    }

    fn is_current(&self, timer: TimerRequest, phase: Phase) -> bool {
        timer.cycle == self.cycle && self.phase() == phase
    }

    fn open_window(&mut self, phase: Phase, now: f64) {
        let from = self.phase();
        // New cycle: any ramp/settle timer still pending becomes stale
        self.cycle += 1;
        self.window = Some(CleaningWindow {
            phase,
            started_at: now,
            settle_deadline: None,
            cycle: self.cycle,
        });
        log::info!("nozzle_fan: {} -> {} at {:.3} (cycle {})", from, phase, now, self.cycle);
    }

    fn set_phase(&mut self, phase: Phase, now: f64) {
        if let Some(window) = self.window.as_mut() {
            log::info!(
                "nozzle_fan: {} -> {} at {:.3} (cycle {})",
                window.phase,
                phase,
                now,
                self.cycle
            );
            window.phase = phase;
        }
    }

    fn restore_idle(&mut self, now: f64) {
        if let Some(window) = self.window.take() {
            log::info!("nozzle_fan: {} -> idle at {:.3} (cycle {})", window.phase, now, self.cycle);
        }
        self.cycle += 1;
        self.override_active = false;
        self.override_duty = 0.0;
        self.write_duty(self.requested_duty, now);
    }

    fn apply_override(&mut self, duty: f64, now: f64) {
        self.override_active = true;
        self.override_duty = clamp_fraction(duty);
        self.write_duty(self.override_duty, now);
    }

    fn write_duty(&mut self, duty: f64, now: f64) {
        let write = self.output.set_duty(duty, now);
        self.track_retry(write.retry_at());
    }

    fn track_retry(&mut self, retry_at: Option<f64>) {
        if let Some(waketime) = retry_at {
            self.request_timer(TimerKind::OutputFlush, waketime);
        }
    }

    fn request_timer(&mut self, kind: TimerKind, waketime: f64) {
        self.timers.push(TimerRequest { kind, waketime, cycle: self.cycle });
    }
}
