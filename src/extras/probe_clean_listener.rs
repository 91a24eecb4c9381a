// klippy_nozzle_fan/src/extras/probe_clean_listener.rs
// Turns host lifecycle notifications into coordinator transitions and
// force-closes windows whose end notification never arrives.

use crate::extras::fan_coordinator::{
    FanCoordinator, FanCoordinatorError, Phase, Request, TimerKind, TimerRequest, WindowKind,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostEvent {
    CleanStart,
    CleanEnd,
    ProbeStart,
    ProbeEnd,
    HomeStart,
    HomeEnd,
}

impl HostEvent {
    pub const ALL: [HostEvent; 6] = [
        HostEvent::CleanStart,
        HostEvent::CleanEnd,
        HostEvent::ProbeStart,
        HostEvent::ProbeEnd,
        HostEvent::HomeStart,
        HostEvent::HomeEnd,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            HostEvent::CleanStart => "clean_start",
            HostEvent::CleanEnd => "clean_end",
            HostEvent::ProbeStart => "probe_start",
            HostEvent::ProbeEnd => "probe_end",
            HostEvent::HomeStart => "home_start",
            HostEvent::HomeEnd => "home_end",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_lowercase();
        HostEvent::ALL.into_iter().find(|event| event.name() == name)
    }
}

/// What the listener did with a notification.
#[derive(Debug, Clone, PartialEq)]
pub enum EventOutcome {
    Forwarded(Request),
    /// Same notification as last time with no opposite one in between.
    Duplicate,
    /// The probe window was already held by the other probe source.
    Joined,
    /// One probe source closed; the other still holds the window.
    Held,
    Rejected(FanCoordinatorError),
}

/// A window that was closed by the watchdog instead of its end event.
#[derive(Debug, Clone, PartialEq)]
pub struct WatchdogTimeout {
    pub window: WindowKind,
    pub opened_at: f64,
    pub expired_at: f64,
    /// Coordinator phase that was cut short, if the window still owned it.
    pub interrupted: Option<Phase>,
}

impl std::fmt::Display for WatchdogTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} window opened at {:.3} got no end event within {:.3}s",
            self.window,
            self.opened_at,
            self.expired_at - self.opened_at
        )?;
        match self.interrupted {
            Some(phase) => write!(f, "; fan released from {}", phase),
            None => write!(f, "; fan already released"),
        }
    }
}

impl std::error::Error for WatchdogTimeout {}

#[derive(Debug, Clone, Copy)]
struct OpenWindow {
    token: u64,
    opened_at: f64,
    // Coordinator cycle the window started, None if the begin was rejected
    coordinator_cycle: Option<u64>,
}

pub struct ProbeCleanListener {
    watchdog_time: f64,
    clean: Option<OpenWindow>,
    probe: Option<OpenWindow>,
    probe_held: bool,
    home_held: bool,
    next_token: u64,
    watchdog_trips: u64,
    timers: Vec<TimerRequest>,
}

impl ProbeCleanListener {
    pub fn new(watchdog_time: f64) -> Self {
        ProbeCleanListener {
            watchdog_time,
            clean: None,
            probe: None,
            probe_held: false,
            home_held: false,
            next_token: 0,
            watchdog_trips: 0,
            timers: Vec::new(),
        }
    }

    pub fn clean_open(&self) -> bool {
        self.clean.is_some()
    }

    pub fn probe_open(&self) -> bool {
        self.probe.is_some()
    }

    pub fn watchdog_trips(&self) -> u64 {
        self.watchdog_trips
    }

    pub fn take_timer_requests(&mut self) -> Vec<TimerRequest> {
        std::mem::take(&mut self.timers)
    }

    pub fn handle_event(
        &mut self,
        event: HostEvent,
        now: f64,
        coordinator: &mut FanCoordinator,
    ) -> EventOutcome {
        match event {
            HostEvent::CleanStart => {
                if self.clean.is_some() {
                    return EventOutcome::Duplicate;
                }
                let result = coordinator.begin_clean(now);
                let window = self.open_window(WindowKind::Clean, now, result.is_ok(), coordinator);
                self.clean = Some(window);
                Self::outcome(Request::BeginClean, result)
            }
            HostEvent::CleanEnd => {
                if self.clean.take().is_none() {
                    return EventOutcome::Duplicate;
                }
                Self::outcome(Request::EndClean, coordinator.end_clean(now))
            }
            HostEvent::ProbeStart | HostEvent::HomeStart => {
                let is_home = event == HostEvent::HomeStart;
                let held = if is_home { &mut self.home_held } else { &mut self.probe_held };
                if *held {
                    return EventOutcome::Duplicate;
                }
                *held = true;
                if self.probe.is_some() {
                    return EventOutcome::Joined;
                }
                let result = coordinator.begin_probe(now);
                let window = self.open_window(WindowKind::Probe, now, result.is_ok(), coordinator);
                self.probe = Some(window);
                Self::outcome(Request::BeginProbe, result)
            }
            HostEvent::ProbeEnd | HostEvent::HomeEnd => {
                let is_home = event == HostEvent::HomeEnd;
                let held = if is_home { &mut self.home_held } else { &mut self.probe_held };
                if !*held {
                    return EventOutcome::Duplicate;
                }
                *held = false;
                if self.probe_held || self.home_held {
                    return EventOutcome::Held;
                }
                self.probe = None;
                Self::outcome(Request::EndProbe, coordinator.end_probe(now))
            }
        }
    }

    /// Handles a fired watchdog timer. Returns a report when it closed a
    /// window, `None` when the window had already ended.
    pub fn watchdog_expired(
        &mut self,
        timer: TimerRequest,
        now: f64,
        coordinator: &mut FanCoordinator,
    ) -> Option<WatchdogTimeout> {
        let (window, token) = match timer.kind {
            TimerKind::Watchdog { window, token } => (window, token),
            _ => return None,
        };
        let slot = match window {
            WindowKind::Clean => &mut self.clean,
            WindowKind::Probe => &mut self.probe,
        };
        let open = match *slot {
            Some(open) if open.token == token => open,
            _ => {
                log::debug!("ProbeCleanListener: {} watchdog {} already closed", window, token);
                return None;
            }
        };
        *slot = None;
        if window == WindowKind::Probe {
            self.probe_held = false;
            self.home_held = false;
        }
        self.watchdog_trips += 1;

        let owns_fan = open.coordinator_cycle == Some(coordinator.cycle())
            && match window {
                WindowKind::Clean => {
                    matches!(coordinator.phase(), Phase::PreClean | Phase::Cleaning)
                }
                WindowKind::Probe => coordinator.phase() == Phase::ProbeActive,
            };
        let interrupted = if owns_fan {
            let reason = format!("no {} end event within {:.1}s", window, self.watchdog_time);
            coordinator.force_idle(now, &reason)
        } else {
            None
        };

        let report = WatchdogTimeout {
            window,
            opened_at: open.opened_at,
            expired_at: now,
            interrupted,
        };
        log::warn!("ProbeCleanListener: watchdog: {}", report);
        Some(report)
    }

    /// Forgets every open window. Used by the operator reset command.
    pub fn reset(&mut self) -> bool {
        let had_open = self.clean.is_some() || self.probe.is_some();
        self.clean = None;
        self.probe = None;
        self.probe_held = false;
        self.home_held = false;
        had_open
    }

    fn open_window(
        &mut self,
        window: WindowKind,
        now: f64,
        accepted: bool,
        coordinator: &FanCoordinator,
    ) -> OpenWindow {
        self.next_token += 1;
        let token = self.next_token;
        // Armed even when the coordinator refused the begin, so a lost end
        // event cannot wedge the listener's own bookkeeping
        self.timers.push(TimerRequest {
            kind: TimerKind::Watchdog { window, token },
            waketime: now + self.watchdog_time,
            // Informational only: watchdogs are matched by token, and the
            // window's own coordinator_cycle decides whether to force idle
            cycle: coordinator.cycle(),
        });
        OpenWindow {
            token,
            opened_at: now,
            coordinator_cycle: accepted.then(|| coordinator.cycle()),
        }
    }

    fn outcome(request: Request, result: Result<(), FanCoordinatorError>) -> EventOutcome {
        match result {
            Ok(()) => EventOutcome::Forwarded(request),
            Err(e) => {
                match e {
                    FanCoordinatorError::ConflictingRequest { .. } => {
                        log::warn!("ProbeCleanListener: {}", e)
                    }
                    FanCoordinatorError::NotActive { .. } => {
                        log::debug!("ProbeCleanListener: {}", e)
                    }
                }
                EventOutcome::Rejected(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extras::fan::{FanOutput, LoggingPwmPin};
    use crate::extras::fan_coordinator::CoordinatorTiming;

    fn setup() -> (ProbeCleanListener, FanCoordinator, LoggingPwmPin) {
        let pin = LoggingPwmPin::new("nozzle_fan");
        let timing = CoordinatorTiming {
            clean_speed: 1.0,
            post_clean_speed: None,
            ramp_time: 0.5,
            settle_time: 2.0,
        };
        let output = FanOutput::new(Box::new(pin.clone()), 1.0, 0.0);
        let coordinator = FanCoordinator::new(timing, output);
        (ProbeCleanListener::new(10.0), coordinator, pin)
    }

    fn watchdog_timer(timers: &[TimerRequest]) -> TimerRequest {
        *timers
            .iter()
            .find(|t| matches!(t.kind, TimerKind::Watchdog { .. }))
            .expect("watchdog armed")
    }

    #[test]
    fn event_names_round_trip() {
        for event in HostEvent::ALL {
            assert_eq!(HostEvent::from_name(event.name()), Some(event));
        }
        assert_eq!(HostEvent::from_name(" Probe_Start "), Some(HostEvent::ProbeStart));
        assert_eq!(HostEvent::from_name("print_start"), None);
    }

    #[test]
    fn duplicate_notifications_are_ignored() {
        let (mut listener, mut coord, pin) = setup();
        assert_eq!(
            listener.handle_event(HostEvent::CleanStart, 0.0, &mut coord),
            EventOutcome::Forwarded(Request::BeginClean)
        );
        assert_eq!(
            listener.handle_event(HostEvent::CleanStart, 0.1, &mut coord),
            EventOutcome::Duplicate
        );
        assert_eq!(coord.window().unwrap().started_at, 0.0);

        assert_eq!(
            listener.handle_event(HostEvent::CleanEnd, 1.0, &mut coord),
            EventOutcome::Forwarded(Request::EndClean)
        );
        assert_eq!(
            listener.handle_event(HostEvent::CleanEnd, 1.1, &mut coord),
            EventOutcome::Duplicate
        );
        assert_eq!(
            listener.handle_event(HostEvent::ProbeEnd, 1.2, &mut coord),
            EventOutcome::Duplicate
        );
        assert_eq!(coord.phase(), Phase::Settling);
        assert_eq!(pin.writes().len(), 1);
    }

    #[test]
    fn homing_and_probing_share_the_probe_window() {
        let (mut listener, mut coord, _pin) = setup();
        assert_eq!(
            listener.handle_event(HostEvent::HomeStart, 0.0, &mut coord),
            EventOutcome::Forwarded(Request::BeginProbe)
        );
        assert_eq!(
            listener.handle_event(HostEvent::ProbeStart, 0.5, &mut coord),
            EventOutcome::Joined
        );
        assert_eq!(listener.handle_event(HostEvent::ProbeEnd, 1.0, &mut coord), EventOutcome::Held);
        assert_eq!(coord.phase(), Phase::ProbeActive);
        assert_eq!(
            listener.handle_event(HostEvent::HomeEnd, 1.5, &mut coord),
            EventOutcome::Forwarded(Request::EndProbe)
        );
        assert_eq!(coord.phase(), Phase::Idle);
        assert!(!listener.probe_open());
    }

    #[test]
    fn conflicting_begin_is_reported_and_cycle_continues() {
        let (mut listener, mut coord, _pin) = setup();
        listener.handle_event(HostEvent::ProbeStart, 0.0, &mut coord);
        let outcome = listener.handle_event(HostEvent::CleanStart, 0.2, &mut coord);
        assert!(matches!(
            outcome,
            EventOutcome::Rejected(FanCoordinatorError::ConflictingRequest {
                request: Request::BeginClean,
                ..
            })
        ));
        assert_eq!(coord.phase(), Phase::ProbeActive);
        // The rejected clean still closes cleanly on its end event
        assert!(matches!(
            listener.handle_event(HostEvent::CleanEnd, 0.4, &mut coord),
            EventOutcome::Rejected(FanCoordinatorError::NotActive { .. })
        ));
        assert!(!listener.clean_open());
        assert_eq!(coord.phase(), Phase::ProbeActive);
    }

    #[test]
    fn watchdog_forces_idle_when_end_never_arrives() {
        let (mut listener, mut coord, pin) = setup();
        coord.set_requested_duty(0.3, 0.0);
        listener.handle_event(HostEvent::CleanStart, 1.0, &mut coord);
        let watchdog = watchdog_timer(&listener.take_timer_requests());
        assert_eq!(watchdog.waketime, 11.0);

        let report = listener
            .watchdog_expired(watchdog, 11.0, &mut coord)
            .expect("watchdog should trip");
        assert_eq!(report.window, WindowKind::Clean);
        assert_eq!(report.interrupted, Some(Phase::PreClean));
        assert_eq!(coord.phase(), Phase::Idle);
        assert_eq!(pin.last_value(), Some(0.3));
        assert_eq!(listener.watchdog_trips(), 1);
        assert!(!listener.clean_open());

        // A new clean can start afterwards
        assert_eq!(
            listener.handle_event(HostEvent::CleanStart, 12.0, &mut coord),
            EventOutcome::Forwarded(Request::BeginClean)
        );
    }

    #[test]
    fn watchdog_is_stale_after_matching_end() {
        let (mut listener, mut coord, _pin) = setup();
        listener.handle_event(HostEvent::CleanStart, 0.0, &mut coord);
        let watchdog = watchdog_timer(&listener.take_timer_requests());
        listener.handle_event(HostEvent::CleanEnd, 1.0, &mut coord);

        assert_eq!(listener.watchdog_expired(watchdog, 10.0, &mut coord), None);
        assert_eq!(listener.watchdog_trips(), 0);
    }

    #[test]
    fn watchdog_leaves_fan_alone_once_probe_took_over() {
        let (mut listener, mut coord, _pin) = setup();
        listener.handle_event(HostEvent::CleanStart, 0.0, &mut coord);
        let clean_watchdog = watchdog_timer(&listener.take_timer_requests());
        listener.handle_event(HostEvent::ProbeStart, 1.0, &mut coord);

        let report = listener.watchdog_expired(clean_watchdog, 10.0, &mut coord).unwrap();
        assert_eq!(report.interrupted, None);
        assert_eq!(coord.phase(), Phase::ProbeActive);
        assert!(listener.probe_open());
    }

    #[test]
    fn probe_watchdog_clears_both_holders() {
        let (mut listener, mut coord, _pin) = setup();
        listener.handle_event(HostEvent::HomeStart, 0.0, &mut coord);
        listener.handle_event(HostEvent::ProbeStart, 0.1, &mut coord);
        let watchdog = watchdog_timer(&listener.take_timer_requests());

        let report = listener.watchdog_expired(watchdog, 10.0, &mut coord).unwrap();
        assert_eq!(report.interrupted, Some(Phase::ProbeActive));
        assert_eq!(coord.phase(), Phase::Idle);
        assert_eq!(
            listener.handle_event(HostEvent::ProbeEnd, 10.5, &mut coord),
            EventOutcome::Duplicate
        );
    }

    #[test]
    fn reset_forgets_open_windows() {
        let (mut listener, mut coord, _pin) = setup();
        assert!(!listener.reset());
        listener.handle_event(HostEvent::CleanStart, 0.0, &mut coord);
        assert!(listener.reset());
        assert!(!listener.clean_open());
    }
}
