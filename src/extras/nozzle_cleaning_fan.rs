// klippy_nozzle_fan/src/extras/nozzle_cleaning_fan.rs
// The [nozzle_cleaning_fan] printer object: config loading, event and
// G-code registration, and timer plumbing around the fan coordinator.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::json;

use crate::configfile::{ConfigError, Configfile, FloatBounds};
use crate::core_traits::{PrintKObject, Reactor};
use crate::extras::fan::{FanOutput, PwmPin};
use crate::extras::fan_coordinator::{
    CoordinatorTiming, FanCoordinator, Phase, TimerKind, TimerRequest,
};
use crate::extras::probe_clean_listener::{
    EventOutcome, HostEvent, ProbeCleanListener, WatchdogTimeout,
};
use crate::gcode::{CommandError, GCodeCommand};
use crate::printer::Printer;

pub const CONFIG_SECTION: &str = "nozzle_cleaning_fan";

#[derive(Debug, Clone, PartialEq)]
pub enum NozzleFanError {
    Config(ConfigError),
    Command(CommandError),
}

impl std::fmt::Display for NozzleFanError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NozzleFanError::Config(e) => write!(f, "[{}] config error: {}", CONFIG_SECTION, e),
            NozzleFanError::Command(e) => {
                write!(f, "[{}] command registration failed: {}", CONFIG_SECTION, e)
            }
        }
    }
}

impl std::error::Error for NozzleFanError {}

impl From<ConfigError> for NozzleFanError {
    fn from(e: ConfigError) -> Self {
        NozzleFanError::Config(e)
    }
}

impl From<CommandError> for NozzleFanError {
    fn from(e: CommandError) -> Self {
        NozzleFanError::Command(e)
    }
}

// --- Configuration Parameters ---

#[derive(Debug, Clone, PartialEq)]
pub struct NozzleFanParams {
    pub pin: String,
    pub clean_speed: f64,
    pub post_clean_speed: Option<f64>,
    pub ramp_time: f64,
    pub settle_time: f64,
    pub watchdog_time: f64,
    pub min_toggle_interval: f64,
    pub max_power: f64,
}

impl NozzleFanParams {
    pub fn new_from_config(config: &Configfile, section: &str) -> Result<Self, ConfigError> {
        if !config.has_section(section) {
            return Err(ConfigError::SectionNotFound(section.to_string()));
        }
        let fraction = FloatBounds::fraction();
        let seconds = FloatBounds::non_negative();
        let power = FloatBounds { above: Some(0.0), maxval: Some(1.0), minval: None };
        Ok(NozzleFanParams {
            pin: config.get(section, "pin", None)?,
            clean_speed: config.getfloat(section, "clean_speed", Some(1.0), fraction)?,
            post_clean_speed: config.getfloat_opt(section, "post_clean_speed", fraction)?,
            ramp_time: config.getfloat(section, "ramp_time", Some(0.5), seconds)?,
            settle_time: config.getfloat(section, "settle_time", Some(2.0), seconds)?,
            watchdog_time: config.getfloat(
                section,
                "watchdog_time",
                Some(60.0),
                FloatBounds::positive(),
            )?,
            min_toggle_interval: config.getfloat(
                section,
                "min_toggle_interval",
                Some(0.1),
                seconds,
            )?,
            max_power: config.getfloat(section, "max_power", Some(1.0), power)?,
        })
    }

    pub fn timing(&self) -> CoordinatorTiming {
        CoordinatorTiming {
            clean_speed: self.clean_speed,
            post_clean_speed: self.post_clean_speed,
            ramp_time: self.ramp_time,
            settle_time: self.settle_time,
        }
    }
}

// --- Printer Object ---

pub struct PrinterNozzleFan {
    params: NozzleFanParams,
    reactor: Arc<dyn Reactor>,
    coordinator: FanCoordinator,
    listener: ProbeCleanListener,
    last_watchdog: Option<WatchdogTimeout>,
    // Console for watchdog notices, set when wired onto a printer
    console: Option<Printer>,
}

impl PrinterNozzleFan {
    pub fn new(params: NozzleFanParams, reactor: Arc<dyn Reactor>, pin: Box<dyn PwmPin>) -> Self {
        let output = FanOutput::new(pin, params.max_power, params.min_toggle_interval);
        let coordinator = FanCoordinator::new(params.timing(), output);
        let listener = ProbeCleanListener::new(params.watchdog_time);
        PrinterNozzleFan {
            params,
            reactor,
            coordinator,
            listener,
            last_watchdog: None,
            console: None,
        }
    }

    /// Reads `[nozzle_cleaning_fan]`, resolves its pin and wires the object
    /// onto the printer's event bus and G-code dispatcher.
    pub fn load_config(
        printer: &Printer,
        config: &Configfile,
        pwm_pin_resolver: impl FnOnce(&str) -> Box<dyn PwmPin>,
    ) -> Result<Arc<Mutex<Self>>, NozzleFanError> {
        let params = NozzleFanParams::new_from_config(config, CONFIG_SECTION)?;
        let pin = pwm_pin_resolver(&params.pin);
        log::info!("{}: loaded on pin {} ({:?})", CONFIG_SECTION, params.pin, params);

        let mut nozzle_fan = Self::new(params, printer.get_reactor(), pin);
        nozzle_fan.console = Some(printer.clone());
        let fan = Arc::new(Mutex::new(nozzle_fan));
        Self::register_event_handlers(printer, Arc::downgrade(&fan));
        Self::register_commands(printer, Arc::downgrade(&fan))?;
        Ok(fan)
    }

    pub fn params(&self) -> &NozzleFanParams {
        &self.params
    }

    pub fn coordinator(&self) -> &FanCoordinator {
        &self.coordinator
    }

    pub fn listener(&self) -> &ProbeCleanListener {
        &self.listener
    }

    pub fn last_watchdog(&self) -> Option<&WatchdogTimeout> {
        self.last_watchdog.as_ref()
    }

    pub fn handle_event(&mut self, event: HostEvent, eventtime: f64) -> EventOutcome {
        let outcome = self.listener.handle_event(event, eventtime, &mut self.coordinator);
        match &outcome {
            EventOutcome::Duplicate => log::debug!(
                "{}: duplicate {} at {:.3} ignored",
                CONFIG_SECTION,
                event.name(),
                eventtime
            ),
            other => log::debug!(
                "{}: {} at {:.3} -> {:?}",
                CONFIG_SECTION,
                event.name(),
                eventtime,
                other
            ),
        }
        outcome
    }

    pub fn handle_timer(&mut self, timer: TimerRequest, eventtime: f64) {
        match timer.kind {
            TimerKind::Watchdog { .. } => {
                let expired =
                    self.listener.watchdog_expired(timer, eventtime, &mut self.coordinator);
                if let Some(report) = expired {
                    if let Some(console) = &self.console {
                        console.respond_info(&format!("{}: watchdog: {}", CONFIG_SECTION, report));
                    }
                    self.last_watchdog = Some(report);
                }
            }
            _ => {
                self.coordinator.handle_timer(timer, eventtime);
            }
        }
    }

    pub fn set_requested_duty(&mut self, duty: f64, eventtime: f64) {
        self.coordinator.set_requested_duty(duty, eventtime);
    }

    /// Operator escape hatch: drops any open window and restores the
    /// requested duty. Returns the phase that was cancelled.
    pub fn reset(&mut self, eventtime: f64) -> Option<Phase> {
        self.listener.reset();
        self.coordinator.force_idle(eventtime, "operator reset")
    }

    pub fn status_message(&self) -> String {
        let state = self.coordinator.fan_state();
        let mut msg = format!(
            "{}: phase={} duty={:.2} requested={:.2}",
            CONFIG_SECTION,
            self.coordinator.phase(),
            state.current_duty,
            state.requested_duty
        );
        if state.override_active {
            msg.push_str(&format!(" override={:.2}", state.override_duty));
        }
        if let Some(deadline) = self.coordinator.window().and_then(|w| w.settle_deadline) {
            msg.push_str(&format!(" settle_deadline={:.3}", deadline));
        }
        msg
    }

    fn take_timer_requests(&mut self) -> Vec<TimerRequest> {
        let mut timers = self.coordinator.take_timer_requests();
        timers.extend(self.listener.take_timer_requests());
        timers
    }

    fn register_event_handlers(printer: &Printer, fan: Weak<Mutex<Self>>) {
        for event in HostEvent::ALL {
            let fan = fan.clone();
            printer.register_event_handler(
                event.name(),
                Arc::new(move |eventtime: f64| {
                    run_locked(&fan, |nf| nf.handle_event(event, eventtime));
                }),
            );
        }
    }

    fn register_commands(printer: &Printer, fan: Weak<Mutex<Self>>) -> Result<(), CommandError> {
        let weak = fan.clone();
        printer.register_command(
            "NOZZLE_FAN_STATUS",
            Arc::new(move |gcmd: &GCodeCommand| -> Result<(), CommandError> {
                let msg = run_locked(&weak, |nf| nf.status_message()).ok_or_else(dropped)?;
                gcmd.respond_info(&msg);
                Ok(())
            }),
            Some("Report nozzle cleaning fan state"),
        )?;

        let weak = fan.clone();
        printer.register_command(
            "NOZZLE_FAN_RESET",
            Arc::new(move |gcmd: &GCodeCommand| -> Result<(), CommandError> {
                let cancelled = run_locked(&weak, |nf| {
                    let now = nf.reactor.monotonic();
                    nf.reset(now)
                })
                .ok_or_else(dropped)?;
                match cancelled {
                    Some(phase) => {
                        gcmd.respond_info(&format!("{}: cancelled {} cycle", CONFIG_SECTION, phase))
                    }
                    None => gcmd.respond_info(&format!("{}: no active cycle", CONFIG_SECTION)),
                }
                Ok(())
            }),
            Some("Cancel a stuck cleaning or probing cycle"),
        )?;

        let weak = fan.clone();
        printer.register_command(
            "SET_NOZZLE_FAN",
            Arc::new(move |gcmd: &GCodeCommand| -> Result<(), CommandError> {
                let speed = gcmd.get_float("SPEED", None, Some(0.0), Some(1.0))?;
                request_speed(&weak, speed)
            }),
            Some("Set the requested nozzle fan speed (0.0-1.0)"),
        )?;

        // M106 values above 255 are clamped by the coordinator
        let weak = fan.clone();
        printer.register_command(
            "M106",
            Arc::new(move |gcmd: &GCodeCommand| -> Result<(), CommandError> {
                let value = gcmd.get_float("S", Some(255.0), None, None)?;
                request_speed(&weak, value / 255.0)
            }),
            Some("Set fan speed"),
        )?;

        let weak = fan.clone();
        printer.register_command(
            "M107",
            Arc::new(move |_gcmd: &GCodeCommand| request_speed(&weak, 0.0)),
            Some("Turn fan off"),
        )?;

        let weak = fan.clone();
        printer.register_command(
            "NOZZLE_CLEAN_START",
            Arc::new(move |gcmd: &GCodeCommand| notify(&weak, gcmd, HostEvent::CleanStart)),
            Some("Notify that the nozzle cleaning macro has started"),
        )?;

        printer.register_command(
            "NOZZLE_CLEAN_END",
            Arc::new(move |gcmd: &GCodeCommand| notify(&fan, gcmd, HostEvent::CleanEnd)),
            Some("Notify that the nozzle cleaning macro has finished"),
        )?;
        Ok(())
    }
}

impl PrintKObject for PrinterNozzleFan {
    fn get_status(&self, _eventtime: f64) -> serde_json::Value {
        let state = self.coordinator.fan_state();
        json!({
            "phase": self.coordinator.phase().as_str(),
            "current_duty": state.current_duty,
            "requested_duty": state.requested_duty,
            "override_active": state.override_active,
            "override_duty": state.override_duty,
            "cycle": self.coordinator.cycle(),
            "watchdog_trips": self.listener.watchdog_trips(),
            "last_watchdog": self.last_watchdog.as_ref().map(|w| w.to_string()),
        })
    }
}

fn dropped() -> CommandError {
    CommandError::GCodeError(format!("{} object is no longer available", CONFIG_SECTION))
}

fn request_speed(fan: &Weak<Mutex<PrinterNozzleFan>>, duty: f64) -> Result<(), CommandError> {
    run_locked(fan, |nf| {
        let now = nf.reactor.monotonic();
        nf.set_requested_duty(duty, now);
    })
    .ok_or_else(dropped)
}

fn notify(
    fan: &Weak<Mutex<PrinterNozzleFan>>,
    gcmd: &GCodeCommand,
    event: HostEvent,
) -> Result<(), CommandError> {
    let outcome = run_locked(fan, |nf| {
        let now = nf.reactor.monotonic();
        nf.handle_event(event, now)
    })
    .ok_or_else(dropped)?;
    if let EventOutcome::Rejected(e) = outcome {
        gcmd.respond_info(&format!("{}: {}", CONFIG_SECTION, e));
    }
    Ok(())
}

/// Runs `f` on the fan with its lock held, then hands any timers it
/// requested to the reactor once the lock is released.
fn run_locked<R>(
    fan: &Weak<Mutex<PrinterNozzleFan>>,
    f: impl FnOnce(&mut PrinterNozzleFan) -> R,
) -> Option<R> {
    let strong = fan.upgrade()?;
    let (result, timers, reactor) = {
        let mut nf = strong.lock();
        let result = f(&mut *nf);
        (result, nf.take_timer_requests(), nf.reactor.clone())
    };
    schedule_timers(fan, reactor.as_ref(), timers);
    Some(result)
}

fn schedule_timers(
    fan: &Weak<Mutex<PrinterNozzleFan>>,
    reactor: &dyn Reactor,
    timers: Vec<TimerRequest>,
) {
    for timer in timers {
        let fan = fan.clone();
        reactor.register_callback(
            timer.waketime,
            Box::new(move |eventtime: f64| fire_timer(&fan, timer, eventtime)),
        );
    }
}

fn fire_timer(fan: &Weak<Mutex<PrinterNozzleFan>>, timer: TimerRequest, eventtime: f64) {
    run_locked(fan, |nf| nf.handle_timer(timer, eventtime));
}
