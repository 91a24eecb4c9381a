// klippy_nozzle_fan/src/printer.rs
// The printer object: shared handles to the reactor, G-code dispatcher and
// event bus that extras are wired onto at load time.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core_traits::Reactor;
use crate::gcode::{CommandError, GCodeCommand, GCodeDispatch, GCodeHandler};

/// Event handlers receive the event time the notification was sent at.
pub type EventHandler = Arc<dyn Fn(f64) + Send + Sync>;

#[derive(Clone)]
pub struct Printer {
    reactor: Arc<dyn Reactor>,
    gcode: Arc<Mutex<GCodeDispatch>>,
    event_handlers: Arc<Mutex<HashMap<String, Vec<EventHandler>>>>,
    console: Arc<Mutex<Vec<String>>>,
}

impl Printer {
    pub fn new(reactor: Arc<dyn Reactor>) -> Self {
        Printer {
            reactor,
            gcode: Arc::new(Mutex::new(GCodeDispatch::new())),
            event_handlers: Arc::new(Mutex::new(HashMap::new())),
            console: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn get_reactor(&self) -> Arc<dyn Reactor> {
        self.reactor.clone()
    }

    pub fn register_event_handler(&self, event: &str, handler: EventHandler) {
        self.event_handlers
            .lock()
            .entry(event.to_string())
            .or_default()
            .push(handler);
    }

    /// Delivers `event` to every registered handler, in registration order.
    /// Returns the number of handlers invoked.
    pub fn send_event(&self, event: &str) -> usize {
        let eventtime = self.reactor.monotonic();
        // Handlers run unlocked so they may send further events
        let handlers = self.event_handlers.lock().get(event).cloned().unwrap_or_default();
        log::debug!(
            "Printer: event '{}' at {:.3} -> {} handler(s)",
            event,
            eventtime,
            handlers.len()
        );
        for handler in &handlers {
            handler(eventtime);
        }
        handlers.len()
    }

    pub fn register_command(
        &self,
        name: &str,
        handler: GCodeHandler,
        description: Option<&str>,
    ) -> Result<(), CommandError> {
        self.gcode.lock().register_command(name, handler, description)
    }

    /// Parses and runs one G-code line, returning any responses it produced.
    pub fn run_script_line(&self, line: &str) -> Result<Vec<String>, CommandError> {
        let gcmd = GCodeCommand::parse(line)?;
        let handler = self
            .gcode
            .lock()
            .lookup(&gcmd.command)
            .ok_or_else(|| CommandError::UnknownCommand(gcmd.command.clone()))?;
        handler(&gcmd)?;
        Ok(gcmd.take_responses())
    }

    /// Unsolicited console message, not tied to a running command.
    pub fn respond_info(&self, msg: &str) {
        log::info!("{}", msg);
        self.console.lock().push(msg.to_string());
    }

    pub fn take_console_messages(&self) -> Vec<String> {
        std::mem::take(&mut *self.console.lock())
    }

    pub fn command_help(&self) -> Vec<(String, String)> {
        self.gcode.lock().help()
    }
}
