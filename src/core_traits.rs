// klippy_nozzle_fan/src/core_traits.rs

/// Callback handed to the reactor; receives the event time it runs at.
pub type TimerCallback = Box<dyn FnOnce(f64) + Send>;

// --- Reactor Trait ---
/// Event loop clock and one-shot timer scheduling.
pub trait Reactor: Send + Sync {
    /// Current time on the reactor's monotonic clock, in seconds.
    fn monotonic(&self) -> f64;

    /// Runs `callback` once the clock reaches `waketime`. There is no
    /// cancellation; callers guard stale callbacks themselves.
    fn register_callback(&self, waketime: f64, callback: TimerCallback);
}

// --- PrintKObject Trait ---
/// Objects that report status to the host's query/webhooks layer.
pub trait PrintKObject {
    fn get_status(&self, eventtime: f64) -> serde_json::Value;
}
