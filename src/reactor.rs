// klippy_nozzle_fan/src/reactor.rs
// Simulated-time event reactor.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use parking_lot::Mutex;

use crate::core_traits::{Reactor, TimerCallback};

struct PendingTimer {
    waketime: f64,
    // Registration order, breaks ties so equal waketimes run FIFO
    order: u64,
    callback: TimerCallback,
}

impl PartialEq for PendingTimer {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PendingTimer {}

impl PartialOrd for PendingTimer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PendingTimer {
    // Reversed so the BinaryHeap pops the earliest timer first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .waketime
            .total_cmp(&self.waketime)
            .then_with(|| other.order.cmp(&self.order))
    }
}

#[derive(Default)]
struct ReactorState {
    now: f64,
    next_order: u64,
    timers: BinaryHeap<PendingTimer>,
}

/// Deterministic reactor whose clock only moves when told to. Used by the
/// simulator binary and by tests that need to step through timed behaviour.
#[derive(Default)]
pub struct SimReactor {
    state: Mutex<ReactorState>,
}

impl SimReactor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_timers(&self) -> usize {
        self.state.lock().timers.len()
    }

    /// Advances the clock to `target`, running every callback due on the
    /// way in time order. Callbacks run without the reactor lock held, so
    /// they may register further callbacks; those run too if they fall due
    /// before `target`.
    pub fn advance_to(&self, target: f64) {
        loop {
            let timer = {
                let mut state = self.state.lock();
                let due = state.timers.peek().map_or(false, |next| next.waketime <= target);
                match if due { state.timers.pop() } else { None } {
                    Some(timer) => {
                        if timer.waketime > state.now {
                            state.now = timer.waketime;
                        }
                        timer
                    }
                    None => {
                        if target > state.now {
                            state.now = target;
                        }
                        return;
                    }
                }
            };
            let eventtime = self.monotonic();
            log::trace!("SimReactor: running timer due {:.3} at {:.3}", timer.waketime, eventtime);
            (timer.callback)(eventtime);
        }
    }

    pub fn advance_by(&self, delta: f64) {
        let target = self.monotonic() + delta;
        self.advance_to(target);
    }
}

impl Reactor for SimReactor {
    fn monotonic(&self) -> f64 {
        self.state.lock().now
    }

    fn register_callback(&self, waketime: f64, callback: TimerCallback) {
        let mut state = self.state.lock();
        let order = state.next_order;
        state.next_order += 1;
        state.timers.push(PendingTimer { waketime, order, callback });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn runs_callbacks_in_time_order() {
        let reactor = SimReactor::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for (waketime, tag) in [(2.0, "b"), (1.0, "a"), (2.0, "c"), (5.0, "late")] {
            let log = log.clone();
            reactor.register_callback(waketime, Box::new(move |t| log.lock().push((tag, t))));
        }

        reactor.advance_to(3.0);
        assert_eq!(*log.lock(), vec![("a", 1.0), ("b", 2.0), ("c", 2.0)]);
        assert_eq!(reactor.monotonic(), 3.0);
        assert_eq!(reactor.pending_timers(), 1);
    }

    #[test]
    fn callbacks_may_register_followups() {
        let reactor = Arc::new(SimReactor::new());
        let hits = Arc::new(Mutex::new(Vec::new()));

        let inner_reactor = reactor.clone();
        let inner_hits = hits.clone();
        reactor.register_callback(
            1.0,
            Box::new(move |t| {
                inner_hits.lock().push(t);
                let again = inner_hits.clone();
                inner_reactor.register_callback(t + 0.5, Box::new(move |t2| again.lock().push(t2)));
            }),
        );

        reactor.advance_by(2.0);
        assert_eq!(*hits.lock(), vec![1.0, 1.5]);
    }

    #[test]
    fn clock_never_moves_backwards() {
        let reactor = SimReactor::new();
        reactor.advance_to(4.0);
        reactor.advance_to(1.0);
        assert_eq!(reactor.monotonic(), 4.0);
    }
}
