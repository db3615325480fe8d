//! Begin/complete logging around a multi-step operation

use std::cell::Cell;
use std::time::Instant;

use super::logger::Logger;

/// Logs `{name}_BEGIN` on creation, `{name}_COMPLETE` (with `elapsed_ms`)
/// or `{name}_FAILED` when finished, and `{name}_INCOMPLETE` if dropped
/// without either.
pub struct ObservationScope<'a> {
    name: &'a str,
    finished: Cell<bool>,
    timer: Timer,
}

impl<'a> ObservationScope<'a> {
    pub fn new(name: &'a str, fields: &[(&str, &str)]) -> Self {
        Logger::info(&format!("{}_BEGIN", name), fields);
        Self {
            name,
            finished: Cell::new(false),
            timer: Timer::new(),
        }
    }

    pub fn complete(self, fields: &[(&str, &str)]) {
        self.finished.set(true);
        let elapsed = self.timer.elapsed_ms();
        let mut all: Vec<(&str, &str)> = fields.to_vec();
        all.push(("elapsed_ms", &elapsed));
        Logger::info(&format!("{}_COMPLETE", self.name), &all);
    }

    /// Failure that aborts startup
    pub fn fail_fatal(self, reason: &str) {
        self.finished.set(true);
        Logger::fatal(&format!("{}_FAILED", self.name), &[("reason", reason)]);
    }
}

impl Drop for ObservationScope<'_> {
    fn drop(&mut self) {
        if !self.finished.get() {
            Logger::warn(
                &format!("{}_INCOMPLETE", self.name),
                &[("reason", "scope dropped without completion")],
            );
        }
    }
}

/// Wall-clock stopwatch for log fields
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> String {
        self.start.elapsed().as_millis().to_string()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
