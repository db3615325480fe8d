//! Observability for the binary log
//!
//! - Structured logging (one JSON object per line)
//! - Passive counters
//! - Typed lifecycle events
//!
//! Observability never feeds back into behavior: counters are only read by
//! status reporting and tests, and logging failures are swallowed.
//!
//! ```ignore
//! use binlog::observability::{log_event_with_fields, Event, MetricsRegistry};
//!
//! log_event_with_fields(Event::FileRotated, &[("from", "binlog.000001")]);
//! let metrics = MetricsRegistry::new();
//! metrics.increment_fsyncs();
//! ```

mod events;
mod logger;
mod metrics;
mod scope;

pub use events::Event;
pub use logger::{Logger, Severity};
pub use metrics::{MetricsRegistry, MetricsSnapshot};
pub use scope::{ObservationScope, Timer};

/// Log a lifecycle event at its natural severity
pub fn log_event(event: Event) {
    log_event_with_fields(event, &[]);
}

/// Log a lifecycle event with fields at its natural severity
pub fn log_event_with_fields(event: Event, fields: &[(&str, &str)]) {
    Logger::log(event.severity(), event.as_str(), fields);
}
