//! Crash-point injection for durability tests
//!
//! Setting `BINLOG_CRASH_POINT=<name>` makes the process abort the moment
//! execution reaches `maybe_crash(<name>)`: no unwinding, no destructors,
//! no buffered output flushed. Tests spawn a child process with the
//! variable set, then restart against the same directory and check what
//! recovery sees.
//!
//! ```bash
//! BINLOG_CRASH_POINT=group_commit_after_fsync binlog init --config cfg.json
//! ```

use std::sync::OnceLock;

pub const CRASH_POINT_ENV: &str = "BINLOG_CRASH_POINT";

static CRASH_POINT: OnceLock<Option<String>> = OnceLock::new();

fn configured() -> Option<&'static str> {
    CRASH_POINT
        .get_or_init(|| std::env::var(CRASH_POINT_ENV).ok())
        .as_deref()
}

#[inline]
pub fn crash_point_enabled(name: &str) -> bool {
    configured() == Some(name)
}

/// Abort immediately if `name` is the configured crash point
#[inline]
pub fn maybe_crash(name: &str) {
    if crash_point_enabled(name) {
        eprintln!("[CRASH] aborting at crash point {}", name);
        std::process::abort();
    }
}

pub mod points {
    pub const GROUP_COMMIT_BEFORE_WRITE: &str = "group_commit_before_write";
    pub const GROUP_COMMIT_AFTER_WRITE: &str = "group_commit_after_write";
    pub const GROUP_COMMIT_BEFORE_FSYNC: &str = "group_commit_before_fsync";
    pub const GROUP_COMMIT_AFTER_FSYNC: &str = "group_commit_after_fsync";
    /// Successor file is durable but not yet in the index
    pub const ROTATE_BEFORE_INDEX: &str = "rotate_before_index";
    pub const ROTATE_AFTER_INDEX: &str = "rotate_after_index";
    pub const TC_AFTER_SLOT_SYNC: &str = "tc_after_slot_sync";
    /// Durability token reserved, engines not yet told to commit
    pub const COMMIT_BEFORE_ENGINE_COMMIT: &str = "commit_before_engine_commit";
    pub const RECOVERY_START: &str = "recovery_start";

    pub fn all() -> &'static [&'static str] {
        &[
            GROUP_COMMIT_BEFORE_WRITE,
            GROUP_COMMIT_AFTER_WRITE,
            GROUP_COMMIT_BEFORE_FSYNC,
            GROUP_COMMIT_AFTER_FSYNC,
            ROTATE_BEFORE_INDEX,
            ROTATE_AFTER_INDEX,
            TC_AFTER_SLOT_SYNC,
            COMMIT_BEFORE_ENGINE_COMMIT,
            RECOVERY_START,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_point_is_disabled() {
        // The test harness never sets the variable
        assert!(!crash_point_enabled("no_such_point"));
        maybe_crash("no_such_point");
    }

    #[test]
    fn test_point_names_unique() {
        let all = points::all();
        let mut sorted = all.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(sorted.len(), all.len());
    }
}
