//! Position state file
//!
//! Text format, one `domain-server-seq` per line, most recent entry of each
//! domain last. Written with fsync at clean shutdown and removed once a new
//! log file's head marker supersedes it. A missing file is an empty state.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use super::errors::{GtidError, GtidResult};
use super::{Gtid, GtidState};

/// Write `state` durably to `path` (temp file + rename)
pub fn write_state_file(path: &Path, state: &GtidState) -> GtidResult<()> {
    let tmp = path.with_extension("tmp");
    {
        let mut file = File::create(&tmp)?;
        let mut content = String::new();
        for gtid in state.to_list() {
            content.push_str(&gtid.to_string());
            content.push('\n');
        }
        file.write_all(content.as_bytes())?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    if let Some(parent) = path.parent() {
        if let Ok(dir) = File::open(parent) {
            let _ = dir.sync_all();
        }
    }
    Ok(())
}

/// Read the state file; `Ok(None)` when it does not exist
pub fn read_state_file(path: &Path) -> GtidResult<Option<GtidState>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(GtidError::Io(e)),
    };

    let mut list = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let gtid: Gtid = line.parse().map_err(|_| GtidError::StateFile {
            line: idx + 1,
            reason: format!("cannot parse '{}'", line),
        })?;
        list.push(gtid);
    }
    Ok(Some(GtidState::from_list(&list)))
}

/// Remove the state file if present
pub fn remove_state_file(path: &Path) -> GtidResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(GtidError::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_missing_file_is_none() {
        let dir = TempDir::new().unwrap();
        assert!(read_state_file(&dir.path().join("binlog.state"))
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_write_then_read() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("binlog.state");
        let state = GtidState::from_list(&[
            Gtid::new(0, 2, 4),
            Gtid::new(0, 1, 9),
            Gtid::new(7, 1, 1),
        ]);
        write_state_file(&path, &state).unwrap();
        let loaded = read_state_file(&path).unwrap().unwrap();
        assert_eq!(loaded, state);
        assert_eq!(loaded.find_most_recent(0), Some(Gtid::new(0, 1, 9)));
    }

    #[test]
    fn test_bad_line_reports_line_number() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("binlog.state");
        fs::write(&path, "0-1-1\nnot-a-gtid\n").unwrap();
        match read_state_file(&path) {
            Err(GtidError::StateFile { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_remove_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("binlog.state");
        write_state_file(&path, &GtidState::new()).unwrap();
        remove_state_file(&path).unwrap();
        remove_state_file(&path).unwrap();
        assert!(!path.exists());
    }
}
