//! CLI command implementations
//!
//! Every command loads and validates the configuration first. `init` is the
//! only command that boots the service; the others work on the files
//! directly and expect the service to be stopped.

use std::path::Path;
use std::sync::Arc;

use serde_json::{json, Value};

use crate::binlog::header::HEADER_LEN;
use crate::binlog::{LogFileStore, LogReader, ReadRecord, RecordBody};
use crate::config::BinlogConfig;
use crate::observability::MetricsRegistry;
use crate::recovery::RecoveryManager;
use crate::service::BinlogService;

use super::args::Command;
use super::errors::{CliError, CliResult};
use super::io::{write_line, write_response};

/// Main CLI entry point
///
/// Parses arguments and dispatches to the appropriate command.
/// This is the only function that main.rs should call.
pub fn run() -> CliResult<()> {
    let cli = super::args::Cli::parse_args();
    run_command(cli.command)
}

/// Run the appropriate command based on CLI args
pub fn run_command(cmd: Command) -> CliResult<()> {
    match cmd {
        Command::Init { config } => init(&config),
        Command::List { config } => list(&config),
        Command::Dump { config, file } => dump(&config, file.as_deref()),
        Command::Recover { config } => recover(&config),
        Command::Purge { config, to } => purge(&config, &to),
    }
}

/// Create the data directory and the first log file.
///
/// Boots the service with no engines and shuts it down cleanly, so the
/// directory is left with one closed file and a position state file.
pub fn init(config_path: &Path) -> CliResult<()> {
    let config = BinlogConfig::load(config_path)?;
    if is_initialized(&config) {
        return Err(CliError::already_initialized());
    }

    let service = BinlogService::init(config, Vec::new())?;
    let files = service.file_names()?;
    service.shutdown()?;

    write_response(json!({ "initialized": true, "files": files }))
}

/// List indexed files with their size and in-use flag
pub fn list(config_path: &Path) -> CliResult<()> {
    let config = BinlogConfig::load(config_path)?;
    let store = open_store(&config)?;

    let mut files = Vec::new();
    for name in store.file_names() {
        let reader = store.open_reader(&name)?;
        files.push(json!({
            "name": name,
            "size": reader.file_len(),
            "in_use": reader.header().is_in_use(),
            "created_at": reader.header().created_at.to_rfc3339(),
            "checksum": reader.header().checksum.name(),
        }));
    }
    write_response(json!({ "files": files }))
}

/// Print one JSON line per record of `file` (default: the last file).
///
/// Damage stops the dump with an error after the records before it were
/// printed.
pub fn dump(config_path: &Path, file: Option<&str>) -> CliResult<()> {
    let config = BinlogConfig::load(config_path)?;
    let store = open_store(&config)?;
    let name = match file {
        Some(name) => name.to_string(),
        None => store
            .index()
            .last()
            .map(str::to_string)
            .ok_or_else(CliError::not_initialized)?,
    };

    let mut reader = store.open_reader(&name)?;
    write_line(&json!({
        "file": name,
        "offset": 0,
        "type": "header",
        "length": HEADER_LEN,
        "in_use": reader.header().is_in_use(),
    }))?;
    while let Some(read) = reader.read_next()? {
        write_line(&describe(&read))?;
    }
    Ok(())
}

fn describe(read: &ReadRecord) -> Value {
    let record = &read.record;
    let mut line = json!({
        "offset": read.offset,
        "end": read.end_offset,
        "type": record.record_type.name(),
        "flags": record.flags,
        "length": record.payload.len(),
    });
    let extra = match record.body() {
        Ok(RecordBody::Gtid(g)) => json!({
            "gtid": g.gtid.to_string(),
            "standalone": g.is_standalone(),
            "two_phase": g.is_two_phase(),
            "commit_id": g.commit_id,
        }),
        Ok(RecordBody::Commit(c)) => json!({ "xid": c.xid, "engine_count": c.engine_count }),
        Ok(RecordBody::Rotate(r)) => json!({ "next_file": r.next_file }),
        Ok(RecordBody::Checkpoint(c)) => json!({ "checkpoint_file": c.oldest_file }),
        Ok(RecordBody::GtidList(l)) => json!({
            "gtid_list": l.gtids.iter().map(ToString::to_string).collect::<Vec<_>>(),
        }),
        Ok(RecordBody::Incident(i)) => json!({ "incident": i.message }),
        Ok(_) => Value::Null,
        Err(e) => json!({ "decode_error": e.to_string() }),
    };
    if let (Value::Object(fields), Value::Object(extra)) = (&mut line, extra) {
        fields.extend(extra);
    }
    line
}

/// Dry-run crash recovery with no engines attached
pub fn recover(config_path: &Path) -> CliResult<()> {
    let config = BinlogConfig::load(config_path)?;
    if !is_initialized(&config) {
        return Err(CliError::not_initialized());
    }
    let mut options = config.recovery_options()?;
    options.inspect_only = true;
    let report = RecoveryManager::new(options, Arc::new(MetricsRegistry::new())).recover(&[])?;
    write_response(serde_json::to_value(&report)?)
}

/// Delete every file before `to`.
///
/// Refuses to run on a log that was not shut down cleanly, since crash
/// recovery may still need the older files.
pub fn purge(config_path: &Path, to: &str) -> CliResult<()> {
    let config = BinlogConfig::load(config_path)?;
    let mut store = open_store(&config)?;
    if let Some(last) = store.index().last().map(str::to_string) {
        if store.open_reader(&last)?.header().is_in_use() {
            return Err(CliError::needs_recovery(&last));
        }
    }
    let outcome = store.purge_to(to, &|_| false)?;
    write_response(json!({
        "purged": outcome.purged,
        "blocked": outcome.blocked.map(|b| format!("{:?}", b)),
    }))
}

fn open_store(config: &BinlogConfig) -> CliResult<LogFileStore> {
    if !is_initialized(config) {
        return Err(CliError::not_initialized());
    }
    Ok(LogFileStore::open(
        config.store_options()?,
        Arc::new(MetricsRegistry::new()),
    )?)
}

/// A data directory is initialized once it holds an index
fn is_initialized(config: &BinlogConfig) -> bool {
    config
        .data_dir
        .join(format!("{}.index", config.log_basename))
        .exists()
}

#[cfg(test)]
mod tests {
    use super::super::errors::CliErrorCode;
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn create_config(temp_dir: &TempDir) -> std::path::PathBuf {
        let config_path = temp_dir.path().join("binlog.json");
        let data_dir = temp_dir.path().join("data");

        let config = json!({
            "data_dir": data_dir.to_string_lossy()
        });

        fs::write(&config_path, config.to_string()).unwrap();
        config_path
    }

    #[test]
    fn test_init_creates_first_file() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = create_config(&temp_dir);
        let data_dir = temp_dir.path().join("data");

        init(&config_path).unwrap();

        assert!(data_dir.join("binlog.index").exists());
        assert!(data_dir.join("binlog.000001").exists());
        assert!(data_dir.join("binlog.state").exists());
    }

    #[test]
    fn test_init_refuses_reinit() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = create_config(&temp_dir);

        init(&config_path).unwrap();

        let result = init(&config_path);
        assert!(result.is_err());
        assert_eq!(
            result.unwrap_err().code(),
            &CliErrorCode::AlreadyInitialized
        );
    }

    #[test]
    fn test_list_requires_init() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = create_config(&temp_dir);

        let result = list(&config_path);
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().code(), &CliErrorCode::NotInitialized);
    }

    #[test]
    fn test_commands_after_init() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = create_config(&temp_dir);
        init(&config_path).unwrap();

        list(&config_path).unwrap();
        dump(&config_path, None).unwrap();
        recover(&config_path).unwrap();
        purge(&config_path, "binlog.000001").unwrap();
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("binlog.json");
        let config = json!({
            "data_dir": temp_dir.path().join("data").to_string_lossy(),
            "checksum": "md5"
        });
        fs::write(&config_path, config.to_string()).unwrap();

        let result = init(&config_path);
        assert_eq!(result.unwrap_err().code(), &CliErrorCode::ConfigError);
    }

    #[test]
    fn test_describe_names_commit_xid() {
        use crate::binlog::record::CommitPayload;
        use crate::binlog::LogRecord;

        let read = ReadRecord {
            offset: 100,
            end_offset: 120,
            record: LogRecord::commit(&CommitPayload::two_phase(7, 2)),
        };
        let line = describe(&read);
        assert_eq!(line["xid"], 7);
        assert_eq!(line["engine_count"], 2);
        assert_eq!(line["offset"], 100);
    }
}
