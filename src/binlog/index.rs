//! Log file index
//!
//! `<basename>.index` lists every live log file, one name per line, oldest
//! first. The index only ever names files that are already durable: a file
//! is written and fsynced before its name is appended, and the index is
//! fsynced after every append.
//!
//! Purging rewrites the index through a temp file and rename. Before that,
//! the victims are recorded in `<basename>.purge` so an interrupted purge is
//! finished by the next `open`.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use super::errors::{BinlogError, BinlogResult};

pub struct LogFileIndex {
    dir: PathBuf,
    basename: String,
    entries: Vec<String>,
}

impl LogFileIndex {
    /// Opens (or creates) the index in `dir`, completing any interrupted purge.
    pub fn open(dir: &Path, basename: &str) -> BinlogResult<Self> {
        fs::create_dir_all(dir).map_err(|e| {
            BinlogError::append_failed(format!("cannot create {}", dir.display()), e)
        })?;
        let mut index = Self {
            dir: dir.to_path_buf(),
            basename: basename.to_string(),
            entries: Vec::new(),
        };
        index.entries = read_lines(&index.index_path())?;
        if let Some(victims) = read_lines_if_exists(&index.purge_intent_path())? {
            index.finish_purge(&victims)?;
        }
        for name in &index.entries {
            if !index.file_path(name).exists() {
                return Err(BinlogError::corruption(format!(
                    "index names {} but the file is missing",
                    name
                )));
            }
        }
        Ok(index)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn basename(&self) -> &str {
        &self.basename
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(format!("{}.index", self.basename))
    }

    fn purge_intent_path(&self) -> PathBuf {
        self.dir.join(format!("{}.purge", self.basename))
    }

    pub fn file_path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn last(&self) -> Option<&str> {
        self.entries.last().map(String::as_str)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|e| e == name)
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|e| e == name)
    }

    /// Name the next file would get: `<basename>.NNNNNN`
    pub fn next_file_name(&self) -> String {
        let next = self
            .entries
            .last()
            .and_then(|name| self.sequence_of(name))
            .map_or(1, |n| n + 1);
        format!("{}.{:06}", self.basename, next)
    }

    fn sequence_of(&self, name: &str) -> Option<u64> {
        name.strip_prefix(&self.basename)?
            .strip_prefix('.')?
            .parse()
            .ok()
    }

    /// Append a durable file's name and fsync the index
    pub fn append(&mut self, name: &str) -> BinlogResult<()> {
        let path = self.index_path();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| BinlogError::append_failed("cannot open log index", e))?;
        file.write_all(format!("{}\n", name).as_bytes())
            .map_err(|e| BinlogError::append_failed("cannot append to log index", e))?;
        file.sync_all()
            .map_err(|e| BinlogError::fsync_failed("fsync of log index failed", e))?;
        sync_dir(&self.dir)?;
        self.entries.push(name.to_string());
        Ok(())
    }

    /// Remove `victims` (a prefix of the index) and delete their files
    pub fn purge(&mut self, victims: &[String]) -> BinlogResult<()> {
        if victims.is_empty() {
            return Ok(());
        }
        let intent = self.purge_intent_path();
        write_lines_durably(&intent, victims)?;
        self.finish_purge(victims)
    }

    fn finish_purge(&mut self, victims: &[String]) -> BinlogResult<()> {
        let remaining: Vec<String> = self
            .entries
            .iter()
            .filter(|e| !victims.contains(e))
            .cloned()
            .collect();
        write_lines_durably(&self.index_path(), &remaining)?;
        self.entries = remaining;
        for name in victims {
            match fs::remove_file(self.file_path(name)) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(BinlogError::io(format!("cannot delete {}", name), e));
                }
            }
        }
        match fs::remove_file(self.purge_intent_path()) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(BinlogError::io("cannot remove purge intent", e)),
        }
        sync_dir(&self.dir)
    }
}

fn read_lines(path: &Path) -> BinlogResult<Vec<String>> {
    Ok(read_lines_if_exists(path)?.unwrap_or_default())
}

fn read_lines_if_exists(path: &Path) -> BinlogResult<Option<Vec<String>>> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(BinlogError::io(format!("cannot open {}", path.display()), e));
        }
    };
    let mut lines = Vec::new();
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| BinlogError::io(format!("cannot read {}", path.display()), e))?;
        let trimmed = line.trim();
        if !trimmed.is_empty() {
            lines.push(trimmed.to_string());
        }
    }
    Ok(Some(lines))
}

fn write_lines_durably(path: &Path, lines: &[String]) -> BinlogResult<()> {
    let tmp = path.with_extension("tmp");
    let mut file = File::create(&tmp)
        .map_err(|e| BinlogError::append_failed(format!("cannot create {}", tmp.display()), e))?;
    for line in lines {
        writeln!(file, "{}", line)
            .map_err(|e| BinlogError::append_failed(format!("cannot write {}", tmp.display()), e))?;
    }
    file.sync_all()
        .map_err(|e| BinlogError::fsync_failed(format!("fsync of {} failed", tmp.display()), e))?;
    fs::rename(&tmp, path)
        .map_err(|e| BinlogError::append_failed(format!("cannot rename {}", tmp.display()), e))?;
    sync_dir(path.parent().unwrap_or(Path::new(".")))
}

/// fsync a directory so renames and creations inside it are durable
pub(crate) fn sync_dir(dir: &Path) -> BinlogResult<()> {
    let handle = File::open(dir)
        .map_err(|e| BinlogError::io(format!("cannot open {}", dir.display()), e))?;
    handle
        .sync_all()
        .map_err(|e| BinlogError::fsync_failed(format!("fsync of {} failed", dir.display()), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(index: &LogFileIndex, name: &str) {
        File::create(index.file_path(name)).unwrap();
    }

    #[test]
    fn test_next_file_name_sequence() {
        let dir = TempDir::new().unwrap();
        let mut index = LogFileIndex::open(dir.path(), "binlog").unwrap();
        assert_eq!(index.next_file_name(), "binlog.000001");
        touch(&index, "binlog.000001");
        index.append("binlog.000001").unwrap();
        assert_eq!(index.next_file_name(), "binlog.000002");
    }

    #[test]
    fn test_entries_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = LogFileIndex::open(dir.path(), "binlog").unwrap();
            for name in ["binlog.000001", "binlog.000002"] {
                touch(&index, name);
                index.append(name).unwrap();
            }
        }
        let index = LogFileIndex::open(dir.path(), "binlog").unwrap();
        assert_eq!(index.entries(), &["binlog.000001", "binlog.000002"]);
        assert_eq!(index.last(), Some("binlog.000002"));
    }

    #[test]
    fn test_missing_file_is_detected() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = LogFileIndex::open(dir.path(), "binlog").unwrap();
            touch(&index, "binlog.000001");
            index.append("binlog.000001").unwrap();
            fs::remove_file(index.file_path("binlog.000001")).unwrap();
        }
        assert!(LogFileIndex::open(dir.path(), "binlog").is_err());
    }

    #[test]
    fn test_purge_removes_files_and_entries() {
        let dir = TempDir::new().unwrap();
        let mut index = LogFileIndex::open(dir.path(), "binlog").unwrap();
        for name in ["binlog.000001", "binlog.000002", "binlog.000003"] {
            touch(&index, name);
            index.append(name).unwrap();
        }
        index
            .purge(&["binlog.000001".to_string(), "binlog.000002".to_string()])
            .unwrap();
        assert_eq!(index.entries(), &["binlog.000003"]);
        assert!(!index.file_path("binlog.000001").exists());
        assert!(!index.purge_intent_path().exists());
    }

    #[test]
    fn test_interrupted_purge_completes_on_open() {
        let dir = TempDir::new().unwrap();
        {
            let mut index = LogFileIndex::open(dir.path(), "binlog").unwrap();
            for name in ["binlog.000001", "binlog.000002"] {
                touch(&index, name);
                index.append(name).unwrap();
            }
            // Intent recorded, index not yet rewritten
            write_lines_durably(&index.purge_intent_path(), &["binlog.000001".to_string()])
                .unwrap();
        }
        let index = LogFileIndex::open(dir.path(), "binlog").unwrap();
        assert_eq!(index.entries(), &["binlog.000002"]);
        assert!(!index.file_path("binlog.000001").exists());
    }
}
