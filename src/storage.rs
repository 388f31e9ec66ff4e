//! Durable term, vote and log storage.
//!
//! Raft's safety argument assumes that `current_term`, `voted_for` and the
//! log survive restarts. [`FileStore`] provides that; [`MemoryStore`] keeps
//! everything in process memory for tests and throwaway nodes.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::raft::state::LogEntry;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("corrupt log file {path}: unreadable entry at line {line}")]
    Corrupt { path: PathBuf, line: usize },

    #[error("log file {0} is in an unknown state after a failed write; restart to recover")]
    Poisoned(PathBuf),
}

/// The persistent half of a Raft node's state.
///
/// The log is 1-indexed; index 0 is the empty-log sentinel with term 0.
/// Implementations only need to provide the primitive accessors and the two
/// write paths; everything else is derived.
pub trait LogStore: Send + Sync {
    fn current_term(&self) -> u64;

    fn voted_for(&self) -> Option<&str>;

    fn log(&self) -> &[LogEntry];

    /// Persist term and vote together, so a crash can never pair a new term
    /// with a vote cast in an older one.
    fn set_term_and_vote(&mut self, term: u64, voted_for: Option<&str>)
        -> Result<(), StorageError>;

    fn append_entry(&mut self, entry: LogEntry) -> Result<(), StorageError>;

    /// Delete the entry at `index` and everything after it.
    fn delete_from(&mut self, index: u64) -> Result<(), StorageError>;

    fn set_current_term(&mut self, term: u64) -> Result<(), StorageError> {
        let voted_for = self.voted_for().map(str::to_owned);
        self.set_term_and_vote(term, voted_for.as_deref())
    }

    fn set_voted_for(&mut self, node_id: &str) -> Result<(), StorageError> {
        self.set_term_and_vote(self.current_term(), Some(node_id))
    }

    fn clear_voted_for(&mut self) -> Result<(), StorageError> {
        self.set_term_and_vote(self.current_term(), None)
    }

    fn last_log_index(&self) -> u64 {
        self.log().len() as u64
    }

    fn last_log_term(&self) -> u64 {
        self.log().last().map(|e| e.term).unwrap_or(0)
    }

    /// Term of the entry at `index`, or 0 when there is no such entry.
    fn term_at(&self, index: u64) -> u64 {
        self.entry_at(index).map(|e| e.term).unwrap_or(0)
    }

    fn entry_at(&self, index: u64) -> Option<&LogEntry> {
        if index == 0 {
            return None;
        }
        self.log().get((index - 1) as usize)
    }

    /// Entries from `index` (inclusive) to the end of the log.
    fn entries_from(&self, index: u64) -> Vec<LogEntry> {
        let start = index.max(1) as usize - 1;
        self.log().get(start..).map(<[_]>::to_vec).unwrap_or_default()
    }
}

/// Volatile store. State is lost when the process exits.
#[derive(Debug, Default)]
pub struct MemoryStore {
    current_term: u64,
    voted_for: Option<String>,
    entries: Vec<LogEntry>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LogStore for MemoryStore {
    fn current_term(&self) -> u64 {
        self.current_term
    }

    fn voted_for(&self) -> Option<&str> {
        self.voted_for.as_deref()
    }

    fn log(&self) -> &[LogEntry] {
        &self.entries
    }

    fn set_term_and_vote(
        &mut self,
        term: u64,
        voted_for: Option<&str>,
    ) -> Result<(), StorageError> {
        self.current_term = term;
        self.voted_for = voted_for.map(str::to_owned);
        Ok(())
    }

    fn append_entry(&mut self, entry: LogEntry) -> Result<(), StorageError> {
        self.entries.push(entry);
        Ok(())
    }

    fn delete_from(&mut self, index: u64) -> Result<(), StorageError> {
        self.entries.truncate(index.max(1) as usize - 1);
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Metadata {
    current_term: u64,
    voted_for: Option<String>,
}

const META_FILE: &str = "meta.json";
const LOG_FILE: &str = "log.jsonl";

/// File-backed store: `meta.json` holds term and vote, `log.jsonl` holds one
/// JSON-encoded entry per line. Every write is fsynced before returning.
#[derive(Debug)]
pub struct FileStore {
    dir: PathBuf,
    meta: Metadata,
    entries: Vec<LogEntry>,
    log_file: File,
    /// Set when a failed write could not be undone; all later writes fail.
    poisoned: bool,
}

impl FileStore {
    /// Open (or create) the store rooted at `dir`, restoring any state a
    /// previous process left there.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let meta = match fs::read(dir.join(META_FILE)) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Metadata::default(),
            Err(err) => return Err(err.into()),
        };

        let log_path = dir.join(LOG_FILE);
        let (entries, torn_tail) = Self::load_log(&log_path)?;
        if torn_tail {
            tracing::warn!(
                path = %log_path.display(),
                recovered = entries.len(),
                "Dropping torn entry at the end of the log"
            );
            Self::rewrite_log(&log_path, &entries)?;
        }

        let log_file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        tracing::debug!(
            dir = %dir.display(),
            term = meta.current_term,
            entries = entries.len(),
            "Opened durable state"
        );

        Ok(Self {
            dir,
            meta,
            entries,
            log_file,
            poisoned: false,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn load_log(path: &Path) -> Result<(Vec<LogEntry>, bool), StorageError> {
        let file = match File::open(path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), false)),
            Err(err) => return Err(err.into()),
        };

        let lines: Vec<String> = BufReader::new(file).lines().collect::<io::Result<_>>()?;
        let last_line = lines.iter().rposition(|l| !l.trim().is_empty());

        let mut entries = Vec::with_capacity(lines.len());
        for (i, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str(line) {
                Ok(entry) => entries.push(entry),
                // A crash mid-append can only damage the final line.
                Err(_) if Some(i) == last_line => return Ok((entries, true)),
                Err(_) => {
                    return Err(StorageError::Corrupt {
                        path: path.to_path_buf(),
                        line: i + 1,
                    })
                }
            }
        }
        Ok((entries, false))
    }

    fn rewrite_log(path: &Path, entries: &[LogEntry]) -> Result<(), StorageError> {
        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        for entry in entries {
            let mut line = serde_json::to_vec(entry)?;
            line.push(b'\n');
            file.write_all(&line)?;
        }
        file.sync_all()?;
        fs::rename(tmp, path)?;
        Ok(())
    }

    fn check_poisoned(&self) -> Result<(), StorageError> {
        if self.poisoned {
            return Err(StorageError::Poisoned(self.dir.join(LOG_FILE)));
        }
        Ok(())
    }

    /// Append `line` and fsync it. On failure the file is cut back to its
    /// previous length so no partial line is left for the next append to
    /// run into.
    fn append_line(&mut self, line: &[u8]) -> Result<(), StorageError> {
        let old_len = self.log_file.metadata()?.len();
        let written = self
            .log_file
            .write_all(line)
            .and_then(|()| self.log_file.sync_data());
        if let Err(err) = written {
            self.roll_back(old_len);
            return Err(err.into());
        }
        Ok(())
    }

    fn roll_back(&mut self, len: u64) {
        let truncated = self
            .log_file
            .set_len(len)
            .and_then(|()| self.log_file.sync_data());
        if let Err(err) = truncated {
            tracing::error!(
                path = %self.dir.join(LOG_FILE).display(),
                len,
                error = %err,
                "Failed to roll back partial log write, refusing further writes"
            );
            self.poisoned = true;
        }
    }

    fn persist_meta(&self, meta: &Metadata) -> Result<(), StorageError> {
        let path = self.dir.join(META_FILE);
        let tmp = path.with_extension("tmp");
        let mut file = File::create(&tmp)?;
        file.write_all(&serde_json::to_vec_pretty(meta)?)?;
        file.sync_all()?;
        fs::rename(tmp, path)?;
        Ok(())
    }
}

impl LogStore for FileStore {
    fn current_term(&self) -> u64 {
        self.meta.current_term
    }

    fn voted_for(&self) -> Option<&str> {
        self.meta.voted_for.as_deref()
    }

    fn log(&self) -> &[LogEntry] {
        &self.entries
    }

    fn set_term_and_vote(
        &mut self,
        term: u64,
        voted_for: Option<&str>,
    ) -> Result<(), StorageError> {
        let meta = Metadata {
            current_term: term,
            voted_for: voted_for.map(str::to_owned),
        };
        self.persist_meta(&meta)?;
        self.meta = meta;
        Ok(())
    }

    fn append_entry(&mut self, entry: LogEntry) -> Result<(), StorageError> {
        self.check_poisoned()?;
        let mut line = serde_json::to_vec(&entry)?;
        line.push(b'\n');
        self.append_line(&line)?;
        self.entries.push(entry);
        Ok(())
    }

    fn delete_from(&mut self, index: u64) -> Result<(), StorageError> {
        self.check_poisoned()?;
        let keep = index.max(1) as usize - 1;
        if keep >= self.entries.len() {
            return Ok(());
        }

        let log_path = self.dir.join(LOG_FILE);
        Self::rewrite_log(&log_path, &self.entries[..keep])?;
        // The rename has happened: our handle now points at the old file.
        self.entries.truncate(keep);
        match OpenOptions::new().append(true).open(&log_path) {
            Ok(file) => self.log_file = file,
            Err(err) => {
                self.poisoned = true;
                return Err(err.into());
            }
        }
        Ok(())
    }
}
