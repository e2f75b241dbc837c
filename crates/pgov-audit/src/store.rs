//! Audit stores
//!
//! [`MemoryAuditStore`] keeps one hash chain per task in a sharded map, so
//! appends for unrelated tasks never contend. [`JsonlAuditStore`] wraps it and
//! writes each sealed entry through to an append-only JSON-lines file before
//! the entry becomes visible. A failed write is cut back off the file, so no
//! line exists on disk for an entry the chain does not hold.

use crate::entry::{AuditEntry, AuditEvent, GENESIS_HASH};
use crate::error::AuditError;
use chrono::{DateTime, Duration, SubsecRound, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use pgov_policy::TaskId;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Persistence backend for the audit log
pub trait AuditStore: Send + Sync + std::fmt::Debug {
    /// Seal and persist an event
    ///
    /// # Errors
    /// Any failure to persist; the entry must then be treated as not written.
    fn append(&self, event: AuditEvent) -> Result<AuditEntry, AuditError>;

    /// Entries of a task in append order
    ///
    /// # Errors
    /// If the store cannot be read.
    fn query(&self, task_id: TaskId) -> Result<Vec<AuditEntry>, AuditError>;

    /// Tasks with at least one entry
    fn task_ids(&self) -> Vec<TaskId>;

    /// Short backend name for logs
    fn name(&self) -> &'static str;
}

#[derive(Debug, Default)]
struct Chain {
    entries: Vec<AuditEntry>,
}

impl Chain {
    fn head(&self) -> (String, Option<DateTime<Utc>>) {
        self.entries.last().map_or_else(
            || (GENESIS_HASH.to_string(), None),
            |e| (e.hash.clone(), Some(e.timestamp)),
        )
    }
}

/// In-memory, per-task sharded store
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    chains: DashMap<TaskId, Arc<Mutex<Chain>>>,
    next_seq: AtomicU64,
}

impl MemoryAuditStore {
    /// Create empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Total entries across all tasks
    #[must_use]
    pub fn len(&self) -> usize {
        self.chains.iter().map(|c| c.value().lock().entries.len()).sum()
    }

    /// Whether no entry has been written
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Seal `event` under its task's lock and hand it to `sink` before it
    /// becomes visible. A sink error discards the entry.
    pub(crate) fn append_sealed<F>(&self, event: AuditEvent, sink: F) -> Result<AuditEntry, AuditError>
    where
        F: FnOnce(&AuditEntry) -> Result<(), AuditError>,
    {
        let chain = Arc::clone(self.chains.entry(event.task_id).or_default().value());
        let mut chain = chain.lock();

        let (prev_hash, last_ts) = chain.head();
        let mut timestamp = Utc::now().trunc_subsecs(6);
        if let Some(last) = last_ts {
            if timestamp <= last {
                timestamp = last + Duration::microseconds(1);
            }
        }
        let seq = self.next_seq.fetch_add(1, Ordering::AcqRel);

        let entry = AuditEntry::seal(event, seq, timestamp, prev_hash);
        sink(&entry)?;
        chain.entries.push(entry.clone());
        Ok(entry)
    }

    /// Insert an already sealed entry (replay)
    fn restore(&self, entry: AuditEntry) {
        self.next_seq.fetch_max(entry.seq + 1, Ordering::AcqRel);
        let chain = Arc::clone(self.chains.entry(entry.task_id).or_default().value());
        chain.lock().entries.push(entry);
    }
}

impl AuditStore for MemoryAuditStore {
    fn append(&self, event: AuditEvent) -> Result<AuditEntry, AuditError> {
        self.append_sealed(event, |_| Ok(()))
    }

    fn query(&self, task_id: TaskId) -> Result<Vec<AuditEntry>, AuditError> {
        Ok(self
            .chains
            .get(&task_id)
            .map(|c| c.value().lock().entries.clone())
            .unwrap_or_default())
    }

    fn task_ids(&self) -> Vec<TaskId> {
        let mut ids: Vec<TaskId> = self.chains.iter().map(|c| *c.key()).collect();
        ids.sort();
        ids
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

/// Byte destination of a [`JsonlAuditStore`]
pub trait LineSink: Write + Send + std::fmt::Debug {
    /// Cut the sink back to its first `len` bytes
    ///
    /// # Errors
    /// If the sink cannot be shortened.
    fn truncate(&mut self, len: u64) -> std::io::Result<()>;
}

impl LineSink for File {
    fn truncate(&mut self, len: u64) -> std::io::Result<()> {
        self.set_len(len)
    }
}

/// Unbuffered line writer tracking the last committed length
#[derive(Debug)]
struct LineWriter {
    sink: Box<dyn LineSink>,
    committed: u64,
}

impl LineWriter {
    fn append(&mut self, line: &[u8]) -> Result<(), AuditError> {
        let written = self
            .sink
            .write_all(line)
            .and_then(|()| self.sink.flush());
        match written {
            Ok(()) => {
                self.committed += line.len() as u64;
                Ok(())
            }
            Err(e) => {
                if let Err(cut) = self.sink.truncate(self.committed) {
                    tracing::error!(error = %cut, committed = self.committed, "partial audit line could not be removed");
                }
                Err(e.into())
            }
        }
    }
}

/// Append-only JSON-lines store
///
/// Reads are served from memory; every append is written and flushed to the
/// sink first.
#[derive(Debug)]
pub struct JsonlAuditStore {
    path: PathBuf,
    memory: MemoryAuditStore,
    writer: Mutex<LineWriter>,
}

impl JsonlAuditStore {
    /// Open (or create) a log file, replaying existing entries
    ///
    /// # Errors
    /// - `AuditError::Io` if the file cannot be opened or read
    /// - `AuditError::Serialization` on a malformed line
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        let memory = MemoryAuditStore::new();

        if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            let mut replayed = 0usize;
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                memory.restore(serde_json::from_str(&line)?);
                replayed += 1;
            }
            tracing::info!(path = %path.display(), replayed, "audit log replayed");
        }

        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        let committed = file.metadata()?.len();
        Ok(Self::with_sink(path, memory, Box::new(file), committed))
    }

    /// Store writing to `sink`, which already holds `committed` bytes of
    /// the entries in `memory`
    fn with_sink(
        path: PathBuf,
        memory: MemoryAuditStore,
        sink: Box<dyn LineSink>,
        committed: u64,
    ) -> Self {
        Self {
            path,
            memory,
            writer: Mutex::new(LineWriter { sink, committed }),
        }
    }

    /// Backing file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditStore for JsonlAuditStore {
    fn append(&self, event: AuditEvent) -> Result<AuditEntry, AuditError> {
        self.memory.append_sealed(event, |entry| {
            let mut line = serde_json::to_vec(entry)?;
            line.push(b'\n');
            self.writer.lock().append(&line)
        })
    }

    fn query(&self, task_id: TaskId) -> Result<Vec<AuditEntry>, AuditError> {
        self.memory.query(task_id)
    }

    fn task_ids(&self) -> Vec<TaskId> {
        self.memory.task_ids()
    }

    fn name(&self) -> &'static str {
        "jsonl"
    }
}
