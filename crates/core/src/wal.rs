//! Write-ahead journal for two-backend writes.
//!
//! Each pending operation is one JSON file in the journal directory, written
//! to a temp file, synced, then renamed into place. Removing the file marks
//! the operation complete, so any file found on startup is an orphan: a write
//! that may have reached only one backend.
//!
//! Journaling never blocks the write it protects. Failures are logged and
//! counted; after `max_consecutive_failures` in a row the breaker trips and
//! [`Wal::write`] returns synthetic tokens for the rest of the process.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::fact::{Fact, FactId};
use crate::Result;

/// Consecutive journal failures before the breaker trips.
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 10;

const ENTRY_EXT: &str = "json";
const TEMP_EXT: &str = "tmp";
const SYNTHETIC_PREFIX: &str = "synthetic-";

/// Handle returned by [`Wal::write`] and consumed by [`Wal::remove`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WalToken(pub String);

impl WalToken {
    /// A token for an operation that was not journalled.
    pub fn synthetic() -> Self {
        Self(format!("{SYNTHETIC_PREFIX}{}", Ulid::new()))
    }

    /// Not backed by a journal file.
    pub fn is_synthetic(&self) -> bool {
        self.0.starts_with(SYNTHETIC_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for WalToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the journaled operation intends to do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WalOp {
    /// Write a new fact to both backends.
    Store,
    /// Write a new fact that supersedes `target`.
    Update { target: FactId },
    /// Close `target` with no replacement.
    Retract { target: FactId },
    /// Hard-delete the fact from both backends.
    Delete,
}

/// One journal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalEntry {
    pub token: WalToken,
    pub op: WalOp,
    pub fact_id: FactId,
    /// Full payload for writes, so an orphan can be re-indexed without guessing.
    pub fact: Option<Fact>,
    pub recorded_at: DateTime<Utc>,
}

/// Breaker and failure counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WalStats {
    pub enabled: bool,
    pub tripped: bool,
    pub consecutive_failures: u32,
    pub total_failures: u64,
    pub max_consecutive_failures: u32,
}

pub struct Wal {
    dir: PathBuf,
    enabled: bool,
    max_consecutive_failures: u32,
    consecutive_failures: AtomicU32,
    total_failures: AtomicU64,
    tripped: AtomicBool,
}

impl Wal {
    /// Journal into `dir`, creating it if needed.
    ///
    /// A directory that cannot be created counts as a journal failure; the
    /// journal is still returned so the writes it guards can proceed.
    pub fn open(dir: impl Into<PathBuf>, max_consecutive_failures: u32) -> Self {
        let wal = Self {
            dir: dir.into(),
            enabled: true,
            max_consecutive_failures: max_consecutive_failures.max(1),
            consecutive_failures: AtomicU32::new(0),
            total_failures: AtomicU64::new(0),
            tripped: AtomicBool::new(false),
        };
        if let Err(e) = fs::create_dir_all(&wal.dir) {
            wal.record_failure("open", &e);
        }
        wal
    }

    /// A journal that never writes; every token is synthetic.
    pub fn disabled() -> Self {
        Self {
            dir: PathBuf::new(),
            enabled: false,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            consecutive_failures: AtomicU32::new(0),
            total_failures: AtomicU64::new(0),
            tripped: AtomicBool::new(false),
        }
    }

    /// Journal an intended operation. Never fails: on error, or once the
    /// breaker has tripped, a synthetic token is returned.
    pub fn write(&self, op: WalOp, fact_id: &FactId, fact: Option<&Fact>) -> WalToken {
        if !self.is_active() {
            return WalToken::synthetic();
        }

        let entry = WalEntry {
            token: WalToken(Ulid::new().to_string()),
            op,
            fact_id: fact_id.clone(),
            fact: fact.cloned(),
            recorded_at: Utc::now(),
        };

        match self.persist(&entry) {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::Release);
                entry.token
            }
            Err(e) => {
                self.record_failure("write", &e);
                WalToken::synthetic()
            }
        }
    }

    /// Mark an operation complete. Synthetic tokens are ignored.
    pub fn remove(&self, token: &WalToken) {
        if token.is_synthetic() || !self.enabled {
            return;
        }
        match fs::remove_file(self.entry_path(token)) {
            Ok(()) => {
                self.consecutive_failures.store(0, Ordering::Release);
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => self.record_failure("remove", &e),
        }
    }

    /// Every entry written but never removed, oldest first.
    ///
    /// Unreadable files are logged and skipped.
    pub fn scan_orphans(&self) -> Result<Vec<WalEntry>> {
        if !self.enabled || !self.dir.is_dir() {
            return Ok(Vec::new());
        }

        let mut orphans = Vec::new();
        for dir_entry in fs::read_dir(&self.dir)? {
            let path = dir_entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
                continue;
            }
            match read_entry(&path) {
                Ok(entry) => orphans.push(entry),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "unreadable WAL entry");
                }
            }
        }

        orphans.sort_by(|a, b| {
            a.recorded_at
                .cmp(&b.recorded_at)
                .then_with(|| a.token.0.cmp(&b.token.0))
        });
        Ok(orphans)
    }

    pub fn stats(&self) -> WalStats {
        WalStats {
            enabled: self.enabled,
            tripped: self.tripped.load(Ordering::Acquire),
            consecutive_failures: self.consecutive_failures.load(Ordering::Acquire),
            total_failures: self.total_failures.load(Ordering::Acquire),
            max_consecutive_failures: self.max_consecutive_failures,
        }
    }

    /// Enabled and the breaker has not tripped.
    pub fn is_active(&self) -> bool {
        self.enabled && !self.tripped.load(Ordering::Acquire)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn persist(&self, entry: &WalEntry) -> Result<()> {
        let json = serde_json::to_vec(entry)?;
        let final_path = self.entry_path(&entry.token);
        let temp_path = final_path.with_extension(TEMP_EXT);

        {
            let mut file = OpenOptions::new()
                .create(true)
                .truncate(true)
                .write(true)
                .open(&temp_path)?;
            file.write_all(&json)?;
            file.sync_all()?;
        }
        fs::rename(&temp_path, &final_path)?;

        // Persist the rename itself. Not every platform can open a directory.
        if let Ok(dir) = File::open(&self.dir) {
            dir.sync_all().ok();
        }
        Ok(())
    }

    fn record_failure(&self, stage: &str, error: &dyn std::fmt::Display) {
        let total = self.total_failures.fetch_add(1, Ordering::AcqRel) + 1;
        let consecutive = self.consecutive_failures.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::warn!(
            stage,
            error = %error,
            consecutive,
            total,
            dir = %self.dir.display(),
            "WAL journal failure"
        );

        if consecutive >= self.max_consecutive_failures && !self.tripped.swap(true, Ordering::AcqRel)
        {
            tracing::error!(
                consecutive,
                "WAL circuit breaker tripped; journaling disabled until restart"
            );
        }
    }

    fn entry_path(&self, token: &WalToken) -> PathBuf {
        self.dir.join(format!("{}.{ENTRY_EXT}", token.0))
    }
}

fn read_entry(path: &Path) -> Result<WalEntry> {
    let bytes = fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}
