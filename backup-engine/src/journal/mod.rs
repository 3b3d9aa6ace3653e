//! Restore progress journal.
//!
//! Records which parts of which tables were restored or failed during a
//! restore run, and which object-storage disks were already restarted, so an
//! interrupted run resumes without attaching anything twice.
//!
//! The document is a JSON object keyed by `database.table`, plus a `disks`
//! entry:
//!
//! ```json
//! {
//!   "db.events": { "restored": ["all_1_1_0"], "failed": { "all_2_2_0": "error" } },
//!   "disks": { "s3": true }
//! }
//! ```

use crate::fs::write_atomic;
use crate::metadata::{PartMetadata, TableMetadata};
use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableProgress {
    #[serde(default)]
    pub restored: BTreeSet<String>,
    #[serde(default)]
    pub failed: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
struct JournalDocument {
    #[serde(default)]
    disks: BTreeMap<String, bool>,
    #[serde(flatten)]
    tables: BTreeMap<String, TableProgress>,
}

/// A part that failed to restore, as recorded in the journal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailedPart {
    pub table: String,
    pub part: String,
    pub error: String,
}

#[derive(Debug)]
pub struct RestoreContext {
    path: PathBuf,
    state: JournalDocument,
}

fn table_key(database: &str, table: &str) -> String {
    format!("{database}.{table}")
}

impl RestoreContext {
    /// Empty journal persisted at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            state: JournalDocument::default(),
        }
    }

    /// Open the journal at `path`, picking up progress of an interrupted run.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let mut ctx = Self::new(path);
        ctx.load_state()?;
        Ok(ctx)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replace in-memory progress with the persisted document, if any.
    pub fn load_state(&mut self) -> Result<()> {
        if !self.path.exists() {
            debug!(path = %self.path.display(), "No restore journal found, starting fresh");
            self.state = JournalDocument::default();
            return Ok(());
        }

        let data = std::fs::read_to_string(&self.path)?;
        self.state = serde_json::from_str(&data).map_err(|e| {
            BackupError::InvalidStructure(format!(
                "restore journal {} is malformed: {e}",
                self.path.display()
            ))
        })?;
        debug!(
            path = %self.path.display(),
            tables = self.state.tables.len(),
            "Loaded restore journal"
        );
        Ok(())
    }

    /// Persist the journal. Safe to call any number of times.
    pub fn dump_state(&self) -> Result<()> {
        let data = serde_json::to_vec_pretty(&self.state)?;
        write_atomic(&self.path, &data)
    }

    pub fn add_table(&mut self, table: &TableMetadata) {
        self.state
            .tables
            .entry(table_key(&table.database, &table.name))
            .or_default();
    }

    pub fn part_restored(&self, part: &PartMetadata) -> bool {
        self.state
            .tables
            .get(&table_key(&part.database, &part.table))
            .is_some_and(|t| t.restored.contains(&part.name))
    }

    /// Mark `part` restored, clearing an earlier failure of the same part.
    pub fn add_part(&mut self, part: &PartMetadata) {
        let progress = self
            .state
            .tables
            .entry(table_key(&part.database, &part.table))
            .or_default();
        progress.failed.remove(&part.name);
        progress.restored.insert(part.name.clone());
    }

    /// Record a failure for `part`. A part already restored stays restored.
    pub fn add_failed_part(&mut self, part: &PartMetadata, error: &str) {
        let progress = self
            .state
            .tables
            .entry(table_key(&part.database, &part.table))
            .or_default();
        if progress.restored.contains(&part.name) {
            return;
        }
        progress.failed.insert(part.name.clone(), error.to_string());
    }

    pub fn disk_restarted(&self, disk: &str) -> bool {
        self.state.disks.get(disk).copied().unwrap_or(false)
    }

    pub fn set_disk_restarted(&mut self, disk: &str) {
        self.state.disks.insert(disk.to_string(), true);
    }

    pub fn table_progress(&self, database: &str, table: &str) -> Option<&TableProgress> {
        self.state.tables.get(&table_key(database, table))
    }

    pub fn failed_parts(&self) -> Vec<FailedPart> {
        self.state
            .tables
            .iter()
            .flat_map(|(table, progress)| {
                progress.failed.iter().map(move |(part, error)| FailedPart {
                    table: table.clone(),
                    part: part.clone(),
                    error: error.clone(),
                })
            })
            .collect()
    }

    pub fn restored_count(&self) -> usize {
        self.state.tables.values().map(|t| t.restored.len()).sum()
    }

    /// Delete the persisted journal.
    pub fn remove(&mut self) -> Result<()> {
        self.state = JournalDocument::default();
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
