//! Part deduplication across backup generations.
//!
//! A [`DedupInfo`] index is built once per backup run from earlier backups.
//! For each candidate part, [`deduplicate_part`] decides whether the part can
//! be recorded as a link to bytes already stored elsewhere, or must be copied.
//!
//! Matching is strict and fails open: anything short of an exact
//! checksum/size/layout match is a miss, which only costs storage.

use crate::control::FrozenPart;
use crate::metadata::{BackupMetadata, BackupState, PartMetadata};
use chrono::{DateTime, Duration, FixedOffset};
use std::collections::HashMap;
use tracing::debug;

/// Index entry for a part stored by a previous backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupPartInfo {
    /// Path of the backup this entry was taken from
    pub backup_path: String,
    pub checksum: String,
    pub size: u64,
    pub tarball: bool,
    /// Where the bytes really are, if the source backup itself linked them
    pub link: Option<String>,
}

impl DedupPartInfo {
    /// Backup path physically holding the bytes. Never more than one hop.
    pub fn storage_path(&self) -> &str {
        self.link.as_deref().unwrap_or(&self.backup_path)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TableDedupInfo {
    parts: HashMap<String, DedupPartInfo>,
}

impl TableDedupInfo {
    pub fn get(&self, part_name: &str) -> Option<&DedupPartInfo> {
        self.parts.get(part_name)
    }

    pub fn insert(&mut self, part_name: impl Into<String>, info: DedupPartInfo) {
        self.parts.insert(part_name.into(), info);
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct DatabaseDedupInfo {
    tables: HashMap<String, TableDedupInfo>,
}

impl DatabaseDedupInfo {
    /// Index for one table; empty if nothing is known about it.
    pub fn table(&self, name: &str) -> TableDedupInfo {
        self.tables.get(name).cloned().unwrap_or_default()
    }

    pub fn table_mut(&mut self, name: &str) -> &mut TableDedupInfo {
        self.tables.entry(name.to_string()).or_default()
    }
}

/// Read-only per-database, per-table index of previously stored parts.
#[derive(Debug, Clone, Default)]
pub struct DedupInfo {
    databases: HashMap<String, DatabaseDedupInfo>,
}

impl DedupInfo {
    pub fn database(&self, name: &str) -> DatabaseDedupInfo {
        self.databases.get(name).cloned().unwrap_or_default()
    }

    pub fn database_mut(&mut self, name: &str) -> &mut DatabaseDedupInfo {
        self.databases.entry(name.to_string()).or_default()
    }

    /// Build the index from earlier backups.
    ///
    /// Only completed, data-bearing backups younger than `age_limit` relative
    /// to `now` are used. Newer backups win when several hold the same part.
    /// Only `databases` are indexed.
    pub fn collect(
        backups: &[BackupMetadata],
        databases: &[String],
        age_limit: Duration,
        now: DateTime<FixedOffset>,
    ) -> Self {
        let mut eligible: Vec<&BackupMetadata> = backups
            .iter()
            .filter(|b| b.state() == BackupState::Created && !b.schema_only)
            .filter(|b| now.signed_duration_since(b.start_time()) <= age_limit)
            .collect();
        eligible.sort_by_key(|b| std::cmp::Reverse(b.start_time()));

        let mut info = DedupInfo::default();
        for backup in eligible {
            for db_name in databases {
                let Ok(tables) = backup.get_tables(db_name) else {
                    continue;
                };
                let db_info = info.database_mut(db_name);
                for table in tables {
                    let table_info = db_info.table_mut(&table.name);
                    for part in table.parts() {
                        if table_info.get(&part.name).is_some() {
                            continue;
                        }
                        table_info.insert(
                            part.name.clone(),
                            DedupPartInfo {
                                backup_path: backup.path.clone(),
                                checksum: part.checksum.clone(),
                                size: part.size,
                                tarball: part.tarball,
                                link: part.link.clone(),
                            },
                        );
                    }
                }
            }
        }

        info
    }
}

/// Return a linked record for `candidate` if an identical part is already
/// stored, or `None` if the caller has to copy the bytes.
pub fn deduplicate_part(candidate: &FrozenPart, index: &TableDedupInfo) -> Option<PartMetadata> {
    let existing = index.get(&candidate.name)?;

    if candidate.checksum.is_empty() || existing.checksum.is_empty() {
        return None;
    }
    if existing.checksum != candidate.checksum
        || existing.size != candidate.size
        || existing.tarball != candidate.tarball
    {
        return None;
    }

    let target = existing.storage_path();
    if target.is_empty() {
        return None;
    }

    debug!(
        database = %candidate.database,
        table = %candidate.table,
        part = %candidate.name,
        link = target,
        "Part deduplicated"
    );

    Some(candidate.to_part_metadata().with_link(target))
}
