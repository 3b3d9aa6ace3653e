//! Backup metadata: the authoritative record of what a backup contains.
//!
//! [`BackupMetadata`] exclusively owns its database -> table -> part tree.
//! All mutation goes through methods on the owner so the aggregate `size`
//! and `real_size` counters always match the tree:
//!
//! * `size` is the sum of all part sizes
//! * `real_size` is the sum of sizes of parts without a link
//!
//! The tree is only mutable while the backup is `creating` or `deleting`;
//! in every other state it is read-only history.

mod document;
pub mod part;
pub mod state;
pub mod table;

pub use part::{PartMetadata, DEFAULT_DISK};
pub use state::BackupState;
pub use table::TableMetadata;

use crate::utils::errors::{BackupError, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, FixedOffset, Local, NaiveDateTime};
use document::{RawCloudStorage, RawDatabase, RawDocument, RawMeta, RawPart, RawTable};
use std::collections::{BTreeMap, HashSet};
use std::fmt::Write;

/// Object-storage disks whose shadow metadata was captured with the backup.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CloudStorageMetadata {
    pub encrypted: bool,
    pub disks: Vec<String>,
}

impl CloudStorageMetadata {
    pub fn has_disk(&self, name: &str) -> bool {
        self.disks.iter().any(|d| d == name)
    }
}

#[derive(Debug, Clone)]
pub struct BackupMetadata {
    pub name: String,
    pub path: String,
    /// Version of the tool that produced the backup
    pub version: String,
    /// Version of the database server the backup was taken from
    pub ch_version: String,
    pub hostname: String,
    pub labels: BTreeMap<String, String>,
    pub schema_only: bool,
    time_format: String,
    state: BackupState,
    start_time: DateTime<FixedOffset>,
    end_time: Option<DateTime<FixedOffset>>,
    size: u64,
    real_size: u64,
    databases: BTreeMap<String, BTreeMap<String, TableMetadata>>,
    access_control: Vec<String>,
    s3_revisions: BTreeMap<String, u64>,
    cloud_storage: CloudStorageMetadata,
}

/// Parameters of a fresh backup.
#[derive(Debug, Clone)]
pub struct NewBackup {
    pub name: String,
    pub path: String,
    pub version: String,
    pub ch_version: String,
    pub time_format: String,
    pub hostname: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub schema_only: bool,
}

impl BackupMetadata {
    /// Start a new backup in the `creating` state.
    pub fn new(params: NewBackup) -> Result<Self> {
        validate_time_format(&params.time_format)?;

        let hostname = params.hostname.unwrap_or_else(|| {
            hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| "localhost".to_string())
        });

        Ok(Self {
            name: params.name,
            path: params.path,
            version: params.version,
            ch_version: params.ch_version,
            hostname,
            labels: params.labels,
            schema_only: params.schema_only,
            time_format: params.time_format,
            state: BackupState::Creating,
            start_time: Local::now().fixed_offset(),
            end_time: None,
            size: 0,
            real_size: 0,
            databases: BTreeMap::new(),
            access_control: Vec::new(),
            s3_revisions: BTreeMap::new(),
            cloud_storage: CloudStorageMetadata::default(),
        })
    }

    pub fn state(&self) -> BackupState {
        self.state
    }

    pub fn set_state(&mut self, next: BackupState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(BackupError::InvalidTransition {
                from: self.state.to_string(),
                to: next.to_string(),
            });
        }
        self.state = next;
        Ok(())
    }

    pub fn mark_failed(&mut self) {
        self.state = BackupState::Failed;
    }

    fn ensure_mutable(&self) -> Result<()> {
        if self.state.is_mutable() {
            Ok(())
        } else {
            Err(BackupError::ReadOnly(self.state.to_string()))
        }
    }

    pub fn time_format(&self) -> &str {
        &self.time_format
    }

    pub fn start_time(&self) -> DateTime<FixedOffset> {
        self.start_time
    }

    pub fn end_time(&self) -> Option<DateTime<FixedOffset>> {
        self.end_time
    }

    pub fn update_end_time(&mut self) {
        self.end_time = Some(Local::now().fixed_offset());
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn real_size(&self) -> u64 {
        self.real_size
    }

    /// True if the backup holds no data.
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Backup name usable as a freeze/shadow directory name.
    pub fn sanitized_name(&self) -> String {
        self.name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect()
    }

    pub fn get_databases(&self) -> Vec<&str> {
        self.databases.keys().map(String::as_str).collect()
    }

    pub fn add_database(&mut self, name: &str) -> Result<()> {
        self.ensure_mutable()?;
        if self.databases.contains_key(name) {
            return Err(BackupError::Conflict(format!("database {name}")));
        }
        self.databases.insert(name.to_string(), BTreeMap::new());
        Ok(())
    }

    pub fn get_tables(&self, database: &str) -> Result<Vec<&TableMetadata>> {
        self.databases
            .get(database)
            .map(|tables| tables.values().collect())
            .ok_or_else(|| BackupError::NotFound(format!("database {database}")))
    }

    pub fn get_table(&self, database: &str, table: &str) -> Option<&TableMetadata> {
        self.databases.get(database)?.get(table)
    }

    /// Attach a finished table and account for its parts.
    pub fn add_table(&mut self, table: TableMetadata) -> Result<()> {
        self.ensure_mutable()?;
        let tables = self
            .databases
            .get_mut(&table.database)
            .ok_or_else(|| BackupError::NotFound(format!("database {}", table.database)))?;
        if tables.contains_key(&table.name) {
            return Err(BackupError::Conflict(format!(
                "table {}.{}",
                table.database, table.name
            )));
        }

        self.size += table.size();
        self.real_size += table.real_size();
        tables.insert(table.name.clone(), table);
        Ok(())
    }

    pub fn add_part(&mut self, part: PartMetadata) -> Result<()> {
        self.ensure_mutable()?;
        let table = self
            .databases
            .get_mut(&part.database)
            .and_then(|tables| tables.get_mut(&part.table))
            .ok_or_else(|| {
                BackupError::NotFound(format!("table {}.{}", part.database, part.table))
            })?;

        let (size, linked) = (part.size, part.is_linked());
        table.add_part(part)?;
        self.size += size;
        if !linked {
            self.real_size += size;
        }
        Ok(())
    }

    /// Remove the named parts of a table, returning the removed records.
    ///
    /// Fails without changing anything if one of the parts is unknown.
    pub fn remove_parts(
        &mut self,
        database: &str,
        table: &str,
        part_names: &[&str],
    ) -> Result<Vec<PartMetadata>> {
        self.ensure_mutable()?;
        let table_meta = self
            .databases
            .get_mut(database)
            .and_then(|tables| tables.get_mut(table))
            .ok_or_else(|| BackupError::NotFound(format!("table {database}.{table}")))?;

        if let Some(missing) = part_names.iter().find(|n| table_meta.part(n).is_none()) {
            return Err(BackupError::NotFound(format!(
                "part {missing} of {database}.{table}"
            )));
        }

        let mut seen = HashSet::new();
        let unique: Vec<&str> = part_names.iter().copied().filter(|n| seen.insert(*n)).collect();
        let freed: u64 = unique
            .iter()
            .filter_map(|n| table_meta.part(n))
            .map(|p| p.size)
            .sum();
        let freed_real: u64 = unique
            .iter()
            .filter_map(|n| table_meta.part(n))
            .filter(|p| !p.is_linked())
            .map(|p| p.size)
            .sum();
        let (Some(size), Some(real_size)) = (
            self.size.checked_sub(freed),
            self.real_size.checked_sub(freed_real),
        ) else {
            return Err(BackupError::InvalidStructure(format!(
                "removing {freed} bytes from {database}.{table} exceeds counters bytes={} real_bytes={}",
                self.size, self.real_size
            )));
        };

        let removed = unique
            .iter()
            .filter_map(|name| table_meta.remove_part(name))
            .collect();
        self.size = size;
        self.real_size = real_size;
        Ok(removed)
    }

    /// Data parts of all tables.
    pub fn get_parts(&self) -> Vec<&PartMetadata> {
        self.databases
            .values()
            .flat_map(|tables| tables.values())
            .flat_map(|table| table.parts())
            .collect()
    }

    pub fn find_part(&self, database: &str, table: &str, part: &str) -> Option<&PartMetadata> {
        self.get_table(database, table)?.part(part)
    }

    /// Recompute the aggregate counters from the tree and compare.
    pub fn check_counters(&self) -> Result<()> {
        let parts = self.get_parts();
        let size: u64 = parts.iter().map(|p| p.size).sum();
        let real_size: u64 = parts.iter().filter(|p| !p.is_linked()).map(|p| p.size).sum();

        if size != self.size || real_size != self.real_size {
            return Err(BackupError::InvalidStructure(format!(
                "counters bytes={} real_bytes={} do not match parts bytes={} real_bytes={}",
                self.size, self.real_size, size, real_size
            )));
        }
        Ok(())
    }

    pub fn access_control(&self) -> &[String] {
        &self.access_control
    }

    pub fn set_access_control(&mut self, objects: Vec<String>) -> Result<()> {
        self.ensure_mutable()?;
        self.access_control = objects;
        Ok(())
    }

    /// Object-storage disk name -> revision counter captured at freeze time.
    pub fn s3_revisions(&self) -> &BTreeMap<String, u64> {
        &self.s3_revisions
    }

    pub fn set_s3_revision(&mut self, disk: &str, revision: u64) -> Result<()> {
        self.ensure_mutable()?;
        self.s3_revisions.insert(disk.to_string(), revision);
        Ok(())
    }

    /// True if the backup has data pinned to object-storage revisions.
    pub fn has_s3_data(&self) -> bool {
        !self.s3_revisions.is_empty()
    }

    pub fn cloud_storage(&self) -> &CloudStorageMetadata {
        &self.cloud_storage
    }

    pub fn encrypt_cloud_storage(&mut self) -> Result<()> {
        self.ensure_mutable()?;
        self.cloud_storage.encrypted = true;
        Ok(())
    }

    pub fn add_cloud_storage_disk(&mut self, disk: &str) -> Result<()> {
        self.ensure_mutable()?;
        if !self.cloud_storage.has_disk(disk) {
            self.cloud_storage.disks.push(disk.to_string());
        }
        Ok(())
    }

    fn format_time(&self, value: &DateTime<FixedOffset>) -> Result<String> {
        let mut out = String::new();
        write!(out, "{}", value.format(&self.time_format)).map_err(|_| {
            BackupError::InvalidStructure(format!("cannot format time with {}", self.time_format))
        })?;
        Ok(out)
    }

    /// Serialize to JSON. The light form omits the database tree and the
    /// access-control list and is meant for cheap listing.
    pub fn dump_json(&self, light: bool) -> Result<String> {
        let databases = (!light).then(|| {
            self.databases
                .iter()
                .map(|(db, tables)| {
                    let tables = tables
                        .iter()
                        .map(|(name, table)| (name.clone(), raw_table(table)))
                        .collect();
                    (db.clone(), RawDatabase { tables })
                })
                .collect()
        });

        let document = RawDocument {
            databases,
            access_control: (!light).then(|| self.access_control.clone()),
            meta: RawMeta {
                name: self.name.clone(),
                path: self.path.clone(),
                version: self.version.clone(),
                ch_version: self.ch_version.clone(),
                hostname: self.hostname.clone(),
                time_format: Some(self.time_format.clone()),
                date_fmt: Some(self.time_format.clone()),
                start_time: Some(self.format_time(&self.start_time)?),
                end_time: self.end_time.as_ref().map(|t| self.format_time(t)).transpose()?,
                bytes: self.size,
                real_bytes: self.real_size,
                state: self.state.to_string(),
                labels: Some(self.labels.clone()),
                schema_only: self.schema_only,
                s3_revisions: self.s3_revisions.clone(),
                cloud_storage: RawCloudStorage {
                    encrypted: self.cloud_storage.encrypted,
                    disks: self.cloud_storage.disks.clone(),
                },
            },
        };

        Ok(serde_json::to_string(&document)?)
    }

    /// Reconstruct a backup from its JSON document.
    pub fn load_json(data: &str) -> Result<Self> {
        let document: RawDocument = serde_json::from_str(data)
            .map_err(|e| BackupError::InvalidStructure(e.to_string()))?;
        Self::from_document(document)
    }

    pub fn load(data: serde_json::Value) -> Result<Self> {
        let document: RawDocument = serde_json::from_value(data)
            .map_err(|e| BackupError::InvalidStructure(e.to_string()))?;
        Self::from_document(document)
    }

    fn from_document(document: RawDocument) -> Result<Self> {
        let meta = document.meta;
        let state: BackupState = meta.state.parse()?;

        let time_format = meta
            .time_format
            .or(meta.date_fmt)
            .ok_or_else(|| BackupError::InvalidStructure("missing field `time_format`".into()))?;
        validate_time_format(&time_format)?;

        let start_time = meta
            .start_time
            .as_deref()
            .ok_or_else(|| BackupError::InvalidStructure("missing field `start_time`".into()))
            .and_then(|value| parse_time(value, &time_format))?;
        let end_time = meta
            .end_time
            .as_deref()
            .filter(|value| !value.is_empty())
            .map(|value| parse_time(value, &time_format))
            .transpose()?;

        let has_tree = document.databases.is_some();
        let mut databases = BTreeMap::new();
        for (db_name, raw_db) in document.databases.unwrap_or_default() {
            let mut tables = BTreeMap::new();
            for (table_name, raw_table) in raw_db.tables {
                let mut table =
                    TableMetadata::new(&db_name, &table_name, raw_table.engine, raw_table.uuid);
                for (part_name, raw) in raw_table.parts {
                    table.add_part(PartMetadata {
                        database: db_name.clone(),
                        table: table_name.clone(),
                        name: part_name,
                        checksum: raw.checksum,
                        size: raw.bytes,
                        files: raw.files,
                        tarball: raw.tarball,
                        link: raw.link,
                        disk_name: raw.disk_name,
                    })?;
                }
                tables.insert(table_name, table);
            }
            databases.insert(db_name, tables);
        }

        let backup = Self {
            name: meta.name,
            path: meta.path,
            version: meta.version,
            ch_version: meta.ch_version,
            hostname: meta.hostname,
            labels: meta.labels.unwrap_or_default(),
            schema_only: meta.schema_only,
            time_format,
            state,
            start_time,
            end_time,
            size: meta.bytes,
            real_size: meta.real_bytes,
            databases,
            access_control: document.access_control.unwrap_or_default(),
            s3_revisions: meta.s3_revisions,
            cloud_storage: CloudStorageMetadata {
                encrypted: meta.cloud_storage.encrypted,
                disks: meta.cloud_storage.disks,
            },
        };

        // a light document carries the counters without the tree
        if has_tree {
            backup.check_counters()?;
        }
        Ok(backup)
    }

    /// Table names of every database, for quick membership checks.
    pub fn table_set(&self) -> HashSet<(String, String)> {
        self.databases
            .iter()
            .flat_map(|(db, tables)| tables.keys().map(move |t| (db.clone(), t.clone())))
            .collect()
    }
}

fn raw_table(table: &TableMetadata) -> RawTable {
    RawTable {
        engine: table.engine.clone(),
        uuid: table.uuid.clone(),
        parts: table
            .parts()
            .map(|part| {
                (
                    part.name.clone(),
                    RawPart {
                        checksum: part.checksum.clone(),
                        bytes: part.size,
                        files: part.files.clone(),
                        link: part.link.clone(),
                        tarball: part.tarball,
                        disk_name: part.disk_name.clone(),
                    },
                )
            })
            .collect(),
    }
}

fn validate_time_format(format: &str) -> Result<()> {
    if StrftimeItems::new(format).any(|item| matches!(item, Item::Error)) {
        return Err(BackupError::InvalidStructure(format!(
            "invalid time format {format:?}"
        )));
    }
    Ok(())
}

/// Parse a timestamp with an explicit format, assuming UTC when the value
/// carries no zone.
fn parse_time(value: &str, format: &str) -> Result<DateTime<FixedOffset>> {
    if let Ok(parsed) = DateTime::parse_from_str(value, format) {
        return Ok(parsed);
    }
    NaiveDateTime::parse_from_str(value, format)
        .map(|naive| naive.and_utc().fixed_offset())
        .map_err(|e| BackupError::InvalidStructure(format!("invalid time {value:?}: {e}")))
}
