//! Values exchanged with the collaborators.

use crate::metadata::PartMetadata;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiskKind {
    Local,
    ObjectStorage,
}

/// A physical disk known to the database server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Disk {
    pub name: String,
    pub kind: DiskKind,
    pub path: PathBuf,
    /// Object-storage disks may be fronted by a local cache layer
    pub has_cache: bool,
}

impl Disk {
    pub fn local(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kind: DiskKind::Local,
            path: path.into(),
            has_cache: false,
        }
    }

    pub fn object_storage(name: impl Into<String>, path: impl Into<PathBuf>, has_cache: bool) -> Self {
        Self {
            name: name.into(),
            kind: DiskKind::ObjectStorage,
            path: path.into(),
            has_cache,
        }
    }

    /// Object storage without a cache: parts are recorded as-is, never uploaded.
    pub fn is_uncached_object_storage(&self) -> bool {
        self.kind == DiskKind::ObjectStorage && !self.has_cache
    }
}

/// A table as reported by the database server or rebuilt from a backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    pub database: String,
    pub name: String,
    pub engine: String,
    pub uuid: Option<String>,
    pub create_statement: String,
    /// Data directories of the table, one per disk it has data on
    pub paths_with_disks: Vec<(PathBuf, Disk)>,
}

impl Table {
    /// Fully quoted `db`.`table` identifier.
    pub fn quoted_name(&self) -> String {
        format!("`{}`.`{}`", self.database, self.name)
    }
}

/// A part snapshotted by a freeze, before it is accounted for in a backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrozenPart {
    pub database: String,
    pub table: String,
    pub name: String,
    pub disk_name: String,
    /// Location of the frozen copy
    pub path: PathBuf,
    pub checksum: String,
    pub size: u64,
    pub files: Vec<String>,
    pub tarball: bool,
}

impl FrozenPart {
    pub fn to_part_metadata(&self) -> PartMetadata {
        PartMetadata::new(
            &self.database,
            &self.table,
            &self.name,
            &self.checksum,
            self.size,
            self.files.clone(),
            self.tarball,
        )
        .on_disk(&self.disk_name)
    }
}
