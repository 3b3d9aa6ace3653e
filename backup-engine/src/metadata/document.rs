//! Wire format of the backup metadata document.
//!
//! These records mirror the persisted JSON one to one. They are converted to
//! and from the owned tree in [`super::BackupMetadata`], which is where
//! validation happens.

use super::part::DEFAULT_DISK;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RawDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub databases: Option<BTreeMap<String, RawDatabase>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_control: Option<Vec<String>>,
    pub meta: RawMeta,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RawDatabase {
    pub tables: BTreeMap<String, RawTable>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RawTable {
    pub engine: String,
    #[serde(default)]
    pub uuid: Option<String>,
    pub parts: BTreeMap<String, RawPart>,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RawPart {
    pub checksum: String,
    pub bytes: u64,
    pub files: Vec<String>,
    pub link: Option<String>,
    #[serde(default)]
    pub tarball: bool,
    #[serde(default = "default_disk")]
    pub disk_name: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub(crate) struct RawMeta {
    pub name: String,
    pub path: String,
    pub version: String,
    #[serde(default)]
    pub ch_version: String,
    pub hostname: String,
    #[serde(default)]
    pub time_format: Option<String>,
    /// Legacy alias of `time_format`, still written for older readers
    #[serde(default)]
    pub date_fmt: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub bytes: u64,
    pub real_bytes: u64,
    pub state: String,
    #[serde(default)]
    pub labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub schema_only: bool,
    #[serde(default)]
    pub s3_revisions: BTreeMap<String, u64>,
    #[serde(default)]
    pub cloud_storage: RawCloudStorage,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub(crate) struct RawCloudStorage {
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default)]
    pub disks: Vec<String>,
}

fn default_disk() -> String {
    DEFAULT_DISK.to_string()
}
