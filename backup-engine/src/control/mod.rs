//! Collaborator contracts consumed by the orchestrators.
//!
//! The database control surface, durable backup storage and the
//! coordination service are external systems. Their clients live outside
//! this crate and plug in through the traits below.

pub mod models;
mod retrying;

pub use models::{Disk, DiskKind, FrozenPart, Table};
pub use retrying::Retrying;

use crate::metadata::{BackupMetadata, PartMetadata};
use crate::utils::errors::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Control surface of the database server on this cluster member.
#[async_trait]
pub trait DatabaseControl: Send + Sync {
    async fn list_databases(&self) -> Result<Vec<String>>;

    /// Tables of `database`, or of every database when `None`.
    async fn get_tables(&self, database: Option<&str>) -> Result<Vec<Table>>;

    async fn get_table(&self, database: &str, name: &str) -> Result<Option<Table>>;

    async fn does_table_exist(&self, database: &str, name: &str) -> Result<bool>;

    async fn get_database_engine(&self, database: &str) -> Result<String>;

    /// Server version, e.g. `23.8.2.7`
    async fn version(&self) -> Result<String>;

    async fn get_macros(&self) -> Result<HashMap<String, String>>;

    async fn get_disks(&self) -> Result<Vec<Disk>>;

    async fn get_access_control_objects(&self) -> Result<Vec<String>>;

    /// Copy-free snapshot of the table's current parts under `backup_name`.
    async fn freeze_table(&self, backup_name: &str, table: &Table) -> Result<()>;

    async fn list_frozen_parts(
        &self,
        table: &Table,
        disk: &Disk,
        data_path: &Path,
        backup_name: &str,
    ) -> Result<Vec<FrozenPart>>;

    /// Revision counter of an object-storage disk recorded by the freeze, if
    /// the disk supports revision-pinned restore.
    async fn frozen_disk_revision(&self, disk: &Disk, backup_name: &str) -> Result<Option<u64>>;

    async fn remove_frozen_part(&self, part: &FrozenPart) -> Result<()>;

    /// Release everything frozen under `backup_name`.
    async fn remove_frozen_data(&self, backup_name: &str) -> Result<()>;

    async fn create_table(&self, table: &Table) -> Result<()>;

    async fn drop_table_if_exists(&self, database: &str, name: &str) -> Result<()>;

    /// Staging location for a part pending attachment.
    async fn get_detached_part_path(
        &self,
        table: &Table,
        disk_name: &str,
        part_name: &str,
    ) -> Result<PathBuf>;

    /// Hand staged files over to the database server's user.
    async fn chown_detached_parts(&self, table: &Table) -> Result<()>;

    async fn attach_part(&self, table: &Table, part_name: &str) -> Result<()>;

    /// Tell an object-storage disk which revision to materialize on restart.
    /// Revision `0` means latest.
    async fn create_disk_restore_directive(
        &self,
        disk_name: &str,
        revision: u64,
        source_bucket: &str,
        source_path: &str,
    ) -> Result<()>;

    async fn restart_disk(&self, disk_name: &str) -> Result<()>;
}

/// Durable storage holding backups.
///
/// Part transfers are enqueued and run in the background; [`wait`](Self::wait)
/// joins everything enqueued so far.
#[async_trait]
pub trait BackupStorage: Send + Sync {
    async fn upload_table_create_statement(
        &self,
        backup_name: &str,
        database: &str,
        table: &str,
        statement: &str,
    ) -> Result<()>;

    async fn get_table_create_statement(
        &self,
        backup: &BackupMetadata,
        database: &str,
        table: &str,
    ) -> Result<String>;

    /// Replace the stored metadata document as a whole.
    async fn upload_backup_metadata(&self, backup: &BackupMetadata) -> Result<()>;

    async fn download_backup_metadata(&self, backup_name: &str) -> Result<String>;

    async fn enqueue_upload_part(&self, backup_name: &str, part: &FrozenPart) -> Result<()>;

    async fn enqueue_download_part(
        &self,
        backup: &BackupMetadata,
        part: &PartMetadata,
        destination: &Path,
    ) -> Result<()>;

    async fn wait(&self) -> Result<()>;

    /// Compare a stored part with its record.
    async fn check_data_part(&self, backup_path: &str, part: &PartMetadata) -> Result<bool>;

    /// Store the shadow metadata of an object-storage disk. Returns `false`
    /// when nothing was frozen on that disk.
    async fn upload_cloud_storage_metadata(&self, backup: &BackupMetadata, disk: &Disk) -> Result<bool>;

    /// Copy a part of a shadow-backed disk straight into the table's detached area.
    async fn copy_part_between_disks(
        &self,
        backup: &BackupMetadata,
        table: &Table,
        part: &PartMetadata,
    ) -> Result<()>;
}

/// Coordination service holding replica registrations.
#[async_trait]
pub trait Coordination: Send + Sync {
    async fn delete_replica(&self, path: &str, replica: &str) -> Result<()>;
}
