//! Retry at the collaborator boundary.

use super::{BackupStorage, Coordination, DatabaseControl, Disk, FrozenPart, Table};
use crate::metadata::{BackupMetadata, PartMetadata};
use crate::utils::errors::{BackupError, Result};
use crate::utils::retry::{retry, RetryPolicy};
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Wraps a collaborator and retries each call that fails with a transient
/// error, following `policy`.
pub struct Retrying<C> {
    inner: C,
    policy: RetryPolicy,
}

impl<C> Retrying<C> {
    pub fn new(inner: C, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }
}

#[async_trait]
impl<C: DatabaseControl> DatabaseControl for Retrying<C> {
    async fn list_databases(&self) -> Result<Vec<String>> {
        retry(&self.policy, "list_databases", BackupError::is_transient, || {
            self.inner.list_databases()
        })
        .await
    }

    async fn get_tables(&self, database: Option<&str>) -> Result<Vec<Table>> {
        retry(&self.policy, "get_tables", BackupError::is_transient, || {
            self.inner.get_tables(database)
        })
        .await
    }

    async fn get_table(&self, database: &str, name: &str) -> Result<Option<Table>> {
        retry(&self.policy, "get_table", BackupError::is_transient, || {
            self.inner.get_table(database, name)
        })
        .await
    }

    async fn does_table_exist(&self, database: &str, name: &str) -> Result<bool> {
        retry(&self.policy, "does_table_exist", BackupError::is_transient, || {
            self.inner.does_table_exist(database, name)
        })
        .await
    }

    async fn get_database_engine(&self, database: &str) -> Result<String> {
        retry(&self.policy, "get_database_engine", BackupError::is_transient, || {
            self.inner.get_database_engine(database)
        })
        .await
    }

    async fn version(&self) -> Result<String> {
        retry(&self.policy, "version", BackupError::is_transient, || self.inner.version()).await
    }

    async fn get_macros(&self) -> Result<HashMap<String, String>> {
        retry(&self.policy, "get_macros", BackupError::is_transient, || self.inner.get_macros())
            .await
    }

    async fn get_disks(&self) -> Result<Vec<Disk>> {
        retry(&self.policy, "get_disks", BackupError::is_transient, || self.inner.get_disks()).await
    }

    async fn get_access_control_objects(&self) -> Result<Vec<String>> {
        retry(&self.policy, "get_access_control_objects", BackupError::is_transient, || {
            self.inner.get_access_control_objects()
        })
        .await
    }

    async fn freeze_table(&self, backup_name: &str, table: &Table) -> Result<()> {
        retry(&self.policy, "freeze_table", BackupError::is_transient, || {
            self.inner.freeze_table(backup_name, table)
        })
        .await
    }

    async fn list_frozen_parts(
        &self,
        table: &Table,
        disk: &Disk,
        data_path: &Path,
        backup_name: &str,
    ) -> Result<Vec<FrozenPart>> {
        retry(&self.policy, "list_frozen_parts", BackupError::is_transient, || {
            self.inner.list_frozen_parts(table, disk, data_path, backup_name)
        })
        .await
    }

    async fn frozen_disk_revision(&self, disk: &Disk, backup_name: &str) -> Result<Option<u64>> {
        retry(&self.policy, "frozen_disk_revision", BackupError::is_transient, || {
            self.inner.frozen_disk_revision(disk, backup_name)
        })
        .await
    }

    async fn remove_frozen_part(&self, part: &FrozenPart) -> Result<()> {
        retry(&self.policy, "remove_frozen_part", BackupError::is_transient, || {
            self.inner.remove_frozen_part(part)
        })
        .await
    }

    async fn remove_frozen_data(&self, backup_name: &str) -> Result<()> {
        retry(&self.policy, "remove_frozen_data", BackupError::is_transient, || {
            self.inner.remove_frozen_data(backup_name)
        })
        .await
    }

    async fn create_table(&self, table: &Table) -> Result<()> {
        retry(&self.policy, "create_table", BackupError::is_transient, || {
            self.inner.create_table(table)
        })
        .await
    }

    async fn drop_table_if_exists(&self, database: &str, name: &str) -> Result<()> {
        retry(&self.policy, "drop_table_if_exists", BackupError::is_transient, || {
            self.inner.drop_table_if_exists(database, name)
        })
        .await
    }

    async fn get_detached_part_path(
        &self,
        table: &Table,
        disk_name: &str,
        part_name: &str,
    ) -> Result<PathBuf> {
        retry(&self.policy, "get_detached_part_path", BackupError::is_transient, || {
            self.inner.get_detached_part_path(table, disk_name, part_name)
        })
        .await
    }

    async fn chown_detached_parts(&self, table: &Table) -> Result<()> {
        retry(&self.policy, "chown_detached_parts", BackupError::is_transient, || {
            self.inner.chown_detached_parts(table)
        })
        .await
    }

    async fn attach_part(&self, table: &Table, part_name: &str) -> Result<()> {
        retry(&self.policy, "attach_part", BackupError::is_transient, || {
            self.inner.attach_part(table, part_name)
        })
        .await
    }

    async fn create_disk_restore_directive(
        &self,
        disk_name: &str,
        revision: u64,
        source_bucket: &str,
        source_path: &str,
    ) -> Result<()> {
        retry(&self.policy, "create_disk_restore_directive", BackupError::is_transient, || {
            self.inner
                .create_disk_restore_directive(disk_name, revision, source_bucket, source_path)
        })
        .await
    }

    async fn restart_disk(&self, disk_name: &str) -> Result<()> {
        retry(&self.policy, "restart_disk", BackupError::is_transient, || {
            self.inner.restart_disk(disk_name)
        })
        .await
    }
}

#[async_trait]
impl<C: BackupStorage> BackupStorage for Retrying<C> {
    async fn upload_table_create_statement(
        &self,
        backup_name: &str,
        database: &str,
        table: &str,
        statement: &str,
    ) -> Result<()> {
        retry(&self.policy, "upload_table_create_statement", BackupError::is_transient, || {
            self.inner
                .upload_table_create_statement(backup_name, database, table, statement)
        })
        .await
    }

    async fn get_table_create_statement(
        &self,
        backup: &BackupMetadata,
        database: &str,
        table: &str,
    ) -> Result<String> {
        retry(&self.policy, "get_table_create_statement", BackupError::is_transient, || {
            self.inner.get_table_create_statement(backup, database, table)
        })
        .await
    }

    async fn upload_backup_metadata(&self, backup: &BackupMetadata) -> Result<()> {
        retry(&self.policy, "upload_backup_metadata", BackupError::is_transient, || {
            self.inner.upload_backup_metadata(backup)
        })
        .await
    }

    async fn download_backup_metadata(&self, backup_name: &str) -> Result<String> {
        retry(&self.policy, "download_backup_metadata", BackupError::is_transient, || {
            self.inner.download_backup_metadata(backup_name)
        })
        .await
    }

    async fn enqueue_upload_part(&self, backup_name: &str, part: &FrozenPart) -> Result<()> {
        retry(&self.policy, "enqueue_upload_part", BackupError::is_transient, || {
            self.inner.enqueue_upload_part(backup_name, part)
        })
        .await
    }

    async fn enqueue_download_part(
        &self,
        backup: &BackupMetadata,
        part: &PartMetadata,
        destination: &Path,
    ) -> Result<()> {
        retry(&self.policy, "enqueue_download_part", BackupError::is_transient, || {
            self.inner.enqueue_download_part(backup, part, destination)
        })
        .await
    }

    async fn wait(&self) -> Result<()> {
        retry(&self.policy, "wait", BackupError::is_transient, || self.inner.wait()).await
    }

    async fn check_data_part(&self, backup_path: &str, part: &PartMetadata) -> Result<bool> {
        retry(&self.policy, "check_data_part", BackupError::is_transient, || {
            self.inner.check_data_part(backup_path, part)
        })
        .await
    }

    async fn upload_cloud_storage_metadata(&self, backup: &BackupMetadata, disk: &Disk) -> Result<bool> {
        retry(&self.policy, "upload_cloud_storage_metadata", BackupError::is_transient, || {
            self.inner.upload_cloud_storage_metadata(backup, disk)
        })
        .await
    }

    async fn copy_part_between_disks(
        &self,
        backup: &BackupMetadata,
        table: &Table,
        part: &PartMetadata,
    ) -> Result<()> {
        retry(&self.policy, "copy_part_between_disks", BackupError::is_transient, || {
            self.inner.copy_part_between_disks(backup, table, part)
        })
        .await
    }
}

#[async_trait]
impl<C: Coordination> Coordination for Retrying<C> {
    async fn delete_replica(&self, path: &str, replica: &str) -> Result<()> {
        retry(&self.policy, "delete_replica", BackupError::is_transient, || {
            self.inner.delete_replica(path, replica)
        })
        .await
    }
}
