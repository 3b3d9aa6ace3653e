//! Backup orchestration: schema and data capture into a fresh metadata document.

use crate::config::Config;
use crate::control::{BackupStorage, DatabaseControl, DiskKind, FrozenPart, Table};
use crate::dedup::{deduplicate_part, DedupInfo, TableDedupInfo};
use crate::events::{Event, EventSink};
use crate::metadata::{BackupMetadata, BackupState, NewBackup, TableMetadata};
use crate::schema::{is_external_db_engine, is_merge_tree};
use crate::utils::errors::{BackupError, Result};
use chrono::{Local, TimeDelta};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

/// Root under which backups are stored, unless the job overrides it.
pub const DEFAULT_BACKUP_ROOT: &str = "ch_backup";

/// Backup job configuration
#[derive(Debug, Clone, Default)]
pub struct BackupJob {
    /// Backup name; a random UUID if unset
    pub name: Option<String>,
    /// Storage root the backup path is built from
    pub root: Option<String>,
    /// Databases to back up; every database if unset
    pub databases: Option<Vec<String>>,
    pub labels: BTreeMap<String, String>,
    pub schema_only: bool,
    pub backup_access_control: bool,
    /// Earlier backups considered as deduplication sources
    pub dedup_sources: Vec<BackupMetadata>,
}

/// Main backup executor
pub struct BackupExecutor {
    database: Arc<dyn DatabaseControl>,
    storage: Arc<dyn BackupStorage>,
    config: Config,
    events: Arc<dyn EventSink>,
}

impl BackupExecutor {
    pub fn new(
        database: Arc<dyn DatabaseControl>,
        storage: Arc<dyn BackupStorage>,
        config: Config,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            database,
            storage,
            config,
            events,
        }
    }

    /// Execute a backup job.
    ///
    /// On failure the document is persisted in the `failed` state and the
    /// original error is returned.
    pub async fn execute(&self, job: BackupJob) -> Result<BackupMetadata> {
        let ch_version = self.database.version().await?;
        let name = job.name.clone().unwrap_or_else(|| Uuid::new_v4().to_string());
        let root = job.root.as_deref().unwrap_or(DEFAULT_BACKUP_ROOT);

        let mut backup = BackupMetadata::new(NewBackup {
            path: format!("{root}/{name}"),
            name,
            version: env!("CARGO_PKG_VERSION").to_string(),
            ch_version,
            time_format: self.config.backup.time_format.clone(),
            hostname: None,
            labels: job.labels.clone(),
            schema_only: job.schema_only,
        })?;

        self.events.emit(&Event::BackupStarted { name: backup.name.clone() });

        let result = self.run(&job, &mut backup).await;
        let released = self.database.remove_frozen_data(&backup.sanitized_name()).await;

        match result.and(released) {
            Ok(()) => {
                backup.update_end_time();
                backup.set_state(BackupState::Created)?;
                self.storage.upload_backup_metadata(&backup).await?;
                self.events.emit(&Event::BackupCompleted {
                    name: backup.name.clone(),
                    size: backup.size(),
                    real_size: backup.real_size(),
                });
                Ok(backup)
            }
            Err(e) => {
                backup.mark_failed();
                backup.update_end_time();
                if let Err(upload_err) = self.storage.upload_backup_metadata(&backup).await {
                    warn!(backup = %backup.name, error = %upload_err, "Failed to persist failed backup state");
                }
                self.events.emit(&Event::BackupFailed {
                    name: backup.name.clone(),
                    error: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn run(&self, job: &BackupJob, backup: &mut BackupMetadata) -> Result<()> {
        self.storage.upload_backup_metadata(backup).await?;

        if job.backup_access_control {
            let objects = self.database.get_access_control_objects().await?;
            debug!(count = objects.len(), "Captured access control objects");
            backup.set_access_control(objects)?;
        }

        let databases = match &job.databases {
            Some(databases) => databases.clone(),
            None => self.database.list_databases().await?,
        };

        let dedup_info = if self.config.backup.deduplicate_parts && !job.schema_only {
            let age_limit_days = self.config.backup.deduplication_age_limit_days;
            let age_limit = TimeDelta::try_days(age_limit_days).ok_or_else(|| {
                BackupError::Config(format!(
                    "deduplication_age_limit_days {age_limit_days} is out of range"
                ))
            })?;
            DedupInfo::collect(
                &job.dedup_sources,
                &databases,
                age_limit,
                Local::now().fixed_offset(),
            )
        } else {
            DedupInfo::default()
        };

        for db_name in &databases {
            let engine = self.database.get_database_engine(db_name).await?;
            if is_external_db_engine(&engine) {
                self.events.emit(&Event::DatabaseSkipped {
                    database: db_name.clone(),
                    engine,
                });
                continue;
            }

            backup.add_database(db_name)?;
            let db_dedup = dedup_info.database(db_name);

            let mut tables_done = 0;
            for table in self.database.get_tables(Some(db_name)).await? {
                let index = db_dedup.table(&table.name);
                if let Some(table_meta) = self.backup_table(backup, &table, &index, job.schema_only).await? {
                    backup.add_table(table_meta)?;
                    tables_done += 1;
                }
            }

            self.storage.upload_backup_metadata(backup).await?;
            self.events.emit(&Event::DatabaseBackedUp {
                database: db_name.clone(),
                tables: tables_done,
            });
        }

        if !job.schema_only {
            self.backup_cloud_storage_metadata(backup).await?;
        }

        Ok(())
    }

    /// Capture one table. Returns `None` if the table vanished mid-backup.
    async fn backup_table(
        &self,
        backup: &BackupMetadata,
        table: &Table,
        index: &TableDedupInfo,
        schema_only: bool,
    ) -> Result<Option<TableMetadata>> {
        self.storage
            .upload_table_create_statement(&backup.name, &table.database, &table.name, &table.create_statement)
            .await?;

        let mut table_meta =
            TableMetadata::new(&table.database, &table.name, &table.engine, table.uuid.clone());

        if schema_only || !is_merge_tree(&table.engine) {
            return Ok(Some(table_meta));
        }

        let freeze_name = backup.sanitized_name();
        if let Err(e) = self.database.freeze_table(&freeze_name, table).await {
            if !self.database.does_table_exist(&table.database, &table.name).await? {
                self.events.emit(&Event::TableDroppedDuringBackup {
                    database: table.database.clone(),
                    table: table.name.clone(),
                });
                return Ok(None);
            }
            return Err(e);
        }

        let mut uploaded: Vec<FrozenPart> = Vec::new();
        for (data_path, disk) in &table.paths_with_disks {
            let frozen = self
                .database
                .list_frozen_parts(table, disk, data_path, &freeze_name)
                .await?;

            for part in frozen {
                if disk.is_uncached_object_storage() {
                    table_meta.add_part(part.to_part_metadata())?;
                    continue;
                }

                if let Some(linked) = deduplicate_part(&part, index) {
                    self.database.remove_frozen_part(&part).await?;
                    self.events.emit(&Event::PartDeduplicated {
                        database: part.database.clone(),
                        table: part.table.clone(),
                        part: part.name.clone(),
                        link: linked.link.clone().unwrap_or_default(),
                    });
                    table_meta.add_part(linked)?;
                    continue;
                }

                self.storage.enqueue_upload_part(&backup.name, &part).await?;
                uploaded.push(part);
            }
        }

        self.storage.wait().await?;

        if self.config.backup.validate_part_after_upload {
            self.validate_uploaded_parts(backup, &uploaded).await?;
        }

        for part in &uploaded {
            table_meta.add_part(part.to_part_metadata())?;
            self.database.remove_frozen_part(part).await?;
        }

        debug!(
            table = %table.quoted_name(),
            parts = table_meta.part_count(),
            uploaded = uploaded.len(),
            "Table backed up"
        );
        Ok(Some(table_meta))
    }

    async fn validate_uploaded_parts(&self, backup: &BackupMetadata, uploaded: &[FrozenPart]) -> Result<()> {
        let mut broken = Vec::new();
        for part in uploaded {
            if !self.storage.check_data_part(&backup.path, &part.to_part_metadata()).await? {
                broken.push(format!("{}.{}:{}", part.database, part.table, part.name));
            }
        }

        if broken.is_empty() {
            Ok(())
        } else {
            Err(BackupError::Verification(broken))
        }
    }

    /// Record revisions of object-storage disks and store the shadow
    /// metadata of those without a local cache.
    async fn backup_cloud_storage_metadata(&self, backup: &mut BackupMetadata) -> Result<()> {
        let freeze_name = backup.sanitized_name();

        for disk in self.database.get_disks().await? {
            if disk.kind != DiskKind::ObjectStorage {
                continue;
            }

            if let Some(revision) = self.database.frozen_disk_revision(&disk, &freeze_name).await? {
                backup.set_s3_revision(&disk.name, revision)?;
            }

            if disk.has_cache {
                continue;
            }

            if self.config.cloud_storage.encryption && !backup.cloud_storage().encrypted {
                backup.encrypt_cloud_storage()?;
            }
            if self.storage.upload_cloud_storage_metadata(backup, &disk).await? {
                debug!(disk = %disk.name, "Stored shadow metadata");
                backup.add_cloud_storage_disk(&disk.name)?;
            }
        }

        Ok(())
    }
}
