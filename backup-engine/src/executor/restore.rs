//! Restore orchestration: schema recreation followed by data reattachment.
//!
//! Phases run strictly in order: schema preparation, coordination cleanup,
//! table creation, disk materialization, per-table data copy and per-part
//! attach. Schema failures end the run unless `keep_going` is set; data
//! failures are always only reported.

use crate::config::Config;
use crate::control::{BackupStorage, Coordination, DatabaseControl, Table};
use crate::events::{Event, EventSink};
use crate::journal::{FailedPart, RestoreContext};
use crate::metadata::{BackupMetadata, BackupState, PartMetadata, TableMetadata};
use crate::schema::{
    compare_schema, get_table_zookeeper_path, is_atomic_db_engine, is_external_db_engine,
    is_materialized_view, is_merge_tree, is_replicated, order_for_restore, rewrite_table_schema,
    substitute_macros, version_ge, RewriteOptions,
};
use crate::utils::errors::{BackupError, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use tracing::debug;

/// Servers from this version on accept an explicit inner table UUID for
/// materialized views.
const INNER_UUID_MIN_VERSION: &str = "21.4";

/// Prefix of the implicit storage table of a materialized view.
const INNER_TABLE_PREFIX: &str = ".inner";

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    /// Databases to restore; every database in the backup if unset
    pub databases: Option<Vec<String>>,
    /// Replica whose stale registrations are removed before creating tables
    pub replica_name: Option<String>,
    pub cloud_storage_source_bucket: Option<String>,
    pub cloud_storage_source_path: Option<String>,
    /// Materialize object-storage disks at their latest revision
    pub cloud_storage_latest: bool,
    pub clean_zookeeper: bool,
    pub schema_only: bool,
    /// Report failed tables instead of aborting the run
    pub keep_going: bool,
}

/// Outcome of a restore run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub created_tables: Vec<String>,
    /// Tables that already existed with an equivalent schema
    pub existing_tables: Vec<String>,
    /// Tables whose creation or data restore failed
    pub failed_tables: Vec<String>,
    pub failed_parts: Vec<FailedPart>,
    pub attached_parts: usize,
}

impl RestoreReport {
    pub fn is_complete(&self) -> bool {
        self.failed_tables.is_empty() && self.failed_parts.is_empty()
    }
}

pub struct RestoreExecutor {
    database: Arc<dyn DatabaseControl>,
    storage: Arc<dyn BackupStorage>,
    coordination: Option<Arc<dyn Coordination>>,
    config: Config,
    events: Arc<dyn EventSink>,
}

impl RestoreExecutor {
    pub fn new(
        database: Arc<dyn DatabaseControl>,
        storage: Arc<dyn BackupStorage>,
        config: Config,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            database,
            storage,
            coordination: None,
            config,
            events,
        }
    }

    pub fn with_coordination(mut self, coordination: Arc<dyn Coordination>) -> Self {
        self.coordination = Some(coordination);
        self
    }

    /// Restore the backup stored under `backup_name`.
    pub async fn restore(&self, backup_name: &str, options: &RestoreOptions) -> Result<RestoreReport> {
        let document = self.storage.download_backup_metadata(backup_name).await?;
        let backup = BackupMetadata::load_json(&document)?;
        self.restore_backup(&backup, options).await
    }

    /// Restore an already loaded backup.
    pub async fn restore_backup(
        &self,
        backup: &BackupMetadata,
        options: &RestoreOptions,
    ) -> Result<RestoreReport> {
        if backup.state() != BackupState::Created {
            return Err(BackupError::NotRestorable {
                name: backup.name.clone(),
                state: backup.state().to_string(),
            });
        }

        self.events.emit(&Event::RestoreStarted { name: backup.name.clone() });

        let databases: Vec<String> = match &options.databases {
            Some(databases) => databases.clone(),
            None => backup.get_databases().into_iter().map(str::to_string).collect(),
        };

        let mut tables = Vec::new();
        for db_name in &databases {
            for table_meta in backup.get_tables(db_name)? {
                let create_statement = self
                    .storage
                    .get_table_create_statement(backup, db_name, &table_meta.name)
                    .await?;
                tables.push(Table {
                    database: table_meta.database.clone(),
                    name: table_meta.name.clone(),
                    engine: table_meta.engine.clone(),
                    uuid: table_meta.uuid.clone(),
                    create_statement,
                    paths_with_disks: Vec::new(),
                });
            }
        }

        let mut report = RestoreReport::default();
        let failed = self.restore_tables(tables, options, &mut report).await?;

        if options.schema_only || backup.schema_only {
            self.finish(backup, &report);
            return Ok(report);
        }

        let mut ctx = RestoreContext::open(&self.config.backup.restore_context_path)?;

        if backup.has_s3_data() {
            self.restore_cloud_storage_disks(backup, options, &mut ctx).await?;
        }

        for db_name in &databases {
            for table_meta in backup.get_tables(db_name)? {
                let key = (table_meta.database.clone(), table_meta.name.clone());
                if !is_merge_tree(&table_meta.engine) || failed.contains(&key) {
                    continue;
                }
                self.restore_table_data(backup, table_meta, &mut ctx, &mut report).await?;
            }
        }

        report.failed_parts = ctx.failed_parts();
        if report.is_complete() {
            ctx.remove()?;
        } else {
            ctx.dump_state()?;
        }

        self.finish(backup, &report);
        Ok(report)
    }

    /// Recreate the schema of the tables found on `source` in this server.
    pub async fn restore_schema(
        &self,
        source: &dyn DatabaseControl,
        options: &RestoreOptions,
    ) -> Result<RestoreReport> {
        let databases = match &options.databases {
            Some(databases) => databases.clone(),
            None => source.list_databases().await?,
        };

        let mut tables = Vec::new();
        for db_name in &databases {
            let engine = source.get_database_engine(db_name).await?;
            if is_external_db_engine(&engine) {
                self.events.emit(&Event::DatabaseSkipped {
                    database: db_name.clone(),
                    engine,
                });
                continue;
            }
            tables.extend(source.get_tables(Some(db_name)).await?);
        }

        let mut report = RestoreReport::default();
        self.restore_tables(tables, options, &mut report).await?;
        Ok(report)
    }

    fn finish(&self, backup: &BackupMetadata, report: &RestoreReport) {
        self.events.emit(&Event::RestoreCompleted {
            name: backup.name.clone(),
            failed_tables: report.failed_tables.len(),
            failed_parts: report.failed_parts.len(),
        });
    }

    /// Schema phase. Returns the tables that could not be created.
    async fn restore_tables(
        &self,
        tables: Vec<Table>,
        options: &RestoreOptions,
        report: &mut RestoreReport,
    ) -> Result<HashSet<(String, String)>> {
        let tables = self.rewrite_tables(tables).await?;
        let tables = self.preprocess_tables(tables, report).await?;

        if options.clean_zookeeper {
            self.clean_replicas(&tables, options).await?;
        }

        let failed = self.create_tables(tables, report).await;
        if failed.is_empty() {
            return Ok(HashSet::new());
        }

        let names: Vec<String> = failed.iter().map(Table::quoted_name).collect();
        if !options.keep_going {
            return Err(BackupError::TablesFailed(names));
        }

        report.failed_tables.extend(names);
        Ok(failed
            .into_iter()
            .map(|t| (t.database, t.name))
            .collect())
    }

    /// Adapt captured DDL to this server.
    async fn rewrite_tables(&self, tables: Vec<Table>) -> Result<Vec<Table>> {
        let version = self.database.version().await?;
        let inner_uuid_supported = version_ge(&version, INNER_UUID_MIN_VERSION);

        let known_uuids: HashMap<(String, String), Option<String>> = tables
            .iter()
            .map(|t| ((t.database.clone(), t.name.clone()), t.uuid.clone()))
            .collect();

        let mut db_engines: HashMap<String, String> = HashMap::new();
        let mut rewritten = Vec::with_capacity(tables.len());

        for mut table in tables {
            if table.name.starts_with(INNER_TABLE_PREFIX) {
                debug!(table = %table.quoted_name(), "Inner table is created by its view");
                continue;
            }

            let db_engine = match db_engines.get(&table.database) {
                Some(engine) => engine.clone(),
                None => {
                    let engine = self.database.get_database_engine(&table.database).await?;
                    db_engines.insert(table.database.clone(), engine.clone());
                    engine
                }
            };

            let add_uuid = table.uuid.is_some() && is_atomic_db_engine(&db_engine);
            let inner_uuid = match (&table.uuid, add_uuid && inner_uuid_supported) {
                (Some(uuid), true) if is_materialized_view(&table.engine) => known_uuids
                    .get(&(table.database.clone(), format!(".inner_id.{uuid}")))
                    .cloned()
                    .flatten(),
                _ => None,
            };

            rewrite_table_schema(
                &mut table,
                &RewriteOptions {
                    force_non_replicated: self.config.backup.force_non_replicated,
                    override_replica_name: self.config.backup.override_replica_name.clone(),
                    add_uuid,
                    inner_uuid,
                },
            );
            rewritten.push(table);
        }

        Ok(rewritten)
    }

    /// Skip tables that already exist with an equivalent schema and drop
    /// same-named tables whose schema differs.
    async fn preprocess_tables(&self, tables: Vec<Table>, report: &mut RestoreReport) -> Result<Vec<Table>> {
        let mut to_create = Vec::with_capacity(tables.len());

        for table in tables {
            let Some(existing) = self.database.get_table(&table.database, &table.name).await? else {
                to_create.push(table);
                continue;
            };

            if compare_schema(&existing.create_statement, &table.create_statement) {
                self.events.emit(&Event::TableAlreadyExists {
                    database: table.database.clone(),
                    table: table.name.clone(),
                });
                report.existing_tables.push(table.quoted_name());
                continue;
            }

            self.events.emit(&Event::TableReplaced {
                database: table.database.clone(),
                table: table.name.clone(),
            });
            self.database
                .drop_table_if_exists(&table.database, &table.name)
                .await?;
            to_create.push(table);
        }

        Ok(to_create)
    }

    /// Remove stale replica registrations of the replicated tables about to
    /// be created.
    async fn clean_replicas(&self, tables: &[Table], options: &RestoreOptions) -> Result<()> {
        let Some(coordination) = &self.coordination else {
            self.events.emit(&Event::ReplicaCleanupSkipped);
            return Ok(());
        };

        let macros = self.database.get_macros().await?;
        let replica_template = options
            .replica_name
            .clone()
            .or_else(|| self.config.backup.override_replica_name.clone())
            .unwrap_or_else(|| "{replica}".to_string());

        for table in tables.iter().filter(|t| is_replicated(&t.engine)) {
            let path = substitute_macros(&get_table_zookeeper_path(table)?, &macros, Some(table));
            let replica = substitute_macros(&replica_template, &macros, Some(table));
            if replica.contains('{') {
                return Err(BackupError::Config(format!(
                    "cannot resolve replica name {replica_template}"
                )));
            }

            coordination.delete_replica(&path, &replica).await?;
            self.events.emit(&Event::ReplicaRemoved { path, replica });
        }

        Ok(())
    }

    /// Submit tables in dependency-friendly order, requeueing failures.
    ///
    /// A success resets the error list. The loop gives up once more errors
    /// have accumulated than tables remain pending. Returns the tables left
    /// pending.
    async fn create_tables(&self, tables: Vec<Table>, report: &mut RestoreReport) -> Vec<Table> {
        let mut pending: VecDeque<Table> = order_for_restore(tables).into();
        let mut errors: Vec<(String, String, BackupError)> = Vec::new();

        while let Some(table) = pending.pop_front() {
            match self.database.create_table(&table).await {
                Ok(()) => {
                    debug!(table = %table.quoted_name(), "Table created");
                    report.created_tables.push(table.quoted_name());
                    errors.clear();
                }
                Err(e) => {
                    self.events.emit(&Event::TableCreateFailed {
                        database: table.database.clone(),
                        table: table.name.clone(),
                        error: e.to_string(),
                    });
                    errors.push((table.database.clone(), table.name.clone(), e));
                    pending.push_back(table);
                    if errors.len() > pending.len() {
                        break;
                    }
                }
            }
        }

        for table in &pending {
            let error = errors
                .iter()
                .rev()
                .find(|(db, name, _)| *db == table.database && *name == table.name)
                .map(|(_, _, e)| e.to_string())
                .unwrap_or_default();
            self.events.emit(&Event::TableNotRestored {
                database: table.database.clone(),
                table: table.name.clone(),
                error,
            });
        }
        pending.into_iter().collect()
    }

    /// Materialize each object-storage disk at its recorded revision once per run.
    async fn restore_cloud_storage_disks(
        &self,
        backup: &BackupMetadata,
        options: &RestoreOptions,
        ctx: &mut RestoreContext,
    ) -> Result<()> {
        let source_bucket = options.cloud_storage_source_bucket.clone().unwrap_or_default();
        let source_path = options
            .cloud_storage_source_path
            .clone()
            .unwrap_or_else(|| backup.path.clone());

        for (disk, revision) in backup.s3_revisions() {
            if ctx.disk_restarted(disk) {
                debug!(%disk, "Disk already restored in an earlier run");
                continue;
            }

            let revision = if options.cloud_storage_latest { 0 } else { *revision };
            let result = match self
                .database
                .create_disk_restore_directive(disk, revision, &source_bucket, &source_path)
                .await
            {
                Ok(()) => self.database.restart_disk(disk).await,
                Err(e) => Err(e),
            };

            if result.is_ok() {
                ctx.set_disk_restarted(disk);
            }
            ctx.dump_state()?;
            result?;
            self.events.emit(&Event::DiskRestored { disk: disk.clone(), revision });
        }

        Ok(())
    }

    /// Restore the data of one table. Table-level failures go to the report.
    async fn restore_table_data(
        &self,
        backup: &BackupMetadata,
        table_meta: &TableMetadata,
        ctx: &mut RestoreContext,
        report: &mut RestoreReport,
    ) -> Result<()> {
        ctx.add_table(table_meta);

        let result = self.restore_table_parts(backup, table_meta, ctx, report).await;
        ctx.dump_state()?;

        if let Err(e) = result {
            self.events.emit(&Event::TableDataFailed {
                database: table_meta.database.clone(),
                table: table_meta.name.clone(),
                error: e.to_string(),
            });
            report
                .failed_tables
                .push(format!("`{}`.`{}`", table_meta.database, table_meta.name));
        } else {
            let (restored, failed) = ctx
                .table_progress(&table_meta.database, &table_meta.name)
                .map_or((0, 0), |p| (p.restored.len(), p.failed.len()));
            self.events.emit(&Event::TableDataRestored {
                database: table_meta.database.clone(),
                table: table_meta.name.clone(),
                restored,
                failed,
            });
        }
        Ok(())
    }

    async fn restore_table_parts(
        &self,
        backup: &BackupMetadata,
        table_meta: &TableMetadata,
        ctx: &mut RestoreContext,
        report: &mut RestoreReport,
    ) -> Result<()> {
        let table = self
            .database
            .get_table(&table_meta.database, &table_meta.name)
            .await?
            .ok_or_else(|| {
                BackupError::NotFound(format!("table {}.{}", table_meta.database, table_meta.name))
            })?;

        let mut staged: Vec<&PartMetadata> = Vec::new();
        for part in table_meta.parts() {
            if ctx.part_restored(part) {
                debug!(table = %table.quoted_name(), part = %part.name, "Part already restored, skipping");
                continue;
            }

            if backup.s3_revisions().contains_key(&part.disk_name) {
                // materialized by the disk restart
            } else if backup.cloud_storage().has_disk(&part.disk_name) {
                self.storage.copy_part_between_disks(backup, &table, part).await?;
            } else {
                let destination = self
                    .database
                    .get_detached_part_path(&table, &part.disk_name, &part.name)
                    .await?;
                self.storage.enqueue_download_part(backup, part, &destination).await?;
            }
            staged.push(part);
        }

        if staged.is_empty() {
            return Ok(());
        }

        self.storage.wait().await?;
        self.database.chown_detached_parts(&table).await?;

        for part in staged {
            match self.database.attach_part(&table, &part.name).await {
                Ok(()) => {
                    ctx.add_part(part);
                    report.attached_parts += 1;
                    self.events.emit(&Event::PartAttached {
                        database: part.database.clone(),
                        table: part.table.clone(),
                        part: part.name.clone(),
                    });
                }
                Err(e) => {
                    ctx.add_failed_part(part, &e.to_string());
                    self.events.emit(&Event::PartAttachFailed {
                        database: part.database.clone(),
                        table: part.table.clone(),
                        part: part.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
            ctx.dump_state()?;
        }

        Ok(())
    }
}
