//! In-memory collaborators for orchestration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use backup_engine::control::{BackupStorage, Coordination, DatabaseControl, Disk, FrozenPart, Table};
use backup_engine::metadata::{BackupMetadata, PartMetadata};
use backup_engine::{BackupError, Config, Result};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;

pub const DATA_ROOT: &str = "/var/lib/clickhouse";

pub fn config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.backup.restore_context_path = dir.path().join("restore_state.json");
    config
}

pub fn table(database: &str, name: &str, engine: &str, body: &str) -> Table {
    Table {
        database: database.into(),
        name: name.into(),
        engine: engine.into(),
        uuid: None,
        create_statement: format!("CREATE TABLE {database}.{name} {body}"),
        paths_with_disks: vec![(
            PathBuf::from(format!("{DATA_ROOT}/data/{database}/{name}")),
            Disk::local("default", DATA_ROOT),
        )],
    }
}

pub fn merge_tree(database: &str, name: &str) -> Table {
    table(
        database,
        name,
        "MergeTree",
        "(`id` UInt64, `value` String) ENGINE = MergeTree ORDER BY id",
    )
}

pub fn frozen_part(table: &Table, name: &str, size: u64) -> FrozenPart {
    FrozenPart {
        database: table.database.clone(),
        table: table.name.clone(),
        name: name.into(),
        disk_name: "default".into(),
        path: PathBuf::from(format!(
            "{DATA_ROOT}/shadow/backup/data/{}/{}/{name}",
            table.database, table.name
        )),
        checksum: format!("checksum-{name}"),
        size,
        files: vec!["checksums.txt".into(), "data.bin".into()],
        tarball: false,
    }
}

#[derive(Default)]
struct DatabaseState {
    databases: BTreeMap<String, String>,
    tables: Vec<Table>,
    frozen: HashMap<(String, String), Vec<FrozenPart>>,
    disks: Vec<Disk>,
    revisions: HashMap<String, u64>,
    macros: HashMap<String, String>,
    access_control: Vec<String>,
    requires: HashMap<String, String>,
    fail_create: HashSet<String>,
    fail_attach: HashSet<String>,
    drop_on_freeze: HashSet<String>,
    created: Vec<String>,
    dropped: Vec<String>,
    attached: Vec<String>,
    removed_frozen_parts: Vec<String>,
    frozen_data_released: usize,
    directives: Vec<(String, u64)>,
    restarted: Vec<String>,
}

/// Database server holding tables in memory.
#[derive(Default)]
pub struct FakeDatabase {
    state: Mutex<DatabaseState>,
}

impl FakeDatabase {
    pub fn new() -> Self {
        let db = Self::default();
        db.state().disks.push(Disk::local("default", DATA_ROOT));
        db
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DatabaseState> {
        self.state.lock().unwrap()
    }

    pub fn add_database(&self, name: &str, engine: &str) {
        self.state().databases.insert(name.into(), engine.into());
    }

    pub fn add_table(&self, table: Table, parts: Vec<FrozenPart>) {
        let mut state = self.state();
        state.databases.entry(table.database.clone()).or_insert_with(|| "Atomic".into());
        state.frozen.insert((table.database.clone(), table.name.clone()), parts);
        state.tables.push(table);
    }

    pub fn add_disk(&self, disk: Disk, revision: Option<u64>) {
        let mut state = self.state();
        if let Some(revision) = revision {
            state.revisions.insert(disk.name.clone(), revision);
        }
        state.disks.push(disk);
    }

    pub fn set_macro(&self, name: &str, value: &str) {
        self.state().macros.insert(name.into(), value.into());
    }

    pub fn set_access_control(&self, objects: &[&str]) {
        self.state().access_control = objects.iter().map(|o| o.to_string()).collect();
    }

    /// Creating `table` fails until `dependency` exists.
    pub fn require(&self, table: &str, dependency: &str) {
        self.state().requires.insert(table.into(), dependency.into());
    }

    pub fn fail_create(&self, table: &str) {
        self.state().fail_create.insert(table.into());
    }

    pub fn fail_attach(&self, part: &str) {
        self.state().fail_attach.insert(part.into());
    }

    pub fn heal(&self) {
        let mut state = self.state();
        state.fail_create.clear();
        state.fail_attach.clear();
    }

    pub fn drop_on_freeze(&self, table: &str) {
        self.state().drop_on_freeze.insert(table.into());
    }

    pub fn created(&self) -> Vec<String> {
        self.state().created.clone()
    }

    pub fn dropped(&self) -> Vec<String> {
        self.state().dropped.clone()
    }

    pub fn attached(&self) -> Vec<String> {
        self.state().attached.clone()
    }

    pub fn clear_attached(&self) {
        self.state().attached.clear();
    }

    pub fn removed_frozen_parts(&self) -> Vec<String> {
        self.state().removed_frozen_parts.clone()
    }

    pub fn frozen_data_released(&self) -> usize {
        self.state().frozen_data_released
    }

    pub fn directives(&self) -> Vec<(String, u64)> {
        self.state().directives.clone()
    }

    pub fn restarted(&self) -> Vec<String> {
        self.state().restarted.clone()
    }

    fn find(&self, database: &str, name: &str) -> Option<Table> {
        self.state()
            .tables
            .iter()
            .find(|t| t.database == database && t.name == name)
            .cloned()
    }
}

#[async_trait]
impl DatabaseControl for FakeDatabase {
    async fn list_databases(&self) -> Result<Vec<String>> {
        Ok(self.state().databases.keys().cloned().collect())
    }

    async fn get_tables(&self, database: Option<&str>) -> Result<Vec<Table>> {
        Ok(self
            .state()
            .tables
            .iter()
            .filter(|t| database.map_or(true, |db| t.database == db))
            .cloned()
            .collect())
    }

    async fn get_table(&self, database: &str, name: &str) -> Result<Option<Table>> {
        Ok(self.find(database, name))
    }

    async fn does_table_exist(&self, database: &str, name: &str) -> Result<bool> {
        Ok(self.find(database, name).is_some())
    }

    async fn get_database_engine(&self, database: &str) -> Result<String> {
        Ok(self
            .state()
            .databases
            .get(database)
            .cloned()
            .unwrap_or_else(|| "Atomic".into()))
    }

    async fn version(&self) -> Result<String> {
        Ok("23.8.2.7".into())
    }

    async fn get_macros(&self) -> Result<HashMap<String, String>> {
        Ok(self.state().macros.clone())
    }

    async fn get_disks(&self) -> Result<Vec<Disk>> {
        Ok(self.state().disks.clone())
    }

    async fn get_access_control_objects(&self) -> Result<Vec<String>> {
        Ok(self.state().access_control.clone())
    }

    async fn freeze_table(&self, _backup_name: &str, table: &Table) -> Result<()> {
        let mut state = self.state();
        if state.drop_on_freeze.contains(&table.name) {
            state
                .tables
                .retain(|t| !(t.database == table.database && t.name == table.name));
            return Err(BackupError::Database(format!(
                "Table {} doesn't exist",
                table.quoted_name()
            )));
        }
        Ok(())
    }

    async fn list_frozen_parts(
        &self,
        table: &Table,
        disk: &Disk,
        _data_path: &Path,
        _backup_name: &str,
    ) -> Result<Vec<FrozenPart>> {
        Ok(self
            .state()
            .frozen
            .get(&(table.database.clone(), table.name.clone()))
            .map(|parts| {
                parts
                    .iter()
                    .filter(|p| p.disk_name == disk.name)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn frozen_disk_revision(&self, disk: &Disk, _backup_name: &str) -> Result<Option<u64>> {
        Ok(self.state().revisions.get(&disk.name).copied())
    }

    async fn remove_frozen_part(&self, part: &FrozenPart) -> Result<()> {
        self.state().removed_frozen_parts.push(part.name.clone());
        Ok(())
    }

    async fn remove_frozen_data(&self, _backup_name: &str) -> Result<()> {
        self.state().frozen_data_released += 1;
        Ok(())
    }

    async fn create_table(&self, table: &Table) -> Result<()> {
        let mut state = self.state();
        if state.fail_create.contains(&table.name) {
            return Err(BackupError::Database(format!("cannot create {}", table.name)));
        }
        if let Some(dependency) = state.requires.get(&table.name) {
            if !state.tables.iter().any(|t| &t.name == dependency) {
                return Err(BackupError::Database(format!(
                    "{} depends on missing {dependency}",
                    table.name
                )));
            }
        }
        state.created.push(table.quoted_name());
        state.tables.push(table.clone());
        Ok(())
    }

    async fn drop_table_if_exists(&self, database: &str, name: &str) -> Result<()> {
        let mut state = self.state();
        state.tables.retain(|t| !(t.database == database && t.name == name));
        state.dropped.push(format!("`{database}`.`{name}`"));
        Ok(())
    }

    async fn get_detached_part_path(
        &self,
        table: &Table,
        _disk_name: &str,
        part_name: &str,
    ) -> Result<PathBuf> {
        Ok(PathBuf::from(format!(
            "{DATA_ROOT}/data/{}/{}/detached/{part_name}",
            table.database, table.name
        )))
    }

    async fn chown_detached_parts(&self, _table: &Table) -> Result<()> {
        Ok(())
    }

    async fn attach_part(&self, table: &Table, part_name: &str) -> Result<()> {
        let mut state = self.state();
        if state.fail_attach.contains(part_name) {
            return Err(BackupError::Database(format!("cannot attach {part_name}")));
        }
        state.attached.push(format!("{}.{}:{part_name}", table.database, table.name));
        Ok(())
    }

    async fn create_disk_restore_directive(
        &self,
        disk_name: &str,
        revision: u64,
        _source_bucket: &str,
        _source_path: &str,
    ) -> Result<()> {
        self.state().directives.push((disk_name.into(), revision));
        Ok(())
    }

    async fn restart_disk(&self, disk_name: &str) -> Result<()> {
        self.state().restarted.push(disk_name.into());
        Ok(())
    }
}

#[derive(Default)]
struct StorageState {
    documents: HashMap<String, String>,
    statements: HashMap<(String, String, String), String>,
    uploaded_parts: Vec<String>,
    downloaded_parts: Vec<String>,
    copied_parts: Vec<String>,
    broken_parts: HashSet<String>,
    shadow_disks: HashSet<String>,
    waits: usize,
}

/// Backup storage keeping documents and transfer logs in memory.
#[derive(Default)]
pub struct FakeStorage {
    state: Mutex<StorageState>,
}

impl FakeStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, StorageState> {
        self.state.lock().unwrap()
    }

    pub fn document(&self, backup_name: &str) -> Option<BackupMetadata> {
        self.state()
            .documents
            .get(backup_name)
            .map(|data| BackupMetadata::load_json(data).unwrap())
    }

    pub fn uploaded_parts(&self) -> Vec<String> {
        self.state().uploaded_parts.clone()
    }

    pub fn downloaded_parts(&self) -> Vec<String> {
        self.state().downloaded_parts.clone()
    }

    pub fn copied_parts(&self) -> Vec<String> {
        self.state().copied_parts.clone()
    }

    pub fn break_part(&self, part: &str) {
        self.state().broken_parts.insert(part.into());
    }

    pub fn add_shadow_disk(&self, disk: &str) {
        self.state().shadow_disks.insert(disk.into());
    }

    pub fn waits(&self) -> usize {
        self.state().waits
    }
}

#[async_trait]
impl BackupStorage for FakeStorage {
    async fn upload_table_create_statement(
        &self,
        backup_name: &str,
        database: &str,
        table: &str,
        statement: &str,
    ) -> Result<()> {
        self.state().statements.insert(
            (backup_name.into(), database.into(), table.into()),
            statement.into(),
        );
        Ok(())
    }

    async fn get_table_create_statement(
        &self,
        backup: &BackupMetadata,
        database: &str,
        table: &str,
    ) -> Result<String> {
        self.state()
            .statements
            .get(&(backup.name.clone(), database.into(), table.into()))
            .cloned()
            .ok_or_else(|| BackupError::NotFound(format!("schema of {database}.{table}")))
    }

    async fn upload_backup_metadata(&self, backup: &BackupMetadata) -> Result<()> {
        let data = backup.dump_json(false)?;
        self.state().documents.insert(backup.name.clone(), data);
        Ok(())
    }

    async fn download_backup_metadata(&self, backup_name: &str) -> Result<String> {
        self.state()
            .documents
            .get(backup_name)
            .cloned()
            .ok_or_else(|| BackupError::NotFound(format!("backup {backup_name}")))
    }

    async fn enqueue_upload_part(&self, _backup_name: &str, part: &FrozenPart) -> Result<()> {
        self.state().uploaded_parts.push(part.name.clone());
        Ok(())
    }

    async fn enqueue_download_part(
        &self,
        _backup: &BackupMetadata,
        part: &PartMetadata,
        _destination: &Path,
    ) -> Result<()> {
        self.state().downloaded_parts.push(part.name.clone());
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        self.state().waits += 1;
        Ok(())
    }

    async fn check_data_part(&self, _backup_path: &str, part: &PartMetadata) -> Result<bool> {
        Ok(!self.state().broken_parts.contains(&part.name))
    }

    async fn upload_cloud_storage_metadata(&self, _backup: &BackupMetadata, disk: &Disk) -> Result<bool> {
        Ok(self.state().shadow_disks.contains(&disk.name))
    }

    async fn copy_part_between_disks(
        &self,
        _backup: &BackupMetadata,
        _table: &Table,
        part: &PartMetadata,
    ) -> Result<()> {
        self.state().copied_parts.push(part.name.clone());
        Ok(())
    }
}

/// Coordination service recording replica deletions.
#[derive(Default)]
pub struct FakeCoordination {
    deleted: Mutex<Vec<(String, String)>>,
}

impl FakeCoordination {
    pub fn deleted(&self) -> Vec<(String, String)> {
        self.deleted.lock().unwrap().clone()
    }
}

#[async_trait]
impl Coordination for FakeCoordination {
    async fn delete_replica(&self, path: &str, replica: &str) -> Result<()> {
        self.deleted
            .lock()
            .unwrap()
            .push((path.into(), replica.into()));
        Ok(())
    }
}
