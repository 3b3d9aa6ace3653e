//! Structured progress events emitted by the orchestrators.
//!
//! Orchestrators report through an injected [`EventSink`] instead of a
//! process-wide logger. [`TracingSink`] forwards events to `tracing`,
//! [`MemorySink`] keeps them for inspection.

use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum Event {
    #[serde(rename = "backup:started")]
    BackupStarted { name: String },

    /// Databases backed by an external engine hold no local data
    #[serde(rename = "database_skipped")]
    DatabaseSkipped { database: String, engine: String },

    #[serde(rename = "backup:table_dropped")]
    TableDroppedDuringBackup { database: String, table: String },

    #[serde(rename = "backup:part_deduplicated")]
    PartDeduplicated {
        database: String,
        table: String,
        part: String,
        link: String,
    },

    #[serde(rename = "backup:database_done")]
    DatabaseBackedUp { database: String, tables: usize },

    #[serde(rename = "backup:completed")]
    BackupCompleted {
        name: String,
        size: u64,
        real_size: u64,
    },

    #[serde(rename = "backup:failed")]
    BackupFailed { name: String, error: String },

    #[serde(rename = "restore:started")]
    RestoreStarted { name: String },

    /// An equivalent table already exists on the target
    #[serde(rename = "restore:table_exists")]
    TableAlreadyExists { database: String, table: String },

    /// A same-named table with a different schema was dropped
    #[serde(rename = "restore:table_replaced")]
    TableReplaced { database: String, table: String },

    #[serde(rename = "restore:table_create_failed")]
    TableCreateFailed {
        database: String,
        table: String,
        error: String,
    },

    #[serde(rename = "restore:table_not_restored")]
    TableNotRestored {
        database: String,
        table: String,
        error: String,
    },

    #[serde(rename = "restore:replica_cleanup_skipped")]
    ReplicaCleanupSkipped,

    #[serde(rename = "restore:replica_removed")]
    ReplicaRemoved { path: String, replica: String },

    #[serde(rename = "restore:disk_restored")]
    DiskRestored { disk: String, revision: u64 },

    #[serde(rename = "restore:part_attached")]
    PartAttached {
        database: String,
        table: String,
        part: String,
    },

    #[serde(rename = "restore:part_failed")]
    PartAttachFailed {
        database: String,
        table: String,
        part: String,
        error: String,
    },

    #[serde(rename = "restore:table_data_done")]
    TableDataRestored {
        database: String,
        table: String,
        restored: usize,
        failed: usize,
    },

    #[serde(rename = "restore:table_data_failed")]
    TableDataFailed {
        database: String,
        table: String,
        error: String,
    },

    #[serde(rename = "restore:completed")]
    RestoreCompleted {
        name: String,
        failed_tables: usize,
        failed_parts: usize,
    },
}

pub trait EventSink: Send + Sync {
    fn emit(&self, event: &Event);
}

/// Sink that writes every event to the `tracing` subscriber.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &Event) {
        match event {
            Event::BackupStarted { name } => info!(backup = %name, "Starting backup"),
            Event::DatabaseSkipped { database, engine } => {
                info!(%database, %engine, "Skipping database with external engine")
            }
            Event::TableDroppedDuringBackup { database, table } => {
                warn!(%database, %table, "Table was dropped during backup, skipping")
            }
            Event::PartDeduplicated { database, table, part, link } => {
                debug!(%database, %table, %part, %link, "Part linked to earlier backup")
            }
            Event::DatabaseBackedUp { database, tables } => {
                info!(%database, tables, "Database backed up")
            }
            Event::BackupCompleted { name, size, real_size } => {
                info!(backup = %name, size, real_size, "Backup completed")
            }
            Event::BackupFailed { name, error } => error!(backup = %name, %error, "Backup failed"),
            Event::RestoreStarted { name } => info!(backup = %name, "Starting restore"),
            Event::TableAlreadyExists { database, table } => {
                info!(%database, %table, "Table already exists with the same schema, skipping")
            }
            Event::TableReplaced { database, table } => {
                warn!(%database, %table, "Table exists with a different schema, dropping it")
            }
            Event::TableCreateFailed { database, table, error } => {
                warn!(%database, %table, %error, "Failed to create table, will retry")
            }
            Event::TableNotRestored { database, table, error } => {
                warn!(%database, %table, %error, "Table was not restored")
            }
            Event::ReplicaCleanupSkipped => {
                warn!("Coordination service is not configured, skipping replica cleanup")
            }
            Event::ReplicaRemoved { path, replica } => {
                info!(%path, %replica, "Removed stale replica registration")
            }
            Event::DiskRestored { disk, revision } => info!(%disk, revision, "Disk restored"),
            Event::PartAttached { database, table, part } => {
                debug!(%database, %table, %part, "Part attached")
            }
            Event::PartAttachFailed { database, table, part, error } => {
                error!(%database, %table, %part, %error, "Failed to attach part")
            }
            Event::TableDataRestored { database, table, restored, failed } => {
                info!(%database, %table, restored, failed, "Table data restored")
            }
            Event::TableDataFailed { database, table, error } => {
                error!(%database, %table, %error, "Failed to restore table data")
            }
            Event::RestoreCompleted { name, failed_tables, failed_parts } => {
                if *failed_tables == 0 && *failed_parts == 0 {
                    info!(backup = %name, "Restore completed")
                } else {
                    warn!(backup = %name, failed_tables, failed_parts, "Restore completed with failures")
                }
            }
        }
    }
}

/// Sink that records events in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Event>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<Event> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl EventSink for MemorySink {
    fn emit(&self, event: &Event) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
