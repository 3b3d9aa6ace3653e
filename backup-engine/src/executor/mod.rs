//! Backup and restore orchestration.
//!
//! Both executors drive the external collaborators sequentially, table by
//! table, and report progress through an injected [`EventSink`](crate::events::EventSink).

pub mod backup;
pub mod restore;

pub use backup::{BackupExecutor, BackupJob, DEFAULT_BACKUP_ROOT};
pub use restore::{RestoreExecutor, RestoreOptions, RestoreReport};
