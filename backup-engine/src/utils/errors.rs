//! Custom error types for the backup engine.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    /// The metadata document is malformed or written by an incompatible version.
    #[error("Invalid backup structure: {0}")]
    InvalidStructure(String),

    #[error("Unknown backup state: {0}")]
    UnknownState(String),

    /// Network blips, lock contention and similar failures worth retrying.
    #[error("Transient error: {0}")]
    Transient(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Coordination service error: {0}")]
    Coordination(String),

    #[error("Uploaded parts are broken: {}", .0.join(", "))]
    Verification(Vec<String>),

    #[error("Failed to restore tables: {}", .0.join(", "))]
    TablesFailed(Vec<String>),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    Conflict(String),

    #[error("Backup metadata is read-only in state {0}")]
    ReadOnly(String),

    #[error("Invalid backup state transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Backup {name} is {state} and cannot be restored")]
    NotRestorable { name: String, state: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Persist error: {0}")]
    Persist(#[from] tempfile::PersistError),
}

impl BackupError {
    /// Whether a collaborator call failing with this error may be retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, BackupError::Transient(_))
    }

    /// Structural errors signal a corrupt or foreign-version backup.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            BackupError::InvalidStructure(_) | BackupError::UnknownState(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;
