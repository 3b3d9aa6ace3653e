//! Backup lifecycle state.

use crate::utils::errors::BackupError;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackupState {
    Created,
    Creating,
    Deleting,
    PartiallyDeleted,
    Failed,
}

impl BackupState {
    pub const ALL: [BackupState; 5] = [
        BackupState::Created,
        BackupState::Creating,
        BackupState::Deleting,
        BackupState::PartiallyDeleted,
        BackupState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            BackupState::Created => "created",
            BackupState::Creating => "creating",
            BackupState::Deleting => "deleting",
            BackupState::PartiallyDeleted => "partially_deleted",
            BackupState::Failed => "failed",
        }
    }

    /// Metadata may only change while a backup is being written or deleted.
    pub fn is_mutable(&self) -> bool {
        matches!(self, BackupState::Creating | BackupState::Deleting)
    }

    /// Transitions move forward through creating -> created -> deleting ->
    /// partially_deleted. Marking as failed is always allowed, and deletion
    /// may be (re)started from any settled state.
    pub fn can_transition_to(&self, next: BackupState) -> bool {
        use BackupState::*;

        match (self, next) {
            (_, Failed) => true,
            (Creating, Created) => true,
            (Created | Failed | PartiallyDeleted, Deleting) => true,
            (Deleting, PartiallyDeleted) => true,
            _ => false,
        }
    }
}

impl fmt::Display for BackupState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupState {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        BackupState::ALL
            .into_iter()
            .find(|state| state.as_str() == s)
            .ok_or_else(|| BackupError::UnknownState(s.to_string()))
    }
}
