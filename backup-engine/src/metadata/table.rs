//! Table records and their part maps.

use super::part::PartMetadata;
use crate::utils::errors::{BackupError, Result};
use std::collections::{BTreeMap, HashSet};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableMetadata {
    pub database: String,
    pub name: String,
    pub engine: String,
    /// Stable identifier, used when restoring into Atomic databases
    pub uuid: Option<String>,
    parts: BTreeMap<String, PartMetadata>,
}

impl TableMetadata {
    pub fn new(
        database: impl Into<String>,
        name: impl Into<String>,
        engine: impl Into<String>,
        uuid: Option<String>,
    ) -> Self {
        Self {
            database: database.into(),
            name: name.into(),
            engine: engine.into(),
            uuid,
            parts: BTreeMap::new(),
        }
    }

    pub fn parts(&self) -> impl Iterator<Item = &PartMetadata> {
        self.parts.values()
    }

    /// Parts except the ones named in `excluded`.
    pub fn get_parts(&self, excluded: &HashSet<String>) -> Vec<&PartMetadata> {
        self.parts
            .values()
            .filter(|part| !excluded.contains(&part.name))
            .collect()
    }

    pub fn part(&self, name: &str) -> Option<&PartMetadata> {
        self.parts.get(name)
    }

    pub fn part_count(&self) -> usize {
        self.parts.len()
    }

    pub fn add_part(&mut self, part: PartMetadata) -> Result<()> {
        if part.database != self.database || part.table != self.name {
            return Err(BackupError::Conflict(format!(
                "part {} belongs to {}.{}, not {}.{}",
                part.name, part.database, part.table, self.database, self.name
            )));
        }
        if self.parts.contains_key(&part.name) {
            return Err(BackupError::Conflict(format!(
                "part {} already recorded for {}.{}",
                part.name, self.database, self.name
            )));
        }

        self.parts.insert(part.name.clone(), part);
        Ok(())
    }

    pub(crate) fn remove_part(&mut self, name: &str) -> Option<PartMetadata> {
        self.parts.remove(name)
    }

    /// Sum of all part sizes.
    pub fn size(&self) -> u64 {
        self.parts.values().map(|p| p.size).sum()
    }

    /// Sum of sizes of parts physically stored in this backup.
    pub fn real_size(&self) -> u64 {
        self.parts
            .values()
            .filter(|p| !p.is_linked())
            .map(|p| p.size)
            .sum()
    }
}
