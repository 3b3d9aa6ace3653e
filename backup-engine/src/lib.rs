//! Backup Engine Library
//!
//! Deduplicating backup and resumable restore for a distributed column-store
//! database. The database server, backup storage and coordination service
//! are reached through the traits in [`control`].

pub mod config;
pub mod control;
pub mod dedup;
pub mod events;
pub mod executor;
pub mod fs;
pub mod journal;
pub mod metadata;
pub mod schema;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::{BackupError, Result};
