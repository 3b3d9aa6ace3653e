//! Data part records.

/// Disk name assumed for parts recorded without one.
pub const DEFAULT_DISK: &str = "default";

/// One immutable data part as recorded in a backup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartMetadata {
    pub database: String,
    pub table: String,
    pub name: String,
    pub checksum: String,
    pub size: u64,
    pub files: Vec<String>,
    /// Part files are stored as a single tarball rather than one object per file
    pub tarball: bool,
    /// Path of the backup that physically holds the bytes, for deduplicated parts
    pub link: Option<String>,
    pub disk_name: String,
}

impl PartMetadata {
    pub fn new(
        database: impl Into<String>,
        table: impl Into<String>,
        name: impl Into<String>,
        checksum: impl Into<String>,
        size: u64,
        files: Vec<String>,
        tarball: bool,
    ) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            name: name.into(),
            checksum: checksum.into(),
            size,
            files,
            tarball,
            link: None,
            disk_name: DEFAULT_DISK.to_string(),
        }
    }

    pub fn with_link(mut self, link: impl Into<String>) -> Self {
        self.link = Some(link.into());
        self
    }

    pub fn on_disk(mut self, disk_name: impl Into<String>) -> Self {
        self.disk_name = disk_name.into();
        self
    }

    /// Whether the bytes of this part live in another backup.
    pub fn is_linked(&self) -> bool {
        self.link.is_some()
    }
}
