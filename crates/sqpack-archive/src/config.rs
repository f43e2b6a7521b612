//! Configuration for reading and generating archives

use crate::{ArchiveError, ArchiveResult};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use sqpack_formats::header::DEFAULT_MAX_DATA_FILE_SIZE;
use sqpack_formats::locator::MAX_LOCATOR_OFFSET;
use sqpack_formats::packed::DEFAULT_COMPRESSION_LEVEL;
use std::path::Path;

fn load_json<T: DeserializeOwned>(path: &Path) -> ArchiveResult<T> {
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text)
        .map_err(|e| ArchiveError::Config(format!("{}: {e}", path.display())))
}

/// How archive files are accessed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IoMode {
    /// Memory-map every file
    #[default]
    Mmap,
    /// Positional reads through a shared file handle
    Positional,
    /// Load every file into memory up front
    Memory,
}

/// Configuration for [`SqPackReader`](crate::SqPackReader)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    /// Verify checksums and table invariants while opening
    pub strict: bool,

    /// File access strategy
    pub io_mode: IoMode,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            strict: false,
            io_mode: IoMode::Mmap,
        }
    }
}

impl ReaderConfig {
    /// Enable or disable strict verification
    #[must_use]
    pub const fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Set the file access strategy
    #[must_use]
    pub const fn with_io_mode(mut self, io_mode: IoMode) -> Self {
        self.io_mode = io_mode;
        self
    }

    /// Load from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> ArchiveResult<Self> {
        load_json(path.as_ref())
    }
}

/// Configuration for [`VirtualSqPack`](crate::VirtualSqPack)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneratorConfig {
    /// Fill in every checksum and reject entries missing a hash kind
    pub strict: bool,

    /// Largest size of one data file in bytes
    pub max_data_file_size: u64,

    /// Deflate level for raw entries (0-9)
    pub compression_level: u32,

    /// Compress raw entries on demand instead of at freeze time
    pub lazy_encoding: bool,

    /// Entries below this size are kept in the export cache's LRU
    pub export_small_entry_limit: usize,

    /// Number of small entries the export cache keeps
    pub export_cache_entries: usize,
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self {
            strict: false,
            max_data_file_size: DEFAULT_MAX_DATA_FILE_SIZE,
            compression_level: DEFAULT_COMPRESSION_LEVEL,
            lazy_encoding: true,
            export_small_entry_limit: 64 * 1024, // 64 KiB
            export_cache_entries: 1024,
        }
    }
}

impl GeneratorConfig {
    /// Enable or disable strict mode
    #[must_use]
    pub const fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Set the data file size cap
    #[must_use]
    pub const fn with_max_data_file_size(mut self, size: u64) -> Self {
        self.max_data_file_size = size;
        self
    }

    /// Set the deflate level
    #[must_use]
    pub const fn with_compression_level(mut self, level: u32) -> Self {
        self.compression_level = level;
        self
    }

    /// Choose lazy or eager encoding of raw entries
    #[must_use]
    pub const fn with_lazy_encoding(mut self, lazy: bool) -> Self {
        self.lazy_encoding = lazy;
        self
    }

    /// Set the export cache bounds
    #[must_use]
    pub const fn with_export_cache(mut self, entries: usize, small_entry_limit: usize) -> Self {
        self.export_cache_entries = entries;
        self.export_small_entry_limit = small_entry_limit;
        self
    }

    /// Load from a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> ArchiveResult<Self> {
        let config: Self = load_json(path.as_ref())?;
        config.validate()?;
        Ok(config)
    }

    /// Check that the values can produce a valid archive
    pub fn validate(&self) -> ArchiveResult<()> {
        if self.max_data_file_size <= 2048 || self.max_data_file_size > MAX_LOCATOR_OFFSET {
            return Err(ArchiveError::Config(format!(
                "max_data_file_size must be in 2049..={MAX_LOCATOR_OFFSET}, got {}",
                self.max_data_file_size
            )));
        }
        if self.compression_level > 9 {
            return Err(ArchiveError::Config(format!(
                "compression_level must be 0-9, got {}",
                self.compression_level
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = GeneratorConfig::default();
        assert_eq!(config.max_data_file_size, 2_000_000_000);
        assert_eq!(config.compression_level, 6);
        config.validate().unwrap();
        assert_eq!(ReaderConfig::default().io_mode, IoMode::Mmap);
    }

    #[test]
    fn test_builders() {
        let config = GeneratorConfig::default()
            .with_strict(true)
            .with_max_data_file_size(1 << 20)
            .with_lazy_encoding(false);
        assert!(config.strict);
        assert_eq!(config.max_data_file_size, 1 << 20);
        assert!(!config.lazy_encoding);

        let reader = ReaderConfig::default().with_io_mode(IoMode::Memory).with_strict(true);
        assert_eq!(reader.io_mode, IoMode::Memory);
        assert!(reader.strict);
    }

    #[test]
    fn test_validation() {
        assert!(GeneratorConfig::default().with_max_data_file_size(100).validate().is_err());
        assert!(GeneratorConfig::default().with_max_data_file_size(u64::MAX).validate().is_err());
        assert!(GeneratorConfig::default().with_compression_level(12).validate().is_err());
    }

    #[test]
    fn test_json_loading() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "strict": true, "io_mode": "positional" }}"#).unwrap();
        let config = ReaderConfig::from_json_file(file.path()).unwrap();
        assert!(config.strict);
        assert_eq!(config.io_mode, IoMode::Positional);

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{ "compression_level": 42 }}"#).unwrap();
        let err = GeneratorConfig::from_json_file(file.path()).unwrap_err();
        assert!(matches!(err, ArchiveError::Config(_)));
    }
}
