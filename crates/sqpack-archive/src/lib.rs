//! SqPack archive reader and virtual archive generator.
//!
//! An archive is a pair of index files (`*.index`, `*.index2`) and up to
//! eight data files (`*.dat0` ... `*.dat7`). This crate sits on top of
//! `sqpack-formats`:
//!
//! - [`SqPackReader`] opens an archive from disk or from streams, checks its
//!   headers and tables and resolves paths to entries.
//! - [`VirtualSqPack`] collects entries from existing archives and raw
//!   files, then [`freeze`](VirtualSqPack::freeze)s them into a
//!   [`FrozenSqPack`] whose index and data files are generated on demand.
//! - [`ExportCache`] buffers encoded entries while a frozen archive is
//!   written to disk.
//!
//! Reading a frozen archive through [`SqPackReader::from_streams`] uses the
//! same lookup path as reading one from disk.
//!
//! # Example
//!
//! ```rust
//! use sqpack_archive::{EntrySource, GeneratorConfig, ReaderConfig, SqPackReader, VirtualSqPack};
//! use sqpack_formats::{EncodeKind, MemoryStream, PathSpec};
//!
//! # fn example() -> Result<(), sqpack_archive::ArchiveError> {
//! let mut pack = VirtualSqPack::new(GeneratorConfig::default());
//! pack.add(
//!     PathSpec::new("exd/root.exl"),
//!     EntrySource::Raw {
//!         stream: MemoryStream::shared(b"EXLT,2\n".to_vec()),
//!         kind: EncodeKind::Binary,
//!     },
//!     false,
//! )?;
//! let frozen = pack.freeze()?;
//!
//! let reader = SqPackReader::from_streams(
//!     Some(frozen.index1()),
//!     Some(frozen.index2()),
//!     frozen.data_files(),
//!     ReaderConfig::default(),
//! )?;
//! assert_eq!(reader.read_path("exd/root.exl")?, b"EXLT,2\n");
//! # Ok(())
//! # }
//! # example().unwrap();
//! ```

#![warn(missing_docs)]
#![allow(clippy::must_use_candidate)]

use sqpack_formats::FormatError;
use thiserror::Error;

// Export buffering
pub mod cache;

// Reader and generator configuration
pub mod config;

// Generated archive streams
pub mod frozen;

// Virtual archive assembly
pub mod generator;

// Archive reading
pub mod reader;

pub use cache::ExportCache;
pub use config::{GeneratorConfig, IoMode, ReaderConfig};
pub use frozen::{FrozenDataFile, FrozenEntry, FrozenSqPack};
pub use generator::{AddResult, EntrySource, VirtualSqPack};
pub use reader::{ReaderEntry, SqPackReader};

/// Archive-level errors
#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Error from the format layer
    #[error("format error: {0}")]
    Format(#[from] FormatError),

    /// Archive files disagree with each other
    #[error("corrupt archive: {0}")]
    Corrupt(String),

    /// No entry matches the request
    #[error("entry not found: {0}")]
    NotFound(String),

    /// The virtual archive has already been frozen
    #[error("virtual archive is already frozen")]
    AlreadyFrozen,

    /// Entries do not fit in the allowed number of data files
    #[error("entries need more than {max} data files")]
    TooManyDataFiles {
        /// Data file limit
        max: usize,
    },

    /// A single entry exceeds the data file size cap
    #[error("entry {path} of {size} bytes exceeds the {max}-byte data file limit")]
    EntryTooLarge {
        /// Entry identity
        path: String,
        /// Packed size of the entry
        size: u64,
        /// Data file size cap
        max: u64,
    },

    /// Colliding entries cannot be told apart
    #[error("hash collision cannot be resolved without path text: {0}")]
    UnresolvableSynonym(String),

    /// Entry lacks a hash kind one of the index files needs
    #[error("entry has no {kind} hash: {path}")]
    MissingHash {
        /// Entry identity
        path: String,
        /// Missing hash kind
        kind: &'static str,
    },

    /// Invalid configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ArchiveError {
    /// Whether the error signals damaged archive content
    pub fn is_corruption(&self) -> bool {
        match self {
            Self::Corrupt(_) => true,
            Self::Format(e) => e.is_corruption(),
            _ => false,
        }
    }

    /// Whether the error is a lookup miss
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

/// Result type for archive operations
pub type ArchiveResult<T> = Result<T, ArchiveError>;
