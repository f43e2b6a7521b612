//! Binary formats of SqPack archives
//!
#![allow(clippy::cast_possible_truncation)] // Intentional for binary format parsing
#![allow(clippy::cast_possible_wrap)] // Intentional for binary operations
#![allow(clippy::cast_lossless)] // Sometimes clearer than From
#![allow(clippy::uninlined_format_args)] // Backwards compatibility
#![allow(clippy::doc_markdown)] // Format terms don't need backticks
#![allow(clippy::module_name_repetitions)] // Clear naming is preferred
#![allow(clippy::similar_names)] // Domain-specific naming patterns
#![allow(clippy::needless_pass_by_value)] // Shared stream handles
#![allow(clippy::map_unwrap_or)] // Binary format patterns
#![allow(clippy::redundant_closure_for_method_calls)] // Iterator chains
#![allow(clippy::return_self_not_must_use)] // Builder patterns
#![allow(clippy::use_self)] // Type clarity
//! This crate implements the on-disk structures of SqPack archives: the
//! SqPack, index and data file headers, the index tables with their hash
//! and text locators, and the packed entry codec that stores files as
//! runs of deflate blocks.
//!
//! # Modules
//!
//! - **align**: 128-byte allocation unit and 16,000-byte chunking
//! - **path**: [`PathSpec`] pairing path text with its hashes
//! - **locator**: [`DataLocator`] packing data file index and offset
//! - **stream**: [`RandomAccessStream`] and its file, memory and view sources
//! - **header**: SqPack, index and data file headers
//! - **index**: index1/index2 tables with synonym resolution
//! - **packed**: block codec, packed entry encoders and decoders
//!
//! # Design Principles
//!
//! - **Symmetric Operations**: every header and table both parses and builds
//! - **Random Access**: packed entries decode any byte range without
//!   inflating the whole file
//! - **Strict Mode**: checksums and table invariants are verified on request

#![warn(missing_docs)]

pub mod align;
pub mod error;
pub mod header;
pub mod index;
pub mod locator;
pub mod packed;
pub mod path;
pub mod stream;

// Test utilities module
#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
pub(crate) mod test_utils;

pub use error::{FormatError, FormatResult};
pub use header::{DataHeader, IndexHeader, SegmentDescriptor, SqPackHeader, SqPackType};
pub use index::{IndexEntry, IndexLookup, SqIndex, SqIndex1, SqIndex2};
pub use locator::DataLocator;
pub use packed::{
    EncodeKind, PackedDecoder, PackedFileHeader, PackedFileStream, PackedType, UnpackingStream,
};
pub use path::PathSpec;
pub use stream::{
    FileStream, MemoryStream, MmapStream, RandomAccessStream, SharedStream, ViewStream,
};

use binrw::{BinRead, BinReaderExt, BinWrite, BinWriterExt};
use std::io::Cursor;

/// Read a little-endian structure from the start of `data`
pub fn read_le<T>(data: &[u8]) -> FormatResult<T>
where
    T: BinRead,
    for<'a> T::Args<'a>: Default,
{
    let mut cursor = Cursor::new(data);
    Ok(cursor.read_le()?)
}

/// Serialize a little-endian structure
pub fn write_le<T>(value: &T) -> FormatResult<Vec<u8>>
where
    T: BinWrite,
    for<'a> T::Args<'a>: Default,
{
    let mut cursor = Cursor::new(Vec::new());
    cursor.write_le(value)?;
    Ok(cursor.into_inner())
}

/// Common format trait that every header and table implements
pub trait SqPackFormat: Sized {
    /// Parse from bytes
    fn parse(data: &[u8]) -> FormatResult<Self>;

    /// Build to bytes
    fn build(&self) -> FormatResult<Vec<u8>>;

    /// Verify round-trip correctness
    fn verify_round_trip(data: &[u8]) -> FormatResult<()> {
        let parsed = Self::parse(data)?;
        let rebuilt = parsed.build()?;
        if data != rebuilt.as_slice() {
            return Err(FormatError::corrupt("round-trip verification failed"));
        }
        Ok(())
    }
}
