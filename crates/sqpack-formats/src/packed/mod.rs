//! Packed entries
//!
//! Every entry in a data file is stored as:
//!
//! ```text
//! [PackedFileHeader][type-specific locator table][pad to 128]
//! [data region: optional verbatim prefix, then blocks]
//! ```
//!
//! Offsets in the locator tables are relative to the end of the header
//! (`header_size`). Three layouts exist besides the empty placeholder:
//!
//! - **Binary**: a flat run of blocks described by [`BinaryBlockLocator`]s
//! - **Model**: eleven independently chunked sections described by one
//!   [`ModelBlockLocator`](model::ModelBlockLocator)
//! - **Texture**: the native texture header copied verbatim, then one run
//!   of blocks per mip level described by
//!   [`TextureBlockLocator`](texture::TextureBlockLocator)s

pub mod block;
pub mod decoder;
pub mod encoder;
pub mod model;
pub mod texture;

pub use block::{
    BLOCK_HEADER_SIZE, BlockHeader, DEFAULT_COMPRESSION_LEVEL, STORED_BLOCK_MARKER, decode_block,
    decode_block_into, encode_block, verify_block_padding, worst_case_block_size,
};
pub use decoder::{PackedDecoder, UnpackingStream};
pub use encoder::{EagerPackedStream, EncodeKind, LazyPackedStream, PackedFileStream, SourceLayout};

use crate::align::ALIGNMENT;
use crate::error::{FormatError, FormatResult};
use binrw::{BinRead, BinWrite};

/// Serialized size of [`PackedFileHeader`]
pub const PACKED_FILE_HEADER_SIZE: u32 = 24;

/// Kind of packed entry
#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[brw(little, repr = u32)]
pub enum PackedType {
    /// Placeholder without data
    Empty = 1,
    /// Arbitrary bytes
    Binary = 2,
    /// 3D model
    Model = 3,
    /// Texture
    Texture = 4,
}

/// Header at the start of every packed entry
#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq)]
#[brw(little)]
pub struct PackedFileHeader {
    /// Size of this header plus its locator table, 128-byte aligned
    pub header_size: u32,
    /// Entry layout
    pub entry_type: PackedType,
    /// Size of the unpacked file
    pub decompressed_size: u32,
    /// Largest block slot in the entry
    pub block_buffer_size: u32,
    /// Size of the whole entry in 128-byte units
    pub occupied_space_unit_count: u32,
    /// Block count (binary), locator count (texture) or format version (model)
    pub block_count_or_version: u32,
}

impl PackedFileHeader {
    /// Header of an empty placeholder entry
    pub const fn empty() -> Self {
        Self {
            header_size: ALIGNMENT as u32,
            entry_type: PackedType::Empty,
            decompressed_size: 0,
            block_buffer_size: 0,
            occupied_space_unit_count: 1,
            block_count_or_version: 0,
        }
    }

    /// Parse from the first bytes of an entry
    pub fn parse(data: &[u8]) -> FormatResult<Self> {
        if data.len() < PACKED_FILE_HEADER_SIZE as usize {
            return Err(FormatError::corrupt(format!(
                "packed file header truncated: {} bytes",
                data.len()
            )));
        }
        let header: Self = crate::read_le(&data[..PACKED_FILE_HEADER_SIZE as usize])
            .map_err(|e| FormatError::corrupt(format!("packed file header: {e}")))?;
        if header.header_size < PACKED_FILE_HEADER_SIZE {
            return Err(FormatError::corrupt(format!(
                "packed header size {} is smaller than the header itself",
                header.header_size
            )));
        }
        Ok(header)
    }

    /// Bytes the entry occupies in its data file
    pub const fn occupied_size(&self) -> u64 {
        self.occupied_space_unit_count as u64 * ALIGNMENT
    }
}

/// A run of source bytes encoded as one group of blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Section {
    /// Where the run starts in the source file
    pub source_offset: u64,
    /// Bytes to encode
    pub size: u64,
    /// Bytes actually present in the source; the rest reads as zero
    pub available: u64,
}

impl Section {
    /// Section fully backed by the source
    pub const fn new(source_offset: u64, size: u64) -> Self {
        Self {
            source_offset,
            size,
            available: size,
        }
    }
}

/// Binary entry table record
#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq)]
#[brw(little)]
pub struct BinaryBlockLocator {
    /// Block offset relative to the end of the header
    pub offset: u32,
    /// Slot size of the block
    pub block_size: u16,
    /// Bytes the block inflates to
    pub decompressed_size: u16,
}

/// Serialized size of [`BinaryBlockLocator`]
pub const BINARY_BLOCK_LOCATOR_SIZE: u32 = 8;

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_header_bytes() {
        let bytes = crate::write_le(&PackedFileHeader::empty()).unwrap();
        assert_eq!(bytes.len(), PACKED_FILE_HEADER_SIZE as usize);
        assert_eq!(&bytes[0..4], &128u32.to_le_bytes());
        assert_eq!(&bytes[4..8], &1u32.to_le_bytes());
        assert_eq!(&bytes[16..20], &1u32.to_le_bytes());
    }

    #[test]
    fn test_unknown_type_is_corrupt() {
        let mut bytes = crate::write_le(&PackedFileHeader::empty()).unwrap();
        bytes[4] = 9;
        assert!(PackedFileHeader::parse(&bytes).unwrap_err().is_corruption());
    }

    #[test]
    fn test_occupied_size() {
        let mut header = PackedFileHeader::empty();
        header.occupied_space_unit_count = 3;
        assert_eq!(header.occupied_size(), 384);
    }
}
