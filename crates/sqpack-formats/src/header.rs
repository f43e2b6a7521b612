//! File headers shared by index and data files
//!
//! Every SqPack file starts with a 1024-byte [`SqPackHeader`], followed by
//! a second 1024-byte header specific to the file kind: [`IndexHeader`] for
//! `.index`/`.index2` and [`DataHeader`] for `.datN`.

use crate::SqPackFormat;
use crate::error::{FormatError, FormatResult};
use crate::locator::MAX_DATA_FILES;
use binrw::{BinRead, BinWrite};
use sqpack_crypto::Sha1Digest;

/// Signature at the start of every SqPack file
pub const SQPACK_SIGNATURE: [u8; 12] = *b"SqPack\0\0\0\0\0\0";

/// Size of every top-level header block
pub const HEADER_SIZE: u32 = 1024;

/// Bytes covered by a header's trailing SHA-1
pub const HEADER_SHA1_OFFSET: usize = 0x3C0;

/// Offset of the first entry in a data file
pub const DATA_ENTRIES_OFFSET: u64 = 2 * HEADER_SIZE as u64;

/// Default cap on a data file's size
pub const DEFAULT_MAX_DATA_FILE_SIZE: u64 = 2_000_000_000;

/// Kind of SqPack file
#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq)]
#[brw(little, repr = u32)]
pub enum SqPackType {
    /// Database file
    Database = 0,
    /// `.datN` data file
    Data = 1,
    /// `.index` / `.index2` file
    Index = 2,
}

/// Parse a fixed-size header from the front of `data`
fn parse_header<T>(data: &[u8], what: &str) -> FormatResult<T>
where
    T: BinRead,
    for<'a> T::Args<'a>: Default,
{
    if data.len() < HEADER_SIZE as usize {
        return Err(FormatError::corrupt(format!(
            "{what} truncated: {} of {HEADER_SIZE} bytes",
            data.len()
        )));
    }
    crate::read_le::<T>(&data[..HEADER_SIZE as usize])
        .map_err(|e| FormatError::corrupt(format!("{what}: {e}")))
}

/// Check a header's trailing SHA-1 against the bytes it covers
fn verify_header_sha1(data: &[u8], stored: &Sha1Digest, what: &str) -> FormatResult<()> {
    if stored.is_zero() {
        return Ok(());
    }
    let actual = Sha1Digest::from_data(&data[..HEADER_SHA1_OFFSET]);
    if &actual != stored {
        return Err(FormatError::corrupt(format!(
            "{what} checksum mismatch: stored {stored}, computed {actual}"
        )));
    }
    Ok(())
}

/// Digest of the bytes a header's trailing SHA-1 covers
fn header_digest<T>(value: &T) -> FormatResult<Sha1Digest>
where
    T: BinWrite,
    for<'a> T::Args<'a>: Default,
{
    let bytes = crate::write_le(value)?;
    Ok(Sha1Digest::from_data(&bytes[..HEADER_SHA1_OFFSET]))
}

/// Common 1024-byte header
#[derive(BinRead, BinWrite, Debug, Clone, PartialEq, Eq)]
#[brw(little)]
pub struct SqPackHeader {
    /// `"SqPack"` followed by NULs
    pub signature: [u8; 12],
    /// Always 1024
    pub header_size: u32,
    /// Always 1
    pub version: u32,
    /// File kind
    pub file_type: SqPackType,
    /// Build date as `YYYYMMDD`, 0 when generated
    pub date: u32,
    /// Build time
    pub time: u32,
    /// Region code, `0xFFFFFFFF` for global
    #[brw(pad_after = 0x39C)]
    pub region: u32,
    /// SHA-1 of bytes `0x000..0x3C0`
    #[brw(pad_after = 0x2C)]
    pub sha1: Sha1Digest,
}

impl SqPackHeader {
    /// Header for a freshly generated file
    pub const fn new(file_type: SqPackType) -> Self {
        Self {
            signature: SQPACK_SIGNATURE,
            header_size: HEADER_SIZE,
            version: 1,
            file_type,
            date: 0,
            time: 0,
            region: 0xFFFF_FFFF,
            sha1: Sha1Digest::ZERO,
        }
    }

    /// Parse and validate, checking the SHA-1 when `strict` is set
    pub fn parse_with(data: &[u8], strict: bool) -> FormatResult<Self> {
        let header: Self = parse_header(data, "SqPack header")?;
        if header.signature != SQPACK_SIGNATURE {
            return Err(FormatError::corrupt(format!(
                "bad SqPack signature {:02X?}",
                header.signature
            )));
        }
        if header.header_size != HEADER_SIZE {
            return Err(FormatError::corrupt(format!(
                "SqPack header size {} != {HEADER_SIZE}",
                header.header_size
            )));
        }
        if strict {
            verify_header_sha1(data, &header.sha1, "SqPack header")?;
        }
        Ok(header)
    }

    /// Store the SHA-1 of the header bytes
    pub fn seal(&mut self) -> FormatResult<()> {
        self.sha1 = header_digest(self)?;
        Ok(())
    }
}

impl SqPackFormat for SqPackHeader {
    fn parse(data: &[u8]) -> FormatResult<Self> {
        Self::parse_with(data, false)
    }

    fn build(&self) -> FormatResult<Vec<u8>> {
        crate::write_le(self)
    }
}

/// Location and checksum of one index segment
#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[brw(little)]
pub struct SegmentDescriptor {
    /// Segment-specific count field
    pub count: u32,
    /// Absolute file offset
    pub offset: u32,
    /// Size in bytes
    pub size: u32,
    /// SHA-1 of the segment bytes, zero when not computed
    #[brw(pad_after = 40)]
    pub sha1: Sha1Digest,
}

impl SegmentDescriptor {
    /// Byte range of the segment
    pub fn range(&self) -> std::ops::Range<usize> {
        self.offset as usize..self.offset as usize + self.size as usize
    }

    /// Slice the segment out of a whole index file
    pub fn slice<'a>(&self, file: &'a [u8], what: &str) -> FormatResult<&'a [u8]> {
        file.get(self.range()).ok_or_else(|| {
            FormatError::corrupt(format!(
                "{what} segment {:#x}+{:#x} lies outside a {}-byte index",
                self.offset,
                self.size,
                file.len()
            ))
        })
    }

    /// Check the stored checksum, if any
    pub fn verify(&self, segment: &[u8], what: &str) -> FormatResult<()> {
        if self.sha1.is_zero() {
            return Ok(());
        }
        let actual = Sha1Digest::from_data(segment);
        if actual != self.sha1 {
            return Err(FormatError::corrupt(format!(
                "{what} segment checksum mismatch: stored {}, computed {actual}",
                self.sha1
            )));
        }
        Ok(())
    }
}

/// Index table variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexType {
    /// `.index`, keyed by `(path_hash, name_hash)`
    Index1 = 0,
    /// `.index2`, keyed by full path hash
    Index2 = 2,
}

/// Second header of `.index` and `.index2` files
#[derive(BinRead, BinWrite, Debug, Clone, PartialEq, Eq)]
#[brw(little)]
pub struct IndexHeader {
    /// Always 1024
    pub header_size: u32,
    /// Hash locators; count is 1
    #[brw(pad_after = 4)]
    pub hash_locators: SegmentDescriptor,
    /// Text locators; count is the number of data files
    pub text_locators: SegmentDescriptor,
    /// Opaque segment kept as-is
    pub unknown_segment: SegmentDescriptor,
    /// Folder locators (index1 only)
    #[brw(pad_after = 4)]
    pub folders: SegmentDescriptor,
    /// 0 for index1, 2 for index2
    #[brw(pad_after = 0x290)]
    pub index_type: u32,
    /// SHA-1 of bytes `0x000..0x3C0`
    #[brw(pad_after = 0x2C)]
    pub sha1: Sha1Digest,
}

impl IndexHeader {
    /// Empty header for `index_type`
    pub fn new(index_type: IndexType) -> Self {
        Self {
            header_size: HEADER_SIZE,
            hash_locators: SegmentDescriptor::default(),
            text_locators: SegmentDescriptor::default(),
            unknown_segment: SegmentDescriptor::default(),
            folders: SegmentDescriptor::default(),
            index_type: index_type as u32,
            sha1: Sha1Digest::ZERO,
        }
    }

    /// Parse and validate, checking the SHA-1 when `strict` is set
    pub fn parse_with(data: &[u8], strict: bool) -> FormatResult<Self> {
        let header: Self = parse_header(data, "index header")?;
        if header.header_size != HEADER_SIZE {
            return Err(FormatError::corrupt(format!(
                "index header size {} != {HEADER_SIZE}",
                header.header_size
            )));
        }
        if strict {
            verify_header_sha1(data, &header.sha1, "index header")?;
        }
        Ok(header)
    }

    /// Store the SHA-1 of the header bytes
    pub fn seal(&mut self) -> FormatResult<()> {
        self.sha1 = header_digest(self)?;
        Ok(())
    }

    /// Number of data files the index refers to
    pub const fn data_file_count(&self) -> u32 {
        self.text_locators.count
    }
}

impl SqPackFormat for IndexHeader {
    fn parse(data: &[u8]) -> FormatResult<Self> {
        Self::parse_with(data, false)
    }

    fn build(&self) -> FormatResult<Vec<u8>> {
        crate::write_le(self)
    }
}

/// Second header of `.datN` files
#[derive(BinRead, BinWrite, Debug, Clone, PartialEq, Eq)]
#[brw(little)]
pub struct DataHeader {
    /// Always 1024
    pub header_size: u32,
    /// Always 0
    pub null1: u32,
    /// Always 0x10
    pub unknown1: u32,
    /// Bytes following both headers
    pub data_size: u64,
    /// 1-based position of this file in the archive (`.dat0` is 1)
    pub span_index: u32,
    /// Always 0
    pub null2: u32,
    /// Cap used when the archive was laid out
    pub max_file_size: u64,
    /// SHA-1 of the entry bytes, zero when not computed
    #[brw(pad_after = 0x388)]
    pub data_sha1: Sha1Digest,
    /// SHA-1 of bytes `0x000..0x3C0`
    #[brw(pad_after = 0x2C)]
    pub sha1: Sha1Digest,
}

impl DataHeader {
    /// Header for data file `index` (0-based) holding `data_size` bytes
    pub const fn new(index: usize, data_size: u64, max_file_size: u64) -> Self {
        Self {
            header_size: HEADER_SIZE,
            null1: 0,
            unknown1: 0x10,
            data_size,
            span_index: index as u32 + 1,
            null2: 0,
            max_file_size,
            data_sha1: Sha1Digest::ZERO,
            sha1: Sha1Digest::ZERO,
        }
    }

    /// Parse and validate, checking the SHA-1 when `strict` is set
    pub fn parse_with(data: &[u8], strict: bool) -> FormatResult<Self> {
        let header: Self = parse_header(data, "data header")?;
        if header.header_size != HEADER_SIZE {
            return Err(FormatError::corrupt(format!(
                "data header size {} != {HEADER_SIZE}",
                header.header_size
            )));
        }
        if header.span_index == 0 || header.span_index as usize > MAX_DATA_FILES {
            return Err(FormatError::corrupt(format!(
                "data span index {} out of range",
                header.span_index
            )));
        }
        if strict {
            verify_header_sha1(data, &header.sha1, "data header")?;
        }
        Ok(header)
    }

    /// Store the SHA-1 of the header bytes
    pub fn seal(&mut self) -> FormatResult<()> {
        self.sha1 = header_digest(self)?;
        Ok(())
    }
}

impl SqPackFormat for DataHeader {
    fn parse(data: &[u8]) -> FormatResult<Self> {
        Self::parse_with(data, false)
    }

    fn build(&self) -> FormatResult<Vec<u8>> {
        crate::write_le(self)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::test_utils::{test_invalid_data_rejected, test_round_trip};

    #[test]
    fn test_sqpack_header_layout() {
        let mut header = SqPackHeader::new(SqPackType::Index);
        header.seal().unwrap();
        let bytes = header.build().unwrap();
        assert_eq!(bytes.len(), 1024);
        assert_eq!(&bytes[..6], b"SqPack");
        assert_eq!(&bytes[0x0C..0x10], &1024u32.to_le_bytes());
        assert_eq!(&bytes[0x14..0x18], &2u32.to_le_bytes());
        assert_eq!(&bytes[0x20..0x24], &[0xFF; 4]);
        assert_eq!(
            &bytes[0x3C0..0x3D4],
            Sha1Digest::from_data(&bytes[..0x3C0]).as_bytes()
        );

        let parsed = SqPackHeader::parse_with(&bytes, true).unwrap();
        assert_eq!(parsed.file_type, SqPackType::Index);
    }

    #[test]
    fn test_sqpack_header_rejects_damage() {
        let mut header = SqPackHeader::new(SqPackType::Data);
        header.seal().unwrap();
        let mut bytes = header.build().unwrap();
        bytes[0x18] = 1;
        assert!(SqPackHeader::parse_with(&bytes, false).is_ok());
        assert!(SqPackHeader::parse_with(&bytes, true).is_err());

        bytes[0] = b'X';
        let err = SqPackHeader::parse_with(&bytes, false).unwrap_err();
        assert!(err.is_corruption());

        assert!(SqPackHeader::parse_with(&bytes[..100], false).is_err());
    }

    #[test]
    fn test_index_header_layout() {
        let mut header = IndexHeader::new(IndexType::Index2);
        header.hash_locators.count = 1;
        header.hash_locators.offset = 2048;
        header.text_locators.count = 3;
        header.folders.size = 16;
        let bytes = header.build().unwrap();
        assert_eq!(bytes.len(), 1024);
        assert_eq!(&bytes[0x04..0x08], &1u32.to_le_bytes());
        assert_eq!(&bytes[0x08..0x0C], &2048u32.to_le_bytes());
        assert_eq!(&bytes[0x50..0x54], &3u32.to_le_bytes());
        assert_eq!(&bytes[0xE8..0xEC], &16u32.to_le_bytes());
        assert_eq!(&bytes[0x12C..0x130], &2u32.to_le_bytes());
        test_round_trip(&header).unwrap();
    }

    #[test]
    fn test_data_header_layout() {
        let mut header = DataHeader::new(0, 0x1234, DEFAULT_MAX_DATA_FILE_SIZE);
        header.seal().unwrap();
        let bytes = header.build().unwrap();
        assert_eq!(bytes.len(), 1024);
        assert_eq!(&bytes[0x08..0x0C], &0x10u32.to_le_bytes());
        assert_eq!(&bytes[0x0C..0x14], &0x1234u64.to_le_bytes());
        assert_eq!(&bytes[0x14..0x18], &1u32.to_le_bytes());
        assert_eq!(&bytes[0x1C..0x24], &DEFAULT_MAX_DATA_FILE_SIZE.to_le_bytes());
        assert_eq!(header.sha1, Sha1Digest::from_data(&bytes[..0x3C0]));
        assert_eq!(DataHeader::parse_with(&bytes, true).unwrap(), header);
        test_round_trip(&header).unwrap();
    }

    #[test]
    fn test_data_header_rejects_bad_span() {
        let mut bytes = DataHeader::new(0, 0, DEFAULT_MAX_DATA_FILE_SIZE).build().unwrap();
        bytes[0x14..0x18].copy_from_slice(&9u32.to_le_bytes());
        test_invalid_data_rejected::<DataHeader>(&bytes);
        test_invalid_data_rejected::<SqPackHeader>(&[0u8; 16]);
    }
}
