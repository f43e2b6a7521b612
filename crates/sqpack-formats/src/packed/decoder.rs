//! Random-access decoding of packed entries
//!
//! A [`PackedDecoder`] turns the locator tables of a packed entry into a
//! [`BlockTable`]: spans of the unpacked file, each backed by a compressed
//! block, verbatim bytes in the entry, or bytes synthesized by the decoder.
//! Reads only inflate the blocks (and the block prefixes) they touch.

use super::block::{
    BLOCK_HEADER_SIZE, BlockHeader, decode_block, decode_block_into, verify_block_padding,
    worst_case_block_size,
};
use super::model::{
    FILE_ORDER, MODEL_BLOCK_LOCATOR_SIZE, MODEL_HEADER_SIZE, ModelBlockLocator, ModelHeader,
};
use super::texture::{
    TEXTURE_BLOCK_LOCATOR_SIZE, TEXTURE_HEADER_SIZE, TextureBlockLocator, locator_positions,
};
use super::{
    BINARY_BLOCK_LOCATOR_SIZE, BinaryBlockLocator, PACKED_FILE_HEADER_SIZE, PackedFileHeader,
    PackedType,
};
use crate::align::{BLOCK_PAYLOAD_SIZE, block_count, chunks};
use crate::error::{FormatError, FormatResult};
use crate::stream::{RandomAccessStream, SharedStream};
use bytes::Bytes;
use tracing::trace;

/// Where the bytes of a span come from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpanSource {
    /// A compressed block at this offset of the packed entry
    Block {
        /// Offset of the block header in the packed entry
        packed_offset: u64,
        /// Expected slot size; values below 16 mean unknown
        size_hint: u32,
    },
    /// Bytes copied verbatim from this offset of the packed entry
    Stored {
        /// Offset of the first byte in the packed entry
        packed_offset: u64,
    },
    /// Bytes produced by the decoder
    Inline(Bytes),
}

/// A logical range of the unpacked file and its backing bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Span {
    /// Offset in the unpacked file
    pub logical_offset: u64,
    /// Number of unpacked bytes
    pub logical_size: u64,
    /// Backing bytes
    pub source: SpanSource,
}

impl Span {
    /// Offset one past the last byte
    pub const fn logical_end(&self) -> u64 {
        self.logical_offset + self.logical_size
    }
}

/// Spans of an entry sorted by logical offset
///
/// Spans may overlap and leave gaps; gaps read as zeros and later spans win
/// where two overlap.
#[derive(Debug, Clone, Default)]
pub struct BlockTable {
    spans: Vec<Span>,
    // Running maximum of span ends, for binary search
    max_ends: Vec<u64>,
}

impl BlockTable {
    /// Build a table, sorting spans by logical offset
    pub fn new(mut spans: Vec<Span>) -> Self {
        spans.retain(|s| s.logical_size > 0);
        spans.sort_by_key(|s| s.logical_offset);
        let mut running = 0;
        let max_ends = spans
            .iter()
            .map(|s| {
                running = running.max(s.logical_end());
                running
            })
            .collect();
        Self { spans, max_ends }
    }

    /// All spans in logical order
    pub fn spans(&self) -> &[Span] {
        &self.spans
    }

    /// Copy `[offset, offset + out.len())` into `out`
    ///
    /// Bytes without a backing span, or whose source has been cut short, are
    /// left untouched.
    pub fn read(
        &self,
        packed: &dyn RandomAccessStream,
        offset: u64,
        out: &mut [u8],
    ) -> FormatResult<()> {
        let end = offset + out.len() as u64;
        let first = self.max_ends.partition_point(|&e| e <= offset);

        for span in &self.spans[first..] {
            if span.logical_offset >= end {
                break;
            }
            if span.logical_end() <= offset {
                continue;
            }
            let from = span.logical_offset.max(offset);
            let to = span.logical_end().min(end);
            let skip = from - span.logical_offset;
            let target = &mut out[(from - offset) as usize..(to - offset) as usize];

            match &span.source {
                SpanSource::Block {
                    packed_offset,
                    size_hint,
                } => {
                    read_block(packed, *packed_offset, *size_hint, skip as usize, target)?;
                }
                SpanSource::Stored { packed_offset } => {
                    let bytes = packed.read_up_to(packed_offset + skip, target.len())?;
                    target[..bytes.len()].copy_from_slice(&bytes);
                }
                SpanSource::Inline(bytes) => {
                    let start = (skip as usize).min(bytes.len());
                    let n = target.len().min(bytes.len() - start);
                    target[..n].copy_from_slice(&bytes[start..start + n]);
                }
            }
        }
        Ok(())
    }
}

/// Decode part of the block at `packed_offset`
///
/// The block is probed with its expected slot size and re-read when its
/// header claims more. A block cut off by the end of the entry yields
/// whatever could be recovered.
fn read_block(
    packed: &dyn RandomAccessStream,
    packed_offset: u64,
    size_hint: u32,
    skip: usize,
    out: &mut [u8],
) -> FormatResult<usize> {
    let probe = if size_hint < BLOCK_HEADER_SIZE {
        worst_case_block_size(BLOCK_PAYLOAD_SIZE) as usize
    } else {
        size_hint as usize
    };
    let mut buf = packed.read_up_to(packed_offset, probe)?;
    if buf.len() < BLOCK_HEADER_SIZE as usize {
        return Ok(0);
    }

    let header = BlockHeader::parse(&buf)?;
    let needed = header.used_size() as usize;
    if needed > buf.len() && buf.len() == probe {
        trace!(
            "Block at {packed_offset:#x} needs {needed} bytes, probed {probe}; re-reading"
        );
        buf = packed.read_up_to(packed_offset, needed)?;
    }
    decode_block_into(&buf, skip, out)
}

/// Read a table region that must lie inside the entry header
fn read_table(
    packed: &dyn RandomAccessStream,
    header: &PackedFileHeader,
    offset: u64,
    len: u64,
    what: &str,
) -> FormatResult<Vec<u8>> {
    if offset + len > u64::from(header.header_size) {
        return Err(FormatError::corrupt(format!(
            "{what} ends at {:#x}, past the {}-byte entry header",
            offset + len,
            header.header_size
        )));
    }
    let bytes = packed.read_up_to(offset, len as usize)?;
    if bytes.len() as u64 != len {
        return Err(FormatError::corrupt(format!(
            "{what} truncated: {} of {len} bytes",
            bytes.len()
        )));
    }
    Ok(bytes)
}

fn parse_slots(bytes: &[u8]) -> Vec<u16> {
    bytes
        .chunks_exact(2)
        .map(|b| u16::from_le_bytes([b[0], b[1]]))
        .collect()
}

/// Block spans of one section chunked at the default payload size
fn section_spans(
    spans: &mut Vec<Span>,
    logical_offset: u64,
    size: u64,
    packed_offset: u64,
    slots: &[u16],
    what: &str,
) -> FormatResult<()> {
    let count = block_count(size) as usize;
    if slots.len() != count {
        return Err(FormatError::corrupt(format!(
            "{what}: {} blocks listed for {size} bytes, expected {count}",
            slots.len()
        )));
    }
    let mut packed = packed_offset;
    for (chunk, &slot) in chunks(size, BLOCK_PAYLOAD_SIZE).zip(slots) {
        spans.push(Span {
            logical_offset: logical_offset + chunk.offset,
            logical_size: chunk.size,
            source: SpanSource::Block {
                packed_offset: packed,
                size_hint: u32::from(slot),
            },
        });
        packed += u64::from(slot);
    }
    Ok(())
}

fn slot_run<'a>(
    slots: &'a [u16],
    first: usize,
    count: usize,
    what: &str,
) -> FormatResult<&'a [u16]> {
    slots.get(first..first + count).ok_or_else(|| {
        FormatError::corrupt(format!(
            "{what}: blocks {first}..{} outside the {}-entry slot table",
            first + count,
            slots.len()
        ))
    })
}

/// Decoder for one packed entry
#[derive(Debug, Clone)]
pub enum PackedDecoder {
    /// Placeholder entry; reads return zeros
    Empty {
        /// Entry header
        header: PackedFileHeader,
    },
    /// Flat run of blocks
    Binary {
        /// Entry header
        header: PackedFileHeader,
        /// Block spans
        table: BlockTable,
    },
    /// Model sections behind a synthesized native header
    Model {
        /// Entry header
        header: PackedFileHeader,
        /// Section table
        locator: Box<ModelBlockLocator>,
        /// Synthesized header and section spans
        table: BlockTable,
    },
    /// Verbatim texture header then mip runs
    Texture {
        /// Entry header
        header: PackedFileHeader,
        /// Mip run table
        locators: Vec<TextureBlockLocator>,
        /// Header and mip spans
        table: BlockTable,
    },
}

impl PackedDecoder {
    /// Parse the header and tables of a packed entry
    pub fn new(packed: &dyn RandomAccessStream) -> FormatResult<Self> {
        let head = packed.read_up_to(0, PACKED_FILE_HEADER_SIZE as usize)?;
        let header = PackedFileHeader::parse(&head)?;
        let base = u64::from(header.header_size);
        let table_start = u64::from(PACKED_FILE_HEADER_SIZE);

        match header.entry_type {
            PackedType::Empty => Ok(Self::Empty { header }),
            PackedType::Binary => {
                let count = u64::from(header.block_count_or_version);
                let bytes = read_table(
                    packed,
                    &header,
                    table_start,
                    count * u64::from(BINARY_BLOCK_LOCATOR_SIZE),
                    "binary block table",
                )?;
                let mut spans = Vec::with_capacity(count as usize);
                let mut logical = 0u64;
                for record in bytes.chunks_exact(BINARY_BLOCK_LOCATOR_SIZE as usize) {
                    let locator: BinaryBlockLocator = crate::read_le(record)?;
                    spans.push(Span {
                        logical_offset: logical,
                        logical_size: u64::from(locator.decompressed_size),
                        source: SpanSource::Block {
                            packed_offset: base + u64::from(locator.offset),
                            size_hint: u32::from(locator.block_size),
                        },
                    });
                    logical += u64::from(locator.decompressed_size);
                }
                Ok(Self::Binary {
                    header,
                    table: BlockTable::new(spans),
                })
            }
            PackedType::Model => {
                let bytes = read_table(
                    packed,
                    &header,
                    table_start,
                    u64::from(MODEL_BLOCK_LOCATOR_SIZE),
                    "model block locator",
                )?;
                let locator: ModelBlockLocator = crate::read_le(&bytes)?;
                if locator.decompressed_size() != u64::from(header.decompressed_size) {
                    return Err(FormatError::corrupt(format!(
                        "model sections add up to {} bytes, header declares {}",
                        locator.decompressed_size(),
                        header.decompressed_size
                    )));
                }
                let slots = parse_slots(&read_table(
                    packed,
                    &header,
                    table_start + u64::from(MODEL_BLOCK_LOCATOR_SIZE),
                    locator.total_blocks() as u64 * 2,
                    "model block sizes",
                )?);

                let native = ModelHeader::contiguous(&locator, header.block_count_or_version);
                let mut spans = vec![Span {
                    logical_offset: 0,
                    logical_size: MODEL_HEADER_SIZE,
                    source: SpanSource::Inline(Bytes::from(crate::write_le(&native)?)),
                }];
                let mut logical = MODEL_HEADER_SIZE;
                for slot in FILE_ORDER {
                    let size = u64::from(locator.decompressed_sizes[slot]);
                    let what = format!("model section {slot}");
                    let run = slot_run(
                        &slots,
                        usize::from(locator.first_block_indices[slot]),
                        usize::from(locator.block_counts[slot]),
                        &what,
                    )?;
                    section_spans(
                        &mut spans,
                        logical,
                        size,
                        base + u64::from(locator.first_block_offsets[slot]),
                        run,
                        &what,
                    )?;
                    logical += size;
                }
                Ok(Self::Model {
                    header,
                    locator: Box::new(locator),
                    table: BlockTable::new(spans),
                })
            }
            PackedType::Texture => {
                let count = u64::from(header.block_count_or_version);
                let bytes = read_table(
                    packed,
                    &header,
                    table_start,
                    count * u64::from(TEXTURE_BLOCK_LOCATOR_SIZE),
                    "texture block table",
                )?;
                let locators = bytes
                    .chunks_exact(TEXTURE_BLOCK_LOCATOR_SIZE as usize)
                    .map(crate::read_le::<TextureBlockLocator>)
                    .collect::<FormatResult<Vec<_>>>()?;
                let total_blocks: u64 = locators.iter().map(|l| u64::from(l.sub_block_count)).sum();
                let slots = parse_slots(&read_table(
                    packed,
                    &header,
                    table_start + bytes.len() as u64,
                    total_blocks * 2,
                    "texture block sizes",
                )?);

                let decompressed = u64::from(header.decompressed_size);
                let raw_len = locators
                    .first()
                    .map_or(0, |l| u64::from(l.first_block_offset));
                if raw_len > decompressed {
                    return Err(FormatError::corrupt(format!(
                        "texture header copy of {raw_len} bytes exceeds the {decompressed}-byte file"
                    )));
                }
                let prefix = packed.read_up_to(base, raw_len.min(TEXTURE_HEADER_SIZE) as usize)?;
                let positions = locator_positions(&prefix, raw_len, &locators, decompressed);

                let mut spans = vec![Span {
                    logical_offset: 0,
                    logical_size: raw_len,
                    source: SpanSource::Stored {
                        packed_offset: base,
                    },
                }];
                for (k, (locator, position)) in locators.iter().zip(positions).enumerate() {
                    let what = format!("texture run {k}");
                    let run = slot_run(
                        &slots,
                        locator.first_sub_block_index as usize,
                        locator.sub_block_count as usize,
                        &what,
                    )?;
                    section_spans(
                        &mut spans,
                        position,
                        u64::from(locator.decompressed_size),
                        base + u64::from(locator.first_block_offset),
                        run,
                        &what,
                    )?;
                }
                Ok(Self::Texture {
                    header,
                    locators,
                    table: BlockTable::new(spans),
                })
            }
        }
    }

    /// Entry header
    pub const fn header(&self) -> &PackedFileHeader {
        match self {
            Self::Empty { header }
            | Self::Binary { header, .. }
            | Self::Model { header, .. }
            | Self::Texture { header, .. } => header,
        }
    }

    /// Entry layout
    pub const fn entry_type(&self) -> PackedType {
        self.header().entry_type
    }

    /// Size of the unpacked file
    pub const fn size(&self) -> u64 {
        self.header().decompressed_size as u64
    }

    /// Span table, absent for empty entries
    pub const fn table(&self) -> Option<&BlockTable> {
        match self {
            Self::Empty { .. } => None,
            Self::Binary { table, .. }
            | Self::Model { table, .. }
            | Self::Texture { table, .. } => Some(table),
        }
    }

    /// Read unpacked bytes starting at `offset`
    ///
    /// Reads are clamped to the unpacked size. Returns the number of bytes
    /// produced; bytes the packed entry cannot supply read as zeros.
    pub fn read(
        &self,
        packed: &dyn RandomAccessStream,
        offset: u64,
        out: &mut [u8],
    ) -> FormatResult<usize> {
        let size = self.size();
        if offset >= size {
            return Ok(0);
        }
        let n = out.len().min((size - offset) as usize);
        let out = &mut out[..n];
        out.fill(0);
        if let Some(table) = self.table() {
            table.read(packed, offset, out)?;
        }
        Ok(n)
    }

    /// Walk every block and check the entry is well formed
    ///
    /// Every block must have the standard header, inflate to exactly its
    /// span and carry zero padding. The spans must cover the unpacked size
    /// and the entry must fit both its declared occupied size and `packed`.
    pub fn verify(&self, packed: &dyn RandomAccessStream) -> FormatResult<()> {
        let header = self.header();
        let occupied = header.occupied_size();
        if occupied > packed.size() {
            return Err(FormatError::corrupt(format!(
                "entry occupies {occupied} bytes, only {} available",
                packed.size()
            )));
        }
        let Some(table) = self.table() else {
            return Ok(());
        };

        let mut data_end = u64::from(header.header_size);
        let mut covered = 0u64;
        for span in table.spans() {
            covered = covered.max(span.logical_end());
            match &span.source {
                SpanSource::Block {
                    packed_offset,
                    size_hint,
                } => {
                    let slot = packed.read_vec(*packed_offset, *size_hint as usize).map_err(|e| {
                        FormatError::corrupt(format!("block at {packed_offset:#x} unreadable: {e}"))
                    })?;
                    let block = BlockHeader::parse(&slot)?;
                    if block.header_size != BLOCK_HEADER_SIZE || block.version != 0 {
                        return Err(FormatError::corrupt(format!(
                            "block at {packed_offset:#x} has header size {} and version {}",
                            block.header_size, block.version
                        )));
                    }
                    let decoded = decode_block(&slot)?;
                    if decoded.len() as u64 != span.logical_size {
                        return Err(FormatError::corrupt(format!(
                            "block at {packed_offset:#x} inflates to {} bytes, expected {}",
                            decoded.len(),
                            span.logical_size
                        )));
                    }
                    verify_block_padding(&slot)?;
                    data_end = data_end.max(packed_offset + u64::from(*size_hint));
                }
                SpanSource::Stored { packed_offset } => {
                    data_end = data_end.max(packed_offset + span.logical_size);
                }
                SpanSource::Inline(_) => {}
            }
        }

        // Texture runs may stop short of the file end; trimmed zeros fill the rest
        let exact = !matches!(self, Self::Texture { .. });
        if covered > self.size() || (exact && covered != self.size()) {
            return Err(FormatError::corrupt(format!(
                "blocks cover {covered} bytes of a {}-byte file",
                self.size()
            )));
        }
        if data_end > occupied {
            return Err(FormatError::corrupt(format!(
                "entry data ends at {data_end:#x}, past its {occupied}-byte allocation"
            )));
        }
        Ok(())
    }
}

/// Unpacked view over a packed entry stream
pub struct UnpackingStream {
    packed: SharedStream,
    decoder: PackedDecoder,
}

impl UnpackingStream {
    /// Parse the entry tables of `packed`
    pub fn new(packed: SharedStream) -> FormatResult<Self> {
        let decoder = PackedDecoder::new(&*packed)?;
        Ok(Self { packed, decoder })
    }

    /// Entry decoder
    pub const fn decoder(&self) -> &PackedDecoder {
        &self.decoder
    }

    /// Entry layout
    pub const fn entry_type(&self) -> PackedType {
        self.decoder.entry_type()
    }

    /// Underlying packed stream
    pub fn packed(&self) -> &SharedStream {
        &self.packed
    }

    /// Fill all of `buf`, zero-filling past the end of the file
    pub fn read_zero_padded(&self, offset: u64, buf: &mut [u8]) -> FormatResult<()> {
        buf.fill(0);
        self.decoder.read(&*self.packed, offset, buf)?;
        Ok(())
    }

    /// Strictly check every block of the entry
    pub fn verify(&self) -> FormatResult<()> {
        self.decoder.verify(&*self.packed)
    }
}

impl std::fmt::Debug for UnpackingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UnpackingStream")
            .field("packed_size", &self.packed.size())
            .field("decoder", &self.decoder)
            .finish()
    }
}

impl RandomAccessStream for UnpackingStream {
    fn size(&self) -> u64 {
        self.decoder.size()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> FormatResult<usize> {
        self.decoder.read(&*self.packed, offset, buf)
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::packed::block::encode_block;
    use crate::stream::MemoryStream;
    use pretty_assertions::assert_eq;

    fn block_span(offset: u64, size: u64, packed_offset: u64, hint: u32) -> Span {
        Span {
            logical_offset: offset,
            logical_size: size,
            source: SpanSource::Block {
                packed_offset,
                size_hint: hint,
            },
        }
    }

    #[test]
    fn test_table_sorts_and_tracks_max_end() {
        let table = BlockTable::new(vec![
            block_span(100, 10, 0, 0),
            block_span(0, 200, 0, 0),
            block_span(50, 0, 0, 0),
        ]);
        assert_eq!(table.spans().len(), 2);
        assert_eq!(table.spans()[0].logical_offset, 0);
        assert_eq!(table.max_ends, vec![200, 200]);
    }

    #[test]
    fn test_overlapping_spans_and_gaps() {
        let table = BlockTable::new(vec![
            Span {
                logical_offset: 0,
                logical_size: 4,
                source: SpanSource::Inline(Bytes::from_static(b"abcd")),
            },
            Span {
                logical_offset: 2,
                logical_size: 2,
                source: SpanSource::Inline(Bytes::from_static(b"XY")),
            },
            Span {
                logical_offset: 6,
                logical_size: 2,
                source: SpanSource::Inline(Bytes::from_static(b"zz")),
            },
        ]);
        let packed = MemoryStream::new(Vec::new());
        let mut out = [0u8; 8];
        table.read(&packed, 0, &mut out).unwrap();
        assert_eq!(&out, b"abXY\0\0zz");

        let mut out = [0u8; 3];
        table.read(&packed, 5, &mut out).unwrap();
        assert_eq!(&out, b"\0zz");
    }

    #[test]
    fn test_block_with_unknown_size_hint() {
        let data: Vec<u8> = (0..5000u32).map(|i| (i % 13) as u8).collect();
        let mut packed = vec![0u8; 128];
        packed.extend(encode_block(&data, 6).unwrap());
        let stream = MemoryStream::new(packed);

        let mut out = vec![0u8; 100];
        let n = read_block(&stream, 128, 0, 4000, &mut out).unwrap();
        assert_eq!(n, 100);
        assert_eq!(out, &data[4000..4100]);
    }

    #[test]
    fn test_small_hint_triggers_reread() {
        let data: Vec<u8> = (0..3000u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 7) as u8)
            .collect();
        let block = encode_block(&data, 6).unwrap();
        assert!(block.len() > 256);
        let stream = MemoryStream::new(block);

        let mut out = vec![0u8; 3000];
        let n = read_block(&stream, 0, 128, 0, &mut out).unwrap();
        assert_eq!(n, 3000);
        assert_eq!(out, data);
    }

    #[test]
    fn test_exhausted_source_reads_zero() {
        let stream = MemoryStream::new(vec![0u8; 8]);
        let mut out = [7u8; 4];
        assert_eq!(read_block(&stream, 0, 128, 0, &mut out).unwrap(), 0);
    }

    #[test]
    fn test_empty_entry_reads_zeros() {
        let mut header = crate::write_le(&PackedFileHeader::empty()).unwrap();
        header[8..12].copy_from_slice(&10u32.to_le_bytes());
        header.resize(128, 0);
        let packed: SharedStream = MemoryStream::shared(header);
        let stream = UnpackingStream::new(packed).unwrap();
        assert_eq!(stream.entry_type(), PackedType::Empty);
        assert_eq!(stream.size(), 10);
        assert_eq!(stream.read_all().unwrap(), vec![0u8; 10]);
        stream.verify().unwrap();
    }

    #[test]
    fn test_table_past_header_is_corrupt() {
        let header = PackedFileHeader {
            header_size: 128,
            entry_type: PackedType::Binary,
            decompressed_size: 100,
            block_buffer_size: 128,
            occupied_space_unit_count: 2,
            block_count_or_version: 50,
        };
        let mut bytes = crate::write_le(&header).unwrap();
        bytes.resize(256, 0);
        let err = PackedDecoder::new(&MemoryStream::new(bytes)).unwrap_err();
        assert!(err.is_corruption());
    }
}
