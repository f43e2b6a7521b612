//! Packed entry encoders
//!
//! Encoding starts from a [`SourceLayout`], which splits a raw file into
//! sections. Each section is cut into 16,000-byte chunks and every chunk
//! becomes one block. The entry header, its locator tables and the block
//! slot sizes are all derived from that layout:
//!
//! - [`EagerPackedStream`] compresses every block up front, producing the
//!   tightest entry.
//! - [`LazyPackedStream`] reserves the worst-case slot for every block so
//!   its size is known immediately, and only compresses blocks that are
//!   actually read.

use super::block::{encode_block, worst_case_block_size};
use super::model::{
    FILE_ORDER, MODEL_BLOCK_LOCATOR_SIZE, MODEL_HEADER_SIZE, ModelBlockLocator, ModelHeader,
    SECTION_COUNT,
};
use super::texture::{TEXTURE_BLOCK_LOCATOR_SIZE, TextureBlockLocator, plan_texture};
use super::{
    BINARY_BLOCK_LOCATOR_SIZE, BinaryBlockLocator, PACKED_FILE_HEADER_SIZE, PackedFileHeader,
    PackedType, Section,
};
use crate::align::{ALIGNMENT, BLOCK_PAYLOAD_SIZE, Chunk, align_to_unit, chunks};
use crate::error::{FormatError, FormatResult};
use crate::stream::{RandomAccessStream, SharedStream, ViewStream, read_from_slice};
use bytes::Bytes;
use std::path::Path;
use std::sync::OnceLock;
use tracing::debug;

/// Which packed layout to encode a raw file as
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum EncodeKind {
    /// Flat blocks
    #[default]
    Binary,
    /// Model sections
    Model,
    /// Texture header plus mip runs
    Texture,
}

impl EncodeKind {
    /// Pick the layout from a file extension
    ///
    /// ```
    /// use sqpack_formats::packed::EncodeKind;
    ///
    /// assert_eq!(EncodeKind::from_path("chara/body.mdl"), EncodeKind::Model);
    /// assert_eq!(EncodeKind::from_path("ui/icon.ATEX"), EncodeKind::Texture);
    /// assert_eq!(EncodeKind::from_path("exd/root.exl"), EncodeKind::Binary);
    /// ```
    pub fn from_path(path: impl AsRef<Path>) -> Self {
        let extension = path
            .as_ref()
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match extension.as_deref() {
            Some("mdl") => Self::Model,
            Some("tex" | "atex") => Self::Texture,
            _ => Self::Binary,
        }
    }
}

/// How a raw file maps onto a packed entry
#[derive(Debug, Clone)]
pub struct SourceLayout {
    /// Entry layout to produce
    pub entry_type: PackedType,
    /// Sections in table order
    pub sections: Vec<Section>,
    /// Size of the unpacked file
    pub decompressed_size: u64,
    /// Verbatim bytes stored before the blocks (texture header)
    pub raw_header: Vec<u8>,
    /// Native header of a model source
    pub model_header: Option<ModelHeader>,
}

impl SourceLayout {
    /// Split `source` into sections for `kind`
    pub fn plan(kind: EncodeKind, source: &dyn RandomAccessStream) -> FormatResult<Self> {
        let size = source.size();
        if size > u64::from(u32::MAX) {
            return Err(FormatError::InvalidArgument(format!(
                "source of {size} bytes is too large for a packed entry"
            )));
        }

        let layout = match kind {
            EncodeKind::Binary if size == 0 => Self {
                entry_type: PackedType::Empty,
                sections: Vec::new(),
                decompressed_size: 0,
                raw_header: Vec::new(),
                model_header: None,
            },
            EncodeKind::Binary => Self {
                entry_type: PackedType::Binary,
                sections: vec![Section::new(0, size)],
                decompressed_size: size,
                raw_header: Vec::new(),
                model_header: None,
            },
            EncodeKind::Model => {
                if size < MODEL_HEADER_SIZE {
                    return Err(FormatError::corrupt(format!(
                        "model source of {size} bytes is smaller than its header"
                    )));
                }
                let header: ModelHeader =
                    crate::read_le(&source.read_vec(0, MODEL_HEADER_SIZE as usize)?)?;
                let regions = header.sections(size)?;
                let sections: Vec<Section> = FILE_ORDER.iter().map(|&slot| regions[slot]).collect();
                let decompressed_size =
                    MODEL_HEADER_SIZE + sections.iter().map(|s| s.size).sum::<u64>();
                Self {
                    entry_type: PackedType::Model,
                    sections,
                    decompressed_size,
                    raw_header: Vec::new(),
                    model_header: Some(header),
                }
            }
            EncodeKind::Texture => {
                let plan = plan_texture(source)?;
                if plan.decompressed_size > u64::from(u32::MAX) {
                    return Err(FormatError::InvalidArgument(format!(
                        "texture layout of {} bytes is too large for a packed entry",
                        plan.decompressed_size
                    )));
                }
                Self {
                    entry_type: PackedType::Texture,
                    sections: plan.sections,
                    decompressed_size: plan.decompressed_size,
                    raw_header: plan.raw_header,
                    model_header: None,
                }
            }
        };
        Ok(layout)
    }

    /// Number of blocks the layout encodes to
    pub fn block_count(&self) -> usize {
        self.sections
            .iter()
            .map(|s| chunks(s.size, BLOCK_PAYLOAD_SIZE).len())
            .sum()
    }

    /// Source bytes of one chunk, zero-filled past the available data
    fn chunk_data(
        &self,
        source: &dyn RandomAccessStream,
        section: &Section,
        chunk: Chunk,
    ) -> FormatResult<Vec<u8>> {
        let present = section.available.saturating_sub(chunk.offset).min(chunk.size);
        let mut data = source.read_up_to(section.source_offset + chunk.offset, present as usize)?;
        data.resize(chunk.size as usize, 0);
        Ok(data)
    }

    /// Size of the locator tables, before alignment
    fn table_size(&self, blocks: u64) -> u64 {
        match self.entry_type {
            PackedType::Empty => 0,
            PackedType::Binary => blocks * u64::from(BINARY_BLOCK_LOCATOR_SIZE),
            PackedType::Model => u64::from(MODEL_BLOCK_LOCATOR_SIZE) + blocks * 2,
            PackedType::Texture => {
                self.sections.len() as u64 * u64::from(TEXTURE_BLOCK_LOCATOR_SIZE) + blocks * 2
            }
        }
    }
}

/// Slot size of every block, per section
type SlotTable = Vec<Vec<u64>>;

fn worst_case_slots(layout: &SourceLayout) -> SlotTable {
    layout
        .sections
        .iter()
        .map(|s| {
            chunks(s.size, BLOCK_PAYLOAD_SIZE)
                .map(|c| worst_case_block_size(c.size))
                .collect()
        })
        .collect()
}

fn does_not_fit(value: u64, what: &str) -> FormatError {
    FormatError::InvalidArgument(format!("{what} of {value} does not fit a packed entry"))
}

fn to_u32(value: u64, what: &str) -> FormatResult<u32> {
    u32::try_from(value).map_err(|_| does_not_fit(value, what))
}

fn to_u16(value: u64, what: &str) -> FormatResult<u16> {
    u16::try_from(value).map_err(|_| does_not_fit(value, what))
}

/// Entry header implied by a layout and its block slots
fn packed_header(layout: &SourceLayout, slots: &SlotTable) -> FormatResult<PackedFileHeader> {
    if layout.entry_type == PackedType::Empty {
        return Ok(PackedFileHeader::empty());
    }

    let blocks: u64 = slots.iter().map(|s| s.len() as u64).sum();
    let tables = u64::from(PACKED_FILE_HEADER_SIZE) + layout.table_size(blocks);
    let header_size = align_to_unit(tables).allocated_size;
    let data_size = layout.raw_header.len() as u64 + slots.iter().flatten().sum::<u64>();
    let occupied = align_to_unit(header_size + data_size).count;
    let largest = slots.iter().flatten().copied().max().unwrap_or(0);

    let block_count_or_version = match layout.entry_type {
        PackedType::Model => layout.model_header.map_or(0, |h| h.version),
        PackedType::Texture => to_u32(layout.sections.len() as u64, "texture run count")?,
        _ => to_u32(blocks, "block count")?,
    };

    Ok(PackedFileHeader {
        header_size: to_u32(header_size, "header size")?,
        entry_type: layout.entry_type,
        decompressed_size: to_u32(layout.decompressed_size, "decompressed size")?,
        block_buffer_size: to_u32(largest, "block size")?,
        occupied_space_unit_count: to_u32(occupied, "occupied size")?,
        block_count_or_version,
    })
}

/// Serialized header and locator tables, padded to `header_size`
fn header_bytes(
    layout: &SourceLayout,
    slots: &SlotTable,
    header: &PackedFileHeader,
) -> FormatResult<Vec<u8>> {
    let mut out = crate::write_le(header)?;
    let raw_len = layout.raw_header.len() as u64;

    match layout.entry_type {
        PackedType::Empty => {}
        PackedType::Binary => {
            let mut offset = 0u64;
            for (section, section_slots) in layout.sections.iter().zip(slots) {
                for (chunk, &slot) in chunks(section.size, BLOCK_PAYLOAD_SIZE).zip(section_slots) {
                    let locator = BinaryBlockLocator {
                        offset: to_u32(offset, "block offset")?,
                        block_size: to_u16(slot, "block size")?,
                        decompressed_size: to_u16(chunk.size, "block length")?,
                    };
                    out.extend(crate::write_le(&locator)?);
                    offset += slot;
                }
            }
        }
        PackedType::Model => {
            let native = layout.model_header.unwrap_or_default();
            let mut locator = ModelBlockLocator {
                vertex_declaration_count: native.vertex_declaration_count,
                material_count: native.material_count,
                lod_count: native.lod_count,
                index_streaming: native.index_streaming,
                edge_geometry: native.edge_geometry,
                ..ModelBlockLocator::default()
            };
            let mut offset = 0u64;
            let mut index = 0u64;
            let sections = layout.sections.iter().zip(slots).take(SECTION_COUNT);
            for (position, (section, section_slots)) in sections.enumerate() {
                let slot = FILE_ORDER[position];
                let total: u64 = section_slots.iter().sum();
                locator.decompressed_sizes[slot] = to_u32(section.size, "model section size")?;
                locator.chunk_sizes[slot] = to_u32(total, "model section slots")?;
                locator.first_block_offsets[slot] = to_u32(offset, "model section offset")?;
                locator.first_block_indices[slot] = to_u16(index, "model block index")?;
                locator.block_counts[slot] =
                    to_u16(section_slots.len() as u64, "model block count")?;
                offset += total;
                index += section_slots.len() as u64;
            }
            out.extend(crate::write_le(&locator)?);
            for &slot in slots.iter().flatten() {
                out.extend(to_u16(slot, "block size")?.to_le_bytes());
            }
        }
        PackedType::Texture => {
            let mut offset = raw_len;
            let mut index = 0u64;
            for (section, section_slots) in layout.sections.iter().zip(slots) {
                let total: u64 = section_slots.iter().sum();
                let locator = TextureBlockLocator {
                    first_block_offset: to_u32(offset, "texture run offset")?,
                    total_size: to_u32(total, "texture run slots")?,
                    decompressed_size: to_u32(section.size, "texture run size")?,
                    first_sub_block_index: to_u32(index, "texture block index")?,
                    sub_block_count: to_u32(section_slots.len() as u64, "texture block count")?,
                };
                out.extend(crate::write_le(&locator)?);
                offset += total;
                index += section_slots.len() as u64;
            }
            for &slot in slots.iter().flatten() {
                out.extend(to_u16(slot, "block size")?.to_le_bytes());
            }
        }
    }

    out.resize(header.header_size as usize, 0);
    Ok(out)
}

/// Packed entry compressed in full at construction
#[derive(Debug, Clone)]
pub struct EagerPackedStream {
    data: Bytes,
    header: PackedFileHeader,
}

impl EagerPackedStream {
    /// Compress `source` according to `layout`
    pub fn new(
        source: &dyn RandomAccessStream,
        layout: &SourceLayout,
        level: u32,
    ) -> FormatResult<Self> {
        let mut blocks = Vec::with_capacity(layout.block_count());
        let mut slots: SlotTable = Vec::with_capacity(layout.sections.len());
        for section in &layout.sections {
            let mut section_slots = Vec::new();
            for chunk in chunks(section.size, BLOCK_PAYLOAD_SIZE) {
                let block = encode_block(&layout.chunk_data(source, section, chunk)?, level)?;
                section_slots.push(block.len() as u64);
                blocks.push(block);
            }
            slots.push(section_slots);
        }

        let header = packed_header(layout, &slots)?;
        let mut data = header_bytes(layout, &slots, &header)?;
        data.extend_from_slice(&layout.raw_header);
        for block in blocks {
            data.extend(block);
        }
        data.resize(header.occupied_size() as usize, 0);

        debug!(
            "Encoded {} bytes as {:?} entry of {} bytes",
            layout.decompressed_size,
            layout.entry_type,
            data.len()
        );
        Ok(Self {
            data: Bytes::from(data),
            header,
        })
    }

    /// Entry header
    pub const fn header(&self) -> &PackedFileHeader {
        &self.header
    }

    /// Encoded entry bytes
    pub const fn bytes(&self) -> &Bytes {
        &self.data
    }
}

impl RandomAccessStream for EagerPackedStream {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> FormatResult<usize> {
        Ok(read_from_slice(&self.data, offset, buf))
    }
}

/// What fills one region of a lazily encoded entry
#[derive(Debug, Clone, Copy)]
enum PieceKind {
    RawHeader,
    Block { section: usize, chunk: Chunk },
}

#[derive(Debug, Clone, Copy)]
struct Piece {
    offset: u64,
    size: u64,
    kind: PieceKind,
}

#[derive(Debug)]
struct LazyTables {
    header: Bytes,
    pieces: Vec<Piece>,
}

/// Packed entry whose blocks are compressed on first read
///
/// Every block sits in a worst-case slot, so the entry is slightly larger
/// than an eager encoding but its size and tables never depend on the
/// compressed output.
pub struct LazyPackedStream {
    source: SharedStream,
    layout: SourceLayout,
    level: u32,
    header: PackedFileHeader,
    slots: SlotTable,
    tables: OnceLock<Result<LazyTables, FormatError>>,
}

impl LazyPackedStream {
    /// Plan an entry over `source` without compressing anything
    pub fn new(source: SharedStream, layout: SourceLayout, level: u32) -> FormatResult<Self> {
        let slots = worst_case_slots(&layout);
        let header = packed_header(&layout, &slots)?;
        Ok(Self {
            source,
            layout,
            level,
            header,
            slots,
            tables: OnceLock::new(),
        })
    }

    /// Entry header
    pub const fn header(&self) -> &PackedFileHeader {
        &self.header
    }

    fn tables(&self) -> FormatResult<&LazyTables> {
        self.tables
            .get_or_init(|| self.build_tables())
            .as_ref()
            .map_err(FormatError::replay)
    }

    fn build_tables(&self) -> FormatResult<LazyTables> {
        let header = Bytes::from(header_bytes(&self.layout, &self.slots, &self.header)?);
        let mut offset = u64::from(self.header.header_size);
        let mut pieces = Vec::with_capacity(self.layout.block_count() + 1);
        if !self.layout.raw_header.is_empty() {
            pieces.push(Piece {
                offset,
                size: self.layout.raw_header.len() as u64,
                kind: PieceKind::RawHeader,
            });
            offset += self.layout.raw_header.len() as u64;
        }
        let sections = self.layout.sections.iter().zip(&self.slots);
        for (index, (section, section_slots)) in sections.enumerate() {
            for (chunk, &slot) in chunks(section.size, BLOCK_PAYLOAD_SIZE).zip(section_slots) {
                pieces.push(Piece {
                    offset,
                    size: slot,
                    kind: PieceKind::Block {
                        section: index,
                        chunk,
                    },
                });
                offset += slot;
            }
        }
        debug!(
            "Planned lazy {:?} entry: {} pieces, {} bytes",
            self.layout.entry_type,
            pieces.len(),
            self.header.occupied_size()
        );
        Ok(LazyTables { header, pieces })
    }

    /// Compressed bytes of one block
    ///
    /// Nothing is kept between reads; the decoder fetches a whole slot per
    /// call, so each block read compresses its chunk once.
    fn block(&self, section: usize, chunk: Chunk) -> FormatResult<Vec<u8>> {
        let section = &self.layout.sections[section];
        let data = self.layout.chunk_data(&*self.source, section, chunk)?;
        encode_block(&data, self.level)
    }
}

impl std::fmt::Debug for LazyPackedStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LazyPackedStream")
            .field("header", &self.header)
            .field("level", &self.level)
            .field("tables_built", &self.tables.get().is_some())
            .finish_non_exhaustive()
    }
}

impl RandomAccessStream for LazyPackedStream {
    fn size(&self) -> u64 {
        self.header.occupied_size()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> FormatResult<usize> {
        let size = self.size();
        if offset >= size {
            return Ok(0);
        }
        let n = buf.len().min((size - offset) as usize);
        let out = &mut buf[..n];
        out.fill(0);
        let end = offset + n as u64;

        let tables = self.tables()?;
        if offset < tables.header.len() as u64 {
            read_from_slice(&tables.header, offset, out);
        }

        let first = tables.pieces.partition_point(|p| p.offset + p.size <= offset);
        for piece in &tables.pieces[first..] {
            if piece.offset >= end {
                break;
            }
            let from = piece.offset.max(offset);
            let to = (piece.offset + piece.size).min(end);
            let target = &mut out[(from - offset) as usize..(to - offset) as usize];
            let within = from - piece.offset;
            match piece.kind {
                PieceKind::RawHeader => {
                    read_from_slice(&self.layout.raw_header, within, target);
                }
                PieceKind::Block { section, chunk } => {
                    let block = self.block(section, chunk)?;
                    read_from_slice(&block, within, target);
                }
            }
        }
        Ok(n)
    }
}

/// A packed entry from any origin
#[derive(Debug)]
pub enum PackedFileStream {
    /// Entry copied from an existing data file
    Stored {
        /// Window over the entry's occupied space
        view: ViewStream,
        /// Entry header
        header: PackedFileHeader,
    },
    /// Entry encoded up front
    Eager(EagerPackedStream),
    /// Entry encoded on demand
    Lazy(LazyPackedStream),
}

impl PackedFileStream {
    /// Entry at `offset` of a data file
    pub fn stored(data_file: SharedStream, offset: u64) -> FormatResult<Self> {
        let head = data_file.read_up_to(offset, PACKED_FILE_HEADER_SIZE as usize)?;
        let header = PackedFileHeader::parse(&head)?;
        let occupied = header.occupied_size().max(ALIGNMENT);
        let view = ViewStream::new(data_file, offset, occupied);
        if view.size() < occupied {
            debug!(
                "Entry at {offset:#x} claims {occupied} bytes, only {} remain in its data file",
                view.size()
            );
        }
        Ok(Self::Stored { view, header })
    }

    /// Encode a raw file
    pub fn encode(
        source: SharedStream,
        kind: EncodeKind,
        level: u32,
        lazy: bool,
    ) -> FormatResult<Self> {
        let layout = SourceLayout::plan(kind, &*source)?;
        if lazy {
            Ok(Self::Lazy(LazyPackedStream::new(source, layout, level)?))
        } else {
            Ok(Self::Eager(EagerPackedStream::new(&*source, &layout, level)?))
        }
    }

    /// Entry header
    pub const fn header(&self) -> &PackedFileHeader {
        match self {
            Self::Stored { header, .. } => header,
            Self::Eager(stream) => stream.header(),
            Self::Lazy(stream) => stream.header(),
        }
    }

    /// Entry layout
    pub const fn entry_type(&self) -> PackedType {
        self.header().entry_type
    }

    /// Size of the unpacked file
    pub const fn decompressed_size(&self) -> u64 {
        self.header().decompressed_size as u64
    }
}

impl RandomAccessStream for PackedFileStream {
    fn size(&self) -> u64 {
        match self {
            Self::Stored { view, .. } => view.size(),
            Self::Eager(stream) => stream.size(),
            Self::Lazy(stream) => stream.size(),
        }
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> FormatResult<usize> {
        match self {
            Self::Stored { view, .. } => view.read_at(offset, buf),
            Self::Eager(stream) => stream.read_at(offset, buf),
            Self::Lazy(stream) => stream.read_at(offset, buf),
        }
    }
}
