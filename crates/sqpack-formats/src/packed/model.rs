//! Model entry layout
//!
//! A native model file starts with a 68-byte [`ModelHeader`] followed by the
//! stack and runtime sections, then, per level of detail, a vertex buffer,
//! an optional edge geometry run and an index buffer. Packed model entries
//! encode those eleven sections independently; the header itself is not
//! stored and is rebuilt by the decoder from the [`ModelBlockLocator`].

use super::Section;
use crate::error::{FormatError, FormatResult};
use binrw::{BinRead, BinWrite};

/// Serialized size of [`ModelHeader`]
pub const MODEL_HEADER_SIZE: u64 = 0x44;

/// Serialized size of [`ModelBlockLocator`]
pub const MODEL_BLOCK_LOCATOR_SIZE: u32 = 184;

/// Number of levels of detail
pub const LOD_COUNT: usize = 3;

/// Number of independently encoded sections
pub const SECTION_COUNT: usize = 11;

/// Array slot of the stack section
pub const STACK: usize = 0;
/// Array slot of the runtime section
pub const RUNTIME: usize = 1;
/// First array slot of the vertex buffers
pub const VERTEX: usize = 2;
/// First array slot of the edge geometry runs
pub const EDGE: usize = 5;
/// First array slot of the index buffers
pub const INDEX: usize = 8;

/// Array slots in file order: stack, runtime, then vertex/edge/index per lod
pub const FILE_ORDER: [usize; SECTION_COUNT] = [
    STACK,
    RUNTIME,
    VERTEX,
    EDGE,
    INDEX,
    VERTEX + 1,
    EDGE + 1,
    INDEX + 1,
    VERTEX + 2,
    EDGE + 2,
    INDEX + 2,
];

/// Native model file header
#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[brw(little)]
pub struct ModelHeader {
    /// Format version
    pub version: u32,
    /// Stack section size
    pub stack_size: u32,
    /// Runtime section size
    pub runtime_size: u32,
    /// Number of vertex declarations
    pub vertex_declaration_count: u16,
    /// Number of materials
    pub material_count: u16,
    /// Absolute offset of each vertex buffer
    pub vertex_offsets: [u32; LOD_COUNT],
    /// Absolute offset of each index buffer
    pub index_offsets: [u32; LOD_COUNT],
    /// Size of each vertex buffer
    pub vertex_sizes: [u32; LOD_COUNT],
    /// Size of each index buffer
    pub index_sizes: [u32; LOD_COUNT],
    /// Levels of detail in use
    pub lod_count: u8,
    /// Index buffer streaming flag
    pub index_streaming: u8,
    /// Edge geometry flag
    #[brw(pad_after = 1)]
    pub edge_geometry: u8,
}

impl ModelHeader {
    /// Source regions of the eleven sections, in array order
    ///
    /// Non-empty regions must follow the header back to back in file order
    /// and end exactly at `file_size`, so that the header the decoder
    /// rebuilds matches this one.
    pub fn sections(&self, file_size: u64) -> FormatResult<[Section; SECTION_COUNT]> {
        let mut sections = [Section::default(); SECTION_COUNT];

        let stack_start = MODEL_HEADER_SIZE;
        sections[STACK] = Section::new(stack_start, u64::from(self.stack_size));
        sections[RUNTIME] = Section::new(
            stack_start + u64::from(self.stack_size),
            u64::from(self.runtime_size),
        );

        for lod in 0..LOD_COUNT {
            let vertex_offset = u64::from(self.vertex_offsets[lod]);
            let vertex_size = u64::from(self.vertex_sizes[lod]);
            let index_offset = u64::from(self.index_offsets[lod]);
            let index_size = u64::from(self.index_sizes[lod]);
            let vertex_end = vertex_offset + vertex_size;

            sections[VERTEX + lod] = Section::new(vertex_offset, vertex_size);
            sections[INDEX + lod] = Section::new(index_offset, index_size);

            let edge_size = if index_size == 0 || index_offset == 0 || vertex_size == 0 {
                0
            } else {
                index_offset.checked_sub(vertex_end).ok_or_else(|| {
                    FormatError::corrupt(format!(
                        "model lod {lod}: index buffer at {index_offset:#x} starts inside vertex buffer ending at {vertex_end:#x}"
                    ))
                })?
            };
            sections[EDGE + lod] = Section::new(vertex_end, edge_size);
        }

        let mut previous_end = MODEL_HEADER_SIZE;
        for slot in FILE_ORDER {
            let section = sections[slot];
            if section.size == 0 {
                continue;
            }
            if section.source_offset != previous_end {
                let problem = if section.source_offset < previous_end {
                    "overlaps"
                } else {
                    "leaves a gap after"
                };
                return Err(FormatError::corrupt(format!(
                    "model section {slot} at {:#x} {problem} data ending at {previous_end:#x}",
                    section.source_offset
                )));
            }
            let end = section.source_offset + section.size;
            if end > file_size {
                return Err(FormatError::corrupt(format!(
                    "model section {slot} ends at {end:#x}, past the {file_size}-byte file"
                )));
            }
            previous_end = end;
        }
        if previous_end != file_size {
            return Err(FormatError::corrupt(format!(
                "model has {} bytes after its last section",
                file_size - previous_end
            )));
        }

        let mut locator = ModelBlockLocator {
            vertex_declaration_count: self.vertex_declaration_count,
            material_count: self.material_count,
            lod_count: self.lod_count,
            index_streaming: self.index_streaming,
            edge_geometry: self.edge_geometry,
            ..ModelBlockLocator::default()
        };
        for (size, section) in locator.decompressed_sizes.iter_mut().zip(&sections) {
            *size = u32::try_from(section.size).map_err(|_| {
                FormatError::corrupt(format!("model section of {} bytes", section.size))
            })?;
        }
        if Self::contiguous(&locator, self.version) != *self {
            return Err(FormatError::corrupt(
                "model header offsets do not describe its sections back to back",
            ));
        }

        Ok(sections)
    }

    /// Header describing sections laid out back to back in file order
    ///
    /// Offsets of a level of detail with no data are left at zero.
    pub fn contiguous(locator: &ModelBlockLocator, version: u32) -> Self {
        let sizes = &locator.decompressed_sizes;
        let mut header = Self {
            version,
            stack_size: sizes[STACK],
            runtime_size: sizes[RUNTIME],
            vertex_declaration_count: locator.vertex_declaration_count,
            material_count: locator.material_count,
            lod_count: locator.lod_count,
            index_streaming: locator.index_streaming,
            edge_geometry: locator.edge_geometry,
            ..Self::default()
        };

        let mut pos = (MODEL_HEADER_SIZE as u32)
            .saturating_add(sizes[STACK])
            .saturating_add(sizes[RUNTIME]);
        for lod in 0..LOD_COUNT {
            let vertex = sizes[VERTEX + lod];
            let edge = sizes[EDGE + lod];
            let index = sizes[INDEX + lod];
            header.vertex_sizes[lod] = vertex;
            header.index_sizes[lod] = index;
            if vertex == 0 && edge == 0 && index == 0 {
                continue;
            }
            header.vertex_offsets[lod] = pos;
            header.index_offsets[lod] = pos.saturating_add(vertex).saturating_add(edge);
            pos = header.index_offsets[lod].saturating_add(index);
        }
        header
    }
}

/// Model entry table
#[derive(BinRead, BinWrite, Debug, Clone, PartialEq, Eq, Default)]
#[brw(little)]
pub struct ModelBlockLocator {
    /// Unpacked size of each section
    pub decompressed_sizes: [u32; SECTION_COUNT],
    /// Total slot bytes of each section
    pub chunk_sizes: [u32; SECTION_COUNT],
    /// Offset of each section's first block, relative to the header end
    pub first_block_offsets: [u32; SECTION_COUNT],
    /// Index of each section's first block in the slot table
    pub first_block_indices: [u16; SECTION_COUNT],
    /// Number of blocks in each section
    pub block_counts: [u16; SECTION_COUNT],
    /// Copied from the native header
    pub vertex_declaration_count: u16,
    /// Copied from the native header
    pub material_count: u16,
    /// Copied from the native header
    pub lod_count: u8,
    /// Copied from the native header
    pub index_streaming: u8,
    /// Copied from the native header
    #[brw(pad_after = 1)]
    pub edge_geometry: u8,
}

impl ModelBlockLocator {
    /// Total number of blocks across all sections
    pub fn total_blocks(&self) -> usize {
        self.block_counts.iter().map(|&c| usize::from(c)).sum()
    }

    /// Unpacked size of the model file
    pub fn decompressed_size(&self) -> u64 {
        MODEL_HEADER_SIZE
            + self
                .decompressed_sizes
                .iter()
                .map(|&s| u64::from(s))
                .sum::<u64>()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    fn locator_with(sizes: [u32; SECTION_COUNT]) -> ModelBlockLocator {
        ModelBlockLocator {
            decompressed_sizes: sizes,
            lod_count: 1,
            ..ModelBlockLocator::default()
        }
    }

    #[test]
    fn test_sizes() {
        assert_eq!(crate::write_le(&ModelHeader::default()).unwrap().len(), 0x44);
        assert_eq!(
            crate::write_le(&ModelBlockLocator::default()).unwrap().len(),
            MODEL_BLOCK_LOCATOR_SIZE as usize
        );
    }

    #[test]
    fn test_contiguous_layout_round_trips_through_sections() {
        let mut sizes = [0u32; SECTION_COUNT];
        sizes[STACK] = 10;
        sizes[RUNTIME] = 20;
        sizes[VERTEX] = 300;
        sizes[EDGE] = 7;
        sizes[INDEX] = 40;
        let locator = locator_with(sizes);
        let header = ModelHeader::contiguous(&locator, 5);

        assert_eq!(header.vertex_offsets, [0x44 + 30, 0, 0]);
        assert_eq!(header.index_offsets, [0x44 + 30 + 307, 0, 0]);

        let sections = header.sections(locator.decompressed_size()).unwrap();
        assert_eq!(sections[EDGE], Section::new(0x44 + 330, 7));
        assert_eq!(sections[INDEX].size, 40);
        assert_eq!(sections[VERTEX + 1].size, 0);
        let total: u64 = sections.iter().map(|s| s.size).sum();
        assert_eq!(total + 0x44, locator.decompressed_size());
    }

    #[test]
    fn test_overflowing_section_rejected() {
        let header = ModelHeader {
            stack_size: 100,
            ..ModelHeader::default()
        };
        assert!(header.sections(0x44 + 99).unwrap_err().is_corruption());
        assert!(header.sections(0x44 + 100).is_ok());
    }

    #[test]
    fn test_overlapping_sections_rejected() {
        let header = ModelHeader {
            stack_size: 100,
            vertex_offsets: [0x44 + 50, 0, 0],
            vertex_sizes: [10, 0, 0],
            ..ModelHeader::default()
        };
        assert!(header.sections(0x1000).unwrap_err().is_corruption());
    }

    #[test]
    fn test_gap_between_sections_rejected() {
        let header = ModelHeader {
            stack_size: 100,
            vertex_offsets: [0x44 + 116, 0, 0],
            vertex_sizes: [10, 0, 0],
            lod_count: 1,
            ..ModelHeader::default()
        };
        let err = header.sections(0x44 + 126).unwrap_err();
        assert!(err.is_corruption());
        assert!(err.to_string().contains("gap"));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let header = ModelHeader {
            stack_size: 100,
            ..ModelHeader::default()
        };
        let err = header.sections(0x44 + 164).unwrap_err();
        assert!(err.to_string().contains("64 bytes after"));
    }

    #[test]
    fn test_offsets_of_unused_lod_rejected() {
        let header = ModelHeader {
            stack_size: 100,
            vertex_offsets: [0, 0x44 + 100, 0],
            ..ModelHeader::default()
        };
        assert!(header.sections(0x44 + 100).unwrap_err().is_corruption());
    }

    #[test]
    fn test_index_inside_vertex_rejected() {
        let header = ModelHeader {
            vertex_offsets: [0x44, 0, 0],
            vertex_sizes: [100, 0, 0],
            index_offsets: [0x44 + 50, 0, 0],
            index_sizes: [10, 0, 0],
            ..ModelHeader::default()
        };
        assert!(header.sections(0x1000).is_err());
    }
}
