//! Texture entry layout
//!
//! A native texture file is an 80-byte [`TextureHeader`] (sometimes
//! followed by extra bytes) and then its mip levels. Array textures repeat
//! the full mip chain once per slice. Packed texture entries copy
//! everything before the first mip verbatim, then encode one block run per
//! mip level and slice.

use super::Section;
use crate::error::{FormatError, FormatResult};
use crate::stream::RandomAccessStream;
use binrw::{BinRead, BinWrite};
use tracing::debug;

/// Serialized size of [`TextureHeader`]
pub const TEXTURE_HEADER_SIZE: u64 = 80;

/// Maximum number of mip levels
pub const MAX_MIP_LEVELS: usize = 13;

/// Serialized size of [`TextureBlockLocator`]
pub const TEXTURE_BLOCK_LOCATOR_SIZE: u32 = 20;

/// Native texture file header
#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[brw(little)]
pub struct TextureHeader {
    /// Attribute flags
    pub attribute: u32,
    /// Pixel format code
    pub format: u32,
    /// Width of mip 0
    pub width: u16,
    /// Height of mip 0
    pub height: u16,
    /// Depth of mip 0
    pub depth: u16,
    /// Mip level count in the low 7 bits
    pub mip_count: u8,
    /// Number of array slices
    pub array_size: u8,
    /// Mip index used by each level of detail
    pub lod_offsets: [u32; 3],
    /// Absolute offset of each mip level
    pub mip_offsets: [u32; MAX_MIP_LEVELS],
}

/// How pixels of a format are packed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelLayout {
    /// Uncompressed, with this many bits per pixel
    Linear(u64),
    /// Block compressed 4x4, with this many bytes per block
    Block(u64),
}

/// Pixel layout of a format code, when known
pub const fn pixel_layout(format: u32) -> Option<PixelLayout> {
    match format {
        // L8, A8
        0x1130 | 0x1131 => Some(PixelLayout::Linear(8)),
        // B4G4R4A4, B5G5R5A1, D16, Shadow16
        0x1440 | 0x1441 | 0x4140 | 0x5140 => Some(PixelLayout::Linear(16)),
        // B8G8R8A8, B8G8R8X8, R32F, R16G16F, D24S8, Shadow24
        0x1450 | 0x1451 | 0x2150 | 0x2250 | 0x4250 | 0x5150 => Some(PixelLayout::Linear(32)),
        // R32G32F, R16G16B16A16F
        0x2260 | 0x2460 => Some(PixelLayout::Linear(64)),
        // R32G32B32A32F
        0x2470 => Some(PixelLayout::Linear(128)),
        // BC1, BC4
        0x3420 | 0x6120 => Some(PixelLayout::Block(8)),
        // BC2, BC3, BC5, BC6H, BC7
        0x3430 | 0x3431 | 0x6230 | 0x6330 | 0x6432 => Some(PixelLayout::Block(16)),
        _ => None,
    }
}

impl TextureHeader {
    /// Parse the header at the start of `data`
    pub fn parse(data: &[u8]) -> FormatResult<Self> {
        if (data.len() as u64) < TEXTURE_HEADER_SIZE {
            return Err(FormatError::corrupt(format!(
                "texture header truncated: {} bytes",
                data.len()
            )));
        }
        crate::read_le(&data[..TEXTURE_HEADER_SIZE as usize])
    }

    /// Number of mip levels, clamped to `1..=13`
    pub fn mip_levels(&self) -> usize {
        usize::from(self.mip_count & 0x7F).clamp(1, MAX_MIP_LEVELS)
    }

    /// Size of mip `level` of one slice, computed from the format
    pub fn mip_size(&self, level: usize) -> Option<u64> {
        let shift = level.min(31) as u32;
        let width = (u64::from(self.width) >> shift).max(1);
        let height = (u64::from(self.height) >> shift).max(1);
        let depth = (u64::from(self.depth) >> shift).max(1);
        match pixel_layout(self.format)? {
            PixelLayout::Linear(bits) => Some((width * height * depth * bits).div_ceil(8)),
            PixelLayout::Block(bytes) => {
                Some(width.div_ceil(4) * height.div_ceil(4) * depth * bytes)
            }
        }
    }
}

/// Texture entry table record, one per mip level and slice
#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[brw(little)]
pub struct TextureBlockLocator {
    /// Offset of the first block, relative to the header end
    pub first_block_offset: u32,
    /// Total slot bytes of this run
    pub total_size: u32,
    /// Bytes this run inflates to
    pub decompressed_size: u32,
    /// Index of the first block in the slot table
    pub first_sub_block_index: u32,
    /// Number of blocks in this run
    pub sub_block_count: u32,
}

/// How a texture source is split into encoded runs
#[derive(Debug, Clone)]
pub struct TexturePlan {
    /// Bytes before the first mip, copied verbatim
    pub raw_header: Vec<u8>,
    /// One run per mip level and slice, slice-major
    pub sections: Vec<Section>,
    /// Size of the unpacked file
    pub decompressed_size: u64,
}

/// Length of a run after dropping trailing zeros past the computed mip size
fn trimmed_size(
    source: &dyn RandomAccessStream,
    start: u64,
    region: u64,
    computed: Option<u64>,
) -> FormatResult<u64> {
    let Some(computed) = computed else {
        return Ok(region);
    };
    if region <= computed {
        return Ok(region);
    }
    let tail = source.read_up_to(start + computed, (region - computed) as usize)?;
    let kept = tail.iter().rposition(|&b| b != 0).map_or(0, |p| p as u64 + 1);
    Ok(computed + kept)
}

/// Split a texture source into its verbatim header and per-mip runs
///
/// Runs extending past the end of the source are kept at full length and
/// read as zeros. Array textures are treated as repeated mip chains when
/// the body divides evenly into slices that can hold every mip.
pub fn plan_texture(source: &dyn RandomAccessStream) -> FormatResult<TexturePlan> {
    let file_size = source.size();
    let head = source.read_up_to(0, TEXTURE_HEADER_SIZE as usize)?;
    let header = TextureHeader::parse(&head)?;

    let levels = header.mip_levels();
    let first = u64::from(header.mip_offsets[0]);
    if first < TEXTURE_HEADER_SIZE {
        return Err(FormatError::corrupt(format!(
            "texture mip 0 at {first:#x} overlaps the header"
        )));
    }
    if first > file_size {
        return Err(FormatError::corrupt(format!(
            "texture mip 0 at {first:#x} is past the {file_size}-byte file"
        )));
    }
    let offsets: Vec<u64> = header.mip_offsets[..levels]
        .iter()
        .map(|&o| u64::from(o))
        .collect();
    if offsets.windows(2).any(|w| w[1] < w[0]) {
        return Err(FormatError::corrupt("texture mip offsets are not ascending"));
    }

    let mut raw_header = source.read_up_to(0, first as usize)?;
    raw_header.resize(first as usize, 0);

    let last = offsets[levels - 1];
    let body = file_size.saturating_sub(first);
    let slices = u64::from(header.array_size);
    let chain_span = (last - first) + header.mip_size(levels - 1).unwrap_or(0);
    let repeat = if slices > 1 && body % slices == 0 && body / slices >= chain_span {
        slices
    } else {
        1
    };
    let stride = body / repeat;

    let mut sections = Vec::with_capacity(levels * repeat as usize);
    let mut layout_end = first;
    for slice in 0..repeat {
        for level in 0..levels {
            let start = offsets[level] + slice * stride;
            let computed = header.mip_size(level);
            let region = if level + 1 < levels {
                offsets[level + 1] - offsets[level]
            } else if repeat > 1 {
                stride - (offsets[level] - first)
            } else {
                file_size
                    .saturating_sub(start)
                    .max(computed.unwrap_or(0))
            };
            let size = trimmed_size(source, start, region, computed)?;
            sections.push(Section {
                source_offset: start,
                size,
                available: file_size.saturating_sub(start).min(size),
            });
            layout_end = layout_end.max(start + region);
        }
    }

    let decompressed_size = file_size.max(layout_end);
    if decompressed_size > file_size {
        debug!(
            "Texture source is {} bytes short of its declared layout, zero-filling",
            decompressed_size - file_size
        );
    }

    Ok(TexturePlan {
        raw_header,
        sections,
        decompressed_size,
    })
}

/// Logical start of every locator's run when unpacking
///
/// `prefix` holds the first bytes of the verbatim header, which is
/// `raw_len` bytes long. Locators are matched to its mip offsets slice by
/// slice. When the locator count does not fit the mip chain, runs are
/// placed back to back after the header instead.
pub fn locator_positions(
    prefix: &[u8],
    raw_len: u64,
    locators: &[TextureBlockLocator],
    decompressed_size: u64,
) -> Vec<u64> {
    let first = raw_len;
    let sequential = || {
        let mut pos = first;
        locators
            .iter()
            .map(|l| {
                let start = pos;
                pos += u64::from(l.decompressed_size);
                start
            })
            .collect::<Vec<_>>()
    };

    let Ok(header) = TextureHeader::parse(prefix) else {
        return sequential();
    };
    let levels = header.mip_levels();
    if locators.is_empty() || locators.len() % levels != 0 {
        return sequential();
    }
    if u64::from(header.mip_offsets[0]) != first {
        return sequential();
    }

    let repeat = (locators.len() / levels) as u64;
    let stride = if repeat > 1 {
        decompressed_size.saturating_sub(first) / repeat
    } else {
        0
    };
    (0..locators.len())
        .map(|k| u64::from(header.mip_offsets[k % levels]) + (k / levels) as u64 * stride)
        .collect()
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::stream::MemoryStream;

    fn texture(
        format: u32,
        width: u16,
        height: u16,
        mips: &[u32],
        array: u8,
        body: &[u8],
    ) -> Vec<u8> {
        let mut header = TextureHeader {
            format,
            width,
            height,
            depth: 1,
            mip_count: mips.len() as u8,
            array_size: array,
            ..TextureHeader::default()
        };
        header.mip_offsets[..mips.len()].copy_from_slice(mips);
        let mut bytes = crate::write_le(&header).unwrap();
        bytes.extend_from_slice(body);
        bytes
    }

    #[test]
    fn test_mip_sizes() {
        let header = TextureHeader {
            format: 0x3420,
            width: 64,
            height: 32,
            depth: 1,
            ..TextureHeader::default()
        };
        assert_eq!(header.mip_size(0), Some(16 * 8 * 8));
        assert_eq!(header.mip_size(6), Some(8));

        let rgba = TextureHeader {
            format: 0x1450,
            width: 4,
            height: 4,
            ..header
        };
        assert_eq!(rgba.mip_size(0), Some(64));
        let unknown = TextureHeader {
            format: 0xBEEF,
            ..rgba
        };
        assert_eq!(unknown.mip_size(0), None);
    }

    #[test]
    fn test_single_mip_plan() {
        let bytes = texture(0x1450, 4, 4, &[80], 1, &[7u8; 64]);
        let plan = plan_texture(&MemoryStream::new(bytes)).unwrap();
        assert_eq!(plan.raw_header.len(), 80);
        assert_eq!(plan.sections, vec![Section::new(80, 64)]);
        assert_eq!(plan.decompressed_size, 144);
    }

    #[test]
    fn test_trailing_zeros_trimmed() {
        let mut body = vec![1u8; 64];
        body.extend_from_slice(&[0u8; 100]);
        let bytes = texture(0x1450, 4, 4, &[80], 1, &body);
        let plan = plan_texture(&MemoryStream::new(bytes)).unwrap();
        assert_eq!(plan.sections[0].size, 64);
        assert_eq!(plan.decompressed_size, 80 + 164);
    }

    #[test]
    fn test_truncated_source_zero_filled() {
        let bytes = texture(0x1450, 4, 4, &[80], 1, &[9u8; 40]);
        let plan = plan_texture(&MemoryStream::new(bytes)).unwrap();
        assert_eq!(plan.sections[0].size, 64);
        assert_eq!(plan.sections[0].available, 40);
        assert_eq!(plan.decompressed_size, 144);
    }

    #[test]
    fn test_array_repeat_detected() {
        // Two slices of a 4x4 L8 texture with two mips (16 + 4 bytes)
        let body: Vec<u8> = (1..=40u8).collect();
        let bytes = texture(0x1130, 4, 4, &[80, 96], 2, &body);
        let plan = plan_texture(&MemoryStream::new(bytes)).unwrap();
        let starts: Vec<u64> = plan.sections.iter().map(|s| s.source_offset).collect();
        assert_eq!(starts, vec![80, 96, 100, 116]);
        assert_eq!(plan.decompressed_size, 120);

        let locators: Vec<TextureBlockLocator> = plan
            .sections
            .iter()
            .map(|s| TextureBlockLocator {
                decompressed_size: s.size as u32,
                ..TextureBlockLocator::default()
            })
            .collect();
        assert_eq!(locator_positions(&plan.raw_header, 80, &locators, 120), starts);
    }

    #[test]
    fn test_bad_mip_offsets_rejected() {
        let bytes = texture(0x1130, 4, 4, &[40], 1, &[0u8; 16]);
        assert!(plan_texture(&MemoryStream::new(bytes)).is_err());

        let bytes = texture(0x1130, 4, 4, &[96, 80], 1, &[0u8; 20]);
        assert!(plan_texture(&MemoryStream::new(bytes)).is_err());

        assert!(plan_texture(&MemoryStream::new(vec![0u8; 20])).is_err());
    }

    #[test]
    fn test_sequential_fallback() {
        let locators = [
            TextureBlockLocator {
                decompressed_size: 10,
                ..TextureBlockLocator::default()
            },
            TextureBlockLocator {
                decompressed_size: 5,
                ..TextureBlockLocator::default()
            },
        ];
        // Header too short to parse
        assert_eq!(locator_positions(&[0u8; 16], 16, &locators, 31), vec![16, 26]);
    }
}
