//! Packed entry encode/decode behaviour across all three layouts

#![allow(clippy::expect_used, clippy::unwrap_used)]

use pretty_assertions::assert_eq;
use proptest::prelude::*;
use sqpack_formats::packed::model::{ModelHeader, MODEL_HEADER_SIZE};
use sqpack_formats::packed::texture::TextureHeader;
use sqpack_formats::{
    EncodeKind, MemoryStream, PackedFileStream, PackedType, RandomAccessStream, SharedStream,
    UnpackingStream,
};
use std::sync::Arc;

fn pattern(len: usize, seed: u32) -> Vec<u8> {
    (0..len as u32)
        .map(|i| {
            let x = i.wrapping_mul(2_654_435_761).wrapping_add(seed);
            // Mix runs and noise so some blocks compress and some are stored
            if (i / 4096) % 2 == 0 {
                (i % 17) as u8
            } else {
                (x >> 11) as u8
            }
        })
        .collect()
}

fn pack(data: Vec<u8>, kind: EncodeKind, lazy: bool) -> Arc<PackedFileStream> {
    Arc::new(PackedFileStream::encode(MemoryStream::shared(data), kind, 6, lazy).unwrap())
}

fn unpack(packed: Arc<PackedFileStream>) -> UnpackingStream {
    let shared: SharedStream = packed;
    UnpackingStream::new(shared).unwrap()
}

fn model_source(stack: u32, runtime: u32, lods: &[(u32, u32, u32)]) -> Vec<u8> {
    let mut header = ModelHeader {
        version: 0x0100_0005,
        stack_size: stack,
        runtime_size: runtime,
        vertex_declaration_count: 3,
        material_count: 2,
        lod_count: lods.len() as u8,
        edge_geometry: 1,
        ..ModelHeader::default()
    };
    let mut pos = MODEL_HEADER_SIZE as u32 + stack + runtime;
    for (lod, &(vertex, edge, index)) in lods.iter().enumerate() {
        header.vertex_offsets[lod] = pos;
        header.vertex_sizes[lod] = vertex;
        header.index_offsets[lod] = pos + vertex + edge;
        header.index_sizes[lod] = index;
        pos += vertex + edge + index;
    }
    let mut bytes = sqpack_formats::write_le(&header).unwrap();
    bytes.extend(pattern((pos as u64 - MODEL_HEADER_SIZE) as usize, 7));
    bytes
}

fn texture_source(format: u32, width: u16, height: u16, mip_sizes: &[usize]) -> Vec<u8> {
    let mut header = TextureHeader {
        format,
        width,
        height,
        depth: 1,
        mip_count: mip_sizes.len() as u8,
        array_size: 1,
        ..TextureHeader::default()
    };
    let mut pos = 80u32;
    for (level, &size) in mip_sizes.iter().enumerate() {
        header.mip_offsets[level] = pos;
        pos += size as u32;
    }
    let mut bytes = sqpack_formats::write_le(&header).unwrap();
    bytes.extend(pattern(pos as usize - 80, 3));
    bytes
}

#[test]
fn binary_round_trip_at_block_boundaries() {
    for size in [0usize, 1, 15_999, 16_000, 16_001, 48_000, 70_123] {
        let data = pattern(size, size as u32);
        let expected = if size == 0 {
            PackedType::Empty
        } else {
            PackedType::Binary
        };
        for lazy in [false, true] {
            let packed = pack(data.clone(), EncodeKind::Binary, lazy);
            assert_eq!(packed.entry_type(), expected);
            assert_eq!(packed.size() % 128, 0);
            let stream = unpack(packed);
            assert_eq!(stream.size(), size as u64);
            assert_eq!(stream.read_all().unwrap(), data, "size {size}, lazy {lazy}");
            stream.verify().unwrap();
        }
    }
}

#[test]
fn eager_entry_is_never_larger_than_lazy() {
    let data = pattern(100_000, 1);
    let eager = pack(data.clone(), EncodeKind::Binary, false);
    let lazy = pack(data, EncodeKind::Binary, true);
    assert!(eager.size() <= lazy.size());
}

#[test]
fn model_round_trip() {
    let source = model_source(300, 17_000, &[(40_000, 96, 5_000), (1_200, 0, 600)]);
    for lazy in [false, true] {
        let packed = pack(source.clone(), EncodeKind::Model, lazy);
        assert_eq!(packed.entry_type(), PackedType::Model);
        assert_eq!(packed.header().block_count_or_version, 0x0100_0005);
        let stream = unpack(packed);
        assert_eq!(stream.size(), source.len() as u64);
        assert_eq!(stream.read_all().unwrap(), source);
        stream.verify().unwrap();
    }
}

#[test]
fn model_sections_at_block_boundaries_round_trip() {
    let layouts = [
        model_source(0, 1, &[(16_001, 0, 15_999), (16_000, 0, 0), (0, 0, 16_000)]),
        model_source(15_999, 16_000, &[(1, 16_001, 1)]),
    ];
    for source in layouts {
        for lazy in [false, true] {
            let stream = unpack(pack(source.clone(), EncodeKind::Model, lazy));
            assert_eq!(stream.size(), source.len() as u64);
            assert_eq!(stream.read_all().unwrap(), source, "lazy {lazy}");
            stream.verify().unwrap();
        }
    }
}

fn encode_model_err(source: Vec<u8>, lazy: bool) -> sqpack_formats::FormatError {
    PackedFileStream::encode(MemoryStream::shared(source), EncodeKind::Model, 6, lazy).unwrap_err()
}

#[test]
fn model_with_trailing_bytes_is_rejected() {
    let mut source = model_source(300, 1000, &[(4000, 0, 500)]);
    source.extend([0xABu8; 64]);
    for lazy in [false, true] {
        let err = encode_model_err(source.clone(), lazy);
        assert!(err.is_corruption());
        assert!(err.to_string().contains("64 bytes after"), "{err}");
    }
}

#[test]
fn model_with_gap_between_sections_is_rejected() {
    let mut source = model_source(300, 1000, &[(4000, 0, 500)]);
    // Move the first lod 16 bytes further, leaving a hole after the runtime section
    let vertex_offset = u32::from_le_bytes(source[0x10..0x14].try_into().unwrap());
    let index_offset = u32::from_le_bytes(source[0x1C..0x20].try_into().unwrap());
    source[0x10..0x14].copy_from_slice(&(vertex_offset + 16).to_le_bytes());
    source[0x1C..0x20].copy_from_slice(&(index_offset + 16).to_le_bytes());
    let at = vertex_offset as usize;
    source.splice(at..at, [0u8; 16]);
    for lazy in [false, true] {
        let err = encode_model_err(source.clone(), lazy);
        assert!(err.is_corruption());
        assert!(err.to_string().contains("gap"), "{err}");
    }
}

#[test]
fn model_with_overlapping_sections_is_rejected() {
    let mut source = model_source(100, 100, &[(200, 0, 50)]);
    // Point the index buffer back into the vertex buffer
    let vertex_offset = u32::from_le_bytes(source[0x10..0x14].try_into().unwrap());
    source[0x1C..0x20].copy_from_slice(&(vertex_offset + 10).to_le_bytes());
    let err = PackedFileStream::encode(MemoryStream::shared(source), EncodeKind::Model, 6, false)
        .unwrap_err();
    assert!(err.is_corruption());
}

#[test]
fn small_texture_round_trip() {
    let source = texture_source(0x1450, 4, 4, &[64]);
    assert_eq!(source.len(), 144);
    for lazy in [false, true] {
        let packed = pack(source.clone(), EncodeKind::Texture, lazy);
        assert_eq!(packed.entry_type(), PackedType::Texture);
        assert_eq!(packed.header().block_count_or_version, 1);
        let stream = unpack(packed);
        assert_eq!(stream.read_all().unwrap(), source);
        stream.verify().unwrap();
    }
}

#[test]
fn mipmapped_texture_round_trip() {
    // 256x256 BC1: the first mip spans three blocks
    let sizes = [32_768, 8_192, 2_048, 512, 128, 32, 8, 8, 8];
    let source = texture_source(0x3420, 256, 256, &sizes);
    for lazy in [false, true] {
        let packed = pack(source.clone(), EncodeKind::Texture, lazy);
        assert_eq!(packed.header().block_count_or_version, sizes.len() as u32);
        let stream = unpack(packed);
        assert_eq!(stream.read_all().unwrap(), source);
        stream.verify().unwrap();
    }
}

#[test]
fn texture_mips_at_block_boundaries_round_trip() {
    // Unknown format: mip sizes come from the offsets alone
    let sizes = [16_001, 0, 16_000, 15_999, 1];
    let source = texture_source(0xBEEF, 64, 64, &sizes);
    for lazy in [false, true] {
        let packed = pack(source.clone(), EncodeKind::Texture, lazy);
        assert_eq!(packed.header().block_count_or_version, sizes.len() as u32);
        let stream = unpack(packed);
        assert_eq!(stream.size(), source.len() as u64);
        assert_eq!(stream.read_all().unwrap(), source, "lazy {lazy}");
        stream.verify().unwrap();
    }
}

#[test]
fn texture_trailing_zeros_survive_trimming() {
    let mut source = texture_source(0x1450, 4, 4, &[64]);
    source.extend(vec![0u8; 5000]);
    let packed = pack(source.clone(), EncodeKind::Texture, false);
    // The zero tail is not encoded as blocks
    assert!(packed.size() <= 384);
    let stream = unpack(packed);
    assert_eq!(stream.size(), source.len() as u64);
    assert_eq!(stream.read_all().unwrap(), source);
    stream.verify().unwrap();
}

#[test]
fn truncated_texture_is_zero_filled() {
    let mut source = texture_source(0x1450, 8, 8, &[256]);
    source.truncate(80 + 100);
    let stream = unpack(pack(source.clone(), EncodeKind::Texture, false));
    assert_eq!(stream.size(), 80 + 256);
    let unpacked = stream.read_all().unwrap();
    assert_eq!(&unpacked[..source.len()], &source[..]);
    assert!(unpacked[source.len()..].iter().all(|&b| b == 0));
}

#[test]
fn reads_are_clamped_to_the_file() {
    let data = pattern(20_000, 9);
    let stream = unpack(pack(data.clone(), EncodeKind::Binary, false));

    let mut buf = vec![0xAAu8; 500];
    assert_eq!(stream.read_at(19_800, &mut buf).unwrap(), 200);
    assert_eq!(&buf[..200], &data[19_800..]);
    assert_eq!(stream.read_at(20_000, &mut buf).unwrap(), 0);
    assert_eq!(stream.read_at(90_000, &mut buf).unwrap(), 0);

    stream.read_zero_padded(19_900, &mut buf).unwrap();
    assert_eq!(&buf[..100], &data[19_900..]);
    assert!(buf[100..].iter().all(|&b| b == 0));
}

#[test]
fn repeated_reads_are_stable() {
    let data = pattern(40_000, 4);
    let stream = unpack(pack(data.clone(), EncodeKind::Binary, true));
    for _ in 0..3 {
        let mut buf = vec![0u8; 1000];
        stream.read_exact_at(15_500, &mut buf).unwrap();
        assert_eq!(buf, &data[15_500..16_500]);
    }
}

#[test]
fn damaged_block_header_fails_verification() {
    let packed = pack(pattern(5000, 2), EncodeKind::Binary, false);
    let mut bytes = packed.read_all().unwrap();
    // First block header follows the 128-byte entry header; bump its version
    bytes[128 + 4] = 1;
    let stream = UnpackingStream::new(MemoryStream::shared(bytes)).unwrap();
    assert!(stream.verify().unwrap_err().is_corruption());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn partial_reads_match_source(
        offset in 0u64..52_000,
        len in 0usize..20_000,
        lazy in any::<bool>(),
    ) {
        let data = pattern(50_000, 11);
        let stream = unpack(pack(data.clone(), EncodeKind::Binary, lazy));
        let mut buf = vec![0u8; len];
        let n = stream.read_at(offset, &mut buf).unwrap();
        let start = (offset as usize).min(data.len());
        let end = (start + len).min(data.len());
        prop_assert_eq!(n, end - start);
        prop_assert_eq!(&buf[..n], &data[start..end]);
    }
}
