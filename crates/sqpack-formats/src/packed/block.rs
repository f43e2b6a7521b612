//! Block codec primitives
//!
//! A block is a 16-byte [`BlockHeader`] followed by its payload, padded
//! with zeros to the 128-byte allocation unit. The payload is raw deflate
//! (no zlib wrapper) unless compressing did not help, in which case it is
//! stored verbatim and the compressed size field holds
//! [`STORED_BLOCK_MARKER`].

use crate::align::{BLOCK_PAYLOAD_SIZE, align_to_unit};
use crate::error::{FormatError, FormatResult};
use binrw::{BinRead, BinWrite};
use flate2::Compression;
use flate2::read::DeflateDecoder;
use flate2::write::DeflateEncoder;
use std::io::{Read, Write};

/// Serialized size of [`BlockHeader`]
pub const BLOCK_HEADER_SIZE: u32 = 16;

/// Compressed size value marking a stored (uncompressed) block
pub const STORED_BLOCK_MARKER: u32 = 32_000;

/// Default deflate level
pub const DEFAULT_COMPRESSION_LEVEL: u32 = 6;

/// Header in front of every block payload
#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq)]
#[brw(little)]
pub struct BlockHeader {
    /// Always 16
    pub header_size: u32,
    /// Always 0
    pub version: u32,
    /// Payload size, or [`STORED_BLOCK_MARKER`]
    pub compressed_size: u32,
    /// Size of the data once inflated
    pub decompressed_size: u32,
}

impl BlockHeader {
    /// Parse the header at the start of `block`
    pub fn parse(block: &[u8]) -> FormatResult<Self> {
        if block.len() < BLOCK_HEADER_SIZE as usize {
            return Err(FormatError::corrupt(format!(
                "block header truncated: {} bytes",
                block.len()
            )));
        }
        let header: Self = crate::read_le(&block[..BLOCK_HEADER_SIZE as usize])?;
        if header.header_size < BLOCK_HEADER_SIZE || header.header_size > 0x1000 {
            return Err(FormatError::corrupt(format!(
                "block header size {} out of range",
                header.header_size
            )));
        }
        Ok(header)
    }

    /// Whether the payload is stored verbatim
    pub const fn is_stored(&self) -> bool {
        self.compressed_size == STORED_BLOCK_MARKER
    }

    /// Bytes of payload following the header
    pub const fn payload_size(&self) -> u32 {
        if self.is_stored() {
            self.decompressed_size
        } else {
            self.compressed_size
        }
    }

    /// Header plus payload, before padding
    pub const fn used_size(&self) -> u64 {
        self.header_size as u64 + self.payload_size() as u64
    }

    /// Header plus payload, padded to the allocation unit
    pub const fn slot_size(&self) -> u64 {
        align_to_unit(self.used_size()).allocated_size
    }
}

/// Largest slot a block of `len` source bytes can need
///
/// Stored blocks are never larger than their source, so the worst case is
/// the header plus the raw bytes.
pub const fn worst_case_block_size(len: u64) -> u64 {
    align_to_unit(BLOCK_HEADER_SIZE as u64 + len).allocated_size
}

/// Compress one chunk into a padded block
pub fn encode_block(data: &[u8], level: u32) -> FormatResult<Vec<u8>> {
    if data.len() as u64 > BLOCK_PAYLOAD_SIZE {
        return Err(FormatError::InvalidArgument(format!(
            "block of {} bytes exceeds {BLOCK_PAYLOAD_SIZE}",
            data.len()
        )));
    }

    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::new(level.min(9)));
    encoder
        .write_all(data)
        .map_err(|e| FormatError::Compression(format!("deflate failed: {e}")))?;
    let compressed = encoder
        .finish()
        .map_err(|e| FormatError::Compression(format!("deflate failed: {e}")))?;

    let stored = compressed.len() >= data.len();
    let header = BlockHeader {
        header_size: BLOCK_HEADER_SIZE,
        version: 0,
        compressed_size: if stored {
            STORED_BLOCK_MARKER
        } else {
            compressed.len() as u32
        },
        decompressed_size: data.len() as u32,
    };

    let mut block = crate::write_le(&header)?;
    block.extend_from_slice(if stored { data } else { &compressed });
    block.resize(header.slot_size() as usize, 0);
    Ok(block)
}

/// Decode bytes `[skip, skip + out.len())` of a block into `out`
///
/// Only the needed prefix of the deflate stream is inflated. A payload cut
/// short by the end of the source yields whatever could be recovered; the
/// rest of `out` is left untouched. Returns the number of bytes written.
pub fn decode_block_into(block: &[u8], skip: usize, out: &mut [u8]) -> FormatResult<usize> {
    let header = BlockHeader::parse(block)?;
    let payload_start = header.header_size as usize;
    let payload_end = payload_start + header.payload_size() as usize;
    let truncated = block.len() < payload_end;
    let payload = block
        .get(payload_start..payload_end.min(block.len()))
        .unwrap_or_default();

    let total = header.decompressed_size as usize;
    if skip >= total || out.is_empty() {
        return Ok(0);
    }
    let want = out.len().min(total - skip);

    if header.is_stored() {
        let available = payload.len().saturating_sub(skip).min(want);
        if available > 0 {
            out[..available].copy_from_slice(&payload[skip..skip + available]);
        }
        return Ok(available);
    }

    let mut decoder = DeflateDecoder::new(payload).take((skip + want) as u64);
    let mut scratch = [0u8; 4096];
    let mut skipped = 0;
    while skipped < skip {
        let n = (skip - skipped).min(scratch.len());
        match decoder.read(&mut scratch[..n]) {
            Ok(0) => return Ok(0),
            Ok(read) => skipped += read,
            Err(_) if truncated => return Ok(0),
            Err(e) => return Err(FormatError::Compression(format!("inflate failed: {e}"))),
        }
    }

    let mut written = 0;
    while written < want {
        match decoder.read(&mut out[written..want]) {
            Ok(0) => break,
            Ok(read) => written += read,
            Err(_) if truncated => break,
            Err(e) => return Err(FormatError::Compression(format!("inflate failed: {e}"))),
        }
    }
    Ok(written)
}

/// Decode a whole block, requiring exactly the declared size
pub fn decode_block(block: &[u8]) -> FormatResult<Vec<u8>> {
    let header = BlockHeader::parse(block)?;
    let mut out = vec![0u8; header.decompressed_size as usize];
    let written = decode_block_into(block, 0, &mut out)?;
    if written != out.len() {
        return Err(FormatError::corrupt(format!(
            "block inflated to {written} bytes, header declares {}",
            out.len()
        )));
    }
    Ok(out)
}

/// Check that every byte after the payload is zero
pub fn verify_block_padding(block: &[u8]) -> FormatResult<()> {
    let header = BlockHeader::parse(block)?;
    let used = header.used_size() as usize;
    if block.len() < used {
        return Err(FormatError::corrupt(format!(
            "block truncated: {} of {used} bytes",
            block.len()
        )));
    }
    if let Some(pos) = block[used..].iter().position(|&b| b != 0) {
        return Err(FormatError::corrupt(format!(
            "non-zero block padding at +{:#x}",
            used + pos
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_compressible_block() {
        let data = vec![0x41u8; 4000];
        let block = encode_block(&data, DEFAULT_COMPRESSION_LEVEL).unwrap();
        let header = BlockHeader::parse(&block).unwrap();
        assert!(!header.is_stored());
        assert_eq!(header.decompressed_size, 4000);
        assert_eq!(block.len() % 128, 0);
        assert_eq!(block.len() as u64, header.slot_size());
        assert_eq!(decode_block(&block).unwrap(), data);
        verify_block_padding(&block).unwrap();
    }

    #[test]
    fn test_incompressible_block_is_stored() {
        let data: Vec<u8> = (0..200u32)
            .map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8)
            .collect();
        let block = encode_block(&data[..3], DEFAULT_COMPRESSION_LEVEL).unwrap();
        let header = BlockHeader::parse(&block).unwrap();
        assert!(header.is_stored());
        assert_eq!(header.compressed_size, STORED_BLOCK_MARKER);
        assert_eq!(header.payload_size(), 3);
        assert_eq!(block.len(), 128);
        assert_eq!(decode_block(&block).unwrap(), &data[..3]);
    }

    #[test]
    fn test_empty_block() {
        let block = encode_block(&[], DEFAULT_COMPRESSION_LEVEL).unwrap();
        assert_eq!(block.len(), 128);
        assert!(decode_block(&block).unwrap().is_empty());
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let data = vec![0u8; BLOCK_PAYLOAD_SIZE as usize + 1];
        assert!(encode_block(&data, 6).is_err());
    }

    #[test]
    fn test_partial_decode() {
        let data: Vec<u8> = (0..16_000u32).map(|i| (i % 251) as u8).collect();
        let block = encode_block(&data, 9).unwrap();
        let mut out = [0u8; 100];
        assert_eq!(decode_block_into(&block, 15_950, &mut out).unwrap(), 50);
        assert_eq!(&out[..50], &data[15_950..]);
        assert_eq!(decode_block_into(&block, 16_000, &mut out).unwrap(), 0);
    }

    #[test]
    fn test_truncated_payload_tolerated() {
        let data: Vec<u8> = (0..8000u32).map(|i| (i % 7) as u8).collect();
        let block = encode_block(&data, 6).unwrap();
        let header = BlockHeader::parse(&block).unwrap();
        let cut = &block[..(header.used_size() as usize) / 2 + 8];
        let mut out = vec![0u8; data.len()];
        let written = decode_block_into(cut, 0, &mut out).unwrap();
        assert!(written < data.len());
        assert_eq!(&out[..written], &data[..written]);
    }

    #[test]
    fn test_bad_padding_detected() {
        let mut block = encode_block(b"hello", 6).unwrap();
        let last = block.len() - 1;
        block[last] = 1;
        assert!(verify_block_padding(&block).is_err());
    }

    #[test]
    fn test_worst_case_size() {
        assert_eq!(worst_case_block_size(0), 128);
        assert_eq!(worst_case_block_size(112), 128);
        assert_eq!(worst_case_block_size(113), 256);
        assert_eq!(worst_case_block_size(16_000), 16_128);
    }

    proptest! {
        #[test]
        fn block_never_exceeds_worst_case(data in prop::collection::vec(any::<u8>(), 0..2048)) {
            let block = encode_block(&data, 6).unwrap();
            prop_assert!(block.len() as u64 <= worst_case_block_size(data.len() as u64));
            prop_assert_eq!(decode_block(&block).unwrap(), data);
        }
    }
}
