//! Allocation granularity and fixed-size chunk iteration
//!
//! Every entry, block and table in a data file starts on a 128-byte
//! boundary, and every block holds at most [`BLOCK_PAYLOAD_SIZE`] bytes of
//! source data. Encoders and decoders both derive block boundaries from
//! [`chunks`], so the two sides always agree.

/// Allocation unit of data files and packed entries
pub const ALIGNMENT: u64 = 128;

/// Largest amount of source data a single block carries
pub const BLOCK_PAYLOAD_SIZE: u64 = 16_000;

/// Result of rounding a size up to a granularity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Alignment {
    /// Number of granules needed
    pub count: u64,
    /// `count * granularity`
    pub allocated_size: u64,
    /// Bytes added after the original size
    pub padding: u64,
}

/// Round `size` up to a multiple of `granularity`
///
/// A zero granularity is treated as one.
///
/// ```
/// use sqpack_formats::align::align;
///
/// let a = align(130, 128);
/// assert_eq!((a.count, a.allocated_size, a.padding), (2, 256, 126));
/// ```
pub const fn align(size: u64, granularity: u64) -> Alignment {
    let granularity = if granularity == 0 { 1 } else { granularity };
    let count = size.div_ceil(granularity);
    let allocated_size = count * granularity;
    Alignment {
        count,
        allocated_size,
        padding: allocated_size - size,
    }
}

/// Round `size` up to the 128-byte allocation unit
pub const fn align_to_unit(size: u64) -> Alignment {
    align(size, ALIGNMENT)
}

/// One window produced by [`chunks`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Chunk {
    /// Zero-based position of the chunk
    pub index: usize,
    /// Offset of the chunk inside the walked range
    pub offset: u64,
    /// Chunk length; only the last one may be shorter than the chunk size
    pub size: u64,
}

/// Iterator over fixed-size windows of `[0, size)`
#[derive(Debug, Clone)]
pub struct Chunks {
    size: u64,
    chunk_size: u64,
    next_offset: u64,
    next_index: usize,
}

impl Iterator for Chunks {
    type Item = Chunk;

    fn next(&mut self) -> Option<Chunk> {
        if self.chunk_size == 0 || self.next_offset >= self.size {
            return None;
        }
        let chunk = Chunk {
            index: self.next_index,
            offset: self.next_offset,
            size: (self.size - self.next_offset).min(self.chunk_size),
        };
        self.next_offset += chunk.size;
        self.next_index += 1;
        Some(chunk)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = if self.chunk_size == 0 {
            0
        } else {
            (self.size.saturating_sub(self.next_offset)).div_ceil(self.chunk_size) as usize
        };
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for Chunks {}

/// Walk `[0, size)` in windows of `chunk_size`
///
/// An empty range yields nothing.
pub const fn chunks(size: u64, chunk_size: u64) -> Chunks {
    Chunks {
        size,
        chunk_size,
        next_offset: 0,
        next_index: 0,
    }
}

/// Number of blocks needed for `size` bytes at the default payload size
pub const fn block_count(size: u64) -> u64 {
    size.div_ceil(BLOCK_PAYLOAD_SIZE)
}

/// Callback form of [`chunks`], stopping at the first error
pub fn try_for_each_chunk<E, F>(size: u64, chunk_size: u64, mut f: F) -> Result<(), E>
where
    F: FnMut(Chunk) -> Result<(), E>,
{
    for chunk in chunks(size, chunk_size) {
        f(chunk)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_align_exact_multiple() {
        let a = align(256, 128);
        assert_eq!(a.count, 2);
        assert_eq!(a.allocated_size, 256);
        assert_eq!(a.padding, 0);
    }

    #[test]
    fn test_align_zero() {
        let a = align_to_unit(0);
        assert_eq!(
            a,
            Alignment {
                count: 0,
                allocated_size: 0,
                padding: 0
            }
        );
    }

    #[test]
    fn test_chunks_with_remainder() {
        let all: Vec<Chunk> = chunks(35_000, BLOCK_PAYLOAD_SIZE).collect();
        assert_eq!(all.len(), 3);
        assert_eq!(
            all[2],
            Chunk {
                index: 2,
                offset: 32_000,
                size: 3_000
            }
        );
        assert_eq!(chunks(35_000, BLOCK_PAYLOAD_SIZE).len(), 3);
    }

    #[test]
    fn test_chunks_empty_range() {
        assert_eq!(chunks(0, BLOCK_PAYLOAD_SIZE).count(), 0);
        assert_eq!(chunks(10, 0).count(), 0);
        assert_eq!(block_count(0), 0);
        assert_eq!(block_count(16_001), 2);
    }

    #[test]
    fn test_try_for_each_chunk_stops_on_error() {
        let mut seen = Vec::new();
        let result: Result<(), usize> = try_for_each_chunk(50, 10, |c| {
            seen.push(c.index);
            if c.index == 2 { Err(c.index) } else { Ok(()) }
        });
        assert_eq!(result, Err(2));
        assert_eq!(seen, vec![0, 1, 2]);
    }
}
