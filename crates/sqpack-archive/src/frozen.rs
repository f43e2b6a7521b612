//! Generated archive streams
//!
//! A [`FrozenSqPack`] holds both serialized index files and one
//! [`FrozenDataFile`] per data span. Data files are never materialized:
//! reads are served from the 2048-byte header buffer, the packed entry
//! streams, and zeros for the alignment gaps between them.

use crate::cache::ExportCache;
use crate::config::GeneratorConfig;
use crate::{ArchiveError, ArchiveResult};
use bytes::Bytes;
use sqpack_crypto::Sha1Hasher;
use sqpack_formats::align::align_to_unit;
use sqpack_formats::header::DATA_ENTRIES_OFFSET;
use sqpack_formats::{
    DataHeader, DataLocator, FormatResult, MemoryStream, PackedFileStream, PathSpec,
    RandomAccessStream, SharedStream, SqPackFormat, SqPackHeader, SqPackType,
};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Buffer size for hashing and streaming large entries
const COPY_CHUNK_SIZE: usize = 1024 * 1024;

/// Entry of a frozen archive
#[derive(Debug, Clone)]
pub struct FrozenEntry {
    /// Identity the entry was added with
    pub spec: PathSpec,
    /// Assigned location
    pub locator: DataLocator,
    /// Packed bytes
    pub packed: Arc<PackedFileStream>,
}

/// Generated `.datN` file
pub struct FrozenDataFile {
    header: Bytes,
    // Sorted by offset, all at or after DATA_ENTRIES_OFFSET
    pieces: Vec<(u64, SharedStream)>,
    size: u64,
}

impl FrozenDataFile {
    /// Data file `index` holding `pieces` at their offsets
    ///
    /// With `strict` set the entry checksum is computed, which reads (and
    /// for lazily encoded entries, compresses) every entry once.
    pub fn new(
        index: usize,
        mut pieces: Vec<(u64, SharedStream)>,
        max_file_size: u64,
        strict: bool,
    ) -> ArchiveResult<Self> {
        pieces.sort_by_key(|(offset, _)| *offset);
        let size = pieces
            .last()
            .map_or(DATA_ENTRIES_OFFSET, |(offset, stream)| {
                offset + align_to_unit(stream.size()).allocated_size
            });

        let mut sqpack = SqPackHeader::new(SqPackType::Data);
        let mut data = DataHeader::new(index, size - DATA_ENTRIES_OFFSET, max_file_size);

        let mut file = Self {
            header: Bytes::new(),
            pieces,
            size,
        };
        if strict {
            data.data_sha1 = file.entry_digest()?;
            data.seal()?;
            sqpack.seal()?;
        }
        let mut header = sqpack.build()?;
        header.extend(data.build()?);
        file.header = header.into();

        debug!(
            "Data file {index}: {} entries, {} bytes",
            file.pieces.len(),
            file.size
        );
        Ok(file)
    }

    fn entry_digest(&self) -> FormatResult<sqpack_crypto::Sha1Digest> {
        let mut hasher = Sha1Hasher::new();
        let mut buf = vec![0u8; COPY_CHUNK_SIZE];
        let mut offset = DATA_ENTRIES_OFFSET;
        while offset < self.size {
            let len = ((self.size - offset) as usize).min(COPY_CHUNK_SIZE);
            self.fill(offset, &mut buf[..len])?;
            hasher.update(&buf[..len]);
            offset += len as u64;
        }
        Ok(hasher.finalize())
    }

    /// Number of entries
    pub fn entry_count(&self) -> usize {
        self.pieces.len()
    }

    /// Fill `out` with entry-area bytes starting at `offset`
    fn fill(&self, offset: u64, out: &mut [u8]) -> FormatResult<()> {
        let mut pos = 0;
        while pos < out.len() {
            let at = offset + pos as u64;
            let next = self.pieces.partition_point(|(start, _)| *start <= at);

            if let Some((start, stream)) = next.checked_sub(1).map(|i| &self.pieces[i])
                && at < start + stream.size()
            {
                let len = ((start + stream.size() - at) as usize).min(out.len() - pos);
                let target = &mut out[pos..pos + len];
                let n = stream.read_at(at - start, target)?;
                target[n..].fill(0);
                pos += len;
                continue;
            }

            // Gap up to the next entry
            let gap_end = self
                .pieces
                .get(next)
                .map_or(self.size, |(start, _)| *start)
                .min(offset + out.len() as u64);
            let len = (gap_end - at) as usize;
            out[pos..pos + len].fill(0);
            pos += len;
        }
        Ok(())
    }
}

impl RandomAccessStream for FrozenDataFile {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> FormatResult<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let n = buf.len().min((self.size - offset) as usize);
        let mut pos = 0;
        if offset < DATA_ENTRIES_OFFSET {
            let start = offset as usize;
            let len = n.min(self.header.len() - start);
            buf[..len].copy_from_slice(&self.header[start..start + len]);
            pos = len;
        }
        if pos < n {
            self.fill(offset + pos as u64, &mut buf[pos..n])?;
        }
        Ok(n)
    }
}

impl std::fmt::Debug for FrozenDataFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrozenDataFile")
            .field("entries", &self.pieces.len())
            .field("size", &self.size)
            .finish()
    }
}

/// Archive produced by [`VirtualSqPack::freeze`](crate::VirtualSqPack::freeze)
#[derive(Debug)]
pub struct FrozenSqPack {
    index1: Bytes,
    index2: Bytes,
    data_files: Vec<Arc<FrozenDataFile>>,
    entries: Vec<FrozenEntry>,
    config: GeneratorConfig,
}

impl FrozenSqPack {
    pub(crate) fn new(
        index1: Bytes,
        index2: Bytes,
        data_files: Vec<Arc<FrozenDataFile>>,
        entries: Vec<FrozenEntry>,
        config: GeneratorConfig,
    ) -> Self {
        Self {
            index1,
            index2,
            data_files,
            entries,
            config,
        }
    }

    /// `.index` contents
    pub fn index1(&self) -> SharedStream {
        MemoryStream::shared(self.index1.clone())
    }

    /// `.index2` contents
    pub fn index2(&self) -> SharedStream {
        MemoryStream::shared(self.index2.clone())
    }

    /// `.datN` streams in span order
    pub fn data_files(&self) -> Vec<SharedStream> {
        self.data_files
            .iter()
            .map(|file| {
                let stream: SharedStream = file.clone();
                stream
            })
            .collect()
    }

    /// Every entry in insertion order
    pub fn entries(&self) -> &[FrozenEntry] {
        &self.entries
    }

    /// Cache sized from the generator configuration
    pub fn export_cache(&self) -> ExportCache {
        ExportCache::new(
            self.config.export_cache_entries,
            self.config.export_small_entry_limit,
        )
    }

    /// Packed bytes of an entry, through `cache`
    ///
    /// Small entries go to the cache's LRU. Large entries are retained until
    /// the caller releases them with [`ExportCache::release_large`].
    pub fn entry_bytes(
        &self,
        entry: &FrozenEntry,
        cache: &mut ExportCache,
    ) -> ArchiveResult<Bytes> {
        let key = (entry.locator.data_file_index(), entry.locator.offset());
        if let Some(bytes) = cache.get(key) {
            return Ok(bytes);
        }
        let bytes = Bytes::from(entry.packed.read_all()?);
        if !cache.insert(key, bytes.clone()) {
            cache.retain_large(key, bytes.clone());
        }
        Ok(bytes)
    }

    /// Write `{name}.index`, `{name}.index2` and `{name}.datN` into `dir`
    ///
    /// Returns the written paths.
    pub fn export(
        &self,
        dir: impl AsRef<Path>,
        name: &str,
        cache: &mut ExportCache,
    ) -> ArchiveResult<Vec<PathBuf>> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;
        let mut written = Vec::with_capacity(self.data_files.len() + 2);

        for (ext, bytes) in [("index", &self.index1), ("index2", &self.index2)] {
            let path = dir.join(format!("{name}.{ext}"));
            std::fs::write(&path, bytes)?;
            written.push(path);
        }

        for (index, file) in self.data_files.iter().enumerate() {
            let path = dir.join(format!("{name}.dat{index}"));
            self.export_data_file(index, file, &path, cache)?;
            written.push(path);
        }

        let (hits, misses) = cache.stats();
        info!(
            "Exported {name} to {} ({} files, cache {hits} hits / {misses} misses)",
            dir.display(),
            written.len()
        );
        Ok(written)
    }

    fn export_data_file(
        &self,
        index: usize,
        file: &FrozenDataFile,
        path: &Path,
        cache: &mut ExportCache,
    ) -> ArchiveResult<()> {
        let mut out = BufWriter::new(File::create(path)?);
        out.write_all(&file.header)?;
        let mut position = DATA_ENTRIES_OFFSET;

        let mut entries: Vec<&FrozenEntry> = self
            .entries
            .iter()
            .filter(|e| e.locator.data_file_index() == index)
            .collect();
        entries.sort_by_key(|e| e.locator.offset());

        for entry in entries {
            let offset = entry.locator.offset();
            if offset < position {
                return Err(ArchiveError::Corrupt(format!(
                    "entry {} at {} overlaps its predecessor",
                    entry.spec, entry.locator
                )));
            }
            write_zeros(&mut out, offset - position)?;

            let bytes = self.entry_bytes(entry, cache)?;
            out.write_all(&bytes)?;
            cache.release_large((index, offset));

            let allocated = align_to_unit(bytes.len() as u64);
            write_zeros(&mut out, allocated.padding)?;
            position = offset + allocated.allocated_size;
        }
        write_zeros(&mut out, file.size().saturating_sub(position))?;
        out.flush()?;
        Ok(())
    }
}

fn write_zeros(out: &mut impl Write, mut count: u64) -> std::io::Result<()> {
    const ZEROS: [u8; 4096] = [0; 4096];
    while count > 0 {
        let n = count.min(ZEROS.len() as u64) as usize;
        out.write_all(&ZEROS[..n])?;
        count -= n as u64;
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use sqpack_formats::header::HEADER_SIZE;

    fn piece(len: usize, value: u8) -> SharedStream {
        MemoryStream::shared(vec![value; len])
    }

    #[test]
    fn test_layout_with_gaps() {
        let file = FrozenDataFile::new(
            2,
            vec![(2048 + 256, piece(10, 0xBB)), (2048, piece(200, 0xAA))],
            1 << 20,
            false,
        )
        .unwrap();
        assert_eq!(file.size(), 2048 + 256 + 128);
        assert_eq!(file.entry_count(), 2);

        let bytes = file.read_all().unwrap();
        assert_eq!(&bytes[..6], b"SqPack");
        assert!(bytes[2048..2248].iter().all(|&b| b == 0xAA));
        assert!(bytes[2248..2304].iter().all(|&b| b == 0));
        assert!(bytes[2304..2314].iter().all(|&b| b == 0xBB));
        assert!(bytes[2314..].iter().all(|&b| b == 0));

        let data = DataHeader::parse_with(&bytes[HEADER_SIZE as usize..], false).unwrap();
        assert_eq!(data.span_index, 3);
        assert_eq!(data.data_size, 256 + 128);
        assert!(data.data_sha1.is_zero());
    }

    #[test]
    fn test_partial_reads_cross_regions() {
        let file = FrozenDataFile::new(0, vec![(2048, piece(300, 7))], 1 << 20, false).unwrap();
        let all = file.read_all().unwrap();
        let mut buf = vec![0xFFu8; 1000];
        assert_eq!(file.read_at(1500, &mut buf).unwrap(), 1000);
        assert_eq!(buf, &all[1500..2500]);
        assert_eq!(file.read_at(file.size(), &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_strict_header_checksums() {
        let file = FrozenDataFile::new(0, vec![(2048, piece(100, 1))], 1 << 20, true).unwrap();
        let bytes = file.read_all().unwrap();
        let data = DataHeader::parse_with(&bytes[HEADER_SIZE as usize..], true).unwrap();
        assert_eq!(
            data.data_sha1,
            sqpack_crypto::Sha1Digest::from_data(&bytes[2048..])
        );
        SqPackHeader::parse_with(&bytes[..HEADER_SIZE as usize], true).unwrap();
    }

    #[test]
    fn test_empty_data_file() {
        let file = FrozenDataFile::new(0, Vec::new(), 1 << 20, false).unwrap();
        assert_eq!(file.size(), 2048);
        assert_eq!(file.read_all().unwrap().len(), 2048);
    }
}
