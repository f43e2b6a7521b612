//! Archive reader
//!
//! Opens an index pair and its data files, validates their headers and
//! resolves paths or hashes to packed entries. Entries of both index files
//! are merged by locator, so an entry known to index1 by its pair hash and
//! to index2 by its full hash appears once with both hashes.

use crate::config::{IoMode, ReaderConfig};
use crate::{ArchiveError, ArchiveResult};
use sqpack_crypto::{Sha1Hasher, normalize_path, path_hash};
use sqpack_formats::header::{DATA_ENTRIES_OFFSET, HEADER_SIZE};
use sqpack_formats::index::{HashEntry, IndexLookup, TextEntry};
use sqpack_formats::{
    DataHeader, DataLocator, FileStream, MemoryStream, MmapStream, PackedFileStream, PathSpec,
    RandomAccessStream, SharedStream, SqIndex1, SqIndex2, SqPackHeader, SqPackType,
    UnpackingStream,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Chunk size used when hashing data files
const HASH_CHUNK_SIZE: usize = 1024 * 1024;

/// One entry of an opened archive
#[derive(Debug, Clone)]
pub struct ReaderEntry {
    /// Known hashes, and the path when an index stores it
    pub spec: PathSpec,
    /// Entry location
    pub locator: DataLocator,
}

/// Opened archive
pub struct SqPackReader {
    config: ReaderConfig,
    index1: Option<SqIndex1>,
    index2: Option<SqIndex2>,
    data_files: Vec<SharedStream>,
    data_headers: Vec<DataHeader>,
    // Sorted by locator
    entries: Vec<ReaderEntry>,
}

fn open_stream(path: &Path, mode: IoMode) -> ArchiveResult<SharedStream> {
    let stream: SharedStream = match mode {
        IoMode::Mmap => Arc::new(MmapStream::open(path)?),
        IoMode::Positional => Arc::new(FileStream::open(path)?),
        IoMode::Memory => MemoryStream::shared(std::fs::read(path)?),
    };
    Ok(stream)
}

fn index_paths(index_path: &Path) -> (PathBuf, PathBuf) {
    let is_index2 = index_path
        .extension()
        .is_some_and(|e| e.eq_ignore_ascii_case("index2"));
    if is_index2 {
        (index_path.with_extension("index"), index_path.to_path_buf())
    } else {
        (index_path.to_path_buf(), index_path.with_extension("index2"))
    }
}

/// Check the headers of one data file
fn check_data_file(
    stream: &dyn RandomAccessStream,
    index: usize,
    strict: bool,
) -> ArchiveResult<DataHeader> {
    let head = stream.read_up_to(0, DATA_ENTRIES_OFFSET as usize)?;
    if head.len() < DATA_ENTRIES_OFFSET as usize {
        return Err(ArchiveError::Corrupt(format!(
            "dat{index}: {} bytes is too short for its headers",
            head.len()
        )));
    }
    let sqpack = SqPackHeader::parse_with(&head[..HEADER_SIZE as usize], strict)?;
    if sqpack.file_type != SqPackType::Data {
        return Err(ArchiveError::Corrupt(format!(
            "dat{index}: file type is {:?}",
            sqpack.file_type
        )));
    }
    let header = DataHeader::parse_with(&head[HEADER_SIZE as usize..], strict)?;

    if strict {
        if header.span_index as usize != index + 1 {
            return Err(ArchiveError::Corrupt(format!(
                "dat{index}: span index {} does not match its position",
                header.span_index
            )));
        }
        let end = DATA_ENTRIES_OFFSET.saturating_add(header.data_size);
        if end > stream.size() {
            return Err(ArchiveError::Corrupt(format!(
                "dat{index}: declares {} entry bytes, file has {}",
                header.data_size,
                stream.size().saturating_sub(DATA_ENTRIES_OFFSET)
            )));
        }
        if !header.data_sha1.is_zero() {
            let mut hasher = Sha1Hasher::new();
            let mut offset = DATA_ENTRIES_OFFSET;
            while offset < end {
                let len = ((end - offset) as usize).min(HASH_CHUNK_SIZE);
                hasher.update(&stream.read_vec(offset, len)?);
                offset += len as u64;
            }
            if hasher.finalize() != header.data_sha1 {
                return Err(ArchiveError::Corrupt(format!("dat{index}: entry checksum mismatch")));
            }
        }
    }
    Ok(header)
}

impl SqPackReader {
    /// Open the archive containing `index_path`
    ///
    /// Either index file may be given; the other one and the data files are
    /// found next to it. A missing sibling index is tolerated.
    pub fn open(index_path: impl AsRef<Path>, config: ReaderConfig) -> ArchiveResult<Self> {
        let (path1, path2) = index_paths(index_path.as_ref());
        let index1 = if path1.exists() {
            Some(open_stream(&path1, config.io_mode)?)
        } else {
            warn!("No index1 at {}", path1.display());
            None
        };
        let index2 = if path2.exists() {
            Some(open_stream(&path2, config.io_mode)?)
        } else {
            warn!("No index2 at {}", path2.display());
            None
        };
        if index1.is_none() && index2.is_none() {
            return Err(ArchiveError::NotFound(format!(
                "no index files at {}",
                index_path.as_ref().display()
            )));
        }

        let count = Self::declared_data_files(index1.as_ref(), index2.as_ref())?;
        let data_files = (0..count)
            .map(|i| open_stream(&path1.with_extension(format!("dat{i}")), config.io_mode))
            .collect::<ArchiveResult<Vec<_>>>()?;

        info!(
            "Opening {} with {} data files",
            path1.display(),
            data_files.len()
        );
        Self::from_streams(index1, index2, data_files, config)
    }

    /// Largest data file count either index header declares
    fn declared_data_files(
        index1: Option<&SharedStream>,
        index2: Option<&SharedStream>,
    ) -> ArchiveResult<usize> {
        let mut count = 0;
        for stream in [index1, index2].into_iter().flatten() {
            let head = stream.read_up_to(u64::from(HEADER_SIZE), HEADER_SIZE as usize)?;
            let header = sqpack_formats::IndexHeader::parse_with(&head, false)?;
            count = count.max(header.data_file_count() as usize);
        }
        Ok(count)
    }

    /// Open an archive from already opened streams
    pub fn from_streams(
        index1: Option<SharedStream>,
        index2: Option<SharedStream>,
        data_files: Vec<SharedStream>,
        config: ReaderConfig,
    ) -> ArchiveResult<Self> {
        let strict = config.strict;
        let index1 = index1
            .map(|s| SqIndex1::parse_with(&s.read_all()?, strict))
            .transpose()?;
        let index2 = index2
            .map(|s| SqIndex2::parse_with(&s.read_all()?, strict))
            .transpose()?;
        if index1.is_none() && index2.is_none() {
            return Err(ArchiveError::NotFound("archive has no index".to_string()));
        }

        let data_headers = data_files
            .iter()
            .enumerate()
            .map(|(i, s)| check_data_file(&**s, i, strict))
            .collect::<ArchiveResult<Vec<_>>>()?;

        let reader = Self {
            entries: Self::merge_entries(index1.as_ref(), index2.as_ref()),
            config,
            index1,
            index2,
            data_files,
            data_headers,
        };
        if strict {
            reader.cross_check()?;
        }
        debug!(
            "Archive has {} entries in {} data files",
            reader.entries.len(),
            reader.data_files.len()
        );
        Ok(reader)
    }

    fn merge_entries(index1: Option<&SqIndex1>, index2: Option<&SqIndex2>) -> Vec<ReaderEntry> {
        let mut merged: BTreeMap<DataLocator, PathSpec> = BTreeMap::new();
        for entry in index1.map(SqIndex1::entries).unwrap_or_default() {
            let spec = entry.path.as_deref().map_or_else(
                || PathSpec::from_pair(entry.key.0, entry.key.1),
                PathSpec::new,
            );
            match merged.get_mut(&entry.locator) {
                Some(existing) => existing.merge_hashes(&spec),
                None => {
                    merged.insert(entry.locator, spec);
                }
            }
        }
        for entry in index2.map(SqIndex2::entries).unwrap_or_default() {
            let spec = entry
                .path
                .as_deref()
                .map_or_else(|| PathSpec::from_full(entry.key), PathSpec::new);
            match merged.get_mut(&entry.locator) {
                Some(existing) => {
                    existing.merge_hashes(&spec);
                    if let Some(text) = spec.text() {
                        existing.upgrade(text);
                    }
                }
                None => {
                    merged.insert(entry.locator, spec);
                }
            }
        }
        merged
            .into_iter()
            .map(|(locator, spec)| ReaderEntry { spec, locator })
            .collect()
    }

    /// Strict consistency between both indexes and the data files
    fn cross_check(&self) -> ArchiveResult<()> {
        if let (Some(index1), Some(index2)) = (&self.index1, &self.index2) {
            if index1.entry_count() != index2.entry_count() {
                return Err(ArchiveError::Corrupt(format!(
                    "index1 has {} entries, index2 has {}",
                    index1.entry_count(),
                    index2.entry_count()
                )));
            }
            let mut locators1: Vec<DataLocator> =
                index1.entries().iter().map(|e| e.locator).collect();
            let mut locators2: Vec<DataLocator> =
                index2.entries().iter().map(|e| e.locator).collect();
            locators1.sort_unstable();
            locators2.sort_unstable();
            if locators1 != locators2 {
                return Err(ArchiveError::Corrupt(
                    "index1 and index2 point at different entries".to_string(),
                ));
            }
        }

        for entry in &self.entries {
            let file = entry.locator.data_file_index();
            let Some(header) = self.data_headers.get(file) else {
                return Err(ArchiveError::Corrupt(format!(
                    "entry {} refers to missing data file {file}",
                    entry.spec
                )));
            };
            if entry.locator.offset() < DATA_ENTRIES_OFFSET
                || entry.locator.offset() >= DATA_ENTRIES_OFFSET.saturating_add(header.data_size)
            {
                return Err(ArchiveError::Corrupt(format!(
                    "entry {} at {} lies outside its data file",
                    entry.spec, entry.locator
                )));
            }
        }
        Ok(())
    }

    /// Reader configuration
    pub const fn config(&self) -> &ReaderConfig {
        &self.config
    }

    /// Parsed index1, when present
    pub const fn index1(&self) -> Option<&SqIndex1> {
        self.index1.as_ref()
    }

    /// Parsed index2, when present
    pub const fn index2(&self) -> Option<&SqIndex2> {
        self.index2.as_ref()
    }

    /// Data file streams in span order
    pub fn data_files(&self) -> &[SharedStream] {
        &self.data_files
    }

    /// Every entry, ordered by locator
    pub fn entries(&self) -> &[ReaderEntry] {
        &self.entries
    }

    /// Entry stored at `locator`
    pub fn entry(&self, locator: DataLocator) -> Option<&ReaderEntry> {
        self.entries
            .binary_search_by_key(&locator, |e| e.locator)
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Resolve a spec, trying index1 then index2
    pub fn find(&self, spec: &PathSpec) -> ArchiveResult<DataLocator> {
        let mut synonym = false;
        if let Some(index1) = &self.index1 {
            match index1.find_spec(spec) {
                IndexLookup::Found(locator) => return Ok(locator),
                IndexLookup::Synonym => synonym = true,
                IndexLookup::Missing => {}
            }
        }
        if let Some(index2) = &self.index2 {
            match index2.find_spec(spec) {
                IndexLookup::Found(locator) => return Ok(locator),
                IndexLookup::Synonym => synonym = true,
                IndexLookup::Missing => {}
            }
        }
        if synonym {
            Err(ArchiveError::UnresolvableSynonym(spec.to_string()))
        } else {
            Err(ArchiveError::NotFound(spec.to_string()))
        }
    }

    /// Resolve a path
    pub fn find_path(&self, path: &str) -> ArchiveResult<DataLocator> {
        self.find(&PathSpec::new(path))
    }

    /// Entries directly inside directory `dir`
    ///
    /// Uses the folder table of index1; without index1 the merged entries
    /// are filtered by directory hash instead.
    pub fn list_folder(&self, dir: &str) -> ArchiveResult<Vec<ReaderEntry>> {
        let normalized = normalize_path(dir);
        let hash = path_hash(normalized.trim_end_matches('/'));

        let Some(index1) = &self.index1 else {
            return Ok(self
                .entries
                .iter()
                .filter(|e| e.spec.path_hash() == Some(hash))
                .cloned()
                .collect());
        };

        let mut listed = Vec::new();
        for record in index1.folder_entries(hash)? {
            let key = record.key();
            if record.locator().is_synonym() {
                listed.extend(
                    index1
                        .text_entries()
                        .iter()
                        .filter(|t| !t.is_terminator() && t.key() == key)
                        .map(|t| ReaderEntry {
                            spec: PathSpec::new(&t.path()),
                            locator: t.locator(),
                        }),
                );
            } else {
                let locator = record.locator();
                listed.push(self.entry(locator).cloned().unwrap_or_else(|| ReaderEntry {
                    spec: PathSpec::from_pair(key.0, key.1),
                    locator,
                }));
            }
        }
        Ok(listed)
    }

    /// Packed bytes of an entry
    pub fn packed_stream(&self, locator: DataLocator) -> ArchiveResult<PackedFileStream> {
        if locator.is_synonym() {
            return Err(ArchiveError::UnresolvableSynonym(locator.to_string()));
        }
        let data_file = self.data_files.get(locator.data_file_index()).ok_or_else(|| {
            ArchiveError::NotFound(format!("data file {} for {locator}", locator.data_file_index()))
        })?;
        Ok(PackedFileStream::stored(Arc::clone(data_file), locator.offset())?)
    }

    /// Decoded view of an entry
    pub fn unpacked_stream(&self, locator: DataLocator) -> ArchiveResult<UnpackingStream> {
        let packed: SharedStream = Arc::new(self.packed_stream(locator)?);
        Ok(UnpackingStream::new(packed)?)
    }

    /// Decoded contents of an entry
    pub fn read_file(&self, spec: &PathSpec) -> ArchiveResult<Vec<u8>> {
        let locator = self.find(spec)?;
        Ok(self.unpacked_stream(locator)?.read_all()?)
    }

    /// Decoded contents of the entry at `path`
    pub fn read_path(&self, path: &str) -> ArchiveResult<Vec<u8>> {
        self.read_file(&PathSpec::new(path))
    }

    /// Strictly check every block of an entry
    pub fn verify_entry(&self, locator: DataLocator) -> ArchiveResult<()> {
        Ok(self.unpacked_stream(locator)?.verify()?)
    }
}

impl std::fmt::Debug for SqPackReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqPackReader")
            .field("config", &self.config)
            .field("has_index1", &self.index1.is_some())
            .field("has_index2", &self.index2.is_some())
            .field("data_files", &self.data_files.len())
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_index_paths() {
        let (a, b) = index_paths(Path::new("/x/000000.win32.index"));
        assert_eq!(a, PathBuf::from("/x/000000.win32.index"));
        assert_eq!(b, PathBuf::from("/x/000000.win32.index2"));

        let (a, b) = index_paths(Path::new("/x/000000.win32.index2"));
        assert_eq!(a, PathBuf::from("/x/000000.win32.index"));
        assert_eq!(b, PathBuf::from("/x/000000.win32.index2"));
        assert_eq!(
            a.with_extension("dat3"),
            PathBuf::from("/x/000000.win32.dat3")
        );
    }

    #[test]
    fn test_short_data_file_rejected() {
        let stream = MemoryStream::new(vec![0u8; 100]);
        assert!(check_data_file(&stream, 0, false).unwrap_err().is_corruption());
    }

    #[test]
    fn test_no_index_rejected() {
        let err = SqPackReader::from_streams(None, None, Vec::new(), ReaderConfig::default())
            .unwrap_err();
        assert!(err.is_not_found());
    }
}
