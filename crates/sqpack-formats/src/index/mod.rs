//! Index tables (`.index` and `.index2`)
//!
//! An index file is laid out as:
//!
//! ```text
//! [SqPackHeader][IndexHeader][hash locators][text locators][segment 3][folders]
//! ```
//!
//! Hash locators are sorted by key so lookups are a binary search. When two
//! different paths share a key, the hash locator holds
//! [`DataLocator::SYNONYM`] and the real locators live in the text locator
//! segment, sorted by path. Folder locators (index1 only) point at the run
//! of hash locators sharing one directory hash.
//!
//! # Examples
//!
//! ```
//! use sqpack_formats::index::{IndexLookup, SqIndex1};
//! use sqpack_formats::{DataLocator, PathSpec, SqPackFormat};
//!
//! let spec = PathSpec::new("exd/root.exl");
//! let key = spec.pair().unwrap_or_default();
//! let locator = DataLocator::new(0, 2048)?;
//!
//! let index = SqIndex1::from_entries(vec![(key, locator)], Vec::new(), 1, false)?;
//! let bytes = index.build()?;
//!
//! let parsed = SqIndex1::parse_with(&bytes, true)?;
//! assert_eq!(parsed.find(key, None), IndexLookup::Found(locator));
//! # Ok::<(), sqpack_formats::FormatError>(())
//! ```

pub mod entry;

pub use entry::{
    FOLDER_LOCATOR_SIZE, FolderLocator, FullHashKind, FullHashLocator, FullTextLocator, HashEntry,
    IndexKind, MAX_TEXT_PATH_LEN, PairHashKind, PairHashLocator, PairTextLocator, TEXT_PATH_SIZE,
    TextEntry,
};

use crate::SqPackFormat;
use crate::error::{FormatError, FormatResult};
use crate::header::{HEADER_SIZE, IndexHeader, SqPackHeader, SqPackType};
use crate::locator::DataLocator;
use crate::path::PathSpec;
use binrw::{BinRead, BinWrite, Endian};
use sqpack_crypto::Sha1Digest;
use std::io::Cursor;
use std::marker::PhantomData;
use tracing::debug;

/// Offset of the first segment in a generated index
const FIRST_SEGMENT_OFFSET: u32 = 2 * HEADER_SIZE;

/// Index1 (`.index`)
pub type SqIndex1 = SqIndex<PairHashKind>;

/// Index2 (`.index2`)
pub type SqIndex2 = SqIndex<FullHashKind>;

/// Outcome of a key lookup
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexLookup {
    /// Entry located
    Found(DataLocator),
    /// No entry with this key (or this path, for colliding keys)
    Missing,
    /// Key is shared by several paths and no path text was given
    Synonym,
}

/// One resolved entry of an index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry<K> {
    /// Lookup key
    pub key: K,
    /// Entry location
    pub locator: DataLocator,
    /// Path text, known only for colliding keys
    pub path: Option<String>,
}

/// Parsed or generated index file
#[derive(Debug, Clone)]
pub struct SqIndex<K: IndexKind> {
    sqpack_header: SqPackHeader,
    header: IndexHeader,
    hash_entries: Vec<K::HashEntry>,
    text_entries: Vec<K::TextEntry>,
    /// `(path, position in text_entries)` sorted by path, terminators removed
    text_lookup: Vec<(String, usize)>,
    unknown_segment: Vec<u8>,
    folders: Vec<FolderLocator>,
    _kind: PhantomData<K>,
}

fn read_records<T>(segment: &[u8], record_size: usize, what: &str) -> FormatResult<Vec<T>>
where
    T: for<'a> BinRead<Args<'a> = ()>,
{
    if segment.len() % record_size != 0 {
        return Err(FormatError::corrupt(format!(
            "{what} segment size {} is not a multiple of {record_size}",
            segment.len()
        )));
    }
    let count = segment.len() / record_size;
    let mut cursor = Cursor::new(segment);
    let mut records = Vec::with_capacity(count);
    for _ in 0..count {
        records.push(T::read_options(&mut cursor, Endian::Little, ())?);
    }
    Ok(records)
}

fn write_records<T>(records: &[T]) -> FormatResult<Vec<u8>>
where
    T: for<'a> BinWrite<Args<'a> = ()>,
{
    let mut cursor = Cursor::new(Vec::new());
    for record in records {
        record.write_options(&mut cursor, Endian::Little, ())?;
    }
    Ok(cursor.into_inner())
}

fn build_text_lookup<T: TextEntry>(entries: &[T]) -> Vec<(String, usize)> {
    let mut lookup: Vec<(String, usize)> = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| !e.is_terminator())
        .map(|(i, e)| (e.path(), i))
        .collect();
    lookup.sort_by(|a, b| a.0.cmp(&b.0));
    lookup
}

fn segment_len(len: usize, what: &str) -> FormatResult<u32> {
    u32::try_from(len).map_err(|_| {
        FormatError::InvalidArgument(format!("{what} segment of {len} bytes is too large"))
    })
}

impl<K: IndexKind> SqIndex<K> {
    /// Parse an index file
    ///
    /// With `strict` set, header and segment checksums are verified (when
    /// present), hash locators must be strictly ascending, text locators
    /// must be sorted by path and hash to their key, and every synonym must
    /// have at least one text locator.
    pub fn parse_with(data: &[u8], strict: bool) -> FormatResult<Self> {
        let sqpack_header = SqPackHeader::parse_with(data, strict)?;
        if sqpack_header.file_type != SqPackType::Index {
            return Err(FormatError::corrupt(format!(
                "{}: expected an index file, found {:?}",
                K::NAME,
                sqpack_header.file_type
            )));
        }

        let rest = data.get(HEADER_SIZE as usize..).unwrap_or_default();
        let header = IndexHeader::parse_with(rest, strict)?;
        if header.index_type != K::INDEX_TYPE as u32 {
            return Err(FormatError::corrupt(format!(
                "{}: index type {} does not match",
                K::NAME,
                header.index_type
            )));
        }

        let hash_bytes = header.hash_locators.slice(data, "hash locator")?;
        let text_bytes = header.text_locators.slice(data, "text locator")?;
        let unknown_bytes = header.unknown_segment.slice(data, "segment 3")?;
        let folder_bytes = header.folders.slice(data, "folder")?;

        if strict {
            header.hash_locators.verify(hash_bytes, "hash locator")?;
            header.text_locators.verify(text_bytes, "text locator")?;
            header.unknown_segment.verify(unknown_bytes, "segment 3")?;
            header.folders.verify(folder_bytes, "folder")?;
        }

        let hash_entries: Vec<K::HashEntry> =
            read_records(hash_bytes, K::HashEntry::SIZE, "hash locator")?;
        let text_entries: Vec<K::TextEntry> =
            read_records(text_bytes, K::TextEntry::SIZE, "text locator")?;
        let folders: Vec<FolderLocator> =
            read_records(folder_bytes, FOLDER_LOCATOR_SIZE, "folder")?;
        let text_lookup = build_text_lookup(&text_entries);

        let index = Self {
            sqpack_header,
            header,
            hash_entries,
            text_entries,
            text_lookup,
            unknown_segment: unknown_bytes.to_vec(),
            folders,
            _kind: PhantomData,
        };

        if strict {
            index.check_consistency()?;
        }

        debug!(
            "Parsed {}: {} hash locators, {} text locators, {} folders",
            K::NAME,
            index.hash_entries.len(),
            index.text_lookup.len(),
            index.folders.len()
        );
        Ok(index)
    }

    /// Structural checks run by strict parsing
    fn check_consistency(&self) -> FormatResult<()> {
        for pair in self.hash_entries.windows(2) {
            if pair[0].key() >= pair[1].key() {
                return Err(FormatError::corrupt(format!(
                    "{}: hash locators out of order at {:?}",
                    K::NAME,
                    pair[1].key()
                )));
            }
        }

        let mut previous: Option<String> = None;
        for entry in self.text_entries.iter().filter(|e| !e.is_terminator()) {
            let path = entry.path();
            if previous.as_ref().is_some_and(|p| p.as_str() > path.as_str()) {
                return Err(FormatError::corrupt(format!(
                    "{}: text locators out of order at {path}",
                    K::NAME
                )));
            }
            if K::key_of(&PathSpec::new(&path)) != Some(entry.key()) {
                return Err(FormatError::corrupt(format!(
                    "{}: text locator {path} does not hash to {:?}",
                    K::NAME,
                    entry.key()
                )));
            }
            previous = Some(path);
        }

        for entry in &self.hash_entries {
            if entry.locator().is_synonym()
                && !self
                    .text_entries
                    .iter()
                    .any(|t| !t.is_terminator() && t.key() == entry.key())
            {
                return Err(FormatError::corrupt(format!(
                    "{}: synonym {:?} has no text locator",
                    K::NAME,
                    entry.key()
                )));
            }
        }

        self.check_folders()
    }

    /// Check every folder record points at a run of its own directory hash
    fn check_folders(&self) -> FormatResult<()> {
        for folder in &self.folders {
            let run = self.folder_run(folder)?;
            if !run
                .iter()
                .all(|e| Self::folder_hash_of(e.key()) == Some(folder.path_hash))
            {
                return Err(FormatError::corrupt(format!(
                    "{}: folder {:08x} covers entries of another directory",
                    K::NAME,
                    folder.path_hash
                )));
            }
        }
        Ok(())
    }

    /// Directory hash of a key, for kinds that have one
    fn folder_hash_of(key: K::Key) -> Option<u32> {
        K::spec_of(key).path_hash()
    }

    /// Hash locators covered by a folder record
    fn folder_run(&self, folder: &FolderLocator) -> FormatResult<&[K::HashEntry]> {
        let base = self.header.hash_locators.offset;
        let start = folder
            .pair_hash_locator_offset
            .checked_sub(base)
            .map(|rel| rel as usize);
        let size = folder.pair_hash_locators_size as usize;
        let record = K::HashEntry::SIZE;
        match start {
            Some(start) if start % record == 0 && size % record == 0 => self
                .hash_entries
                .get(start / record..(start + size) / record)
                .ok_or_else(|| {
                    FormatError::corrupt(format!(
                        "{}: folder {:08x} points outside the hash locators",
                        K::NAME,
                        folder.path_hash
                    ))
                }),
            _ => Err(FormatError::corrupt(format!(
                "{}: folder {:08x} has misaligned range",
                K::NAME,
                folder.path_hash
            ))),
        }
    }

    /// Assemble an index from resolved records
    ///
    /// `hash_entries` pairs each key with its locator (or
    /// [`DataLocator::SYNONYM`]); `text_entries` lists the colliding paths.
    /// Both are sorted here. Folder records are derived for index1. With
    /// `with_checksums` set every header and segment SHA-1 is filled in.
    pub fn from_entries(
        hash_entries: Vec<(K::Key, DataLocator)>,
        text_entries: Vec<(K::Key, DataLocator, u32, String)>,
        data_file_count: usize,
        with_checksums: bool,
    ) -> FormatResult<Self> {
        let mut hash_entries: Vec<K::HashEntry> = hash_entries
            .into_iter()
            .map(|(key, locator)| K::HashEntry::new(key, locator))
            .collect();
        hash_entries.sort_by_key(|e| e.key());

        let mut sorted_text = text_entries;
        sorted_text.sort_by(|a, b| a.3.cmp(&b.3));
        let text_entries = sorted_text
            .iter()
            .map(|(key, locator, conflict, path)| {
                K::TextEntry::new(*key, *locator, *conflict, path)
            })
            .collect::<FormatResult<Vec<_>>>()?;

        let mut header = IndexHeader::new(K::INDEX_TYPE);
        let hash_size = segment_len(hash_entries.len() * K::HashEntry::SIZE, "hash locator")?;
        header.hash_locators.count = 1;
        header.hash_locators.offset = FIRST_SEGMENT_OFFSET;
        header.hash_locators.size = hash_size;

        let folders = if K::HAS_FOLDERS {
            Self::derive_folders(&hash_entries, FIRST_SEGMENT_OFFSET)
        } else {
            Vec::new()
        };

        let text_size = segment_len(text_entries.len() * K::TextEntry::SIZE, "text locator")?;
        header.text_locators.count = data_file_count as u32;
        header.text_locators.offset = FIRST_SEGMENT_OFFSET + hash_size;
        header.text_locators.size = text_size;

        header.unknown_segment.offset = header.text_locators.offset + text_size;

        let folder_size = segment_len(folders.len() * FOLDER_LOCATOR_SIZE, "folder")?;
        header.folders.offset = header.unknown_segment.offset;
        header.folders.size = folder_size;

        let mut index = Self {
            sqpack_header: SqPackHeader::new(SqPackType::Index),
            header,
            text_lookup: build_text_lookup(&text_entries),
            hash_entries,
            text_entries,
            unknown_segment: Vec::new(),
            folders,
            _kind: PhantomData,
        };

        if with_checksums {
            index.header.hash_locators.sha1 =
                Sha1Digest::from_data(&write_records(&index.hash_entries)?);
            index.header.text_locators.sha1 =
                Sha1Digest::from_data(&write_records(&index.text_entries)?);
            index.header.unknown_segment.sha1 = Sha1Digest::from_data(&index.unknown_segment);
            index.header.folders.sha1 = Sha1Digest::from_data(&write_records(&index.folders)?);
            index.header.seal()?;
            index.sqpack_header.seal()?;
        }

        Ok(index)
    }

    /// Group sorted hash locators by directory hash
    fn derive_folders(entries: &[K::HashEntry], segment_offset: u32) -> Vec<FolderLocator> {
        let record = K::HashEntry::SIZE as u32;
        let mut folders: Vec<FolderLocator> = Vec::new();
        for (i, entry) in entries.iter().enumerate() {
            let Some(path_hash) = Self::folder_hash_of(entry.key()) else {
                continue;
            };
            let offset = segment_offset + i as u32 * record;
            match folders.last_mut() {
                Some(folder) if folder.path_hash == path_hash => {
                    folder.pair_hash_locators_size += record;
                }
                _ => folders.push(FolderLocator {
                    path_hash,
                    pair_hash_locator_offset: offset,
                    pair_hash_locators_size: record,
                }),
            }
        }
        folders
    }

    /// Resolve a key, using `text` to disambiguate colliding paths
    pub fn find(&self, key: K::Key, text: Option<&str>) -> IndexLookup {
        let Ok(pos) = self.hash_entries.binary_search_by_key(&key, |e| e.key()) else {
            return IndexLookup::Missing;
        };
        let locator = self.hash_entries[pos].locator();
        if !locator.is_synonym() {
            return IndexLookup::Found(locator);
        }
        let Some(text) = text else {
            return IndexLookup::Synonym;
        };
        match self.find_text(text) {
            Some(entry) if entry.key() == key => IndexLookup::Found(entry.locator()),
            _ => IndexLookup::Missing,
        }
    }

    /// Resolve a spec by its key for this index kind
    pub fn find_spec(&self, spec: &PathSpec) -> IndexLookup {
        match K::key_of(spec) {
            Some(key) => self.find(key, spec.text()),
            None => IndexLookup::Missing,
        }
    }

    /// Look up a text locator by normalized path
    pub fn find_text(&self, path: &str) -> Option<&K::TextEntry> {
        self.text_lookup
            .binary_search_by(|(p, _)| p.as_str().cmp(path))
            .ok()
            .map(|pos| &self.text_entries[self.text_lookup[pos].1])
    }

    /// Every addressable entry: non-synonym hash locators plus text locators
    pub fn entries(&self) -> Vec<IndexEntry<K::Key>> {
        let direct = self
            .hash_entries
            .iter()
            .filter(|e| !e.locator().is_synonym())
            .map(|e| IndexEntry {
                key: e.key(),
                locator: e.locator(),
                path: None,
            });
        let texts = self.text_lookup.iter().map(|(path, i)| {
            let entry = &self.text_entries[*i];
            IndexEntry {
                key: entry.key(),
                locator: entry.locator(),
                path: Some(path.clone()),
            }
        });
        direct.chain(texts).collect()
    }

    /// Number of addressable entries
    pub fn entry_count(&self) -> usize {
        self.hash_entries
            .iter()
            .filter(|e| !e.locator().is_synonym())
            .count()
            + self.text_lookup.len()
    }

    /// Raw hash locators in file order
    pub fn hash_entries(&self) -> &[K::HashEntry] {
        &self.hash_entries
    }

    /// Raw text locators in file order, terminators included
    pub fn text_entries(&self) -> &[K::TextEntry] {
        &self.text_entries
    }

    /// Folder records (empty for index2)
    pub fn folders(&self) -> &[FolderLocator] {
        &self.folders
    }

    /// Hash locators of the directory with hash `path_hash`
    pub fn folder_entries(&self, path_hash: u32) -> FormatResult<&[K::HashEntry]> {
        match self.folders.binary_search_by_key(&path_hash, |f| f.path_hash) {
            Ok(pos) => self.folder_run(&self.folders[pos]),
            Err(_) => Ok(&[]),
        }
    }

    /// Index header
    pub const fn header(&self) -> &IndexHeader {
        &self.header
    }

    /// Common SqPack header
    pub const fn sqpack_header(&self) -> &SqPackHeader {
        &self.sqpack_header
    }

    /// Number of data files the index refers to
    pub const fn data_file_count(&self) -> u32 {
        self.header.data_file_count()
    }
}

impl<K: IndexKind> SqPackFormat for SqIndex<K> {
    fn parse(data: &[u8]) -> FormatResult<Self> {
        Self::parse_with(data, false)
    }

    fn build(&self) -> FormatResult<Vec<u8>> {
        let mut out = self.sqpack_header.build()?;
        out.extend_from_slice(&self.header.build()?);

        let segments = [
            (self.header.hash_locators.offset, write_records(&self.hash_entries)?),
            (self.header.text_locators.offset, write_records(&self.text_entries)?),
            (self.header.unknown_segment.offset, self.unknown_segment.clone()),
            (self.header.folders.offset, write_records(&self.folders)?),
        ];
        for (offset, bytes) in segments {
            if bytes.is_empty() {
                continue;
            }
            let offset = offset as usize;
            if out.len() < offset + bytes.len() {
                out.resize(offset + bytes.len(), 0);
            }
            out[offset..offset + bytes.len()].copy_from_slice(&bytes);
        }
        Ok(out)
    }
}
