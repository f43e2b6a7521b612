//! Virtual archive assembly
//!
//! A [`VirtualSqPack`] collects entries, each a path identity plus either an
//! already packed entry (usually from another archive) or a raw file that
//! is encoded at freeze time. Entries live in an arena; the lookup maps
//! hold arena indices, so an entry keeps its slot when it is re-added with
//! more information.
//!
//! [`freeze`](VirtualSqPack::freeze) lays the entries out in data files,
//! resolves hash collisions and serializes both index files. Nothing can be
//! added afterwards.

use crate::config::GeneratorConfig;
use crate::frozen::{FrozenDataFile, FrozenEntry, FrozenSqPack};
use crate::reader::SqPackReader;
use crate::{ArchiveError, ArchiveResult};
use sqpack_formats::align::align_to_unit;
use sqpack_formats::header::DATA_ENTRIES_OFFSET;
use sqpack_formats::locator::MAX_DATA_FILES;
use sqpack_formats::{
    DataLocator, EncodeKind, PackedFileStream, PathSpec, RandomAccessStream, SharedStream,
    SqIndex1, SqIndex2, SqPackFormat,
};
use std::collections::{BTreeMap, HashMap};
use std::hash::Hash;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Content of an entry
#[derive(Clone)]
pub enum EntrySource {
    /// Entry that is already packed, stored as-is
    Packed(SharedStream),
    /// Unpacked file, encoded as `kind` when the archive is frozen
    Raw {
        /// File contents
        stream: SharedStream,
        /// Packed layout to produce
        kind: EncodeKind,
    },
}

impl std::fmt::Debug for EntrySource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Packed(stream) => f.debug_tuple("Packed").field(&stream.size()).finish(),
            Self::Raw { stream, kind } => f
                .debug_struct("Raw")
                .field("size", &stream.size())
                .field("kind", kind)
                .finish(),
        }
    }
}

/// What [`VirtualSqPack::add`] did; each variant carries the arena index
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddResult {
    /// New entry
    Added(usize),
    /// Existing entry got a new source
    Replaced(usize),
    /// Hash-only entry learned its path text
    Upgraded(usize),
    /// Entry already present and left untouched
    Existing(usize),
}

impl AddResult {
    /// Arena index of the affected entry
    pub const fn index(self) -> usize {
        match self {
            Self::Added(i) | Self::Replaced(i) | Self::Upgraded(i) | Self::Existing(i) => i,
        }
    }
}

#[derive(Debug)]
struct Entry {
    spec: PathSpec,
    source: EntrySource,
}

/// Archive under construction
#[derive(Debug)]
pub struct VirtualSqPack {
    config: GeneratorConfig,
    entries: Vec<Entry>,
    by_text: HashMap<String, usize>,
    by_pair: HashMap<(u32, u32), Vec<usize>>,
    by_full: HashMap<u32, Vec<usize>>,
    frozen: bool,
}

impl VirtualSqPack {
    /// Empty archive
    pub fn new(config: GeneratorConfig) -> Self {
        Self {
            config,
            entries: Vec::new(),
            by_text: HashMap::new(),
            by_pair: HashMap::new(),
            by_full: HashMap::new(),
            frozen: false,
        }
    }

    /// Generator configuration
    pub const fn config(&self) -> &GeneratorConfig {
        &self.config
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no entry was added
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether [`freeze`](Self::freeze) succeeded
    pub const fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// Identity of every entry in insertion order
    pub fn specs(&self) -> impl Iterator<Item = &PathSpec> {
        self.entries.iter().map(|e| &e.spec)
    }

    /// Add an entry, or update the one with the same identity
    ///
    /// An existing entry is matched by path text first, then by any hash
    /// both specs carry. Text given for a hash-only entry upgrades it in
    /// place. The source of an existing entry is only replaced when
    /// `overwrite` is set.
    pub fn add(
        &mut self,
        spec: PathSpec,
        source: EntrySource,
        overwrite: bool,
    ) -> ArchiveResult<AddResult> {
        if self.frozen {
            return Err(ArchiveError::AlreadyFrozen);
        }
        if spec.pair().is_none() && spec.full_path_hash().is_none() {
            return Err(ArchiveError::MissingHash {
                path: spec.to_string(),
                kind: "any",
            });
        }

        let Some(index) = self.find_existing(&spec) else {
            let index = self.entries.len();
            self.entries.push(Entry { spec, source });
            self.register(index);
            return Ok(AddResult::Added(index));
        };

        let entry = &mut self.entries[index];
        let upgraded = match spec.text() {
            Some(text) => entry.spec.upgrade(text),
            None => false,
        };
        entry.spec.merge_hashes(&spec);
        if overwrite {
            entry.source = source;
        }
        self.register(index);

        Ok(if upgraded {
            debug!("Upgraded entry {index} to {}", self.entries[index].spec);
            AddResult::Upgraded(index)
        } else if overwrite {
            AddResult::Replaced(index)
        } else {
            AddResult::Existing(index)
        })
    }

    /// Add a raw file, choosing its layout from the file extension
    pub fn add_raw(
        &mut self,
        path: &str,
        stream: SharedStream,
        overwrite: bool,
    ) -> ArchiveResult<AddResult> {
        let kind = EncodeKind::from_path(path);
        self.add(PathSpec::new(path), EntrySource::Raw { stream, kind }, overwrite)
    }

    /// Import every entry of an opened archive as a packed entry
    pub fn add_from_reader(
        &mut self,
        reader: &SqPackReader,
        overwrite: bool,
    ) -> ArchiveResult<Vec<AddResult>> {
        let mut results = Vec::with_capacity(reader.entries().len());
        for entry in reader.entries() {
            let packed: SharedStream = Arc::new(reader.packed_stream(entry.locator)?);
            results.push(self.add(entry.spec.clone(), EntrySource::Packed(packed), overwrite)?);
        }
        info!("Imported {} entries from archive", results.len());
        Ok(results)
    }

    fn find_existing(&self, spec: &PathSpec) -> Option<usize> {
        if let Some(text) = spec.text()
            && let Some(&index) = self.by_text.get(text)
        {
            return Some(index);
        }
        let by_full = spec
            .full_path_hash()
            .and_then(|full| self.by_full.get(&full))
            .into_iter()
            .flatten();
        let by_pair = spec
            .pair()
            .and_then(|pair| self.by_pair.get(&pair))
            .into_iter()
            .flatten();
        by_full
            .chain(by_pair)
            .copied()
            .find(|&i| self.entries[i].spec == *spec)
    }

    fn register(&mut self, index: usize) {
        fn push_unique<K: Eq + Hash>(map: &mut HashMap<K, Vec<usize>>, key: K, index: usize) {
            let slots = map.entry(key).or_default();
            if !slots.contains(&index) {
                slots.push(index);
            }
        }

        let spec = &self.entries[index].spec;
        if let Some(text) = spec.text() {
            self.by_text.insert(text.to_string(), index);
        }
        if let Some(pair) = spec.pair() {
            push_unique(&mut self.by_pair, pair, index);
        }
        if let Some(full) = spec.full_path_hash() {
            push_unique(&mut self.by_full, full, index);
        }
    }

    /// Lay out data files and build both indexes
    pub fn freeze(&mut self) -> ArchiveResult<FrozenSqPack> {
        if self.frozen {
            return Err(ArchiveError::AlreadyFrozen);
        }
        self.config.validate()?;
        let strict = self.config.strict;

        let packed = self.encode_entries()?;
        let placements = self.allocate(&packed)?;
        let data_file_count = placements
            .iter()
            .map(|(file, _)| file + 1)
            .max()
            .unwrap_or(1);

        let mut entries = Vec::with_capacity(self.entries.len());
        for ((entry, stream), &(file, offset)) in self.entries.iter().zip(packed).zip(&placements) {
            entries.push(FrozenEntry {
                spec: entry.spec.clone(),
                locator: DataLocator::new(file, offset)?,
                packed: stream,
            });
        }

        let (hash1, text1) = partition(&entries, PathSpec::pair, "pair", strict)?;
        let (hash2, text2) = partition(&entries, PathSpec::full_path_hash, "full path", strict)?;
        let index1 = SqIndex1::from_entries(hash1, text1, data_file_count, strict)?.build()?;
        let index2 = SqIndex2::from_entries(hash2, text2, data_file_count, strict)?.build()?;

        let data_files = (0..data_file_count)
            .map(|file| {
                let pieces = entries
                    .iter()
                    .filter(|e| e.locator.data_file_index() == file)
                    .map(|e| {
                        let stream: SharedStream = e.packed.clone();
                        (e.locator.offset(), stream)
                    })
                    .collect();
                FrozenDataFile::new(file, pieces, self.config.max_data_file_size, strict)
                    .map(Arc::new)
            })
            .collect::<ArchiveResult<Vec<_>>>()?;

        self.frozen = true;
        info!(
            "Froze {} entries into {} data files ({} + {} index bytes)",
            entries.len(),
            data_files.len(),
            index1.len(),
            index2.len()
        );
        Ok(FrozenSqPack::new(
            index1.into(),
            index2.into(),
            data_files,
            entries,
            self.config.clone(),
        ))
    }

    fn encode_entries(&self) -> ArchiveResult<Vec<Arc<PackedFileStream>>> {
        self.entries
            .iter()
            .map(|entry| {
                let packed = match &entry.source {
                    EntrySource::Packed(stream) => PackedFileStream::stored(Arc::clone(stream), 0)?,
                    EntrySource::Raw { stream, kind } => PackedFileStream::encode(
                        Arc::clone(stream),
                        *kind,
                        self.config.compression_level,
                        self.config.lazy_encoding,
                    )?,
                };
                Ok(Arc::new(packed))
            })
            .collect()
    }

    /// Data file index and offset of every entry, in arena order
    fn allocate(&self, packed: &[Arc<PackedFileStream>]) -> ArchiveResult<Vec<(usize, u64)>> {
        let max = self.config.max_data_file_size;
        let mut placements = Vec::with_capacity(packed.len());
        let mut file = 0;
        let mut end = DATA_ENTRIES_OFFSET;

        for (entry, stream) in self.entries.iter().zip(packed) {
            let size = align_to_unit(stream.size()).allocated_size;
            if DATA_ENTRIES_OFFSET + size > max {
                return Err(ArchiveError::EntryTooLarge {
                    path: entry.spec.to_string(),
                    size,
                    max,
                });
            }
            if end + size > max {
                debug!("Data file {file} closed at {end} bytes");
                file += 1;
                end = DATA_ENTRIES_OFFSET;
                if file >= MAX_DATA_FILES {
                    return Err(ArchiveError::TooManyDataFiles {
                        max: MAX_DATA_FILES,
                    });
                }
            }
            placements.push((file, end));
            end += size;
        }
        Ok(placements)
    }
}

type HashRecords<K> = Vec<(K, DataLocator)>;
type TextRecords<K> = Vec<(K, DataLocator, u32, String)>;

/// Group entries by one key kind, turning collisions into synonyms
///
/// Colliding entries are ordered by path text; their position is the
/// conflict index.
fn partition<K>(
    entries: &[FrozenEntry],
    key_of: fn(&PathSpec) -> Option<K>,
    kind: &'static str,
    strict: bool,
) -> ArchiveResult<(HashRecords<K>, TextRecords<K>)>
where
    K: Ord + Copy,
{
    let mut groups: BTreeMap<K, Vec<&FrozenEntry>> = BTreeMap::new();
    for entry in entries {
        match key_of(&entry.spec) {
            Some(key) => groups.entry(key).or_default().push(entry),
            None if strict => {
                return Err(ArchiveError::MissingHash {
                    path: entry.spec.to_string(),
                    kind,
                });
            }
            None => warn!("Entry {} has no {kind} hash, leaving it out of that index", entry.spec),
        }
    }

    let mut hashes = Vec::with_capacity(groups.len());
    let mut texts = Vec::new();
    for (key, members) in groups {
        if let [only] = members.as_slice() {
            hashes.push((key, only.locator));
            continue;
        }

        let mut named = members
            .iter()
            .map(|e| {
                e.spec
                    .text()
                    .map(|text| (text.to_string(), e.locator))
                    .ok_or_else(|| ArchiveError::UnresolvableSynonym(e.spec.to_string()))
            })
            .collect::<ArchiveResult<Vec<_>>>()?;
        named.sort();
        debug!("{} entries share a {kind} hash", named.len());

        hashes.push((key, DataLocator::SYNONYM));
        for (conflict, (text, locator)) in named.into_iter().enumerate() {
            texts.push((key, locator, conflict as u32, text));
        }
    }
    Ok((hashes, texts))
}
