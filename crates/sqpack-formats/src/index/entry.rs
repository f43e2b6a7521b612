//! Index table records

use crate::error::{FormatError, FormatResult};
use crate::header::IndexType;
use crate::locator::DataLocator;
use crate::path::PathSpec;
use binrw::{BinRead, BinWrite};
use std::fmt::Debug;
use std::hash::Hash;

/// Size of the NUL-padded path field of a text locator
pub const TEXT_PATH_SIZE: usize = 0xF0;

/// Longest path a text locator can hold (one byte is kept for the NUL)
pub const MAX_TEXT_PATH_LEN: usize = TEXT_PATH_SIZE - 1;

/// Key value used by terminator text locators
const TERMINATOR_HASH: u32 = 0xFFFF_FFFF;

/// Index1 record: `(path_hash, name_hash)` to locator
#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq)]
#[brw(little)]
pub struct PairHashLocator {
    /// Hash of the file name
    pub name_hash: u32,
    /// Hash of the directory
    pub path_hash: u32,
    /// Entry location or [`DataLocator::SYNONYM`]
    #[brw(pad_after = 4)]
    pub locator: DataLocator,
}

/// Index2 record: full path hash to locator
#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq)]
#[brw(little)]
pub struct FullHashLocator {
    /// Hash of the whole path
    pub full_path_hash: u32,
    /// Entry location or [`DataLocator::SYNONYM`]
    pub locator: DataLocator,
}

/// Index1 collision record carrying the literal path
#[derive(BinRead, BinWrite, Debug, Clone, PartialEq, Eq)]
#[brw(little)]
pub struct PairTextLocator {
    /// Hash of the file name
    pub name_hash: u32,
    /// Hash of the directory
    pub path_hash: u32,
    /// Entry location
    pub locator: DataLocator,
    /// Position among the paths sharing this key
    pub conflict_index: u32,
    /// NUL-padded path
    pub path: [u8; TEXT_PATH_SIZE],
}

/// Index2 collision record carrying the literal path
#[derive(BinRead, BinWrite, Debug, Clone, PartialEq, Eq)]
#[brw(little)]
pub struct FullTextLocator {
    /// Hash of the whole path
    pub full_path_hash: u32,
    /// Unused, `0` when generated and `0xFFFFFFFF` in terminators
    pub unused_hash: u32,
    /// Entry location
    pub locator: DataLocator,
    /// Position among the paths sharing this key
    pub conflict_index: u32,
    /// NUL-padded path
    pub path: [u8; TEXT_PATH_SIZE],
}

/// Index1 record grouping the hash locators of one directory
#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq)]
#[brw(little)]
pub struct FolderLocator {
    /// Directory hash shared by the group
    pub path_hash: u32,
    /// Absolute offset of the group's first [`PairHashLocator`]
    pub pair_hash_locator_offset: u32,
    /// Byte size of the group
    #[brw(pad_after = 4)]
    pub pair_hash_locators_size: u32,
}

/// Size of a folder record
pub const FOLDER_LOCATOR_SIZE: usize = 16;

/// Encode a path into the fixed text field
fn encode_path(path: &str) -> FormatResult<[u8; TEXT_PATH_SIZE]> {
    let bytes = path.as_bytes();
    if bytes.len() > MAX_TEXT_PATH_LEN {
        return Err(FormatError::PathTooLong {
            path: path.to_string(),
            len: bytes.len(),
            max: MAX_TEXT_PATH_LEN,
        });
    }
    let mut field = [0u8; TEXT_PATH_SIZE];
    field[..bytes.len()].copy_from_slice(bytes);
    Ok(field)
}

/// Decode the fixed text field up to its first NUL
fn decode_path(field: &[u8; TEXT_PATH_SIZE]) -> String {
    let end = field.iter().position(|&b| b == 0).unwrap_or(TEXT_PATH_SIZE);
    String::from_utf8_lossy(&field[..end]).into_owned()
}

/// Hash table record of an index kind
pub trait HashEntry:
    for<'a> BinRead<Args<'a> = ()> + for<'a> BinWrite<Args<'a> = ()> + Copy + Debug + Send + Sync
{
    /// Lookup key
    type Key;
    /// Serialized size
    const SIZE: usize;

    /// Create a record
    fn new(key: Self::Key, locator: DataLocator) -> Self;
    /// Lookup key of this record
    fn key(&self) -> Self::Key;
    /// Stored locator
    fn locator(&self) -> DataLocator;
}

/// Text table record of an index kind
pub trait TextEntry:
    for<'a> BinRead<Args<'a> = ()> + for<'a> BinWrite<Args<'a> = ()> + Clone + Debug + Send + Sync
{
    /// Lookup key
    type Key;
    /// Serialized size
    const SIZE: usize = 0x100;

    /// Create a record, failing when the path does not fit
    fn new(
        key: Self::Key,
        locator: DataLocator,
        conflict_index: u32,
        path: &str,
    ) -> FormatResult<Self>;
    /// Lookup key of this record
    fn key(&self) -> Self::Key;
    /// Stored locator
    fn locator(&self) -> DataLocator;
    /// Position among colliding paths
    fn conflict_index(&self) -> u32;
    /// Stored path text
    fn path(&self) -> String;
    /// Whether this is a list terminator rather than a real entry
    fn is_terminator(&self) -> bool;
}

impl HashEntry for PairHashLocator {
    type Key = (u32, u32);
    const SIZE: usize = 16;

    fn new((path_hash, name_hash): (u32, u32), locator: DataLocator) -> Self {
        Self {
            name_hash,
            path_hash,
            locator,
        }
    }

    fn key(&self) -> (u32, u32) {
        (self.path_hash, self.name_hash)
    }

    fn locator(&self) -> DataLocator {
        self.locator
    }
}

impl HashEntry for FullHashLocator {
    type Key = u32;
    const SIZE: usize = 8;

    fn new(full_path_hash: u32, locator: DataLocator) -> Self {
        Self {
            full_path_hash,
            locator,
        }
    }

    fn key(&self) -> u32 {
        self.full_path_hash
    }

    fn locator(&self) -> DataLocator {
        self.locator
    }
}

impl TextEntry for PairTextLocator {
    type Key = (u32, u32);

    fn new(
        (path_hash, name_hash): (u32, u32),
        locator: DataLocator,
        conflict_index: u32,
        path: &str,
    ) -> FormatResult<Self> {
        Ok(Self {
            name_hash,
            path_hash,
            locator,
            conflict_index,
            path: encode_path(path)?,
        })
    }

    fn key(&self) -> (u32, u32) {
        (self.path_hash, self.name_hash)
    }

    fn locator(&self) -> DataLocator {
        self.locator
    }

    fn conflict_index(&self) -> u32 {
        self.conflict_index
    }

    fn path(&self) -> String {
        decode_path(&self.path)
    }

    fn is_terminator(&self) -> bool {
        self.name_hash == TERMINATOR_HASH && self.path_hash == TERMINATOR_HASH
    }
}

impl TextEntry for FullTextLocator {
    type Key = u32;

    fn new(
        full_path_hash: u32,
        locator: DataLocator,
        conflict_index: u32,
        path: &str,
    ) -> FormatResult<Self> {
        Ok(Self {
            full_path_hash,
            unused_hash: 0,
            locator,
            conflict_index,
            path: encode_path(path)?,
        })
    }

    fn key(&self) -> u32 {
        self.full_path_hash
    }

    fn locator(&self) -> DataLocator {
        self.locator
    }

    fn conflict_index(&self) -> u32 {
        self.conflict_index
    }

    fn path(&self) -> String {
        decode_path(&self.path)
    }

    fn is_terminator(&self) -> bool {
        self.full_path_hash == TERMINATOR_HASH && self.unused_hash == TERMINATOR_HASH
    }
}

/// Marker tying together the record types of one index file
pub trait IndexKind: Send + Sync + 'static {
    /// Lookup key, ordered the way the hash table is sorted
    type Key: Copy + Ord + Eq + Hash + Debug + Send + Sync;
    /// Hash table record
    type HashEntry: HashEntry<Key = Self::Key>;
    /// Text table record
    type TextEntry: TextEntry<Key = Self::Key>;

    /// Value of the index header's type field
    const INDEX_TYPE: IndexType;
    /// Whether the file carries a folder segment
    const HAS_FOLDERS: bool;
    /// Name used in diagnostics
    const NAME: &'static str;

    /// Key of `spec` in this index, if the spec carries that hash kind
    fn key_of(spec: &PathSpec) -> Option<Self::Key>;

    /// Rebuild a hash-only spec from a key
    fn spec_of(key: Self::Key) -> PathSpec;
}

/// `.index` files
#[derive(Debug, Clone, Copy, Default)]
pub struct PairHashKind;

/// `.index2` files
#[derive(Debug, Clone, Copy, Default)]
pub struct FullHashKind;

impl IndexKind for PairHashKind {
    type Key = (u32, u32);
    type HashEntry = PairHashLocator;
    type TextEntry = PairTextLocator;

    const INDEX_TYPE: IndexType = IndexType::Index1;
    const HAS_FOLDERS: bool = true;
    const NAME: &'static str = "index1";

    fn key_of(spec: &PathSpec) -> Option<(u32, u32)> {
        spec.pair()
    }

    fn spec_of((path_hash, name_hash): (u32, u32)) -> PathSpec {
        PathSpec::from_pair(path_hash, name_hash)
    }
}

impl IndexKind for FullHashKind {
    type Key = u32;
    type HashEntry = FullHashLocator;
    type TextEntry = FullTextLocator;

    const INDEX_TYPE: IndexType = IndexType::Index2;
    const HAS_FOLDERS: bool = false;
    const NAME: &'static str = "index2";

    fn key_of(spec: &PathSpec) -> Option<u32> {
        spec.full_path_hash()
    }

    fn spec_of(key: u32) -> PathSpec {
        PathSpec::from_full(key)
    }
}
