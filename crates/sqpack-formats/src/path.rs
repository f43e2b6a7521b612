//! Entry identity inside an archive
//!
//! An entry can be known by its `(path_hash, name_hash)` pair (index1), by
//! its full path hash (index2), by its path text, or by any combination.
//! Entries read from an archive usually carry hashes only; entries added
//! from disk carry all three.

use sqpack_crypto::{normalize_path, path_hash};
use std::fmt;

/// Hash identity of a file, with the path text when it is known
#[derive(Debug, Clone, Default)]
pub struct PathSpec {
    pair: Option<(u32, u32)>,
    full: Option<u32>,
    text: Option<String>,
}

/// Split a normalized path at its last separator
fn split_path(normalized: &str) -> (&str, &str) {
    match normalized.rfind('/') {
        Some(pos) => (&normalized[..pos], &normalized[pos + 1..]),
        None => ("", normalized),
    }
}

impl PathSpec {
    /// Build a spec from path text, computing every hash kind
    pub fn new(text: &str) -> Self {
        let normalized = normalize_path(text);
        let (dir, name) = split_path(&normalized);
        Self {
            pair: Some((path_hash(dir), path_hash(name))),
            full: Some(path_hash(&normalized)),
            text: Some(normalized),
        }
    }

    /// Spec known only by its index1 key
    pub const fn from_pair(path_hash: u32, name_hash: u32) -> Self {
        Self {
            pair: Some((path_hash, name_hash)),
            full: None,
            text: None,
        }
    }

    /// Spec known only by its index2 key
    pub const fn from_full(full_path_hash: u32) -> Self {
        Self {
            pair: None,
            full: Some(full_path_hash),
            text: None,
        }
    }

    /// Spec known by both keys but without text
    pub const fn from_hashes(path_hash: u32, name_hash: u32, full_path_hash: u32) -> Self {
        Self {
            pair: Some((path_hash, name_hash)),
            full: Some(full_path_hash),
            text: None,
        }
    }

    /// Hash of the directory part
    pub fn path_hash(&self) -> Option<u32> {
        self.pair.map(|(path, _)| path)
    }

    /// Hash of the file name part
    pub fn name_hash(&self) -> Option<u32> {
        self.pair.map(|(_, name)| name)
    }

    /// `(path_hash, name_hash)` pair
    pub const fn pair(&self) -> Option<(u32, u32)> {
        self.pair
    }

    /// Hash of the whole path
    pub const fn full_path_hash(&self) -> Option<u32> {
        self.full
    }

    /// Normalized path text
    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    /// Directory part of the text, empty for top-level files
    pub fn parent(&self) -> Option<&str> {
        self.text.as_deref().map(|t| split_path(t).0)
    }

    /// File name part of the text
    pub fn file_name(&self) -> Option<&str> {
        self.text.as_deref().map(|t| split_path(t).1)
    }

    /// Whether both index keys are present
    pub const fn has_both_hashes(&self) -> bool {
        self.pair.is_some() && self.full.is_some()
    }

    /// Merge the hash kinds of `other` into this spec
    ///
    /// Only kinds this spec lacks are taken; existing values are kept.
    pub fn merge_hashes(&mut self, other: &Self) {
        if self.pair.is_none() {
            self.pair = other.pair;
        }
        if self.full.is_none() {
            self.full = other.full;
        }
    }

    /// True when any hash kind both sides carry is equal
    pub fn matches_any(&self, other: &Self) -> bool {
        if let (Some(a), Some(b)) = (&self.text, &other.text)
            && a == b
        {
            return true;
        }
        matches!((self.pair, other.pair), (Some(a), Some(b)) if a == b)
            || matches!((self.full, other.full), (Some(a), Some(b)) if a == b)
    }

    /// Attach path text to a hash-only spec
    ///
    /// The text is accepted only when it hashes to every value already held.
    /// Missing hash kinds are filled in from the text. Returns whether the
    /// spec changed.
    pub fn upgrade(&mut self, text: &str) -> bool {
        if self.text.is_some() {
            return false;
        }
        let candidate = Self::new(text);
        if let Some(pair) = self.pair
            && candidate.pair != Some(pair)
        {
            return false;
        }
        if let Some(full) = self.full
            && candidate.full != Some(full)
        {
            return false;
        }
        *self = candidate;
        true
    }
}

impl PartialEq for PathSpec {
    fn eq(&self, other: &Self) -> bool {
        if let (Some(a), Some(b)) = (&self.text, &other.text) {
            return a == b;
        }

        let mut shared = false;
        if let (Some(a), Some(b)) = (self.pair, other.pair) {
            if a != b {
                return false;
            }
            shared = true;
        }
        if let (Some(a), Some(b)) = (self.full, other.full) {
            if a != b {
                return false;
            }
            shared = true;
        }
        shared
    }
}

impl From<&str> for PathSpec {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl fmt::Display for PathSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(text) = &self.text {
            return f.write_str(text);
        }
        match (self.pair, self.full) {
            (Some((path, name)), Some(full)) => write!(f, "~{path:08x}/{name:08x} ({full:08x})"),
            (Some((path, name)), None) => write!(f, "~{path:08x}/{name:08x}"),
            (None, Some(full)) => write!(f, "~{full:08x}"),
            (None, None) => f.write_str("~"),
        }
    }
}
