//! Hashing primitives for SqPack archives
//!
//! This crate provides the two hash families the SqPack format relies on:
//!
//! - **Path hashes**: a 32-bit CRC keyed on normalized paths, used by both
//!   index tables to locate entries
//! - **Digests**: SHA-1 checksums embedded in file headers and index segments
//!
//! # Examples
//!
//! ```
//! use sqpack_crypto::{path_hash, Sha1Digest};
//!
//! let name = path_hash("root.exl");
//! let same = path_hash("ROOT.EXL");
//! assert_eq!(name, same);
//!
//! let digest = Sha1Digest::from_data(b"abc");
//! assert_eq!(digest.to_hex(), "a9993e364706816aba3e25717850c26c9cd0d89d");
//! ```

#![warn(missing_docs)]

pub mod crc;
pub mod sha1;

pub use crc::{crc_hash, crc_update, normalize_byte, normalize_path, path_hash};
pub use sha1::{Sha1Digest, Sha1Hasher};
