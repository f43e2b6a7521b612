//! SHA-1 digests stored in SqPack headers and index segments

use binrw::{BinRead, BinWrite};
use sha1::{Digest, Sha1};
use std::fmt;

/// 20-byte SHA-1 digest as stored on disk
///
/// An all-zero digest marks a field that was never computed.
#[derive(BinRead, BinWrite, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Sha1Digest([u8; 20]);

impl Sha1Digest {
    /// Digest with every byte zero
    pub const ZERO: Self = Self([0u8; 20]);

    /// Create digest from raw bytes
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Compute the digest of `data`
    pub fn from_data(data: &[u8]) -> Self {
        let out: [u8; 20] = Sha1::digest(data).into();
        Self(out)
    }

    /// Parse digest from hex string
    pub fn from_hex(hex: &str) -> Result<Self, hex::FromHexError> {
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(hex, &mut bytes)?;
        Ok(Self(bytes))
    }

    /// Get raw bytes
    pub const fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Whether this field was left unset
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }

    /// Convert to hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Sha1Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Incremental SHA-1 over data that arrives in pieces
#[derive(Default, Clone)]
pub struct Sha1Hasher(Sha1);

impl Sha1Hasher {
    /// Start a new digest
    pub fn new() -> Self {
        Self(Sha1::new())
    }

    /// Feed more bytes
    pub fn update(&mut self, data: &[u8]) {
        self.0.update(data);
    }

    /// Finish and return the digest
    pub fn finalize(self) -> Sha1Digest {
        let out: [u8; 20] = self.0.finalize().into();
        Sha1Digest(out)
    }
}

impl fmt::Debug for Sha1Hasher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sha1Hasher").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use super::*;
    use binrw::BinReaderExt;
    use std::io::Cursor;

    #[test]
    fn test_digest_from_data() {
        let digest = Sha1Digest::from_data(b"abc");
        assert_eq!(digest.to_hex(), "a9993e364706816aba3e25717850c26c9cd0d89d");
        assert!(!digest.is_zero());
    }

    #[test]
    fn test_incremental_matches_oneshot() {
        let mut hasher = Sha1Hasher::new();
        hasher.update(b"a");
        hasher.update(b"bc");
        assert_eq!(hasher.finalize(), Sha1Digest::from_data(b"abc"));
    }

    #[test]
    fn test_zero_digest() {
        assert!(Sha1Digest::ZERO.is_zero());
        assert!(Sha1Digest::default().is_zero());
    }

    #[test]
    fn test_hex_round_trip() {
        let digest = Sha1Digest::from_data(b"sqpack");
        let parsed = Sha1Digest::from_hex(&digest.to_hex()).expect("valid hex");
        assert_eq!(parsed, digest);
        assert!(Sha1Digest::from_hex("zz").is_err());
    }

    #[test]
    fn test_binrw_read() {
        let mut cursor = Cursor::new([0xABu8; 20]);
        let digest: Sha1Digest = cursor.read_le().expect("read digest");
        assert_eq!(digest.as_bytes(), &[0xAB; 20]);
    }
}
