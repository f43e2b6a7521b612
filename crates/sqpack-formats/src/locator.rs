//! Data locators
//!
//! A locator packs the data file index and the entry offset into 32 bits:
//!
//! ```text
//! bit 0      synonym flag
//! bits 1..=3 data file index (0-7)
//! bits 4..31 offset / 8 (offsets are multiples of 128)
//! ```

use crate::align::ALIGNMENT;
use crate::error::{FormatError, FormatResult};
use binrw::{BinRead, BinWrite};
use std::fmt;

/// Maximum number of data files an index can address
pub const MAX_DATA_FILES: usize = 8;

/// Largest offset a locator can encode
pub const MAX_LOCATOR_OFFSET: u64 = (u32::MAX as u64 & !0xF) * 8;

/// Location of a packed entry in a data file
#[derive(BinRead, BinWrite, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
#[brw(little)]
pub struct DataLocator(pub u32);

impl DataLocator {
    /// Marker stored in hash tables when several paths share a hash
    pub const SYNONYM: Self = Self(0x0000_0001);

    /// Encode a data file index and byte offset
    pub fn new(data_file_index: usize, offset: u64) -> FormatResult<Self> {
        if data_file_index >= MAX_DATA_FILES {
            return Err(FormatError::InvalidArgument(format!(
                "data file index {data_file_index} exceeds {}",
                MAX_DATA_FILES - 1
            )));
        }
        if offset % ALIGNMENT != 0 {
            return Err(FormatError::InvalidArgument(format!(
                "entry offset {offset:#x} is not {ALIGNMENT}-byte aligned"
            )));
        }
        if offset > MAX_LOCATOR_OFFSET {
            return Err(FormatError::InvalidArgument(format!(
                "entry offset {offset:#x} exceeds locator range"
            )));
        }
        Ok(Self(((offset / 8) as u32) | ((data_file_index as u32) << 1)))
    }

    /// Raw stored value
    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Whether this locator must be resolved through the text table
    pub const fn is_synonym(self) -> bool {
        self.0 & 1 != 0
    }

    /// Index of the data file (`.datN`)
    pub const fn data_file_index(self) -> usize {
        ((self.0 >> 1) & 0x7) as usize
    }

    /// Byte offset of the entry inside its data file
    pub const fn offset(self) -> u64 {
        (self.0 & !0xF) as u64 * 8
    }
}

impl fmt::Debug for DataLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DataLocator({self})")
    }
}

impl fmt::Display for DataLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_synonym() {
            write!(f, "synonym")
        } else {
            write!(f, "dat{}:{:#x}", self.data_file_index(), self.offset())
        }
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let locator = DataLocator::new(3, 0x800).unwrap();
        assert_eq!(locator.raw(), 0x100 | (3 << 1));
        assert_eq!(locator.data_file_index(), 3);
        assert_eq!(locator.offset(), 0x800);
        assert!(!locator.is_synonym());
        assert_eq!(locator.to_string(), "dat3:0x800");
    }

    #[test]
    fn test_synonym() {
        assert!(DataLocator::SYNONYM.is_synonym());
        assert_eq!(DataLocator::SYNONYM.offset(), 0);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(DataLocator::new(8, 0).is_err());
        assert!(DataLocator::new(0, 100).is_err());
        assert!(DataLocator::new(0, MAX_LOCATOR_OFFSET + 128).is_err());
        assert!(DataLocator::new(7, MAX_LOCATOR_OFFSET).is_ok());
    }
}
