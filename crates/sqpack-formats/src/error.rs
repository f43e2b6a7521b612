//! Format error types

use thiserror::Error;

/// Error raised while parsing, building or decoding SqPack structures
#[derive(Debug, Error)]
pub enum FormatError {
    /// Structure is inconsistent with itself or with the bytes around it
    #[error("corrupt data: {0}")]
    CorruptData(String),

    /// Deflate stream could not be produced or consumed
    #[error("compression error: {0}")]
    Compression(String),

    /// Caller passed a value the format cannot represent
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Path does not fit in a text locator
    #[error("path too long for text locator ({len} bytes, max {max}): {path}")]
    PathTooLong {
        /// Offending path
        path: String,
        /// Its length in bytes
        len: usize,
        /// Largest length that fits
        max: usize,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Binary parsing error
    #[error("binary parsing error: {0}")]
    BinRw(#[from] binrw::Error),
}

impl FormatError {
    /// Shorthand for a [`FormatError::CorruptData`] with a formatted message
    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        Self::CorruptData(msg.into())
    }

    /// Rebuild an equivalent error from a stored one
    ///
    /// Keeps the variant, and with it [`FormatError::is_corruption`], for
    /// failures cached behind a shared reference. Binary parsing errors are
    /// not cloneable and come back as [`FormatError::CorruptData`].
    pub fn replay(&self) -> Self {
        match self {
            Self::CorruptData(msg) => Self::CorruptData(msg.clone()),
            Self::Compression(msg) => Self::Compression(msg.clone()),
            Self::InvalidArgument(msg) => Self::InvalidArgument(msg.clone()),
            Self::PathTooLong { path, len, max } => Self::PathTooLong {
                path: path.clone(),
                len: *len,
                max: *max,
            },
            Self::Io(e) => Self::Io(std::io::Error::new(e.kind(), e.to_string())),
            Self::BinRw(e) => Self::CorruptData(e.to_string()),
        }
    }

    /// Whether this error signals damaged archive content
    pub fn is_corruption(&self) -> bool {
        matches!(self, Self::CorruptData(_) | Self::Compression(_) | Self::BinRw(_))
    }
}

/// Result type for format operations
pub type FormatResult<T> = Result<T, FormatError>;
