//! Random-access byte streams
//!
//! Everything in the codec reads through [`RandomAccessStream`]: archive
//! files on disk, in-memory buffers, views into data files, and the packed
//! and unpacked entry streams built on top of them. Streams are immutable
//! after construction and may be shared across threads.

use crate::error::{FormatError, FormatResult};
use bytes::Bytes;
use memmap2::{Mmap, MmapOptions};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::sync::Arc;

/// Offset-addressable byte source
pub trait RandomAccessStream: Send + Sync {
    /// Total length in bytes
    fn size(&self) -> u64;

    /// Read up to `buf.len()` bytes starting at `offset`
    ///
    /// Returns the number of bytes read, which is short only when the end
    /// of the stream is reached. Reading at or past the end returns 0.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> FormatResult<usize>;

    /// Fill `buf` completely or fail with `UnexpectedEof`
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> FormatResult<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.read_at(offset + filled as u64, &mut buf[filled..])?;
            if n == 0 {
                return Err(FormatError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!(
                        "read of {} bytes at {offset:#x} ended after {filled} bytes",
                        buf.len()
                    ),
                )));
            }
            filled += n;
        }
        Ok(())
    }

    /// Read exactly `len` bytes into a new buffer
    fn read_vec(&self, offset: u64, len: usize) -> FormatResult<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Read whatever is available in `[offset, offset + len)`
    fn read_up_to(&self, offset: u64, len: usize) -> FormatResult<Vec<u8>> {
        let available = self.size().saturating_sub(offset).min(len as u64) as usize;
        let mut buf = vec![0u8; available];
        let mut filled = 0;
        while filled < available {
            let n = self.read_at(offset + filled as u64, &mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    /// Read the whole stream
    fn read_all(&self) -> FormatResult<Vec<u8>> {
        let size = self.size();
        let len = usize::try_from(size).map_err(|_| {
            FormatError::InvalidArgument(format!("stream of {size} bytes does not fit in memory"))
        })?;
        self.read_vec(0, len)
    }
}

/// Shared, type-erased stream handle
pub type SharedStream = Arc<dyn RandomAccessStream>;

impl<T: RandomAccessStream + ?Sized> RandomAccessStream for Arc<T> {
    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> FormatResult<usize> {
        (**self).read_at(offset, buf)
    }
}

/// Copy from a byte slice with stream semantics
pub(crate) fn read_from_slice(data: &[u8], offset: u64, buf: &mut [u8]) -> usize {
    let Ok(start) = usize::try_from(offset) else {
        return 0;
    };
    if start >= data.len() {
        return 0;
    }
    let n = buf.len().min(data.len() - start);
    buf[..n].copy_from_slice(&data[start..start + n]);
    n
}

/// Stream over an in-memory buffer
#[derive(Debug, Clone, Default)]
pub struct MemoryStream {
    data: Bytes,
}

impl MemoryStream {
    /// Wrap a buffer
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self { data: data.into() }
    }

    /// Underlying bytes
    pub const fn bytes(&self) -> &Bytes {
        &self.data
    }

    /// Wrap into a shared handle
    pub fn shared(data: impl Into<Bytes>) -> SharedStream {
        Arc::new(Self::new(data))
    }
}

impl RandomAccessStream for MemoryStream {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> FormatResult<usize> {
        Ok(read_from_slice(&self.data, offset, buf))
    }
}

/// Stream over a memory-mapped file
#[derive(Debug)]
pub struct MmapStream {
    mmap: Mmap,
}

impl MmapStream {
    /// Map `path` read-only
    ///
    /// Empty files cannot be mapped on every platform; callers should fall
    /// back to [`FileStream`] for those.
    pub fn open(path: &Path) -> FormatResult<Self> {
        let file = File::open(path)?;
        // Safety: the archive is opened read-only and treated as immutable
        #[allow(unsafe_code)]
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        Ok(Self { mmap })
    }
}

impl RandomAccessStream for MmapStream {
    fn size(&self) -> u64 {
        self.mmap.len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> FormatResult<usize> {
        Ok(read_from_slice(&self.mmap, offset, buf))
    }
}

/// Stream over a file using positional reads
#[derive(Debug)]
pub struct FileStream {
    file: Mutex<File>,
    size: u64,
}

impl FileStream {
    /// Open `path` for reading
    pub fn open(path: &Path) -> FormatResult<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            file: Mutex::new(file),
            size,
        })
    }
}

impl RandomAccessStream for FileStream {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> FormatResult<usize> {
        if offset >= self.size || buf.is_empty() {
            return Ok(0);
        }
        let want = buf.len().min((self.size - offset) as usize);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < want {
            let n = file.read(&mut buf[filled..want])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}

/// Window into another stream
#[derive(Clone)]
pub struct ViewStream {
    inner: SharedStream,
    offset: u64,
    size: u64,
}

impl ViewStream {
    /// View `size` bytes of `inner` starting at `offset`
    ///
    /// The window is clamped to the end of `inner`.
    pub fn new(inner: SharedStream, offset: u64, size: u64) -> Self {
        let size = size.min(inner.size().saturating_sub(offset));
        Self {
            inner,
            offset,
            size,
        }
    }

    /// Start of the window in the inner stream
    pub const fn offset(&self) -> u64 {
        self.offset
    }
}

impl std::fmt::Debug for ViewStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ViewStream")
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl RandomAccessStream for ViewStream {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> FormatResult<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let n = buf.len().min((self.size - offset) as usize);
        self.inner.read_at(self.offset + offset, &mut buf[..n])
    }
}

#[cfg(test)]
#[allow(clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_memory_stream_boundaries() {
        let stream = MemoryStream::new(b"hello world".to_vec());
        let mut buf = [0u8; 5];
        assert_eq!(stream.read_at(6, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");
        assert_eq!(stream.read_at(9, &mut buf).unwrap(), 2);
        assert_eq!(stream.read_at(11, &mut buf).unwrap(), 0);
        assert_eq!(stream.read_at(u64::MAX, &mut buf).unwrap(), 0);
        assert!(stream.read_exact_at(9, &mut buf).is_err());
        assert_eq!(stream.read_up_to(9, 10).unwrap(), b"ld");
    }

    #[test]
    fn test_view_stream() {
        let base = MemoryStream::shared(b"0123456789".to_vec());
        let view = ViewStream::new(base, 2, 5);
        assert_eq!(view.size(), 5);
        assert_eq!(view.read_all().unwrap(), b"23456");

        let mut buf = [0u8; 4];
        assert_eq!(view.read_at(3, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"56");
    }

    #[test]
    fn test_view_clamped_to_inner() {
        let base = MemoryStream::shared(b"0123".to_vec());
        let view = ViewStream::new(base, 2, 100);
        assert_eq!(view.size(), 2);
    }

    #[test]
    fn test_file_and_mmap_agree() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(5000).collect();
        file.write_all(&data).unwrap();
        file.flush().unwrap();

        let positional = FileStream::open(file.path()).unwrap();
        let mapped = MmapStream::open(file.path()).unwrap();
        assert_eq!(positional.size(), 5000);
        assert_eq!(positional.read_vec(1000, 300).unwrap(), &data[1000..1300]);
        assert_eq!(mapped.read_vec(1000, 300).unwrap(), &data[1000..1300]);

        let mut buf = [0u8; 10];
        assert_eq!(positional.read_at(4995, &mut buf).unwrap(), 5);
        assert_eq!(mapped.read_at(5000, &mut buf).unwrap(), 0);
    }
}
