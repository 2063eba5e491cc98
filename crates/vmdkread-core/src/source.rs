//! Physical byte sources backing extent files.
//!
//! Every extent file an image references is represented by a [`DataSource`]:
//! files the core opens itself by path are memory-mapped ([`MmapSource`]),
//! while caller-supplied streams are wrapped in a [`StreamSource`]. Extents
//! address their source through a [`SourcePool`] index so a single image
//! layer can span several files.

use crate::error::{Error, Result};
use memmap2::Mmap;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

/// A random-access byte source backing one extent file.
///
/// Reads are positioned and never move a shared cursor. A read starting at
/// or past the end of the source returns 0 bytes; a read straddling the end
/// returns the bytes that exist. Callers that need full-length reads check
/// the returned count.
pub trait DataSource: Send {
    /// Reads up to `buf.len()` bytes at `offset`, returning the number of
    /// bytes read.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize>;

    /// Returns the total size of the source in bytes.
    fn size(&mut self) -> Result<u64>;
}

/// A memory-mapped file source.
///
/// Used for every file the core opens itself by path. The operating system
/// manages caching and paging; concurrent read-only access from multiple
/// handles over the same file is safe.
pub struct MmapSource {
    mmap: Mmap,
    size: u64,
}

impl MmapSource {
    /// Opens a file and memory-maps it read-only.
    ///
    /// # Errors
    ///
    /// Returns an error if the file does not exist, cannot be opened, or
    /// cannot be mapped.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| Error::io(e, path))?;
        let metadata = file.metadata().map_err(|e| Error::io(e, path))?;
        let size = metadata.len();

        // Safety: the file was opened read-only and the map lives no longer
        // than this source. memmap2 supports zero-length maps, so empty
        // extent files need no special case here.
        let mmap = unsafe { Mmap::map(&file).map_err(|e| Error::io(e, path))? };

        Ok(Self { mmap, size })
    }

    /// Returns the size of the mapped file in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        self.size
    }

    /// Returns true if the mapped file is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl DataSource for MmapSource {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.size {
            return Ok(0);
        }
        let available = self.size - offset;
        let len = std::cmp::min(buf.len() as u64, available) as usize;
        let start = offset as usize;
        buf[..len].copy_from_slice(&self.mmap[start..start + len]);
        Ok(len)
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.size)
    }
}

/// Adapter exposing any `Read + Seek` stream as a [`DataSource`].
///
/// This is the entry point for caller-supplied byte streams: the stream is
/// moved into the adapter and released (dropped) only when the owning
/// handle is closed.
pub struct StreamSource<S> {
    inner: S,
}

impl<S: Read + Seek + Send> StreamSource<S> {
    /// Wraps a stream.
    pub fn new(inner: S) -> Self {
        Self { inner }
    }

    /// Returns the wrapped stream.
    pub fn into_inner(self) -> S {
        self.inner
    }
}

impl<S: Read + Seek + Send> DataSource for StreamSource<S> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.inner
            .seek(SeekFrom::Start(offset))
            .map_err(Error::io_simple)?;
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::io_simple(e)),
            }
        }
        Ok(filled)
    }

    fn size(&mut self) -> Result<u64> {
        self.inner.seek(SeekFrom::End(0)).map_err(Error::io_simple)
    }
}

/// How a pooled source entered the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceOrigin {
    /// The core opened the file itself and owns its lifetime.
    OpenedByCore,
    /// The caller supplied the source; it is only released on close.
    SuppliedByCaller,
}

struct PoolEntry {
    source: Box<dyn DataSource>,
    origin: SourceOrigin,
}

/// An ordered pool of byte sources addressed by extent records.
///
/// Extents reference their backing file by pool index, so a layer built
/// from a multi-extent descriptor carries one pool entry per extent data
/// file, in descriptor order.
#[derive(Default)]
pub struct SourcePool {
    entries: Vec<PoolEntry>,
}

impl SourcePool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a source to the pool, returning its index.
    pub fn push(&mut self, source: Box<dyn DataSource>, origin: SourceOrigin) -> usize {
        self.entries.push(PoolEntry { source, origin });
        self.entries.len() - 1
    }

    /// Returns the number of pooled sources.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the pool holds no sources.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the source at `index`.
    pub fn get_mut(&mut self, index: usize) -> Result<&mut dyn DataSource> {
        let count = self.entries.len();
        match self.entries.get_mut(index) {
            Some(entry) => Ok(entry.source.as_mut()),
            None => Err(Error::format(format!(
                "extent references source {index} but the pool holds {count}"
            ))),
        }
    }

    /// Counts pool entries by origin: `(opened_by_core, supplied_by_caller)`.
    pub fn origin_counts(&self) -> (usize, usize) {
        let core = self
            .entries
            .iter()
            .filter(|e| e.origin == SourceOrigin::OpenedByCore)
            .count();
        (core, self.entries.len() - core)
    }
}

impl std::fmt::Debug for SourcePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (core, caller) = self.origin_counts();
        f.debug_struct("SourcePool")
            .field("opened_by_core", &core)
            .field("supplied_by_caller", &caller)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};
    use tempfile::NamedTempFile;

    #[test]
    fn test_stream_source_read_at() {
        let data: Vec<u8> = (0u8..=255).collect();
        let mut source = StreamSource::new(Cursor::new(data));

        let mut buf = [0u8; 4];
        assert_eq!(source.read_at(10, &mut buf).unwrap(), 4);
        assert_eq!(buf, [10, 11, 12, 13]);
    }

    #[test]
    fn test_stream_source_short_read_at_end() {
        let mut source = StreamSource::new(Cursor::new(vec![1u8, 2, 3]));

        let mut buf = [0u8; 8];
        assert_eq!(source.read_at(1, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[2, 3]);
    }

    #[test]
    fn test_stream_source_read_past_end() {
        let mut source = StreamSource::new(Cursor::new(vec![0u8; 16]));

        let mut buf = [0u8; 4];
        assert_eq!(source.read_at(100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_stream_source_size() {
        let mut source = StreamSource::new(Cursor::new(vec![0u8; 1234]));
        assert_eq!(source.size().unwrap(), 1234);
    }

    #[test]
    fn test_mmap_source_read_at() {
        let mut file = NamedTempFile::new().expect("failed to create temp file");
        let pattern: Vec<u8> = (0u8..=255).cycle().take(1024).collect();
        file.write_all(&pattern).expect("failed to write test data");
        file.flush().expect("failed to flush");

        let mut source = MmapSource::open(file.path()).unwrap();
        assert_eq!(source.size().unwrap(), 1024);

        let mut buf = [0u8; 8];
        assert_eq!(source.read_at(256, &mut buf).unwrap(), 8);
        assert_eq!(buf, [0, 1, 2, 3, 4, 5, 6, 7]);
    }

    #[test]
    fn test_mmap_source_empty_file() {
        let file = NamedTempFile::new().expect("failed to create temp file");
        let mut source = MmapSource::open(file.path()).unwrap();
        assert!(source.is_empty());

        let mut buf = [0u8; 4];
        assert_eq!(source.read_at(0, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_mmap_source_nonexistent_file() {
        let result = MmapSource::open(Path::new("/nonexistent/path/disk-flat.vmdk"));
        assert!(result.is_err());
    }

    #[test]
    fn test_pool_indexing() {
        let mut pool = SourcePool::new();
        let a = pool.push(
            Box::new(StreamSource::new(Cursor::new(vec![0xAAu8; 4]))),
            SourceOrigin::OpenedByCore,
        );
        let b = pool.push(
            Box::new(StreamSource::new(Cursor::new(vec![0xBBu8; 4]))),
            SourceOrigin::SuppliedByCaller,
        );
        assert_eq!((a, b), (0, 1));
        assert_eq!(pool.len(), 2);

        let mut buf = [0u8; 1];
        pool.get_mut(b).unwrap().read_at(0, &mut buf).unwrap();
        assert_eq!(buf[0], 0xBB);

        assert!(pool.get_mut(2).is_err());
        assert_eq!(pool.origin_counts(), (1, 1));
    }
}
