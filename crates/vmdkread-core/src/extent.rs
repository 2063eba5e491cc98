//! Logical-to-physical extent translation.
//!
//! An [`Extent`] maps one contiguous range of the logical address space to
//! its physical backing: a byte range in a flat file, a grain table over a
//! sparse file, or nothing at all (zero extents). An [`ExtentSet`] is the
//! ordered, gap-free sequence of extents forming one image layer.
//!
//! Unallocated sparse grains are *holes*: at this level they read as
//! zeroes, but [`Extent::run_at`] reports them separately so the snapshot
//! chain can resolve them against ancestor layers first.

use crate::error::{Error, Result};
use crate::source::{DataSource, SourcePool};
use flate2::read::DeflateDecoder;
use std::io::Read;

/// One grain table entry of a sparse extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GrainEntry {
    /// No grain stored; the region defers to the parent layer.
    Unallocated,
    /// Grain explicitly zeroed; reads as zeroes, does not defer.
    Zeroed,
    /// Grain stored at this byte offset in the extent data file.
    Stored(u64),
}

/// Resolved grain table of a sparse extent.
#[derive(Debug, Clone)]
pub struct SparseGrains {
    grain_size: u64,
    entries: Vec<GrainEntry>,
    compressed: bool,
}

impl SparseGrains {
    /// Builds a grain table.
    ///
    /// `grain_size` is in bytes and must be non-zero; entries beyond the
    /// end of `entries` are treated as unallocated.
    pub fn new(grain_size: u64, entries: Vec<GrainEntry>, compressed: bool) -> Result<Self> {
        if grain_size == 0 {
            return Err(Error::format("grain size must be non-zero"));
        }
        Ok(Self {
            grain_size,
            entries,
            compressed,
        })
    }

    /// Grain size in bytes.
    pub fn grain_size(&self) -> u64 {
        self.grain_size
    }

    /// Number of grain table entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if the table holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the entry for `grain_index`; indexes beyond the table are
    /// unallocated.
    pub fn entry(&self, grain_index: u64) -> GrainEntry {
        usize::try_from(grain_index)
            .ok()
            .and_then(|i| self.entries.get(i).copied())
            .unwrap_or(GrainEntry::Unallocated)
    }
}

/// Physical backing of an extent. The set of kinds is closed by the format.
#[derive(Debug, Clone)]
pub enum ExtentKind {
    /// Raw bytes at a fixed base offset in the backing source.
    Flat { pool_index: usize, base_offset: u64 },
    /// Grain-table indirection into the backing source.
    Sparse {
        pool_index: usize,
        grains: SparseGrains,
    },
    /// Reads as zeroes; no backing storage.
    Zero,
}

/// A contiguous run within an extent: either backed by data or a hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Run {
    /// Length of the run in bytes.
    pub len: u64,
    /// True if the run is an unallocated sparse grain.
    pub is_hole: bool,
}

/// One physical backing segment covering part of the logical address space.
///
/// Immutable after construction; built by the descriptor and sparse-file
/// collaborators once the physical files are resolved.
#[derive(Debug, Clone)]
pub struct Extent {
    logical_start: u64,
    logical_size: u64,
    kind: ExtentKind,
}

impl Extent {
    /// Creates a flat extent reading from `base_offset` in its source.
    pub fn flat(
        logical_start: u64,
        logical_size: u64,
        pool_index: usize,
        base_offset: u64,
    ) -> Result<Self> {
        Self::with_kind(
            logical_start,
            logical_size,
            ExtentKind::Flat {
                pool_index,
                base_offset,
            },
        )
    }

    /// Creates a sparse extent dispatching through a grain table.
    pub fn sparse(
        logical_start: u64,
        logical_size: u64,
        pool_index: usize,
        grains: SparseGrains,
    ) -> Result<Self> {
        Self::with_kind(
            logical_start,
            logical_size,
            ExtentKind::Sparse { pool_index, grains },
        )
    }

    /// Creates a zero extent.
    pub fn zero(logical_start: u64, logical_size: u64) -> Result<Self> {
        Self::with_kind(logical_start, logical_size, ExtentKind::Zero)
    }

    fn with_kind(logical_start: u64, logical_size: u64, kind: ExtentKind) -> Result<Self> {
        if logical_size == 0 {
            return Err(Error::format(format!(
                "extent at offset {logical_start} has zero size"
            )));
        }
        Ok(Self {
            logical_start,
            logical_size,
            kind,
        })
    }

    /// Start of this extent in the layer's logical address space.
    pub fn logical_start(&self) -> u64 {
        self.logical_start
    }

    /// Length of this extent in bytes.
    pub fn logical_size(&self) -> u64 {
        self.logical_size
    }

    /// First logical offset after this extent.
    pub fn end(&self) -> u64 {
        self.logical_start + self.logical_size
    }

    /// The extent's physical backing.
    pub fn kind(&self) -> &ExtentKind {
        &self.kind
    }

    /// Reports the data-or-hole run at `local_offset`.
    ///
    /// The run is capped at `max_len`, at the end of the extent and, for
    /// sparse extents, at the next grain boundary: allocation state must
    /// be re-resolved grain by grain.
    pub fn run_at(&self, local_offset: u64, max_len: u64) -> Run {
        debug_assert!(local_offset < self.logical_size);
        let cap = max_len.min(self.logical_size - local_offset);
        match &self.kind {
            ExtentKind::Flat { .. } | ExtentKind::Zero => Run {
                len: cap,
                is_hole: false,
            },
            ExtentKind::Sparse { grains, .. } => {
                let grain_size = grains.grain_size();
                let grain_index = local_offset / grain_size;
                let in_grain = local_offset % grain_size;
                Run {
                    len: cap.min(grain_size - in_grain),
                    is_hole: grains.entry(grain_index) == GrainEntry::Unallocated,
                }
            }
        }
    }

    /// Reads up to `buf.len()` bytes at `local_offset` within this extent.
    ///
    /// The read is clamped at the end of the extent; `local_offset` below
    /// `logical_size` is the caller's responsibility. Unallocated grains
    /// read as zeroes here; hole-aware callers resolve them against
    /// ancestor layers via [`Extent::run_at`] before falling back to this
    /// zero fill.
    pub fn read_at(
        &self,
        pool: &mut SourcePool,
        local_offset: u64,
        buf: &mut [u8],
    ) -> Result<usize> {
        debug_assert!(local_offset < self.logical_size);
        let len = (buf.len() as u64).min(self.logical_size - local_offset) as usize;
        let buf = &mut buf[..len];
        match &self.kind {
            ExtentKind::Zero => {
                buf.fill(0);
                Ok(len)
            }
            ExtentKind::Flat {
                pool_index,
                base_offset,
            } => {
                let source = pool.get_mut(*pool_index)?;
                let n = source.read_at(base_offset + local_offset, buf)?;
                if n < buf.len() {
                    return Err(Error::io_simple(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        format!("flat extent file ended after {} of {} bytes", n, buf.len()),
                    )));
                }
                Ok(n)
            }
            ExtentKind::Sparse { pool_index, grains } => {
                let grain_size = grains.grain_size();
                let mut filled = 0usize;
                // Chunked at grain boundaries: every grain re-resolves its
                // allocation state.
                while filled < len {
                    let pos = local_offset + filled as u64;
                    let grain_index = pos / grain_size;
                    let in_grain = pos % grain_size;
                    let take = ((len - filled) as u64).min(grain_size - in_grain) as usize;
                    let dst = &mut buf[filled..filled + take];
                    match grains.entry(grain_index) {
                        GrainEntry::Unallocated | GrainEntry::Zeroed => dst.fill(0),
                        GrainEntry::Stored(grain_offset) => {
                            let source = pool.get_mut(*pool_index)?;
                            read_grain(source, grains, grain_offset, in_grain, dst)?;
                        }
                    }
                    filled += take;
                }
                Ok(len)
            }
        }
    }
}

/// Reads part of a stored grain into `dst`.
fn read_grain(
    source: &mut dyn DataSource,
    grains: &SparseGrains,
    grain_offset: u64,
    in_grain: u64,
    dst: &mut [u8],
) -> Result<()> {
    if grains.compressed {
        let data = read_compressed_grain(source, grain_offset, grains.grain_size())?;
        let start = in_grain as usize;
        dst.copy_from_slice(&data[start..start + dst.len()]);
        return Ok(());
    }
    let n = source.read_at(grain_offset + in_grain, dst)?;
    if n < dst.len() {
        return Err(Error::io_simple(std::io::Error::new(
            std::io::ErrorKind::UnexpectedEof,
            format!("grain ended after {} of {} bytes", n, dst.len()),
        )));
    }
    Ok(())
}

/// Reads and inflates a compressed grain.
///
/// Compressed grains carry a 12-byte header (logical sector address and
/// compressed size) followed by the Deflate payload.
fn read_compressed_grain(
    source: &mut dyn DataSource,
    grain_offset: u64,
    grain_size: u64,
) -> Result<Vec<u8>> {
    let mut header = [0u8; 12];
    if source.read_at(grain_offset, &mut header)? != header.len() {
        return Err(Error::sparse_extent(
            "compressed grain header extends beyond extent file",
        ));
    }
    let compressed_size =
        u32::from_le_bytes([header[8], header[9], header[10], header[11]]) as usize;

    let mut compressed = vec![0u8; compressed_size];
    if source.read_at(grain_offset + 12, &mut compressed)? != compressed_size {
        return Err(Error::sparse_extent(
            "compressed grain data extends beyond extent file",
        ));
    }

    let mut decoder = DeflateDecoder::new(compressed.as_slice());
    let mut data = vec![0u8; grain_size as usize];
    decoder
        .read_exact(&mut data)
        .map_err(|e| Error::sparse_extent(format!("failed to decompress grain: {e}")))?;
    Ok(data)
}

/// An ordered, contiguous, non-overlapping sequence of extents whose union
/// is the logical address space of one image layer.
#[derive(Debug)]
pub struct ExtentSet {
    extents: Vec<Extent>,
    total_size: u64,
}

impl ExtentSet {
    /// Builds a set from extents ordered by logical start.
    ///
    /// # Errors
    ///
    /// A gap or overlap between consecutive extents is a fatal
    /// construction error, not a runtime condition.
    pub fn new(extents: Vec<Extent>) -> Result<Self> {
        let mut expected = 0u64;
        for (i, extent) in extents.iter().enumerate() {
            if extent.logical_start() != expected {
                return Err(Error::format(format!(
                    "extent {} starts at offset {} but the previous extent ends at {}",
                    i,
                    extent.logical_start(),
                    expected
                )));
            }
            expected = extent.end();
        }
        Ok(Self {
            extents,
            total_size: expected,
        })
    }

    /// Total logical size in bytes.
    pub fn size(&self) -> u64 {
        self.total_size
    }

    /// Number of extents.
    pub fn len(&self) -> usize {
        self.extents.len()
    }

    /// Returns true if the set holds no extents.
    pub fn is_empty(&self) -> bool {
        self.extents.is_empty()
    }

    /// The extents in logical order.
    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    /// Resolves `offset` to its containing extent and extent-local offset.
    ///
    /// Returns `None` for offsets at or past the end of the address space.
    pub fn locate(&self, offset: u64) -> Option<(&Extent, u64)> {
        if offset >= self.total_size {
            return None;
        }
        let index = self.extents.partition_point(|e| e.end() <= offset);
        let extent = &self.extents[index];
        Some((extent, offset - extent.logical_start()))
    }

    /// Reports the data-or-hole run at `offset`, capped at `max_len` and
    /// at the containing extent's boundaries.
    pub fn run_at(&self, offset: u64, max_len: u64) -> Option<Run> {
        self.locate(offset)
            .map(|(extent, local)| extent.run_at(local, max_len))
    }

    /// Reads up to `buf.len()` bytes at `offset`, splitting the read at
    /// extent boundaries.
    ///
    /// Reads at or past the end of the address space return 0 bytes, and
    /// reads crossing the end return the bytes before it: running out of
    /// media is a short read, never an error.
    pub fn read_at(&self, pool: &mut SourcePool, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.total_size || buf.is_empty() {
            return Ok(0);
        }
        let len = (buf.len() as u64).min(self.total_size - offset) as usize;
        let mut filled = 0usize;
        while filled < len {
            let pos = offset + filled as u64;
            let Some((extent, local)) = self.locate(pos) else {
                break;
            };
            let n = extent.read_at(pool, local, &mut buf[filled..len])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        Ok(filled)
    }
}
