//! VMDK image handle.
//!
//! [`VmdkHandle`] is the public entry point: it opens an image from a path
//! or a caller-supplied byte stream, resolves its extents into a
//! [`SnapshotChain`], and exposes a seekable, readable view of the logical
//! disk together with the descriptor metadata.
//!
//! A handle is a strict CLOSED -> OPEN -> CLOSED state machine. Every
//! operation on a closed handle fails, a second `open` fails, and a second
//! `close` fails. Reads at or past the end of the media return 0 bytes;
//! running out of media is never an error.
//!
//! One handle owns one cursor and is not meant for shared concurrent use;
//! independent handles over the same files are fine.

use crate::chain::{Layer, SnapshotChain};
use crate::descriptor::{parse_descriptor, DiskType, ExtentType, VmdkDescriptor};
use crate::error::{Error, Result};
use crate::extent::{Extent, ExtentSet};
use crate::source::{DataSource, MmapSource, SourceOrigin, SourcePool};
use crate::sparse::{SparseExtentFile, SECTOR_SIZE, VMDK_MAGIC};
use log::{debug, warn};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

/// Upper bound for standalone descriptor files. Real descriptors are a few
/// kilobytes; anything bigger is almost certainly a data file passed by
/// mistake.
const MAX_DESCRIPTOR_SIZE: u64 = 16 * 1024 * 1024;

/// Requested access mode for `open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessMode {
    /// Read-only access.
    #[default]
    Read,
    /// Read-write access. Not supported by this crate.
    Write,
}

/// Introspection record for one extent of the opened image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentDescriptor {
    /// Extent data filename, if any.
    pub filename: Option<String>,
    /// Extent type.
    pub extent_type: ExtentType,
    /// Start of the extent in the logical address space.
    pub logical_start: u64,
    /// Logical size of the extent in bytes.
    pub size_bytes: u64,
}

struct OpenState {
    descriptor: VmdkDescriptor,
    /// Directory of the descriptor file; used to resolve extent data files
    /// for path-opened images.
    base_path: Option<PathBuf>,
    /// None until the extent data files are open. Self-contained images
    /// build their chain during `open`.
    chain: Option<SnapshotChain>,
    media_size: u64,
    cursor: u64,
}

/// A read-only handle over one VMDK image, optionally backed by a chain of
/// parent images.
#[derive(Default)]
pub struct VmdkHandle {
    state: Option<OpenState>,
}

impl VmdkHandle {
    /// Creates a closed handle.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true while the handle is open.
    pub fn is_open(&self) -> bool {
        self.state.is_some()
    }

    /// Opens an image from a filesystem path.
    ///
    /// The path may point at a hosted sparse extent file with an embedded
    /// descriptor (readable immediately) or at a standalone text
    /// descriptor, in which case [`VmdkHandle::open_extent_data_files`]
    /// must be called before reading.
    ///
    /// # Errors
    ///
    /// Fails with a state error if the handle is already open, an invalid
    /// argument error for [`AccessMode::Write`], and an I/O or parse error
    /// if the image cannot be read or recognized.
    pub fn open(&mut self, path: impl AsRef<Path>, mode: AccessMode) -> Result<()> {
        let path = path.as_ref();
        self.check_can_open(mode)?;

        let source = MmapSource::open(path)?;
        let base_path = path.parent().map(Path::to_path_buf);
        let state = open_from_source(
            Box::new(source),
            SourceOrigin::OpenedByCore,
            base_path,
        )?;
        debug!(
            "opened '{}': {} ({} bytes)",
            path.display(),
            state.descriptor.disk_type,
            state.media_size
        );
        self.state = Some(state);
        Ok(())
    }

    /// Opens an image from a caller-supplied byte source.
    ///
    /// The source is borrowed for the lifetime of the handle and released
    /// at close; the core never closes it earlier. Images whose descriptor
    /// references separate extent data files need
    /// [`VmdkHandle::open_extent_data_files_from_sources`] before reading.
    pub fn open_source(&mut self, source: Box<dyn DataSource>, mode: AccessMode) -> Result<()> {
        self.check_can_open(mode)?;

        let state = open_from_source(source, SourceOrigin::SuppliedByCaller, None)?;
        debug!(
            "opened from caller source: {} ({} bytes)",
            state.descriptor.disk_type, state.media_size
        );
        self.state = Some(state);
        Ok(())
    }

    fn check_can_open(&self, mode: AccessMode) -> Result<()> {
        if self.is_open() {
            return Err(Error::state("handle is already open"));
        }
        if mode != AccessMode::Read {
            return Err(Error::invalid_argument(
                "write access is not supported; images are opened read-only",
            ));
        }
        Ok(())
    }

    /// Returns true if reads require a prior
    /// [`VmdkHandle::open_extent_data_files`] call.
    pub fn needs_extent_data_files(&self) -> Result<bool> {
        Ok(self.open_state()?.chain.is_none())
    }

    /// Opens the extent data files referenced by the descriptor, resolved
    /// relative to the descriptor file's directory.
    ///
    /// # Errors
    ///
    /// Fails with a state error if the handle is closed, if the extent
    /// data files are already open, or if the image was opened from a
    /// stream (use
    /// [`VmdkHandle::open_extent_data_files_from_sources`] instead).
    pub fn open_extent_data_files(&mut self) -> Result<()> {
        let state = self.open_state_mut()?;
        if state.chain.is_some() {
            return Err(Error::state("extent data files are already open"));
        }
        let base_path = state.base_path.clone().ok_or_else(|| {
            Error::state(
                "image was opened from a stream; supply extent data sources instead of paths",
            )
        })?;

        let mut pool = SourcePool::new();
        let mut indices = Vec::with_capacity(state.descriptor.extents.len());
        for record in &state.descriptor.extents {
            match &record.filename {
                Some(name) => {
                    let source = MmapSource::open(&base_path.join(name))?;
                    indices.push(Some(pool.push(Box::new(source), SourceOrigin::OpenedByCore)));
                }
                None => indices.push(None),
            }
        }

        let file_count = pool.len();
        let layer = build_layer(&state.descriptor, pool, &indices)?;
        state.chain = Some(SnapshotChain::new(layer));
        debug!("opened {file_count} extent data file(s)");
        Ok(())
    }

    /// Opens the extent data files from caller-supplied sources, one per
    /// descriptor extent record that references a file, in descriptor
    /// order.
    pub fn open_extent_data_files_from_sources(
        &mut self,
        sources: Vec<Box<dyn DataSource>>,
    ) -> Result<()> {
        let state = self.open_state_mut()?;
        if state.chain.is_some() {
            return Err(Error::state("extent data files are already open"));
        }

        let expected = state
            .descriptor
            .extents
            .iter()
            .filter(|r| r.filename.is_some())
            .count();
        if sources.len() != expected {
            return Err(Error::invalid_argument(format!(
                "image references {} extent data file(s) but {} source(s) were supplied",
                expected,
                sources.len()
            )));
        }

        let mut pool = SourcePool::new();
        let mut remaining = sources.into_iter();
        let mut indices = Vec::with_capacity(state.descriptor.extents.len());
        for record in &state.descriptor.extents {
            if record.filename.is_some() {
                // Count validated above: one source per file-backed record.
                let source = remaining.next().ok_or_else(|| {
                    Error::invalid_argument("fewer sources than extent data files")
                })?;
                indices.push(Some(pool.push(source, SourceOrigin::SuppliedByCaller)));
            } else {
                indices.push(None);
            }
        }

        let layer = build_layer(&state.descriptor, pool, &indices)?;
        state.chain = Some(SnapshotChain::new(layer));
        Ok(())
    }

    /// Attaches an opened parent image; its layers become this handle's
    /// ancestors. The parent handle is consumed.
    ///
    /// A mismatch between the declared parent content identifier and the
    /// parent's actual content identifier is logged as a warning but does
    /// not fail: both values stay readable for callers that want to
    /// enforce a stricter policy.
    pub fn set_parent(&mut self, mut parent: VmdkHandle) -> Result<()> {
        let state = self.open_state_mut()?;
        if !state.descriptor.has_parent() {
            return Err(Error::invalid_argument(
                "image does not declare a parent content identifier",
            ));
        }
        let chain = state
            .chain
            .as_mut()
            .ok_or_else(|| Error::state("extent data files are not open"))?;

        let parent_state = parent
            .state
            .take()
            .ok_or_else(|| Error::state("parent handle is not open"))?;
        let parent_chain = parent_state
            .chain
            .ok_or_else(|| Error::state("parent extent data files are not open"))?;

        let declared = state.descriptor.parent_cid;
        let actual = parent_state.descriptor.cid;
        if declared != actual {
            warn!(
                "parent content identifier mismatch: descriptor declares {declared:08x}, \
                 parent reports {actual:08x}"
            );
        }

        chain.attach_ancestors(parent_chain.into_layers());
        debug!("attached parent chain, depth now {}", chain.depth());
        Ok(())
    }

    /// Moves the cursor.
    ///
    /// `Start`, `Current` and `End` follow the usual seek arithmetic with
    /// the media size as the end base. Seeking past the end of the media
    /// is legal and later reads simply return 0 bytes; a resulting
    /// position before offset 0 is rejected and leaves the cursor
    /// unchanged.
    pub fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        let state = self.open_state_mut()?;
        let (base, delta) = match pos {
            SeekFrom::Start(offset) => {
                state.cursor = offset;
                return Ok(offset);
            }
            SeekFrom::Current(delta) => (state.cursor, delta),
            SeekFrom::End(delta) => (state.media_size, delta),
        };
        let target = base as i128 + delta as i128;
        if target < 0 {
            return Err(Error::invalid_argument(format!(
                "seek to offset {target} is before the start of the media"
            )));
        }
        if target > u64::MAX as i128 {
            return Err(Error::invalid_argument("seek offset overflows"));
        }
        state.cursor = target as u64;
        Ok(state.cursor)
    }

    /// Reads at the cursor, advancing it by the number of bytes returned.
    ///
    /// The count may be less than `buf.len()`, including 0 at or past the
    /// end of the media.
    pub fn read_buffer(&mut self, buf: &mut [u8]) -> Result<usize> {
        let state = self.open_state_mut()?;
        let chain = state
            .chain
            .as_mut()
            .ok_or_else(|| Error::state("extent data files are not open"))?;
        let n = chain.read_at(state.cursor, buf)?;
        state.cursor += n as u64;
        Ok(n)
    }

    /// Reads at `offset` without requiring a prior seek.
    ///
    /// Internally a seek followed by a read, so the cursor lands after the
    /// returned bytes.
    pub fn read_buffer_at_offset(&mut self, buf: &mut [u8], offset: u64) -> Result<usize> {
        self.seek(SeekFrom::Start(offset))?;
        self.read_buffer(buf)
    }

    /// Current cursor position.
    pub fn offset(&self) -> Result<u64> {
        Ok(self.open_state()?.cursor)
    }

    /// Logical media size in bytes.
    pub fn media_size(&self) -> Result<u64> {
        Ok(self.open_state()?.media_size)
    }

    /// Disk type from the descriptor's `createType`.
    pub fn disk_type(&self) -> Result<DiskType> {
        Ok(self.open_state()?.descriptor.disk_type)
    }

    /// Content identifier of the opened layer.
    pub fn content_identifier(&self) -> Result<u32> {
        Ok(self.open_state()?.descriptor.cid)
    }

    /// Declared content identifier of the parent layer;
    /// [`PARENT_CID_NONE`](crate::descriptor::PARENT_CID_NONE) when the
    /// image has no parent.
    pub fn parent_content_identifier(&self) -> Result<u32> {
        Ok(self.open_state()?.descriptor.parent_cid)
    }

    /// Parent image filename for delta links.
    pub fn parent_filename(&self) -> Result<Option<&str>> {
        Ok(self.open_state()?.descriptor.parent_filename.as_deref())
    }

    /// Number of extents in the opened layer.
    pub fn number_of_extents(&self) -> Result<usize> {
        Ok(self.open_state()?.descriptor.extents.len())
    }

    /// Introspection record for extent `index`.
    pub fn extent_descriptor(&self, index: usize) -> Result<ExtentDescriptor> {
        let descriptors = self.extent_descriptors()?;
        descriptors.into_iter().nth(index).ok_or_else(|| {
            Error::invalid_argument(format!("extent index {index} out of range"))
        })
    }

    /// Introspection records for every extent, in logical order.
    pub fn extent_descriptors(&self) -> Result<Vec<ExtentDescriptor>> {
        let state = self.open_state()?;
        let mut logical_start = 0u64;
        let mut descriptors = Vec::with_capacity(state.descriptor.extents.len());
        for record in &state.descriptor.extents {
            let size_bytes = record.size_bytes();
            descriptors.push(ExtentDescriptor {
                filename: record.filename.clone(),
                extent_type: record.extent_type,
                logical_start,
                size_bytes,
            });
            logical_start += size_bytes;
        }
        Ok(descriptors)
    }

    /// Closes the handle, releasing every resource acquired during open.
    ///
    /// # Errors
    ///
    /// Fails with a state error if the handle is already closed.
    pub fn close(&mut self) -> Result<()> {
        let state = self
            .state
            .take()
            .ok_or_else(|| Error::state("handle is not open"))?;
        if let Some(chain) = state.chain {
            let (core, caller) = chain
                .into_layers()
                .into_iter()
                .map(|layer| layer.into_pool().origin_counts())
                .fold((0, 0), |(a, b), (c, d)| (a + c, b + d));
            debug!("closed: released {core} core-opened and {caller} caller-supplied source(s)");
        }
        Ok(())
    }

    fn open_state(&self) -> Result<&OpenState> {
        self.state
            .as_ref()
            .ok_or_else(|| Error::state("handle is not open"))
    }

    fn open_state_mut(&mut self) -> Result<&mut OpenState> {
        self.state
            .as_mut()
            .ok_or_else(|| Error::state("handle is not open"))
    }
}

impl Read for VmdkHandle {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        self.read_buffer(buf)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
    }
}

impl Seek for VmdkHandle {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        VmdkHandle::seek(self, pos).map_err(|e| match e {
            Error::InvalidArgument { .. } => {
                std::io::Error::new(std::io::ErrorKind::InvalidInput, e)
            }
            other => std::io::Error::new(std::io::ErrorKind::Other, other),
        })
    }
}

/// Opens an image from its primary source: a sparse extent file with an
/// embedded descriptor, or a standalone text descriptor.
fn open_from_source(
    mut source: Box<dyn DataSource>,
    origin: SourceOrigin,
    base_path: Option<PathBuf>,
) -> Result<OpenState> {
    let mut magic = [0u8; 4];
    let n = source.read_at(0, &mut magic)?;
    if n == magic.len() && u32::from_le_bytes(magic) == VMDK_MAGIC {
        open_self_contained(source, origin)
    } else {
        open_standalone_descriptor(source, base_path)
    }
}

/// Opens a hosted sparse image whose single file carries the descriptor,
/// the grain tables and the grain data. The chain is ready immediately.
fn open_self_contained(mut source: Box<dyn DataSource>, origin: SourceOrigin) -> Result<OpenState> {
    let extent_file = SparseExtentFile::load(source.as_mut())?;
    let text = extent_file.embedded_descriptor().ok_or_else(|| {
        Error::descriptor("sparse extent file carries no embedded descriptor")
    })?;
    let descriptor = parse_descriptor(text)?;
    if descriptor.extents.is_empty() {
        return Err(Error::descriptor("descriptor contains no extent lines"));
    }

    let media_size = descriptor.media_size_bytes();
    let capacity = extent_file.capacity_bytes();
    if media_size != capacity {
        warn!(
            "descriptor media size ({media_size} bytes) does not match sparse extent \
             capacity ({capacity} bytes); trusting the descriptor"
        );
    }

    let mut pool = SourcePool::new();
    let index = pool.push(source, origin);
    let extent = Extent::sparse(0, media_size, index, extent_file.into_grains())?;
    let extent_set = ExtentSet::new(vec![extent])?;
    let layer = Layer::new(extent_set, pool, descriptor.cid, descriptor.parent_cid);

    Ok(OpenState {
        media_size,
        chain: Some(SnapshotChain::new(layer)),
        base_path: None,
        descriptor,
        cursor: 0,
    })
}

/// Opens a standalone text descriptor. Extent data files are opened later.
fn open_standalone_descriptor(
    mut source: Box<dyn DataSource>,
    base_path: Option<PathBuf>,
) -> Result<OpenState> {
    let size = source.size()?;
    if size > MAX_DESCRIPTOR_SIZE {
        return Err(Error::descriptor(format!(
            "file is {size} bytes; too large for a descriptor and not a sparse extent"
        )));
    }
    let mut bytes = vec![0u8; size as usize];
    let n = source.read_at(0, &mut bytes)?;
    bytes.truncate(n);
    let text = String::from_utf8(bytes)
        .map_err(|_| Error::descriptor("descriptor is not valid UTF-8 text"))?;

    let descriptor = parse_descriptor(&text)?;
    if descriptor.extents.is_empty() {
        return Err(Error::descriptor("descriptor contains no extent lines"));
    }

    Ok(OpenState {
        media_size: descriptor.media_size_bytes(),
        chain: None,
        base_path,
        descriptor,
        cursor: 0,
    })
}

/// Builds a layer from a parsed descriptor, a pool of opened sources and
/// the pool index assigned to each extent record.
fn build_layer(
    descriptor: &VmdkDescriptor,
    mut pool: SourcePool,
    indices: &[Option<usize>],
) -> Result<Layer> {
    let mut extents = Vec::with_capacity(descriptor.extents.len());
    let mut logical_start = 0u64;
    for (record, index) in descriptor.extents.iter().zip(indices) {
        let size_bytes = record.size_bytes();
        let extent = match record.extent_type {
            ExtentType::Zero => Extent::zero(logical_start, size_bytes)?,
            ExtentType::Flat | ExtentType::Vmfs | ExtentType::VmfsRaw | ExtentType::VmfsRdm => {
                let index = require_index(record.extent_type, *index)?;
                Extent::flat(
                    logical_start,
                    size_bytes,
                    index,
                    record.start_sector * SECTOR_SIZE,
                )?
            }
            ExtentType::Sparse | ExtentType::VmfsSparse => {
                let index = require_index(record.extent_type, *index)?;
                let extent_file = SparseExtentFile::load(pool.get_mut(index)?)?;
                let capacity = extent_file.capacity_bytes();
                if capacity != size_bytes {
                    warn!(
                        "sparse extent capacity ({capacity} bytes) does not match its \
                         descriptor record ({size_bytes} bytes); trusting the descriptor"
                    );
                }
                Extent::sparse(logical_start, size_bytes, index, extent_file.into_grains())?
            }
        };
        extents.push(extent);
        logical_start += size_bytes;
    }

    let extent_set = ExtentSet::new(extents)?;
    Ok(Layer::new(
        extent_set,
        pool,
        descriptor.cid,
        descriptor.parent_cid,
    ))
}

fn require_index(extent_type: ExtentType, index: Option<usize>) -> Result<usize> {
    index.ok_or_else(|| {
        Error::format(format!("{extent_type} extent record has no data source"))
    })
}
