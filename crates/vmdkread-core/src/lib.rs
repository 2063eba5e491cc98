//! vmdkread core library
//!
//! This crate reads VMDK virtual disk images: it presents a disk that may
//! be split across several extent files, stored sparsely behind grain
//! tables, or layered as a snapshot delta link, as one contiguous,
//! seekable, readable logical address space.
//!
//! # Overview
//!
//! The main entry point is [`VmdkHandle`]: open an image by path or from a
//! caller-supplied byte stream, then seek and read as with a file. Sparse
//! regions of a delta link transparently fall through to the parent image;
//! regions no layer stores read as zeroes.
//!
//! # Modules
//!
//! - [`error`] - Error types and Result alias
//! - [`source`] - Byte sources backing extent files (mmap, streams)
//! - [`descriptor`] - Descriptor text parsing
//! - [`sparse`] - Hosted sparse extent file parsing
//! - [`extent`] - Logical-to-physical extent translation
//! - [`chain`] - Snapshot chain fallthrough resolution
//! - [`handle`] - The public open/seek/read/close handle
//!
//! # Quick Start
//!
//! ```no_run
//! use vmdkread_core::{AccessMode, VmdkHandle};
//! use std::io::SeekFrom;
//!
//! let mut handle = VmdkHandle::new();
//! handle.open("disk.vmdk", AccessMode::Read).unwrap();
//! if handle.needs_extent_data_files().unwrap() {
//!     handle.open_extent_data_files().unwrap();
//! }
//!
//! let mut buf = vec![0u8; 4096];
//! handle.seek(SeekFrom::Start(0)).unwrap();
//! let n = handle.read_buffer(&mut buf).unwrap();
//! println!("read {} of {} bytes", n, handle.media_size().unwrap());
//! handle.close().unwrap();
//! ```

pub mod chain;
pub mod descriptor;
pub mod error;
pub mod extent;
pub mod handle;
pub mod source;
pub mod sparse;

pub use error::{Error, Result};

// Re-export the public surface for convenience
pub use chain::{Layer, SnapshotChain};
pub use descriptor::{
    parse_descriptor, DiskType, ExtentAccess, ExtentRecord, ExtentType, VmdkDescriptor,
    PARENT_CID_NONE,
};
pub use extent::{Extent, ExtentKind, ExtentSet, GrainEntry, Run, SparseGrains};
pub use handle::{AccessMode, ExtentDescriptor, VmdkHandle};
pub use source::{DataSource, MmapSource, SourceOrigin, SourcePool, StreamSource};
pub use sparse::{SparseExtentFile, SparseExtentHeader, SECTOR_SIZE, VMDK_MAGIC};
