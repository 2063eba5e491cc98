//! Hosted sparse extent files.
//!
//! Parses the 512-byte sparse extent header, the embedded descriptor text
//! and the grain directory/tables of hosted sparse VMDKs
//! (monolithicSparse, twoGbMaxExtentSparse), resolving them into the
//! in-memory grain table consumed by the translation engine.
//!
//! Stream-optimized payloads that interleave markers with the grain data
//! are rejected; so are ESX COWD sparse extents, which use a different
//! header layout entirely.

use crate::error::{Error, Result};
use crate::extent::{GrainEntry, SparseGrains};
use crate::source::DataSource;
use log::debug;

/// VMDK magic number ("KDMV" when read as ASCII bytes).
pub const VMDK_MAGIC: u32 = 0x564D444B;

/// COWD magic number of ESX sparse extents, not supported here.
pub const COWD_MAGIC: u32 = 0x44574F43;

/// Size of a sector in bytes.
pub const SECTOR_SIZE: u64 = 512;

/// Flags in the sparse extent header.
const FLAG_USE_SECONDARY_GRAIN_DIRECTORY: u32 = 1 << 1;
const FLAG_USE_ZEROED_GRAIN_TABLE: u32 = 1 << 2;
const FLAG_COMPRESSED: u32 = 1 << 16;
const FLAG_MARKERS: u32 = 1 << 17;

/// Compression algorithm identifiers.
const COMPRESS_ALGORITHM_NONE: u16 = 0;
const COMPRESS_ALGORITHM_DEFLATE: u16 = 1;

/// Grain table entry values with special meaning.
const GTE_UNALLOCATED: u32 = 0;
const GTE_ZEROED: u32 = 1;

fn le_u16(data: &[u8], offset: usize) -> u16 {
    let mut bytes = [0u8; 2];
    bytes.copy_from_slice(&data[offset..offset + 2]);
    u16::from_le_bytes(bytes)
}

fn le_u32(data: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&data[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn le_u64(data: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

/// Parsed 512-byte sparse extent header.
#[derive(Debug, Clone)]
pub struct SparseExtentHeader {
    /// Format version (1..=3).
    pub version: u32,
    /// Header flags.
    pub flags: u32,
    /// Virtual capacity in sectors.
    pub capacity: u64,
    /// Grain size in sectors; a power of two.
    pub grain_size: u64,
    /// Embedded descriptor offset in sectors, 0 if absent.
    pub descriptor_offset: u64,
    /// Embedded descriptor size in sectors.
    pub descriptor_size: u64,
    /// Grain table entries per grain table.
    pub num_gtes_per_gt: u32,
    /// Secondary (redundant) grain directory offset in sectors.
    pub rgd_offset: u64,
    /// Primary grain directory offset in sectors.
    pub gd_offset: u64,
    /// Compression algorithm for grain data.
    pub compress_algorithm: u16,
}

impl SparseExtentHeader {
    /// Parses a header from the first sector of an extent file.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < SECTOR_SIZE as usize {
            return Err(Error::sparse_extent("sparse extent header too short"));
        }

        let magic = le_u32(data, 0);
        if magic == COWD_MAGIC {
            return Err(Error::sparse_extent(
                "ESX COWD sparse extents are not supported",
            ));
        }
        if magic != VMDK_MAGIC {
            return Err(Error::sparse_extent(format!(
                "invalid sparse extent magic: expected 0x{VMDK_MAGIC:08X}, got 0x{magic:08X}"
            )));
        }

        let version = le_u32(data, 4);
        if version == 0 || version > 3 {
            return Err(Error::sparse_extent(format!(
                "unsupported sparse extent version: {version}"
            )));
        }

        let flags = le_u32(data, 8);
        let capacity = le_u64(data, 12);
        let grain_size = le_u64(data, 20);
        let descriptor_offset = le_u64(data, 28);
        let descriptor_size = le_u64(data, 36);
        let num_gtes_per_gt = le_u32(data, 44);
        let rgd_offset = le_u64(data, 48);
        let gd_offset = le_u64(data, 56);
        // Bytes 64..77 hold overhead, the unclean-shutdown flag and the
        // newline detection characters; none of them affect reading.
        let compress_algorithm = le_u16(data, 77);

        if grain_size == 0 || !grain_size.is_power_of_two() {
            return Err(Error::sparse_extent(format!(
                "grain size {grain_size} sectors is not a power of two"
            )));
        }
        if num_gtes_per_gt == 0 {
            return Err(Error::sparse_extent("grain table entry count is zero"));
        }

        Ok(Self {
            version,
            flags,
            capacity,
            grain_size,
            descriptor_offset,
            descriptor_size,
            num_gtes_per_gt,
            rgd_offset,
            gd_offset,
            compress_algorithm,
        })
    }

    /// Whether grain data is compressed.
    pub fn is_compressed(&self) -> bool {
        (self.flags & FLAG_COMPRESSED) != 0
    }

    /// Whether the payload interleaves stream-optimized markers.
    pub fn has_markers(&self) -> bool {
        (self.flags & FLAG_MARKERS) != 0
    }

    /// Whether the secondary grain directory should be preferred.
    pub fn uses_secondary_grain_directory(&self) -> bool {
        (self.flags & FLAG_USE_SECONDARY_GRAIN_DIRECTORY) != 0
    }

    /// Whether grain table entry value 1 means an explicitly zeroed grain.
    pub fn uses_zeroed_grain_table(&self) -> bool {
        (self.flags & FLAG_USE_ZEROED_GRAIN_TABLE) != 0
    }

    /// Grain size in bytes.
    pub fn grain_size_bytes(&self) -> u64 {
        self.grain_size * SECTOR_SIZE
    }

    /// Virtual capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.capacity * SECTOR_SIZE
    }

    /// Number of grains covering the capacity.
    pub fn grain_count(&self) -> u64 {
        (self.capacity + self.grain_size - 1) / self.grain_size
    }

    /// Number of grain directory entries.
    pub fn grain_directory_entries(&self) -> u64 {
        let per_gt = self.num_gtes_per_gt as u64;
        (self.grain_count() + per_gt - 1) / per_gt
    }
}

/// A hosted sparse extent file resolved to its grain table.
#[derive(Debug)]
pub struct SparseExtentFile {
    header: SparseExtentHeader,
    descriptor: Option<String>,
    grains: SparseGrains,
}

impl SparseExtentFile {
    /// Reads the header, embedded descriptor and grain tables from `source`.
    ///
    /// # Errors
    ///
    /// Returns an error for non-sparse files, COWD extents, unsupported
    /// versions, markered stream-optimized payloads, unknown grain
    /// compression, or truncated metadata.
    pub fn load(source: &mut dyn DataSource) -> Result<Self> {
        let mut header_bytes = [0u8; SECTOR_SIZE as usize];
        let n = source.read_at(0, &mut header_bytes)?;
        if n < header_bytes.len() {
            return Err(Error::sparse_extent(
                "extent file too short for a sparse header",
            ));
        }
        let header = SparseExtentHeader::parse(&header_bytes)?;

        if header.has_markers() {
            return Err(Error::sparse_extent(
                "stream-optimized extents with markers are not supported for reading; \
                 convert the image to a flat or hosted sparse layout first",
            ));
        }
        if header.is_compressed()
            && header.compress_algorithm != COMPRESS_ALGORITHM_DEFLATE
            && header.compress_algorithm != COMPRESS_ALGORITHM_NONE
        {
            return Err(Error::sparse_extent(format!(
                "unknown grain compression algorithm: {}",
                header.compress_algorithm
            )));
        }

        let descriptor = if header.descriptor_offset != 0 && header.descriptor_size != 0 {
            Some(read_embedded_descriptor(source, &header)?)
        } else {
            None
        };

        let grains = load_grain_table(source, &header)?;

        debug!(
            "loaded sparse extent: capacity {} sectors, grain {} sectors, {} grain table entries",
            header.capacity,
            header.grain_size,
            grains.len()
        );

        Ok(Self {
            header,
            descriptor,
            grains,
        })
    }

    /// The parsed header.
    pub fn header(&self) -> &SparseExtentHeader {
        &self.header
    }

    /// Embedded descriptor text, if the file carries one.
    pub fn embedded_descriptor(&self) -> Option<&str> {
        self.descriptor.as_deref()
    }

    /// Virtual capacity in bytes.
    pub fn capacity_bytes(&self) -> u64 {
        self.header.capacity_bytes()
    }

    /// Consumes the file, returning its resolved grain table.
    pub fn into_grains(self) -> SparseGrains {
        self.grains
    }
}

/// Reads the NUL-padded embedded descriptor text.
fn read_embedded_descriptor(
    source: &mut dyn DataSource,
    header: &SparseExtentHeader,
) -> Result<String> {
    let mut buf = vec![0u8; (header.descriptor_size * SECTOR_SIZE) as usize];
    let offset = header.descriptor_offset * SECTOR_SIZE;
    let n = source.read_at(offset, &mut buf)?;
    if n < buf.len() {
        return Err(Error::sparse_extent(
            "embedded descriptor extends beyond extent file",
        ));
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    buf.truncate(end);
    String::from_utf8(buf).map_err(|_| Error::descriptor("embedded descriptor is not valid UTF-8"))
}

/// Loads the grain directory and every referenced grain table.
fn load_grain_table(
    source: &mut dyn DataSource,
    header: &SparseExtentHeader,
) -> Result<SparseGrains> {
    // Fall back to the secondary grain directory when the primary is
    // absent or the header says to prefer it.
    let gd_offset = if header.uses_secondary_grain_directory() || header.gd_offset == 0 {
        header.rgd_offset
    } else {
        header.gd_offset
    };
    if gd_offset == 0 {
        return Err(Error::sparse_extent("extent file has no grain directory"));
    }

    let gd_entries = header.grain_directory_entries() as usize;
    let mut gd_bytes = vec![0u8; gd_entries * 4];
    let n = source.read_at(gd_offset * SECTOR_SIZE, &mut gd_bytes)?;
    if n < gd_bytes.len() {
        return Err(Error::sparse_extent(
            "grain directory extends beyond extent file",
        ));
    }

    let total_grains = header.grain_count() as usize;
    let per_gt = header.num_gtes_per_gt as usize;
    let mut entries = Vec::with_capacity(total_grains);

    for gd_index in 0..gd_entries {
        let count = per_gt.min(total_grains - entries.len());
        let gt_offset_sectors = le_u32(&gd_bytes, gd_index * 4);
        if gt_offset_sectors == 0 {
            // Grain table not allocated: every grain in it is a hole.
            entries.extend(std::iter::repeat(GrainEntry::Unallocated).take(count));
            continue;
        }

        let mut gt_bytes = vec![0u8; count * 4];
        let gt_offset = gt_offset_sectors as u64 * SECTOR_SIZE;
        let n = source.read_at(gt_offset, &mut gt_bytes)?;
        if n < gt_bytes.len() {
            return Err(Error::sparse_extent(
                "grain table extends beyond extent file",
            ));
        }

        for gte_index in 0..count {
            let value = le_u32(&gt_bytes, gte_index * 4);
            let entry = match value {
                GTE_UNALLOCATED => GrainEntry::Unallocated,
                GTE_ZEROED if header.uses_zeroed_grain_table() => GrainEntry::Zeroed,
                _ => GrainEntry::Stored(value as u64 * SECTOR_SIZE),
            };
            entries.push(entry);
        }
    }

    SparseGrains::new(header.grain_size_bytes(), entries, header.is_compressed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::StreamSource;
    use std::io::Cursor;

    fn header_bytes() -> Vec<u8> {
        let mut bytes = vec![0u8; 512];
        bytes[0..4].copy_from_slice(&VMDK_MAGIC.to_le_bytes());
        bytes[4..8].copy_from_slice(&1u32.to_le_bytes()); // version
        bytes[8..12].copy_from_slice(&1u32.to_le_bytes()); // flags
        bytes[12..20].copy_from_slice(&1000u64.to_le_bytes()); // capacity
        bytes[20..28].copy_from_slice(&128u64.to_le_bytes()); // grain size
        bytes[28..36].copy_from_slice(&1u64.to_le_bytes()); // descriptor offset
        bytes[36..44].copy_from_slice(&20u64.to_le_bytes()); // descriptor size
        bytes[44..48].copy_from_slice(&512u32.to_le_bytes()); // GTEs per GT
        bytes[48..56].copy_from_slice(&0u64.to_le_bytes()); // rgdOffset
        bytes[56..64].copy_from_slice(&100u64.to_le_bytes()); // gdOffset
        bytes
    }

    #[test]
    fn test_header_parse() {
        let header = SparseExtentHeader::parse(&header_bytes()).unwrap();
        assert_eq!(header.version, 1);
        assert_eq!(header.capacity, 1000);
        assert_eq!(header.grain_size, 128);
        assert_eq!(header.descriptor_offset, 1);
        assert_eq!(header.descriptor_size, 20);
        assert_eq!(header.num_gtes_per_gt, 512);
        assert_eq!(header.gd_offset, 100);
        assert!(!header.is_compressed());
        assert!(!header.has_markers());
    }

    #[test]
    fn test_header_grain_math() {
        let header = SparseExtentHeader::parse(&header_bytes()).unwrap();
        // 1000 sectors at 128 sectors per grain: 8 grains, one grain table.
        assert_eq!(header.grain_count(), 8);
        assert_eq!(header.grain_directory_entries(), 1);
        assert_eq!(header.grain_size_bytes(), 128 * 512);
        assert_eq!(header.capacity_bytes(), 1000 * 512);
    }

    #[test]
    fn test_header_invalid_magic() {
        let bytes = vec![0u8; 512];
        assert!(SparseExtentHeader::parse(&bytes).is_err());
    }

    #[test]
    fn test_header_cowd_magic() {
        let mut bytes = vec![0u8; 512];
        bytes[0..4].copy_from_slice(&COWD_MAGIC.to_le_bytes());
        let err = SparseExtentHeader::parse(&bytes).unwrap_err();
        assert!(err.to_string().contains("COWD"));
    }

    #[test]
    fn test_header_unsupported_version() {
        let mut bytes = header_bytes();
        bytes[4..8].copy_from_slice(&4u32.to_le_bytes());
        assert!(SparseExtentHeader::parse(&bytes).is_err());
    }

    #[test]
    fn test_header_rejects_non_power_of_two_grain() {
        let mut bytes = header_bytes();
        bytes[20..28].copy_from_slice(&100u64.to_le_bytes());
        assert!(SparseExtentHeader::parse(&bytes).is_err());
    }

    #[test]
    fn test_load_rejects_markered_stream() {
        let mut bytes = header_bytes();
        let flags = 1u32 | FLAG_COMPRESSED | FLAG_MARKERS;
        bytes[8..12].copy_from_slice(&flags.to_le_bytes());
        bytes[77..79].copy_from_slice(&COMPRESS_ALGORITHM_DEFLATE.to_le_bytes());

        let mut source = StreamSource::new(Cursor::new(bytes));
        let err = SparseExtentFile::load(&mut source).unwrap_err();
        assert!(err.to_string().contains("markers"));
    }

    #[test]
    fn test_load_rejects_truncated_file() {
        let mut source = StreamSource::new(Cursor::new(vec![0u8; 100]));
        assert!(SparseExtentFile::load(&mut source).is_err());
    }

    #[test]
    fn test_load_resolves_grain_entries() {
        // Minimal file: header, GD at sector 1, GT at sector 2, grain data
        // at sector 3. Capacity 8 sectors, grain size 4 sectors -> 2 grains.
        let mut bytes = vec![0u8; 512 * 4];
        bytes[0..4].copy_from_slice(&VMDK_MAGIC.to_le_bytes());
        bytes[4..8].copy_from_slice(&1u32.to_le_bytes());
        bytes[8..12].copy_from_slice(&1u32.to_le_bytes());
        bytes[12..20].copy_from_slice(&8u64.to_le_bytes()); // capacity
        bytes[20..28].copy_from_slice(&4u64.to_le_bytes()); // grain size
        bytes[44..48].copy_from_slice(&512u32.to_le_bytes());
        bytes[56..64].copy_from_slice(&1u64.to_le_bytes()); // gdOffset

        // Grain directory: one entry pointing at sector 2.
        bytes[512..516].copy_from_slice(&2u32.to_le_bytes());
        // Grain table: grain 0 stored at sector 3, grain 1 unallocated.
        bytes[1024..1028].copy_from_slice(&3u32.to_le_bytes());

        let mut source = StreamSource::new(Cursor::new(bytes));
        let file = SparseExtentFile::load(&mut source).unwrap();
        assert!(file.embedded_descriptor().is_none());

        let grains = file.into_grains();
        assert_eq!(grains.len(), 2);
        assert_eq!(grains.grain_size(), 4 * 512);
        assert_eq!(grains.entry(0), GrainEntry::Stored(3 * 512));
        assert_eq!(grains.entry(1), GrainEntry::Unallocated);
    }

    #[test]
    fn test_load_unallocated_grain_table() {
        // Grain directory entry 0 means the whole grain table is holes.
        let mut bytes = vec![0u8; 512 * 2];
        bytes[0..4].copy_from_slice(&VMDK_MAGIC.to_le_bytes());
        bytes[4..8].copy_from_slice(&1u32.to_le_bytes());
        bytes[12..20].copy_from_slice(&8u64.to_le_bytes());
        bytes[20..28].copy_from_slice(&4u64.to_le_bytes());
        bytes[44..48].copy_from_slice(&512u32.to_le_bytes());
        bytes[56..64].copy_from_slice(&1u64.to_le_bytes());
        // Grain directory entry stays 0.

        let mut source = StreamSource::new(Cursor::new(bytes));
        let grains = SparseExtentFile::load(&mut source).unwrap().into_grains();
        assert_eq!(grains.entry(0), GrainEntry::Unallocated);
        assert_eq!(grains.entry(1), GrainEntry::Unallocated);
    }
}
