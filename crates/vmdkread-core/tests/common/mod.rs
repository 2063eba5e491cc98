//! Shared fixture builders for integration tests.
//!
//! Hosted sparse images are built byte by byte: header sector, embedded
//! descriptor, grain directory, grain tables, then the grain data. Flat
//! images are a standalone text descriptor next to a raw data file.
#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

pub const SECTOR: u64 = 512;

const VMDK_MAGIC: u32 = 0x564D444B;
const DESCRIPTOR_SECTORS: u64 = 20;
const GTES_PER_GT: u64 = 512;

/// Content of one grain in a sparse fixture.
pub enum GrainSpec {
    /// Unallocated: defers to the parent layer.
    Hole,
    /// Explicitly zeroed grain (grain table entry 1).
    Zeroed,
    /// Stored grain data; must be exactly one grain long for
    /// uncompressed images.
    Data(Vec<u8>),
}

/// Parameters of a hosted sparse fixture image.
pub struct SparseImageSpec<'a> {
    pub capacity_sectors: u64,
    pub grain_sectors: u64,
    pub cid: u32,
    pub parent_cid: u32,
    pub parent_filename: Option<&'a str>,
    pub compressed: bool,
    pub zeroed_grain_flag: bool,
    pub grains: Vec<GrainSpec>,
}

impl<'a> SparseImageSpec<'a> {
    /// A plain uncompressed monolithic sparse image with no parent.
    pub fn basic(capacity_sectors: u64, grain_sectors: u64, grains: Vec<GrainSpec>) -> Self {
        Self {
            capacity_sectors,
            grain_sectors,
            cid: 0xa1b2c3d4,
            parent_cid: 0xffffffff,
            parent_filename: None,
            compressed: false,
            zeroed_grain_flag: false,
            grains,
        }
    }
}

/// Builds the complete byte image of a hosted sparse VMDK.
pub fn build_sparse_image(spec: &SparseImageSpec) -> Vec<u8> {
    let grain_count = (spec.capacity_sectors + spec.grain_sectors - 1) / spec.grain_sectors;
    assert_eq!(
        grain_count as usize,
        spec.grains.len(),
        "grain spec count must cover the capacity"
    );
    let grain_bytes = (spec.grain_sectors * SECTOR) as usize;

    let gt_count = (grain_count + GTES_PER_GT - 1) / GTES_PER_GT;
    let gd_sector = 1 + DESCRIPTOR_SECTORS;
    let gd_sectors = (gt_count * 4 + SECTOR - 1) / SECTOR;
    let gt_first = gd_sector + gd_sectors;
    let gt_sectors_each = GTES_PER_GT * 4 / SECTOR;
    let data_start = gt_first + gt_count * gt_sectors_each;

    let mut image = vec![0u8; (data_start * SECTOR) as usize];

    // Header sector.
    let mut flags = 1u32;
    if spec.zeroed_grain_flag {
        flags |= 1 << 2;
    }
    if spec.compressed {
        flags |= 1 << 16;
    }
    image[0..4].copy_from_slice(&VMDK_MAGIC.to_le_bytes());
    image[4..8].copy_from_slice(&1u32.to_le_bytes());
    image[8..12].copy_from_slice(&flags.to_le_bytes());
    image[12..20].copy_from_slice(&spec.capacity_sectors.to_le_bytes());
    image[20..28].copy_from_slice(&spec.grain_sectors.to_le_bytes());
    image[28..36].copy_from_slice(&1u64.to_le_bytes()); // descriptor offset
    image[36..44].copy_from_slice(&DESCRIPTOR_SECTORS.to_le_bytes());
    image[44..48].copy_from_slice(&(GTES_PER_GT as u32).to_le_bytes());
    image[56..64].copy_from_slice(&gd_sector.to_le_bytes());
    if spec.compressed {
        image[77..79].copy_from_slice(&1u16.to_le_bytes()); // deflate
    }

    // Embedded descriptor.
    let mut text = String::from("# Disk DescriptorFile\nversion=1\nencoding=\"UTF-8\"\n");
    text.push_str(&format!("CID={:x}\n", spec.cid));
    text.push_str(&format!("parentCID={:x}\n", spec.parent_cid));
    text.push_str("createType=\"monolithicSparse\"\n");
    if let Some(parent) = spec.parent_filename {
        text.push_str(&format!("parentFileNameHint=\"{parent}\"\n"));
    }
    text.push_str("\n# Extent description\n");
    text.push_str(&format!(
        "RW {} SPARSE \"fixture.vmdk\"\n",
        spec.capacity_sectors
    ));
    let descriptor_start = SECTOR as usize;
    image[descriptor_start..descriptor_start + text.len()].copy_from_slice(text.as_bytes());

    // Grain data, recording each grain's sector for the tables.
    let mut entries = Vec::with_capacity(spec.grains.len());
    let mut next_sector = data_start;
    for (grain_index, grain) in spec.grains.iter().enumerate() {
        match grain {
            GrainSpec::Hole => entries.push(0u32),
            GrainSpec::Zeroed => entries.push(1u32),
            GrainSpec::Data(data) => {
                entries.push(next_sector as u32);
                let blob = if spec.compressed {
                    let compressed = deflate(data);
                    let mut blob = Vec::with_capacity(12 + compressed.len());
                    let lba = grain_index as u64 * spec.grain_sectors;
                    blob.extend_from_slice(&lba.to_le_bytes());
                    blob.extend_from_slice(&(compressed.len() as u32).to_le_bytes());
                    blob.extend_from_slice(&compressed);
                    while blob.len() % SECTOR as usize != 0 {
                        blob.push(0);
                    }
                    blob
                } else {
                    assert_eq!(data.len(), grain_bytes, "grain data must fill one grain");
                    data.clone()
                };
                next_sector += blob.len() as u64 / SECTOR;
                image.extend_from_slice(&blob);
            }
        }
    }

    // Grain directory and tables.
    for gt_index in 0..gt_count {
        let gd_offset = (gd_sector * SECTOR + gt_index * 4) as usize;
        let gt_sector = (gt_first + gt_index * gt_sectors_each) as u32;
        image[gd_offset..gd_offset + 4].copy_from_slice(&gt_sector.to_le_bytes());
    }
    for (grain_index, entry) in entries.iter().enumerate() {
        let gt_index = grain_index as u64 / GTES_PER_GT;
        let gte_index = grain_index as u64 % GTES_PER_GT;
        let offset = ((gt_first + gt_index * gt_sectors_each) * SECTOR + gte_index * 4) as usize;
        image[offset..offset + 4].copy_from_slice(&entry.to_le_bytes());
    }

    image
}

/// Writes a sparse fixture to `dir` and returns its path.
pub fn write_sparse_image(dir: &Path, name: &str, spec: &SparseImageSpec) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, build_sparse_image(spec)).expect("failed to write sparse fixture");
    path
}

/// Writes a single-extent flat image (descriptor plus `<name>-flat.vmdk`)
/// and returns the descriptor path. `data` must be a whole number of
/// sectors.
pub fn write_flat_image(dir: &Path, name: &str, cid: u32, data: &[u8]) -> PathBuf {
    assert_eq!(data.len() as u64 % SECTOR, 0);
    let sectors = data.len() as u64 / SECTOR;
    let flat_name = format!("{name}-flat.vmdk");
    let descriptor = format!(
        "# Disk DescriptorFile\n\
         version=1\n\
         CID={cid:x}\n\
         parentCID=ffffffff\n\
         createType=\"monolithicFlat\"\n\
         \n\
         # Extent description\n\
         RW {sectors} FLAT \"{flat_name}\" 0\n"
    );
    let path = dir.join(format!("{name}.vmdk"));
    fs::write(&path, descriptor).expect("failed to write descriptor fixture");
    fs::write(dir.join(flat_name), data).expect("failed to write flat fixture");
    path
}

/// A repeating byte pattern for verifiable reads.
pub fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len).map(|i| (i as u8).wrapping_add(seed)).collect()
}

fn deflate(data: &[u8]) -> Vec<u8> {
    use flate2::write::DeflateEncoder;
    use flate2::Compression;
    use std::io::Write;

    let mut encoder = DeflateEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).expect("deflate write failed");
    encoder.finish().expect("deflate finish failed")
}
