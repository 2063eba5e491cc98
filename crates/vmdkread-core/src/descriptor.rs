//! VMDK descriptor parsing.
//!
//! A descriptor is the text section of a VMDK image: either a standalone
//! `.vmdk` file next to the extent data files, or a region embedded in a
//! hosted sparse extent file. It carries the content identifiers, the disk
//! type, the parent linkage for delta links, and the ordered extent list
//! that defines the image's logical address space.

use crate::error::{Error, Result};
use crate::sparse::SECTOR_SIZE;
use std::fmt;

/// Parent content identifier value meaning "no parent".
pub const PARENT_CID_NONE: u32 = 0xffff_ffff;

/// The type of a VMDK extent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentType {
    /// Flat extent - raw disk data in a separate file.
    Flat,
    /// Sparse extent - uses grain tables for allocation.
    Sparse,
    /// Zero extent - reads as zeroes, no backing storage.
    Zero,
    /// VMFS flat extent.
    Vmfs,
    /// VMFS sparse extent (COWD).
    VmfsSparse,
    /// VMFS raw device mapping.
    VmfsRdm,
    /// VMFS raw extent.
    VmfsRaw,
}

impl ExtentType {
    fn parse(s: &str) -> Result<Self> {
        match s.to_uppercase().as_str() {
            "FLAT" => Ok(ExtentType::Flat),
            "SPARSE" => Ok(ExtentType::Sparse),
            "ZERO" => Ok(ExtentType::Zero),
            "VMFS" => Ok(ExtentType::Vmfs),
            "VMFSSPARSE" => Ok(ExtentType::VmfsSparse),
            "VMFSRDM" => Ok(ExtentType::VmfsRdm),
            "VMFSRAW" => Ok(ExtentType::VmfsRaw),
            _ => Err(Error::descriptor(format!("unknown extent type: {s}"))),
        }
    }

    /// The keyword used for this type in descriptor extent lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExtentType::Flat => "FLAT",
            ExtentType::Sparse => "SPARSE",
            ExtentType::Zero => "ZERO",
            ExtentType::Vmfs => "VMFS",
            ExtentType::VmfsSparse => "VMFSSPARSE",
            ExtentType::VmfsRdm => "VMFSRDM",
            ExtentType::VmfsRaw => "VMFSRAW",
        }
    }
}

impl fmt::Display for ExtentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Access mode of an extent as declared in the descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtentAccess {
    /// Read-write extent.
    ReadWrite,
    /// Read-only extent.
    ReadOnly,
    /// Inaccessible extent.
    NoAccess,
}

impl ExtentAccess {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "RW" => Some(ExtentAccess::ReadWrite),
            "RDONLY" => Some(ExtentAccess::ReadOnly),
            "NOACCESS" => Some(ExtentAccess::NoAccess),
            _ => None,
        }
    }
}

/// A VMDK extent entry describing a portion of the disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtentRecord {
    /// Declared access mode.
    pub access: ExtentAccess,
    /// Size of this extent in 512-byte sectors.
    pub size_sectors: u64,
    /// Type of the extent.
    pub extent_type: ExtentType,
    /// Filename of the extent data file. ZERO extents carry none.
    pub filename: Option<String>,
    /// Offset of the extent data within its file, in sectors.
    pub start_sector: u64,
}

impl ExtentRecord {
    /// Size of this extent in bytes.
    pub fn size_bytes(&self) -> u64 {
        self.size_sectors * SECTOR_SIZE
    }
}

/// Disk type derived from the descriptor's `createType`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiskType {
    MonolithicFlat,
    MonolithicSparse,
    TwoGbExtentFlat,
    TwoGbExtentSparse,
    StreamOptimized,
    VmfsFlat,
    VmfsFlatPreAllocated,
    VmfsFlatZeroed,
    VmfsRaw,
    VmfsRdm,
    VmfsRdmp,
    VmfsSparse,
    VmfsSparseThin,
    Device,
    DevicePartitioned,
    Custom,
    /// createType value not recognized.
    Unknown,
}

impl DiskType {
    /// Classifies a descriptor `createType` value.
    pub fn from_create_type(value: &str) -> Self {
        // Case-insensitive, both spellings of the 2Gb split types accepted.
        match value.to_lowercase().as_str() {
            "monolithicflat" => DiskType::MonolithicFlat,
            "monolithicsparse" => DiskType::MonolithicSparse,
            "2gbmaxextentflat" | "twogbmaxextentflat" => DiskType::TwoGbExtentFlat,
            "2gbmaxextentsparse" | "twogbmaxextentsparse" => DiskType::TwoGbExtentSparse,
            "streamoptimized" => DiskType::StreamOptimized,
            "vmfs" => DiskType::VmfsFlat,
            "vmfspreallocated" => DiskType::VmfsFlatPreAllocated,
            "vmfseagerzeroedthick" => DiskType::VmfsFlatZeroed,
            "vmfsraw" => DiskType::VmfsRaw,
            "vmfsrdm" | "vmfsrawdevicemap" => DiskType::VmfsRdm,
            "vmfsrdmp" | "vmfspassthroughrawdevicemap" => DiskType::VmfsRdmp,
            "vmfssparse" => DiskType::VmfsSparse,
            "vmfsthin" => DiskType::VmfsSparseThin,
            "fulldevice" => DiskType::Device,
            "partitioneddevice" => DiskType::DevicePartitioned,
            "custom" => DiskType::Custom,
            _ => DiskType::Unknown,
        }
    }
}

impl fmt::Display for DiskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DiskType::MonolithicFlat => "monolithic flat",
            DiskType::MonolithicSparse => "monolithic sparse",
            DiskType::TwoGbExtentFlat => "2Gb extent flat",
            DiskType::TwoGbExtentSparse => "2Gb extent sparse",
            DiskType::StreamOptimized => "stream optimized",
            DiskType::VmfsFlat => "VMFS flat",
            DiskType::VmfsFlatPreAllocated => "VMFS flat pre-allocated",
            DiskType::VmfsFlatZeroed => "VMFS flat zeroed",
            DiskType::VmfsRaw => "VMFS raw",
            DiskType::VmfsRdm => "VMFS raw device mapping",
            DiskType::VmfsRdmp => "VMFS passthrough raw device mapping",
            DiskType::VmfsSparse => "VMFS sparse",
            DiskType::VmfsSparseThin => "VMFS sparse thin",
            DiskType::Device => "device",
            DiskType::DevicePartitioned => "partitioned device",
            DiskType::Custom => "custom",
            DiskType::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Parsed VMDK descriptor.
#[derive(Debug, Clone)]
pub struct VmdkDescriptor {
    /// Descriptor format version.
    pub version: u32,
    /// Descriptor text encoding, defaults to UTF-8.
    pub encoding: String,
    /// Content identifier of this layer.
    pub cid: u32,
    /// Declared content identifier of the parent layer.
    pub parent_cid: u32,
    /// Raw `createType` value.
    pub create_type: String,
    /// Disk type classified from `createType`.
    pub disk_type: DiskType,
    /// Path to the parent image for delta links.
    pub parent_filename: Option<String>,
    /// Ordered extent records.
    pub extents: Vec<ExtentRecord>,
    /// Disk geometry: cylinders.
    pub cylinders: u64,
    /// Disk geometry: heads.
    pub heads: u32,
    /// Disk geometry: sectors per track.
    pub sectors: u32,
    /// Disk adapter type (e.g., "lsilogic", "ide", "buslogic").
    pub adapter_type: String,
}

impl VmdkDescriptor {
    /// Total logical disk size in sectors.
    pub fn media_size_sectors(&self) -> u64 {
        self.extents.iter().map(|e| e.size_sectors).sum()
    }

    /// Total logical disk size in bytes.
    pub fn media_size_bytes(&self) -> u64 {
        self.media_size_sectors() * SECTOR_SIZE
    }

    /// Whether this descriptor declares a parent layer.
    pub fn has_parent(&self) -> bool {
        self.parent_cid != PARENT_CID_NONE
    }
}

/// Parse a VMDK descriptor from its text content.
///
/// # Errors
///
/// Returns an error if an extent line or a recognized header value is
/// malformed. Unknown keys are ignored.
pub fn parse_descriptor(content: &str) -> Result<VmdkDescriptor> {
    let mut version = 1;
    let mut encoding = String::from("UTF-8");
    let mut cid = 0u32;
    let mut parent_cid = PARENT_CID_NONE;
    let mut create_type = String::new();
    let mut parent_filename = None;
    let mut extents = Vec::new();
    let mut cylinders = 0u64;
    let mut heads = 0u32;
    let mut sectors = 0u32;
    let mut adapter_type = String::new();

    for line in content.lines() {
        let line = line.trim();

        // Skip empty lines and comments
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        // Extent lines start with an access mode keyword
        if let Some(access) = line.split_whitespace().next().and_then(ExtentAccess::parse) {
            extents.push(parse_extent_line(line, access)?);
            continue;
        }

        let Some((key, value)) = parse_key_value(line) else {
            continue;
        };
        match key.as_str() {
            "version" => {
                version = value
                    .parse()
                    .map_err(|_| Error::descriptor(format!("invalid version: {value}")))?;
            }
            "encoding" => {
                encoding = value;
            }
            "CID" => {
                cid = u32::from_str_radix(&value, 16)
                    .map_err(|_| Error::descriptor(format!("invalid CID: {value}")))?;
            }
            "parentCID" => {
                parent_cid = u32::from_str_radix(&value, 16)
                    .map_err(|_| Error::descriptor(format!("invalid parentCID: {value}")))?;
            }
            "createType" => {
                create_type = value;
            }
            "parentFileNameHint" => {
                parent_filename = Some(value);
            }
            "ddb.geometry.cylinders" => {
                cylinders = value
                    .parse()
                    .map_err(|_| Error::descriptor(format!("invalid cylinders: {value}")))?;
            }
            "ddb.geometry.heads" => {
                heads = value
                    .parse()
                    .map_err(|_| Error::descriptor(format!("invalid heads: {value}")))?;
            }
            "ddb.geometry.sectors" => {
                sectors = value
                    .parse()
                    .map_err(|_| Error::descriptor(format!("invalid sectors: {value}")))?;
            }
            "ddb.adapterType" => {
                adapter_type = value;
            }
            _ => {
                // Ignore unknown keys
            }
        }
    }

    let disk_type = DiskType::from_create_type(&create_type);

    Ok(VmdkDescriptor {
        version,
        encoding,
        cid,
        parent_cid,
        create_type,
        disk_type,
        parent_filename,
        extents,
        cylinders,
        heads,
        sectors,
        adapter_type,
    })
}

/// Parse a key=value or key = value line.
///
/// Returns None if the line doesn't contain an equals sign.
fn parse_key_value(line: &str) -> Option<(String, String)> {
    let eq_pos = line.find('=')?;
    let key = line[..eq_pos].trim().to_string();
    let mut value = line[eq_pos + 1..].trim().to_string();

    // Remove surrounding quotes if present
    if value.starts_with('"') && value.ends_with('"') && value.len() >= 2 {
        value = value[1..value.len() - 1].to_string();
    }

    Some((key, value))
}

/// Parse an extent line like: `RW 838860800 FLAT "disk-flat.vmdk" 0`
///
/// The filename and the trailing offset are optional: ZERO extents carry
/// neither, and sparse extent lines commonly omit the offset.
fn parse_extent_line(line: &str, access: ExtentAccess) -> Result<ExtentRecord> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 3 {
        return Err(Error::descriptor(format!("invalid extent line: {line}")));
    }

    let size_sectors: u64 = parts[1]
        .parse()
        .map_err(|_| Error::descriptor(format!("invalid extent size: {}", parts[1])))?;
    let extent_type = ExtentType::parse(parts[2])?;

    // Everything after the type keyword: an optional quoted filename
    // (which may contain spaces) and an optional sector offset.
    let rest = parts[3..].join(" ");
    let (filename, start_sector) = if rest.is_empty() {
        (None, 0)
    } else {
        let (filename, offset_str) = parse_quoted_filename_and_offset(&rest)?;
        let start_sector = if offset_str.is_empty() {
            0
        } else {
            offset_str
                .parse()
                .map_err(|_| Error::descriptor(format!("invalid extent offset: {offset_str}")))?
        };
        (Some(filename), start_sector)
    };

    if filename.is_none() && extent_type != ExtentType::Zero {
        return Err(Error::descriptor(format!(
            "{extent_type} extent without a data file: {line}"
        )));
    }

    Ok(ExtentRecord {
        access,
        size_sectors,
        extent_type,
        filename,
        start_sector,
    })
}

/// Parse a quoted filename followed by an optional offset from a string
/// like: `"disk-flat.vmdk" 0`
fn parse_quoted_filename_and_offset(s: &str) -> Result<(String, String)> {
    let s = s.trim();

    if !s.starts_with('"') {
        return Err(Error::descriptor(format!(
            "expected quoted filename, got: {s}"
        )));
    }

    let end_quote = s[1..]
        .find('"')
        .ok_or_else(|| Error::descriptor(format!("unclosed quote in: {s}")))?
        + 1;

    let filename = s[1..end_quote].to_string();
    let offset_str = s[end_quote + 1..].trim().to_string();

    Ok((filename, offset_str))
}

#[cfg(test)]
mod tests {
    use super::*;

    const DESCRIPTOR: &str = r#"
# Disk DescriptorFile
version=1
encoding="UTF-8"
CID=a1b2c3d4
parentCID=ffffffff
createType="twoGbMaxExtentSparse"

# Extent description
RW 4192256 SPARSE "disk-s001.vmdk"
RW 4192256 SPARSE "disk-s002.vmdk"
RW 2048 SPARSE "disk-s003.vmdk"

# The Disk Data Base
ddb.adapterType = "lsilogic"
ddb.geometry.cylinders = "522"
ddb.geometry.heads = "255"
ddb.geometry.sectors = "63"
"#;

    #[test]
    fn test_parse_descriptor_full() {
        let descriptor = parse_descriptor(DESCRIPTOR).unwrap();
        assert_eq!(descriptor.version, 1);
        assert_eq!(descriptor.encoding, "UTF-8");
        assert_eq!(descriptor.cid, 0xa1b2c3d4);
        assert_eq!(descriptor.parent_cid, PARENT_CID_NONE);
        assert!(!descriptor.has_parent());
        assert_eq!(descriptor.disk_type, DiskType::TwoGbExtentSparse);
        assert_eq!(descriptor.extents.len(), 3);
        assert_eq!(descriptor.media_size_sectors(), 4192256 * 2 + 2048);
        assert_eq!(descriptor.cylinders, 522);
        assert_eq!(descriptor.heads, 255);
        assert_eq!(descriptor.sectors, 63);
        assert_eq!(descriptor.adapter_type, "lsilogic");
    }

    #[test]
    fn test_parse_descriptor_delta_link() {
        let content = r#"
version=1
CID=11223344
parentCID=a1b2c3d4
createType="monolithicSparse"
parentFileNameHint="base.vmdk"
RW 2048 SPARSE "delta.vmdk"
"#;
        let descriptor = parse_descriptor(content).unwrap();
        assert!(descriptor.has_parent());
        assert_eq!(descriptor.parent_cid, 0xa1b2c3d4);
        assert_eq!(descriptor.parent_filename.as_deref(), Some("base.vmdk"));
    }

    #[test]
    fn test_extent_type_parse() {
        assert_eq!(ExtentType::parse("FLAT").unwrap(), ExtentType::Flat);
        assert_eq!(ExtentType::parse("flat").unwrap(), ExtentType::Flat);
        assert_eq!(ExtentType::parse("SPARSE").unwrap(), ExtentType::Sparse);
        assert_eq!(ExtentType::parse("ZERO").unwrap(), ExtentType::Zero);
        assert_eq!(ExtentType::parse("VMFS").unwrap(), ExtentType::Vmfs);
        assert_eq!(
            ExtentType::parse("VMFSSPARSE").unwrap(),
            ExtentType::VmfsSparse
        );
        assert_eq!(ExtentType::parse("VMFSRDM").unwrap(), ExtentType::VmfsRdm);
        assert_eq!(ExtentType::parse("VMFSRAW").unwrap(), ExtentType::VmfsRaw);
        assert!(ExtentType::parse("UNKNOWN").is_err());
    }

    #[test]
    fn test_disk_type_classification() {
        assert_eq!(
            DiskType::from_create_type("monolithicSparse"),
            DiskType::MonolithicSparse
        );
        assert_eq!(
            DiskType::from_create_type("monolithicFlat"),
            DiskType::MonolithicFlat
        );
        assert_eq!(
            DiskType::from_create_type("twoGbMaxExtentSparse"),
            DiskType::TwoGbExtentSparse
        );
        assert_eq!(
            DiskType::from_create_type("2GbMaxExtentSparse"),
            DiskType::TwoGbExtentSparse
        );
        assert_eq!(
            DiskType::from_create_type("streamOptimized"),
            DiskType::StreamOptimized
        );
        assert_eq!(DiskType::from_create_type("vmfs"), DiskType::VmfsFlat);
        assert_eq!(
            DiskType::from_create_type("vmfsRawDeviceMap"),
            DiskType::VmfsRdm
        );
        assert_eq!(DiskType::from_create_type("fullDevice"), DiskType::Device);
        assert_eq!(DiskType::from_create_type("garbage"), DiskType::Unknown);
    }

    #[test]
    fn test_parse_key_value_with_spaces() {
        let (key, value) = parse_key_value("ddb.geometry.cylinders = \"52216\"").unwrap();
        assert_eq!(key, "ddb.geometry.cylinders");
        assert_eq!(value, "52216");
    }

    #[test]
    fn test_parse_key_value_quoted() {
        let (key, value) = parse_key_value("createType=\"monolithicFlat\"").unwrap();
        assert_eq!(key, "createType");
        assert_eq!(value, "monolithicFlat");
    }

    #[test]
    fn test_parse_extent_line_flat() {
        let extent =
            parse_extent_line("RW 838860800 FLAT \"disk-flat.vmdk\" 0", ExtentAccess::ReadWrite)
                .unwrap();
        assert_eq!(extent.access, ExtentAccess::ReadWrite);
        assert_eq!(extent.size_sectors, 838860800);
        assert_eq!(extent.extent_type, ExtentType::Flat);
        assert_eq!(extent.filename.as_deref(), Some("disk-flat.vmdk"));
        assert_eq!(extent.start_sector, 0);
    }

    #[test]
    fn test_parse_extent_line_sparse_without_offset() {
        let extent =
            parse_extent_line("RW 12345 SPARSE \"disk.vmdk\"", ExtentAccess::ReadWrite).unwrap();
        assert_eq!(extent.size_sectors, 12345);
        assert_eq!(extent.extent_type, ExtentType::Sparse);
        assert_eq!(extent.filename.as_deref(), Some("disk.vmdk"));
        assert_eq!(extent.start_sector, 0);
    }

    #[test]
    fn test_parse_extent_line_zero() {
        let extent = parse_extent_line("RW 4096 ZERO", ExtentAccess::ReadWrite).unwrap();
        assert_eq!(extent.extent_type, ExtentType::Zero);
        assert_eq!(extent.filename, None);
        assert_eq!(extent.size_bytes(), 4096 * 512);
    }

    #[test]
    fn test_parse_extent_line_flat_needs_filename() {
        assert!(parse_extent_line("RW 4096 FLAT", ExtentAccess::ReadWrite).is_err());
    }

    #[test]
    fn test_parse_extent_line_filename_with_spaces() {
        let extent = parse_extent_line(
            "RDONLY 128 FLAT \"my disk file-flat.vmdk\" 64",
            ExtentAccess::ReadOnly,
        )
        .unwrap();
        assert_eq!(extent.access, ExtentAccess::ReadOnly);
        assert_eq!(extent.filename.as_deref(), Some("my disk file-flat.vmdk"));
        assert_eq!(extent.start_sector, 64);
    }

    #[test]
    fn test_parse_extent_line_unclosed_quote() {
        assert!(parse_extent_line("RW 128 FLAT \"disk.vmdk 0", ExtentAccess::ReadWrite).is_err());
    }

    #[test]
    fn test_invalid_cid() {
        assert!(parse_descriptor("CID=notahexvalue").is_err());
    }
}
