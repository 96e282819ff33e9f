//! On-disk NCA header structures.
//!
//! Every struct here round-trips byte-exactly through binrw (all reserved
//! regions are modeled), because re-encryption and hash verification both
//! operate on the serialized form.

use binrw::prelude::*;
use binrw::io::Cursor;

use crate::error::Result;

/// Length of the archive header (signatures + metadata + key area).
pub const NCA_HEADER_LENGTH: usize = 0x400;
/// Length of one FS section header.
pub const NCA_FS_HEADER_LENGTH: usize = 0x200;
/// Archive header plus all four section headers.
pub const NCA_FULL_HEADER_LENGTH: u64 = 0xC00;
/// Number of FS section slots.
pub const NCA_FS_HEADER_COUNT: usize = 4;
/// Section start/end sectors are multiples of this.
pub const NCA_FS_SECTOR_SIZE: u64 = 0x200;
/// The main signature covers this many bytes starting at the magic.
pub const NCA_SIGNATURE_AREA_SIZE: usize = 0x200;
/// Bytes of the key area actually used (4 slots of 16).
pub const NCA_USED_KEY_AREA_SIZE: usize = 0x40;
/// Maximum number of HierarchicalSha256 hash regions.
pub const NCA_HIERARCHICAL_SHA256_MAX_REGION_COUNT: usize = 5;
/// Number of working levels in a hierarchical integrity tree.
pub const NCA_IVFC_LEVEL_COUNT: usize = 6;
/// `max_level_count` as stored on disk (includes the master level).
pub const NCA_IVFC_MAX_LEVEL_COUNT: u32 = 7;
/// Bucket tree magic for sparse/BKTR tables.
pub const NCA_BKTR_MAGIC: [u8; 4] = *b"BKTR";
pub const NCA_BKTR_VERSION: u32 = 1;

pub const NCA3_MAGIC: [u8; 4] = *b"NCA3";
pub const NCA2_MAGIC: [u8; 4] = *b"NCA2";
pub const NCA0_MAGIC: [u8; 4] = *b"NCA0";

/// Public exponent of the header main signature key.
pub const NCA_MAIN_SIGNATURE_EXPONENT: [u8; 3] = [0x01, 0x00, 0x01];

/// SHA-256 of the stored key area of an NCA0 whose key area is *not*
/// encrypted. Matching this marker means the key area can be used verbatim.
pub const NCA0_PLAINTEXT_KEY_AREA_HASH: [u8; 0x20] = [
    0x9A, 0xBB, 0xD2, 0x11, 0x86, 0x00, 0x21, 0x9D, 0x7A, 0xDC, 0x5B, 0x43, 0x95, 0xF8, 0x4E,
    0xFD, 0xFF, 0x6B, 0x25, 0xEF, 0x9F, 0x96, 0x85, 0x28, 0x18, 0x9E, 0x76, 0xB0, 0x92, 0xF0,
    0x6A, 0xCB,
];

/// 16-byte content identifier.
pub type ContentId = [u8; 0x10];

/// Byte offset of a section sector index.
pub const fn fs_sector_offset(sector: u32) -> u64 {
    sector as u64 * NCA_FS_SECTOR_SIZE
}

/// Archive format version, derived from the header magic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcaFormatVersion {
    Nca0,
    Nca2,
    Nca3,
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcaDistributionType {
    /// Downloaded from the CDN.
    Download = 0x00,
    /// Shipped on a gamecard.
    GameCard = 0x01,
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcaContentType {
    Program = 0x00,
    Meta = 0x01,
    Control = 0x02,
    Manual = 0x03,
    Data = 0x04,
    PublicData = 0x05,
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcaFsType {
    RomFs = 0x00,
    PartitionFs = 0x01,
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcaHashType {
    Auto = 0x00,
    None = 0x01,
    HierarchicalSha256 = 0x02,
    HierarchicalIntegrity = 0x03,
    /// [14.0.0+] SHA3 variants; recognized but not processed.
    AutoSha3 = 0x04,
    HierarchicalSha3256 = 0x05,
    HierarchicalIntegritySha3 = 0x06,
}

#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NcaEncryptionType {
    Auto = 0x00,
    None = 0x01,
    AesXts = 0x02,
    AesCtr = 0x03,
    AesCtrEx = 0x04,
    /// [14.0.0+] skip-layer-hash variants; recognized but not processed.
    AesCtrSkipLayerHash = 0x05,
    AesCtrExSkipLayerHash = 0x06,
}

/// Section type derived from (fs type, hash type, encryption, format).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NcaFsSectionType {
    PartitionFs,
    RomFs,
    PatchRomFs,
    Nca0RomFs,
    #[default]
    Invalid,
}

/// Section placement entry in the archive header. An all-zero entry means
/// the slot is unoccupied.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NcaFsInfo {
    pub start_sector: u32,
    pub end_sector: u32,
    pub hash_sector_size: u32,
    reserved: u32,
}

impl NcaFsInfo {
    pub fn is_populated(&self) -> bool {
        self.start_sector != 0 || self.end_sector != 0 || self.hash_sector_size != 0
            || self.reserved != 0
    }
}

/// One (offset, size) hash region, relative to the section start.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NcaRegion {
    pub offset: u64,
    pub size: u64,
}

/// Flat SHA-256 tree: a constant block size and up to five regions, the
/// last of which is the data layer.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct HierarchicalSha256Data {
    pub master_hash: [u8; 0x20],
    pub hash_block_size: u32,
    pub hash_region_count: u32,
    pub hash_region: [NcaRegion; NCA_HIERARCHICAL_SHA256_MAX_REGION_COUNT],
    reserved: [u8; 0x80],
}

impl Default for HierarchicalSha256Data {
    fn default() -> Self {
        Self {
            master_hash: [0; 0x20],
            hash_block_size: 0,
            hash_region_count: 0,
            hash_region: [NcaRegion::default(); NCA_HIERARCHICAL_SHA256_MAX_REGION_COUNT],
            reserved: [0; 0x80],
        }
    }
}

/// One verification level of a hierarchical integrity tree. Block size is
/// `1 << block_order`.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NcaIntegrityLevel {
    pub offset: u64,
    pub size: u64,
    pub block_order: u32,
    reserved: u32,
}

impl NcaIntegrityLevel {
    pub fn block_size(&self) -> u64 {
        1u64 << self.block_order
    }
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct NcaIntegrityLevelInfo {
    pub max_level_count: u32,
    pub levels: [NcaIntegrityLevel; NCA_IVFC_LEVEL_COUNT],
    pub signature_salt: [u8; 0x20],
}

impl Default for NcaIntegrityLevelInfo {
    fn default() -> Self {
        Self {
            max_level_count: NCA_IVFC_MAX_LEVEL_COUNT,
            levels: [NcaIntegrityLevel::default(); NCA_IVFC_LEVEL_COUNT],
            signature_salt: [0; 0x20],
        }
    }
}

/// Hierarchical integrity (IVFC) tree: six levels, the last being the data
/// layer, authenticated by the master hash.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct IntegrityMetaInfo {
    pub magic: [u8; 4],
    pub version: u32,
    pub master_hash_size: u32,
    pub level_info: NcaIntegrityLevelInfo,
    pub master_hash: [u8; 0x20],
    reserved: [u8; 0x18],
}

impl Default for IntegrityMetaInfo {
    fn default() -> Self {
        Self {
            magic: *b"IVFC",
            version: 0x20000,
            master_hash_size: 0x20,
            level_info: NcaIntegrityLevelInfo::default(),
            master_hash: [0; 0x20],
            reserved: [0; 0x18],
        }
    }
}

/// The 0xF8-byte hash-data area, interpreted by the section's hash type.
/// Unknown hash types round-trip untouched through the `Raw` arm.
#[binrw]
#[brw(little)]
#[br(import(hash_type: NcaHashType))]
#[derive(Debug, Clone)]
pub enum NcaHashData {
    #[br(pre_assert(hash_type == NcaHashType::HierarchicalSha256))]
    HierarchicalSha256(HierarchicalSha256Data),
    #[br(pre_assert(hash_type == NcaHashType::HierarchicalIntegrity))]
    HierarchicalIntegrity(IntegrityMetaInfo),
    Raw([u8; 0xF8]),
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NcaBucketTreeHeader {
    pub magic: [u8; 4],
    pub version: u32,
    pub entry_count: u32,
    reserved: u32,
}

#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NcaBucketInfo {
    pub offset: u64,
    pub size: u64,
    pub header: NcaBucketTreeHeader,
}

/// Sparse-storage metadata. `generation != 0` marks the section as sparse.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, Default)]
pub struct NcaSparseInfo {
    pub bucket: NcaBucketInfo,
    pub physical_offset: u64,
    pub generation: u16,
    reserved: [u8; 0x6],
}

/// FS section header (0x200 bytes), one per occupied slot.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct NcaFsHeader {
    pub version: u16,
    pub fs_type: NcaFsType,
    pub hash_type: NcaHashType,
    pub encryption_type: NcaEncryptionType,
    pub metadata_hash_type: u8,
    reserved_1: [u8; 0x2],
    #[br(args(hash_type))]
    pub hash_data: NcaHashData,
    pub patch_info: [u8; 0x40],
    /// Upper half of the AES counter. Low 32 bits are the generation, high
    /// 32 bits the secure value.
    pub aes_ctr_upper_iv: u64,
    pub sparse_info: NcaSparseInfo,
    pub compression_info: [u8; 0x28],
    pub metadata_hash_data_info: [u8; 0x30],
    reserved_2: [u8; 0x30],
}

impl Default for NcaFsHeader {
    fn default() -> Self {
        Self {
            version: 2,
            fs_type: NcaFsType::RomFs,
            hash_type: NcaHashType::Auto,
            encryption_type: NcaEncryptionType::Auto,
            metadata_hash_type: 0,
            reserved_1: [0; 0x2],
            hash_data: NcaHashData::Raw([0; 0xF8]),
            patch_info: [0; 0x40],
            aes_ctr_upper_iv: 0,
            sparse_info: NcaSparseInfo::default(),
            compression_info: [0; 0x28],
            metadata_hash_data_info: [0; 0x30],
            reserved_2: [0; 0x30],
        }
    }
}

impl NcaFsHeader {
    pub fn from_bytes(bytes: &[u8; NCA_FS_HEADER_LENGTH]) -> Result<Self> {
        Ok(Cursor::new(bytes).read_le()?)
    }

    pub fn to_bytes(&self) -> Result<[u8; NCA_FS_HEADER_LENGTH]> {
        let mut cursor = Cursor::new(Vec::with_capacity(NCA_FS_HEADER_LENGTH));
        self.write_le(&mut cursor)?;
        let buf = cursor.into_inner();
        <[u8; NCA_FS_HEADER_LENGTH]>::try_from(buf.as_slice()).map_err(|_| {
            crate::error::Error::InvalidArgument("FS header serialized to the wrong length")
        })
    }
}

/// Archive header (0x400 bytes).
#[binrw]
#[brw(little)]
#[derive(Debug, Clone)]
pub struct NcaHeader {
    /// RSA-2048-PSS over the 0x200 bytes starting at `magic`.
    pub main_signature: [u8; 0x100],
    /// Signature using a key from the ACID of the embedded NPDM.
    pub acid_signature: [u8; 0x100],
    pub magic: [u8; 4],
    pub distribution_type: NcaDistributionType,
    pub content_type: NcaContentType,
    pub key_generation_old: u8,
    pub kaek_index: u8,
    pub content_size: u64,
    pub program_id: u64,
    pub content_index: u32,
    pub sdk_version: u32,
    pub key_generation: u8,
    pub main_signature_key_generation: u8,
    reserved: [u8; 0xE],
    pub rights_id: [u8; 0x10],
    pub fs_info: [NcaFsInfo; NCA_FS_HEADER_COUNT],
    pub fs_header_hash: [[u8; 0x20]; NCA_FS_HEADER_COUNT],
    /// 16 key slots of 16 bytes; only the first four are used.
    pub encrypted_key_area: [[u8; 0x10]; 0x10],
}

impl Default for NcaHeader {
    fn default() -> Self {
        Self {
            main_signature: [0; 0x100],
            acid_signature: [0; 0x100],
            magic: NCA3_MAGIC,
            distribution_type: NcaDistributionType::Download,
            content_type: NcaContentType::Program,
            key_generation_old: 0,
            kaek_index: 0,
            content_size: 0,
            program_id: 0,
            content_index: 0,
            sdk_version: 0,
            key_generation: 0,
            main_signature_key_generation: 0,
            reserved: [0; 0xE],
            rights_id: [0; 0x10],
            fs_info: [NcaFsInfo::default(); NCA_FS_HEADER_COUNT],
            fs_header_hash: [[0; 0x20]; NCA_FS_HEADER_COUNT],
            encrypted_key_area: [[0; 0x10]; 0x10],
        }
    }
}

impl NcaHeader {
    pub fn from_bytes(bytes: &[u8; NCA_HEADER_LENGTH]) -> Result<Self> {
        Ok(Cursor::new(bytes).read_le()?)
    }

    pub fn to_bytes(&self) -> Result<[u8; NCA_HEADER_LENGTH]> {
        let mut cursor = Cursor::new(Vec::with_capacity(NCA_HEADER_LENGTH));
        self.write_le(&mut cursor)?;
        let buf = cursor.into_inner();
        <[u8; NCA_HEADER_LENGTH]>::try_from(buf.as_slice()).map_err(|_| {
            crate::error::Error::InvalidArgument("NCA header serialized to the wrong length")
        })
    }

    pub fn format_version(&self) -> Option<NcaFormatVersion> {
        match self.magic {
            NCA3_MAGIC => Some(NcaFormatVersion::Nca3),
            NCA2_MAGIC => Some(NcaFormatVersion::Nca2),
            NCA0_MAGIC => Some(NcaFormatVersion::Nca0),
            _ => None,
        }
    }

    /// Effective key generation: the newer of the two header fields.
    pub fn key_generation_value(&self) -> u8 {
        self.key_generation.max(self.key_generation_old)
    }

    /// A populated rights id means title-key crypto is in effect.
    pub fn rights_id_present(&self) -> bool {
        self.rights_id.iter().any(|&b| b != 0)
    }

    /// The first four key-area slots as a used-area view.
    pub fn used_key_area(&self) -> [[u8; 0x10]; 4] {
        [
            self.encrypted_key_area[0],
            self.encrypted_key_area[1],
            self.encrypted_key_area[2],
            self.encrypted_key_area[3],
        ]
    }
}
