//! Shared fixtures: synthetic archives built with the published crypto
//! primitives, so every engine code path can be checked against known
//! plaintext.
#![allow(dead_code)]

use std::io::Cursor;

use nx_nca::crypto;
use nx_nca::io::StorageReader;
use nx_nca::keys::Keyset;
use nx_nca::nca::types::*;
use nx_nca::nca::{NcaContext, StorageKind};

pub const KAEK: [u8; 0x10] = [0x55; 0x10];
pub const XTS_KEY_1: [u8; 0x10] = [0xA1; 0x10];
pub const XTS_KEY_2: [u8; 0x10] = [0xB2; 0x10];
pub const CTR_KEY: [u8; 0x10] = [0xC3; 0x10];
pub const CONTENT_ID: ContentId = [0x33; 0x10];

pub fn header_key() -> [u8; 0x20] {
    core::array::from_fn(|i| i as u8)
}

pub fn test_keyset() -> Keyset {
    let mut keyset = Keyset::default();
    keyset.insert("header_key", header_key().to_vec());
    keyset.insert("key_area_key_application_00", KAEK.to_vec());
    keyset
}

/// One section of a synthetic archive. `offset` is absolute and must be a
/// multiple of 0x200 (at least 0xC00 for NCA2/NCA3); `plain` must be a
/// multiple of 0x200 long. For NCA0 the first 0x200 bytes of the section
/// region are replaced with the section header.
pub struct SectionSpec {
    pub slot: usize,
    pub offset: u64,
    pub plain: Vec<u8>,
    pub fs_header: NcaFsHeader,
    /// Encrypt the payload with this CTR-Ex generation instead of the plain
    /// counter.
    pub ctr_val: Option<u32>,
}

impl SectionSpec {
    pub fn new(slot: usize, offset: u64, plain: Vec<u8>, fs_header: NcaFsHeader) -> Self {
        assert_eq!(offset % 0x200, 0);
        assert_eq!(plain.len() % 0x200, 0);
        Self {
            slot,
            offset,
            plain,
            fs_header,
            ctr_val: None,
        }
    }
}

fn split_header_key() -> ([u8; 0x10], [u8; 0x10]) {
    let key = header_key();
    (
        key[..0x10].try_into().unwrap(),
        key[0x10..].try_into().unwrap(),
    )
}

/// Assemble and encrypt a complete archive image.
pub fn build_archive(
    version: NcaFormatVersion,
    distribution: NcaDistributionType,
    sections: &[SectionSpec],
) -> Vec<u8> {
    build_archive_with(version, distribution, sections, |_| {})
}

/// [`build_archive`] with a hook run on the fully populated plaintext
/// header right before encryption (rights id, signatures, ...).
pub fn build_archive_with(
    version: NcaFormatVersion,
    distribution: NcaDistributionType,
    sections: &[SectionSpec],
    customize: impl FnOnce(&mut NcaHeader),
) -> Vec<u8> {
    let total = sections
        .iter()
        .map(|s| s.offset + s.plain.len() as u64)
        .max()
        .unwrap_or(0)
        .max(NCA_FULL_HEADER_LENGTH);

    let mut header = NcaHeader::default();
    header.magic = match version {
        NcaFormatVersion::Nca3 => NCA3_MAGIC,
        NcaFormatVersion::Nca2 => NCA2_MAGIC,
        NcaFormatVersion::Nca0 => NCA0_MAGIC,
    };
    header.distribution_type = distribution;
    header.content_size = total;

    let decrypted_slots: [[u8; 0x10]; 4] = [XTS_KEY_1, XTS_KEY_2, CTR_KEY, [0; 0x10]];
    let used_slots = match version {
        NcaFormatVersion::Nca0 => 2,
        _ => 4,
    };
    for i in 0..used_slots {
        if decrypted_slots[i] != [0; 0x10] {
            header.encrypted_key_area[i] = crypto::ecb_encrypt_block(&KAEK, &decrypted_slots[i]);
        }
    }

    for spec in sections {
        let fs_header = spec.fs_header.to_bytes().unwrap();
        header.fs_info[spec.slot].start_sector = (spec.offset / 0x200) as u32;
        header.fs_info[spec.slot].end_sector =
            ((spec.offset + spec.plain.len() as u64) / 0x200) as u32;
        header.fs_header_hash[spec.slot] = crypto::sha256(&fs_header);
    }

    customize(&mut header);

    let (hk_1, hk_2) = split_header_key();
    let mut image = vec![0u8; total as usize];

    let mut header_bytes = header.to_bytes().unwrap();
    crypto::xts_encrypt(&hk_1, &hk_2, &mut header_bytes, 0, 0x200).unwrap();
    image[..NCA_HEADER_LENGTH].copy_from_slice(&header_bytes);

    for spec in sections {
        let upper_iv = spec.fs_header.aes_ctr_upper_iv;
        let mut payload = spec.plain.clone();

        match version {
            NcaFormatVersion::Nca0 => {
                // Header occupies the first sector of the section region;
                // the whole region is XTS'd with the key-area pair using
                // archive-wide sector numbers (minus the two header
                // sectors).
                payload[..NCA_FS_HEADER_LENGTH]
                    .copy_from_slice(&spec.fs_header.to_bytes().unwrap());
                let first_sector = (spec.offset - NCA_HEADER_LENGTH as u64) / 0x200;
                crypto::xts_encrypt(&XTS_KEY_1, &XTS_KEY_2, &mut payload, first_sector, 0x200)
                    .unwrap();
            }
            _ => {
                // Section header sits right after the archive header.
                let sector = match version {
                    NcaFormatVersion::Nca3 => 2 + spec.slot as u64,
                    _ => 0,
                };
                let mut fs_bytes = spec.fs_header.to_bytes().unwrap();
                crypto::xts_encrypt(&hk_1, &hk_2, &mut fs_bytes, sector, 0x200).unwrap();
                let at = NCA_HEADER_LENGTH + spec.slot * NCA_FS_HEADER_LENGTH;
                image[at..at + NCA_FS_HEADER_LENGTH].copy_from_slice(&fs_bytes);

                match spec.fs_header.encryption_type {
                    NcaEncryptionType::None => {}
                    NcaEncryptionType::AesXts => {
                        crypto::xts_encrypt(&XTS_KEY_1, &XTS_KEY_2, &mut payload, 0, 0x200)
                            .unwrap();
                    }
                    NcaEncryptionType::AesCtr | NcaEncryptionType::AesCtrEx => {
                        let iv = match spec.ctr_val {
                            Some(val) => crypto::partial_ctr_ex(upper_iv, val, spec.offset),
                            None => crypto::partial_ctr(upper_iv, spec.offset),
                        };
                        crypto::ctr_crypt(&CTR_KEY, &iv, &mut payload);
                    }
                    other => panic!("fixture does not support {other:?}"),
                }
            }
        }

        let at = spec.offset as usize;
        image[at..at + payload.len()].copy_from_slice(&payload);
    }

    image
}

pub fn open_archive(image: &[u8], keyset: &Keyset) -> nx_nca::Result<NcaContext> {
    open_archive_with_tickets(image, keyset, None)
}

pub fn open_archive_with_tickets(
    image: &[u8],
    keyset: &Keyset,
    tickets: Option<&dyn nx_nca::keys::TicketProvider>,
) -> nx_nca::Result<NcaContext> {
    NcaContext::new(
        Box::new(StorageReader::new(Cursor::new(image.to_vec()))),
        StorageKind::SdCard,
        image.len() as u64,
        CONTENT_ID,
        keyset,
        tickets,
    )
}

pub fn read_section_vec(
    ctx: &mut NcaContext,
    section: usize,
    offset: u64,
    size: usize,
) -> Vec<u8> {
    let mut out = vec![0u8; size];
    ctx.read_section(section, &mut out, offset).unwrap();
    out
}

/// Deterministic pseudo-random payload.
pub fn pattern_bytes(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed).wrapping_add((i >> 8) as u8))
        .collect()
}

/// CTR-encrypted PartitionFS section header with a defaulted flat tree (for
/// read-path tests that never touch the hash layers).
pub fn ctr_section_header(upper_iv: u64) -> NcaFsHeader {
    let mut header = NcaFsHeader::default();
    header.fs_type = NcaFsType::PartitionFs;
    header.hash_type = NcaHashType::HierarchicalSha256;
    header.encryption_type = NcaEncryptionType::AesCtr;
    header.hash_data = NcaHashData::HierarchicalSha256(HierarchicalSha256Data::default());
    header.aes_ctr_upper_iv = upper_iv;
    header
}

/// Flat-tree hashing: the final partial block hashes only its valid bytes.
pub fn flat_hash_table(data: &[u8], block_size: usize) -> Vec<u8> {
    let mut table = Vec::new();
    for chunk in data.chunks(block_size) {
        table.extend_from_slice(&crypto::sha256(chunk));
    }
    table
}

/// Build a section plaintext carrying a flat SHA-256 tree: hash table at
/// `table_offset`, data layer at `data_offset`. Returns the plaintext and
/// the populated section header.
pub fn build_flat_tree_section(
    data: &[u8],
    block_size: u32,
    table_offset: u64,
    data_offset: u64,
    upper_iv: u64,
) -> (Vec<u8>, NcaFsHeader) {
    let table = flat_hash_table(data, block_size as usize);

    let mut plain = vec![0u8; (data_offset as usize + data.len() + 0x1FF) & !0x1FF];
    plain[table_offset as usize..table_offset as usize + table.len()].copy_from_slice(&table);
    plain[data_offset as usize..data_offset as usize + data.len()].copy_from_slice(data);

    let mut hash_data = HierarchicalSha256Data::default();
    hash_data.master_hash = crypto::sha256(&table);
    hash_data.hash_block_size = block_size;
    hash_data.hash_region_count = 2;
    hash_data.hash_region[0] = NcaRegion {
        offset: table_offset,
        size: table.len() as u64,
    };
    hash_data.hash_region[1] = NcaRegion {
        offset: data_offset,
        size: data.len() as u64,
    };

    let mut header = NcaFsHeader::default();
    header.fs_type = NcaFsType::PartitionFs;
    header.hash_type = NcaHashType::HierarchicalSha256;
    header.encryption_type = NcaEncryptionType::AesCtr;
    header.hash_data = NcaHashData::HierarchicalSha256(hash_data);
    header.aes_ctr_upper_iv = upper_iv;

    (plain, header)
}

/// Integrity-tree hashing: every block is zero-padded to the full block
/// size before hashing.
pub fn ivfc_hash_level(child: &[u8], block_size: usize) -> Vec<u8> {
    let mut out = Vec::new();
    for chunk in child.chunks(block_size) {
        let mut block = vec![0u8; block_size];
        block[..chunk.len()].copy_from_slice(chunk);
        out.extend_from_slice(&crypto::sha256(&block));
    }
    out
}

/// Build a section plaintext carrying a six-level integrity tree over
/// `data`, with hash levels 0..=4 at the given offsets and the data layer
/// at `data_offset`.
pub fn build_integrity_tree_section(
    data: &[u8],
    block_order: u32,
    level_offsets: [u64; 5],
    data_offset: u64,
    upper_iv: u64,
) -> (Vec<u8>, NcaFsHeader) {
    let block_size = 1usize << block_order;

    // Hash upwards from the data layer.
    let mut level_bytes: Vec<Vec<u8>> = Vec::new();
    let mut child: Vec<u8> = data.to_vec();
    for _ in 0..5 {
        let level = ivfc_hash_level(&child, block_size);
        child = level.clone();
        level_bytes.push(level);
    }
    level_bytes.reverse(); // index 0 = level 0 (top hash level)

    let mut plain = vec![0u8; (data_offset as usize + data.len() + 0x1FF) & !0x1FF];
    for (i, bytes) in level_bytes.iter().enumerate() {
        let at = level_offsets[i] as usize;
        plain[at..at + bytes.len()].copy_from_slice(bytes);
    }
    plain[data_offset as usize..data_offset as usize + data.len()].copy_from_slice(data);

    let mut meta = IntegrityMetaInfo::default();
    meta.master_hash = crypto::sha256(&level_bytes[0]);
    for i in 0..5 {
        let mut level = NcaIntegrityLevel::default();
        level.offset = level_offsets[i];
        level.size = level_bytes[i].len() as u64;
        level.block_order = block_order;
        meta.level_info.levels[i] = level;
    }
    let mut data_level = NcaIntegrityLevel::default();
    data_level.offset = data_offset;
    data_level.size = data.len() as u64;
    data_level.block_order = block_order;
    meta.level_info.levels[5] = data_level;

    let mut header = NcaFsHeader::default();
    header.fs_type = NcaFsType::RomFs;
    header.hash_type = NcaHashType::HierarchicalIntegrity;
    header.encryption_type = NcaEncryptionType::AesCtr;
    header.hash_data = NcaHashData::HierarchicalIntegrity(meta);
    header.aes_ctr_upper_iv = upper_iv;

    (plain, header)
}
