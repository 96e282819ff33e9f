//! Hash-tree patch generation: flat SHA-256 and hierarchical integrity
//! trees, applied to a full image and re-verified from scratch.

mod common;

use common::*;
use nx_nca::crypto;
use nx_nca::error::Error;
use nx_nca::nca::types::*;
use nx_nca::nca::NcaContext;

const UPPER_IV: u64 = 0x1122_3344_0000_0000;
const SECTION_OFFSET: u64 = 0x1000;

fn flat_archive(data: &[u8], block_size: u32) -> (Vec<u8>, u64) {
    let data_offset = 0x1000u64;
    let (plain, header) = build_flat_tree_section(data, block_size, 0, data_offset, UPPER_IV);
    let spec = SectionSpec::new(0, SECTION_OFFSET, plain, header);
    let image = build_archive(
        NcaFormatVersion::Nca3,
        NcaDistributionType::Download,
        &[spec],
    );
    (image, data_offset)
}

fn integrity_archive(data: &[u8]) -> (Vec<u8>, u64, [u64; 5]) {
    let level_offsets = [0x0u64, 0x100, 0x200, 0x300, 0x400];
    let data_offset = 0x1000u64;
    let (plain, header) =
        build_integrity_tree_section(data, 12, level_offsets, data_offset, UPPER_IV);
    let spec = SectionSpec::new(0, SECTION_OFFSET, plain, header);
    let image = build_archive(
        NcaFormatVersion::Nca3,
        NcaDistributionType::Download,
        &[spec],
    );
    (image, data_offset, level_offsets)
}

/// Apply a freshly generated patch plus the dirty header to a copy of the
/// image and reopen it.
fn patch_and_reopen(
    image: &[u8],
    section: usize,
    data: &[u8],
    data_offset: u64,
) -> (Vec<u8>, NcaContext) {
    let keyset = test_keyset();
    let mut ctx = open_archive(image, &keyset).unwrap();
    assert!(!ctx.is_header_dirty());

    let mut patch = ctx.generate_hash_tree_patch(section, data, data_offset).unwrap();
    assert_eq!(patch.content_id, CONTENT_ID);
    assert!(ctx.is_header_dirty());

    let mut patched = image.to_vec();
    ctx.write_patch_to_buffer(&mut patch, &mut patched, 0);
    assert!(patch.written);
    for entry in &patch.layers {
        assert!(entry.written);
    }

    ctx.encrypt_header(&keyset).unwrap();
    ctx.write_encrypted_header(&mut patched, 0);
    assert!(ctx.header_written());

    let reopened = open_archive(&patched, &keyset).unwrap();
    (patched, reopened)
}

#[test]
fn flat_sha256_patch_keeps_every_layer_consistent() {
    let block_size = 0x1000u32;
    let data = pattern_bytes(0x8000, 0x61);
    let (image, data_offset) = flat_archive(&data, block_size);

    let keyset = test_keyset();
    {
        let mut ctx = open_archive(&image, &keyset).unwrap();
        let patch = ctx
            .generate_hash_tree_patch(0, &[0x11; 0x10], 0x4010)
            .unwrap();
        assert_eq!(patch.layers.len(), 2);
        // Data-layer entry lands at its exact archive offset (16-aligned
        // write, no widening).
        assert_eq!(
            patch.layers[1].offset,
            SECTION_OFFSET + data_offset + 0x4010
        );
        assert_eq!(patch.layers[1].size(), 0x10);
        // The hash-table entry covers the one modified hash slot.
        assert_eq!(patch.layers[0].offset, SECTION_OFFSET + 4 * 0x20);
        assert_eq!(patch.layers[0].size(), 0x20);
    }

    let mut expected = data.clone();
    expected[0x4010..0x4020].fill(0x11);

    let (_, mut reopened) = patch_and_reopen(&image, 0, &[0x11; 0x10], 0x4010);

    // Reopening already re-verified the section-header hash. Check the data
    // layer, the hash table and the master hash explicitly.
    let readback = read_section_vec(&mut reopened, 0, data_offset, expected.len());
    assert_eq!(readback, expected);

    let table = flat_hash_table(&expected, block_size as usize);
    let stored_table = read_section_vec(&mut reopened, 0, 0, table.len());
    assert_eq!(stored_table, table);

    let fs = reopened.fs_section(0).unwrap();
    match &fs.header().unwrap().hash_data {
        NcaHashData::HierarchicalSha256(hash_data) => {
            assert_eq!(hash_data.master_hash, crypto::sha256(&table));
        }
        other => panic!("wrong hash data: {other:?}"),
    }
}

#[test]
fn flat_sha256_patch_truncates_final_partial_block() {
    let block_size = 0x1000u32;
    // 0x2800 bytes: the final block only covers 0x800 bytes.
    let data = pattern_bytes(0x2800, 0x62);
    let (image, data_offset) = flat_archive(&data, block_size);

    let mut expected = data.clone();
    expected[0x2700..0x2708].fill(0x99);

    let (_, mut reopened) = patch_and_reopen(&image, 0, &[0x99; 8], 0x2700);

    let readback = read_section_vec(&mut reopened, 0, data_offset, expected.len());
    assert_eq!(readback, expected);

    let table = flat_hash_table(&expected, block_size as usize);
    let stored_table = read_section_vec(&mut reopened, 0, 0, table.len());
    assert_eq!(stored_table, table);
}

#[test]
fn integrity_patch_rebuilds_all_six_levels() {
    let data = pattern_bytes(0x4000, 0x63);
    let (image, data_offset, level_offsets) = integrity_archive(&data);

    let keyset = test_keyset();
    {
        let mut ctx = open_archive(&image, &keyset).unwrap();
        let patch = ctx
            .generate_hash_tree_patch(0, &[0x22; 0x10], 0x2005)
            .unwrap();
        assert_eq!(patch.layers.len(), NCA_IVFC_LEVEL_COUNT);
        // Unaligned data write widens to the enclosing AES blocks.
        assert_eq!(
            patch.layers[5].offset,
            SECTION_OFFSET + data_offset + 0x2000
        );
        assert_eq!(patch.layers[5].size(), 0x20);
    }

    let mut expected = data.clone();
    expected[0x2005..0x2015].fill(0x22);

    let (_, mut reopened) = patch_and_reopen(&image, 0, &[0x22; 0x10], 0x2005);

    let readback = read_section_vec(&mut reopened, 0, data_offset, expected.len());
    assert_eq!(readback, expected);

    // Recompute the whole chain bottom-up and compare against the stored
    // levels.
    let block_size = 0x1000usize;
    let mut child = expected.clone();
    let mut levels: Vec<Vec<u8>> = Vec::new();
    for _ in 0..5 {
        child = ivfc_hash_level(&child, block_size);
        levels.push(child.clone());
    }
    levels.reverse(); // index 0 = level 0

    for (i, expected_level) in levels.iter().enumerate() {
        let stored = read_section_vec(&mut reopened, 0, level_offsets[i], expected_level.len());
        assert_eq!(&stored, expected_level, "hash level {i}");
    }

    let fs = reopened.fs_section(0).unwrap();
    match &fs.header().unwrap().hash_data {
        NcaHashData::HierarchicalIntegrity(meta) => {
            assert_eq!(meta.master_hash, crypto::sha256(&levels[0]));
        }
        other => panic!("wrong hash data: {other:?}"),
    }
}

#[test]
fn patch_application_is_idempotent() {
    let data = pattern_bytes(0x4000, 0x64);
    let (image, _, _) = integrity_archive(&data);

    let keyset = test_keyset();
    let mut ctx = open_archive(&image, &keyset).unwrap();
    let mut patch = ctx
        .generate_hash_tree_patch(0, &[0x33; 0x20], 0x1000)
        .unwrap();

    let mut once = image.clone();
    ctx.write_patch_to_buffer(&mut patch, &mut once, 0);
    assert!(patch.written);

    let mut twice = once.clone();
    ctx.write_patch_to_buffer(&mut patch, &mut twice, 0);
    assert_eq!(twice, once);
}

#[test]
fn patch_applies_across_buffer_batches() {
    let data = pattern_bytes(0x8000, 0x65);
    let (image, _) = flat_archive(&data, 0x1000);

    let keyset = test_keyset();
    let mut ctx = open_archive(&image, &keyset).unwrap();
    let mut patch = ctx
        .generate_hash_tree_patch(0, &[0x44; 0x30], 0x0FF8)
        .unwrap();

    // Single-batch reference.
    let mut reference = image.clone();
    {
        let mut reference_patch = patch.clone();
        for entry in &mut reference_patch.layers {
            entry.written = false;
        }
        reference_patch.written = false;
        ctx.write_patch_to_buffer(&mut reference_patch, &mut reference, 0);
        assert!(reference_patch.written);
    }

    // Batched application over 0x800-byte windows.
    let mut batched = image.clone();
    for (i, chunk) in batched.chunks_mut(0x800).enumerate() {
        ctx.write_patch_to_buffer(&mut patch, chunk, (i * 0x800) as u64);
    }
    assert!(patch.written);
    assert_eq!(batched, reference);
}

#[test]
fn patch_is_bound_to_the_content_id() {
    let data = pattern_bytes(0x4000, 0x67);
    let (image, _, _) = integrity_archive(&data);

    let keyset = test_keyset();
    let mut ctx = open_archive(&image, &keyset).unwrap();
    let mut patch = ctx
        .generate_hash_tree_patch(0, &[0x55; 0x10], 0x0)
        .unwrap();
    assert_eq!(patch.content_id, CONTENT_ID);

    // Re-identifying the archive detaches existing patches.
    ctx.update_content_id(&[0xAB; 0x20]);
    assert_eq!(ctx.content_id(), &[0xAB; 0x10]);
    assert_eq!(ctx.content_id_str(), "ab".repeat(0x10));

    let mut untouched = image.clone();
    ctx.write_patch_to_buffer(&mut patch, &mut untouched, 0);
    assert!(!patch.written);
    assert_eq!(untouched, image);
}

#[test]
fn patch_rejects_invalid_requests() {
    let data = pattern_bytes(0x4000, 0x66);
    let (image, _, _) = integrity_archive(&data);

    let keyset = test_keyset();
    let mut ctx = open_archive(&image, &keyset).unwrap();

    // Past the data layer.
    assert!(matches!(
        ctx.generate_hash_tree_patch(0, &[0u8; 0x10], 0x3FF8),
        Err(Error::OutOfRange { .. })
    ));
    // Empty write.
    assert!(ctx.generate_hash_tree_patch(0, &[], 0).is_err());

    // A section without a populated hash tree cannot be patched.
    let plain = pattern_bytes(0x800, 0x00);
    let spec = SectionSpec::new(1, 0x1000, plain, ctr_section_header(0));
    let bare = build_archive(
        NcaFormatVersion::Nca3,
        NcaDistributionType::Download,
        &[spec],
    );
    let mut bare_ctx = open_archive(&bare, &keyset).unwrap();
    assert!(matches!(
        bare_ctx.generate_hash_tree_patch(1, &[0u8; 0x10], 0),
        Err(Error::InvalidLayer(1))
    ));
}
