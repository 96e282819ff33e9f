//! Hash-tree patch generation and application.
//!
//! Rewriting a byte range of a section's data layer invalidates every hash
//! layer above it. The patcher reads each affected layer window, substitutes
//! the new bytes, recomputes the hashes level by level up to the master hash
//! in the section header, and re-encrypts every modified span at its
//! original storage offset. The result is a patch set the caller splices
//! into whatever buffers it is about to write out; the archive itself is
//! never written through the block reader.

use tracing::debug;

use crate::crypto;
use crate::error::{Error, Result};
use crate::io::{align_down, align_up, with_crypto_buffer};

use super::types::*;
use super::NcaContext;

/// One re-encrypted layer span at its absolute archive offset.
#[derive(Debug, Clone)]
pub struct NcaPatchEntry {
    pub data: Vec<u8>,
    pub offset: u64,
    /// Set once the entry has been fully spliced into outbound buffers.
    pub written: bool,
}

impl NcaPatchEntry {
    pub fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// Every layer span that must overwrite the archive to keep the hash tree
/// consistent after a data-layer rewrite. Entry `i` belongs to layer `i`
/// (0 = top hash layer, last = data layer).
#[derive(Debug, Clone)]
pub struct NcaHashTreePatch {
    pub content_id: ContentId,
    pub layers: Vec<NcaPatchEntry>,
    pub written: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HashTreeKind {
    /// Flat SHA-256 regions; the final partial block hashes only its valid
    /// bytes.
    FlatSha256,
    /// Hierarchical integrity levels; partial tail blocks are zero-padded
    /// to the full block size before hashing.
    Integrity,
}

#[derive(Debug, Clone, Copy)]
struct LayerGeometry {
    offset: u64,
    size: u64,
    block_size: u64,
}

fn hash_tree_geometry(
    section: usize,
    header: &NcaFsHeader,
) -> Result<(HashTreeKind, Vec<LayerGeometry>)> {
    match &header.hash_data {
        NcaHashData::HierarchicalSha256(data) => {
            let count = data.hash_region_count as usize;
            if data.hash_block_size == 0
                || count == 0
                || count > NCA_HIERARCHICAL_SHA256_MAX_REGION_COUNT
            {
                return Err(Error::InvalidLayer(section));
            }
            let layers = data.hash_region[..count]
                .iter()
                .map(|region| LayerGeometry {
                    offset: region.offset,
                    size: region.size,
                    block_size: data.hash_block_size as u64,
                })
                .collect();
            Ok((HashTreeKind::FlatSha256, layers))
        }
        NcaHashData::HierarchicalIntegrity(data) => {
            if data.level_info.max_level_count != NCA_IVFC_MAX_LEVEL_COUNT {
                return Err(Error::InvalidLayer(section));
            }
            let layers = data
                .level_info
                .levels
                .iter()
                .map(|level| LayerGeometry {
                    offset: level.offset,
                    size: level.size,
                    block_size: level.block_size(),
                })
                .collect();
            Ok((HashTreeKind::Integrity, layers))
        }
        NcaHashData::Raw(_) => Err(Error::UnsupportedHashType(section)),
    }
}

impl NcaContext {
    /// Build the patch set for writing `data` at `data_offset` within the
    /// data layer of `section`.
    ///
    /// Works for both flat-SHA256 and hierarchical-integrity sections;
    /// sparse sections are rejected. On success the section header's master
    /// hash and the archive header's section-header hash have been updated,
    /// so the archive header is dirty and needs
    /// [`NcaContext::encrypt_header`] before write-back.
    pub fn generate_hash_tree_patch(
        &mut self,
        section: usize,
        data: &[u8],
        data_offset: u64,
    ) -> Result<NcaHashTreePatch> {
        with_crypto_buffer(|staging| {
            self.generate_hash_tree_patch_with(section, data, data_offset, staging)
        })
    }

    fn generate_hash_tree_patch_with(
        &mut self,
        section: usize,
        data: &[u8],
        data_offset: u64,
        staging: &mut [u8],
    ) -> Result<NcaHashTreePatch> {
        let fs = self
            .fs_ctx
            .get(section)
            .ok_or(Error::InvalidArgument("section index out of range"))?;
        if !fs.enabled {
            return Err(Error::SectionDisabled(section));
        }
        if fs.has_sparse_layer {
            return Err(Error::SparseSection);
        }
        let header = fs
            .header
            .as_ref()
            .ok_or(Error::SectionDisabled(section))?;

        let (kind, layers) = hash_tree_geometry(section, header)?;
        let layer_count = layers.len();
        let data_layer = layers[layer_count - 1];

        if data.is_empty() {
            return Err(Error::InvalidArgument("empty patch data"));
        }
        if data_offset
            .checked_add(data.len() as u64)
            .map_or(true, |end| end > data_layer.size)
        {
            return Err(Error::OutOfRange {
                offset: data_offset,
                size: data.len() as u64,
            });
        }

        let section_size = fs.section_size;
        let mut entries: Vec<Option<NcaPatchEntry>> = (0..layer_count).map(|_| None).collect();
        let mut master_hash = [0u8; 0x20];

        let mut cur_data: Vec<u8> = data.to_vec();
        let mut cur_data_offset = data_offset;
        let mut cur_data_size = data.len() as u64;

        for i in (0..layer_count).rev() {
            let layer = layers[i];
            let block = layer.block_size;

            if block <= 1 || layer.size == 0 || layer.offset + layer.size > section_size {
                return Err(Error::InvalidLayer(section));
            }

            // Window of the current layer enclosing the patch. Hash layers
            // align to the hash block; the master layer is hashed whole.
            let (read_start, read_end, parent_read_start, parent_read_size) = if i > 0 {
                let parent = layers[i - 1];
                if parent.size == 0 || parent.offset + parent.size > section_size {
                    return Err(Error::InvalidLayer(section));
                }
                let start = layer.offset + align_down(cur_data_offset, block);
                let end = layer.offset + align_up(cur_data_offset + cur_data_size, block);
                (
                    start,
                    end,
                    (cur_data_offset / block) * 0x20,
                    ((end - start) / block) * 0x20,
                )
            } else {
                (layer.offset, layer.offset + layer.size, 0, 0)
            };

            let patch_window_offset = (cur_data_offset - align_down(cur_data_offset, block)) as usize;

            // The buffer keeps the aligned-up size even when the read is
            // clamped at the layer end: integrity trees hash the zero tail
            // of the final block.
            let alloc_size = (read_end - read_start) as usize;
            let mut cur_block = vec![0u8; alloc_size];
            let read_end = read_end.min(layer.offset + layer.size);
            let read_size = read_end - read_start;

            let view = self.section_view(section, read_size, read_start)?;
            self.read_section_inner(
                view,
                &mut cur_block[..read_size as usize],
                read_start,
                None,
                staging,
            )?;

            cur_block[patch_window_offset..patch_window_offset + cur_data_size as usize]
                .copy_from_slice(&cur_data);

            if i > 0 {
                let parent = layers[i - 1];
                let mut parent_block = vec![0u8; parent_read_size as usize];
                let parent_abs = parent.offset + parent_read_start;

                let view = self.section_view(section, parent_read_size, parent_abs)?;
                self.read_section_inner(view, &mut parent_block, parent_abs, None, staging)?;

                let mut hash_block = block;
                let mut pos = 0u64;
                let mut slot = 0usize;
                while pos < read_size {
                    if kind == HashTreeKind::FlatSha256 && hash_block > read_size - pos {
                        hash_block = read_size - pos;
                    }
                    let start = pos as usize;
                    let digest = crypto::sha256(&cur_block[start..start + hash_block as usize]);
                    parent_block[slot * 0x20..(slot + 1) * 0x20].copy_from_slice(&digest);
                    pos += hash_block;
                    slot += 1;
                }

                let encrypted = self.generate_encrypted_block_with(
                    section,
                    &cur_block
                        [patch_window_offset..patch_window_offset + cur_data_size as usize],
                    layer.offset + cur_data_offset,
                    staging,
                )?;
                entries[i] = Some(NcaPatchEntry {
                    data: encrypted.data,
                    offset: encrypted.offset,
                    written: false,
                });

                // The recomputed hash slots become the next layer's patch.
                cur_data = parent_block;
                cur_data_offset = parent_read_start;
                cur_data_size = parent_read_size;
            } else {
                master_hash = crypto::sha256(&cur_block[..read_size as usize]);

                let encrypted = self.generate_encrypted_block_with(
                    section,
                    &cur_block
                        [patch_window_offset..patch_window_offset + cur_data_size as usize],
                    layer.offset + cur_data_offset,
                    staging,
                )?;
                entries[i] = Some(NcaPatchEntry {
                    data: encrypted.data,
                    offset: encrypted.offset,
                    written: false,
                });
            }
        }

        // Store the new master hash and refresh the section-header hash in
        // the archive header; the archive header is dirty from here on.
        let fs = &mut self.fs_ctx[section];
        if let Some(header) = fs.header.as_mut() {
            match &mut header.hash_data {
                NcaHashData::HierarchicalSha256(data) => data.master_hash = master_hash,
                NcaHashData::HierarchicalIntegrity(data) => data.master_hash = master_hash,
                NcaHashData::Raw(_) => {}
            }
            fs.raw_header = header.to_bytes()?;
        }
        self.header.fs_header_hash[section] = crypto::sha256(&self.fs_ctx[section].raw_header);

        let layers = entries
            .into_iter()
            .map(|entry| entry.ok_or(Error::InvalidLayer(section)))
            .collect::<Result<Vec<_>>>()?;

        Ok(NcaHashTreePatch {
            content_id: *self.content_id(),
            layers,
            written: false,
        })
    }

    /// Splice a patch set into a caller buffer covering archive range
    /// `[buf_offset, buf_offset + buf.len())`.
    ///
    /// Entries track their own written state, so a patch can be applied
    /// across several buffer batches and repeated applications are no-ops.
    /// `patch.written` ends up true once every entry has been fully
    /// consumed.
    pub fn write_patch_to_buffer(
        &self,
        patch: &mut NcaHashTreePatch,
        buf: &mut [u8],
        buf_offset: u64,
    ) {
        if patch.written
            || patch.content_id != *self.content_id()
            || patch.layers.is_empty()
            || buf.is_empty()
            || buf_offset.saturating_add(buf.len() as u64) > self.content_size()
        {
            return;
        }

        patch.written = true;

        for (i, entry) in patch.layers.iter_mut().enumerate() {
            if entry.written {
                continue;
            }
            if entry.offset.saturating_add(entry.size()) > self.content_size() {
                patch.written = false;
                continue;
            }

            entry.written = overlay(&entry.data, entry.offset, buf, buf_offset);
            if entry.written {
                debug!(
                    content_id = %self.content_id_str(),
                    "applied hash layer #{i} patch ({:#x} bytes at {:#x})",
                    entry.size(),
                    entry.offset
                );
            } else {
                patch.written = false;
            }
        }
    }
}

/// Overlay `patch` (living at absolute offset `patch_offset`) onto the part
/// of `buf` it intersects. Returns true iff this call consumed the patch's
/// tail.
pub(crate) fn overlay(patch: &[u8], patch_offset: u64, buf: &mut [u8], buf_offset: u64) -> bool {
    let patch_size = patch.len() as u64;
    let buf_size = buf.len() as u64;

    if patch.is_empty()
        || buf.is_empty()
        || buf_offset + buf_size <= patch_offset
        || patch_offset + patch_size <= buf_offset
    {
        return false;
    }

    let patch_start = patch_offset.max(buf_offset) - patch_offset;
    let buf_start = patch_offset.max(buf_offset) - buf_offset;
    let copy_size = (patch_size - patch_start).min(buf_size - buf_start);

    buf[buf_start as usize..(buf_start + copy_size) as usize]
        .copy_from_slice(&patch[patch_start as usize..(patch_start + copy_size) as usize]);

    patch_start + copy_size == patch_size
}
