//! Per-section random-access crypto: the fast/slow read pipeline and the
//! encrypt-block path used by the hash-tree patcher.
//!
//! Unaligned spans stage through the shared 8 MiB crypto buffer; aligned
//! reads decrypt straight into the caller's buffer. All public entry points
//! hold the staging-buffer mutex for their whole duration, including the
//! recursion on spans larger than the buffer.

use tracing::warn;

use crate::crypto;
use crate::error::{Error, Result};
use crate::io::{align_down, align_up, with_crypto_buffer, CRYPTO_BUFFER_SIZE};

use super::types::*;
use super::NcaContext;

/// Resolved crypto state for one section. The keys are picked at init time:
/// title key when a rights id is present, key-area slots otherwise (slot 2
/// for both CTR and CTR-Ex, slots 0/1 for XTS).
#[derive(Debug, Clone, Copy, Default)]
pub enum SectionCrypto {
    #[default]
    None,
    Xts {
        key_1: [u8; 0x10],
        key_2: [u8; 0x10],
    },
    Ctr {
        key: [u8; 0x10],
        upper_iv: u64,
    },
    CtrEx {
        key: [u8; 0x10],
        upper_iv: u64,
    },
}

/// State for one FS section slot. Disabled slots keep their raw header
/// bytes so that header re-encryption stays byte-exact.
pub struct NcaFsSectionContext {
    pub(crate) section_num: usize,
    pub(crate) enabled: bool,
    pub(crate) section_type: NcaFsSectionType,
    pub(crate) encryption_type: NcaEncryptionType,
    pub(crate) section_offset: u64,
    pub(crate) section_size: u64,
    pub(crate) has_sparse_layer: bool,
    pub(crate) sparse_table_offset: u64,
    pub(crate) sparse_table_size: u64,
    pub(crate) sparse_upper_iv: u64,
    pub(crate) crypto: SectionCrypto,
    pub(crate) header: Option<NcaFsHeader>,
    pub(crate) raw_header: [u8; NCA_FS_HEADER_LENGTH],
    pub(crate) encrypted_header: [u8; NCA_FS_HEADER_LENGTH],
    pub(crate) header_written: bool,
}

impl Default for NcaFsSectionContext {
    fn default() -> Self {
        Self {
            section_num: 0,
            enabled: false,
            section_type: NcaFsSectionType::Invalid,
            encryption_type: NcaEncryptionType::Auto,
            section_offset: 0,
            section_size: 0,
            has_sparse_layer: false,
            sparse_table_offset: 0,
            sparse_table_size: 0,
            sparse_upper_iv: 0,
            crypto: SectionCrypto::None,
            header: None,
            raw_header: [0; NCA_FS_HEADER_LENGTH],
            encrypted_header: [0; NCA_FS_HEADER_LENGTH],
            header_written: false,
        }
    }
}

impl NcaFsSectionContext {
    pub fn section_num(&self) -> usize {
        self.section_num
    }

    pub fn section_type(&self) -> NcaFsSectionType {
        self.section_type
    }

    pub fn encryption_type(&self) -> NcaEncryptionType {
        self.encryption_type
    }

    /// Absolute offset of the section payload within the archive.
    pub fn offset(&self) -> u64 {
        self.section_offset
    }

    pub fn size(&self) -> u64 {
        self.section_size
    }

    pub fn is_sparse(&self) -> bool {
        self.has_sparse_layer
    }

    pub fn sparse_table_offset(&self) -> u64 {
        self.sparse_table_offset
    }

    pub fn sparse_table_size(&self) -> u64 {
        self.sparse_table_size
    }

    /// Counter upper half for sparse-table reads: the section's upper IV
    /// with the bucket generation shifted into the generation field.
    pub fn sparse_upper_iv(&self) -> u64 {
        self.sparse_upper_iv
    }

    pub fn header(&self) -> Option<&NcaFsHeader> {
        self.header.as_ref()
    }

    /// Crypto unit the payload is aligned to: XTS sectors or AES blocks.
    fn crypto_unit(&self) -> u64 {
        match self.encryption_type {
            NcaEncryptionType::AesXts => crypto::XTS_SECTOR_SIZE,
            _ => crypto::AES_BLOCK_SIZE,
        }
    }
}

/// Freshly encrypted section block with its absolute archive placement.
#[derive(Debug, Clone)]
pub struct NcaEncryptedBlock {
    pub data: Vec<u8>,
    pub offset: u64,
}

/// Parameters of one read/encrypt operation after validation; plain copies
/// so the borrow of the section context ends before storage access starts.
#[derive(Clone, Copy)]
pub(crate) struct SectionView {
    section_offset: u64,
    crypto: SectionCrypto,
    unit: u64,
    is_nca0: bool,
}

impl NcaContext {
    /// Read decrypted section bytes at `offset` within the section.
    pub fn read_section(&mut self, section: usize, out: &mut [u8], offset: u64) -> Result<()> {
        let view = self.section_view(section, out.len() as u64, offset)?;
        with_crypto_buffer(|staging| self.read_section_inner(view, out, offset, None, staging))
    }

    /// Read decrypted bytes from a patch-RomFS (BKTR) section with the
    /// caller-supplied 32-bit generation mixed into the counter.
    pub fn read_ctr_ex_storage(
        &mut self,
        section: usize,
        out: &mut [u8],
        offset: u64,
        ctr_val: u32,
    ) -> Result<()> {
        let view = self.section_view(section, out.len() as u64, offset)?;
        {
            let fs = &self.fs_ctx[section];
            if fs.section_type != NcaFsSectionType::PatchRomFs
                || fs.encryption_type != NcaEncryptionType::AesCtrEx
            {
                return Err(Error::UnsupportedEncryption(fs.encryption_type));
            }
        }
        with_crypto_buffer(|staging| {
            self.read_section_inner(view, out, offset, Some(ctr_val), staging)
        })
    }

    /// Encrypt `data` as it would appear at `data_offset` within the
    /// section, returning the ciphertext block and its absolute offset.
    ///
    /// Unaligned ranges are widened to the crypto unit: the enclosing span
    /// is read back decrypted, the plaintext overlaid and the whole span
    /// re-encrypted. Sparse and CTR-Ex sections are rejected.
    pub fn generate_encrypted_block(
        &mut self,
        section: usize,
        data: &[u8],
        data_offset: u64,
    ) -> Result<NcaEncryptedBlock> {
        with_crypto_buffer(|staging| {
            self.generate_encrypted_block_with(section, data, data_offset, staging)
        })
    }

    /// Validate and snapshot the section parameters for one operation.
    pub(crate) fn section_view(
        &self,
        section: usize,
        read_size: u64,
        offset: u64,
    ) -> Result<SectionView> {
        let fs = self
            .fs_ctx
            .get(section)
            .ok_or(Error::InvalidArgument("section index out of range"))?;
        if !fs.enabled {
            return Err(Error::SectionDisabled(section));
        }
        if read_size == 0 {
            return Err(Error::InvalidArgument("empty section access"));
        }
        if offset.checked_add(read_size).map_or(true, |end| end > fs.section_size) {
            return Err(Error::OutOfRange {
                offset,
                size: read_size,
            });
        }
        let content_end = fs.section_offset + offset + read_size;
        if content_end > self.content_size() {
            return Err(Error::OutOfRange {
                offset: fs.section_offset + offset,
                size: read_size,
            });
        }

        Ok(SectionView {
            section_offset: fs.section_offset,
            crypto: fs.crypto,
            unit: fs.crypto_unit(),
            is_nca0: self.format_version() == NcaFormatVersion::Nca0,
        })
    }

    /// XTS sector number for payload data. NCA0 numbers sectors across the
    /// whole archive past the header; later formats restart per section.
    fn xts_payload_sector(view: &SectionView, section_relative: u64, content_offset: u64) -> u64 {
        let base = if view.is_nca0 {
            content_offset - NCA_HEADER_LENGTH as u64
        } else {
            section_relative
        };
        base / crypto::XTS_SECTOR_SIZE
    }

    fn decrypt_span(
        view: &SectionView,
        buf: &mut [u8],
        section_relative: u64,
        content_offset: u64,
        ctr_val: Option<u32>,
    ) -> Result<()> {
        match view.crypto {
            SectionCrypto::None => {}
            SectionCrypto::Xts { key_1, key_2 } => {
                let sector = Self::xts_payload_sector(view, section_relative, content_offset);
                crypto::xts_decrypt(
                    &key_1,
                    &key_2,
                    buf,
                    sector,
                    crypto::XTS_SECTOR_SIZE as usize,
                )?;
            }
            SectionCrypto::Ctr { key, upper_iv } | SectionCrypto::CtrEx { key, upper_iv } => {
                let iv = match ctr_val {
                    Some(val) => crypto::partial_ctr_ex(upper_iv, val, content_offset),
                    None => crypto::partial_ctr(upper_iv, content_offset),
                };
                crypto::ctr_crypt(&key, &iv, buf);
            }
        }
        Ok(())
    }

    fn encrypt_span(
        view: &SectionView,
        buf: &mut [u8],
        section_relative: u64,
        content_offset: u64,
    ) -> Result<()> {
        match view.crypto {
            SectionCrypto::None => Ok(()),
            SectionCrypto::Xts { key_1, key_2 } => {
                let sector = Self::xts_payload_sector(view, section_relative, content_offset);
                crypto::xts_encrypt(
                    &key_1,
                    &key_2,
                    buf,
                    sector,
                    crypto::XTS_SECTOR_SIZE as usize,
                )
            }
            SectionCrypto::Ctr { key, upper_iv } => {
                let iv = crypto::partial_ctr(upper_iv, content_offset);
                crypto::ctr_crypt(&key, &iv, buf);
                Ok(())
            }
            SectionCrypto::CtrEx { .. } => {
                Err(Error::UnsupportedEncryption(NcaEncryptionType::AesCtrEx))
            }
        }
    }

    pub(crate) fn read_section_inner(
        &mut self,
        view: SectionView,
        out: &mut [u8],
        offset: u64,
        ctr_val: Option<u32>,
        staging: &mut [u8],
    ) -> Result<()> {
        let read_size = out.len() as u64;
        let content_offset = view.section_offset + offset;

        // Plaintext sections and unit-aligned reads skip the staging buffer.
        let aligned = content_offset % view.unit == 0 && read_size % view.unit == 0;
        if matches!(view.crypto, SectionCrypto::None) || aligned {
            self.read_content(content_offset, out)?;
            return Self::decrypt_span(&view, out, offset, content_offset, ctr_val);
        }

        let block_start = align_down(content_offset, view.unit);
        let block_end = align_up(content_offset + read_size, view.unit);
        let block_size = block_end - block_start;

        let data_start = (content_offset - block_start) as usize;
        let chunk_size = block_size.min(CRYPTO_BUFFER_SIZE as u64) as usize;
        let out_chunk_size = if block_size > CRYPTO_BUFFER_SIZE as u64 {
            CRYPTO_BUFFER_SIZE - data_start
        } else {
            read_size as usize
        };

        let staged = &mut staging[..chunk_size];
        self.read_content(block_start, staged)?;
        Self::decrypt_span(
            &view,
            staged,
            offset - (content_offset - block_start),
            block_start,
            ctr_val,
        )?;

        out[..out_chunk_size].copy_from_slice(&staged[data_start..data_start + out_chunk_size]);

        if block_size > CRYPTO_BUFFER_SIZE as u64 {
            return self.read_section_inner(
                view,
                &mut out[out_chunk_size..],
                offset + out_chunk_size as u64,
                ctr_val,
                staging,
            );
        }
        Ok(())
    }

    pub(crate) fn generate_encrypted_block_with(
        &mut self,
        section: usize,
        data: &[u8],
        data_offset: u64,
        staging: &mut [u8],
    ) -> Result<NcaEncryptedBlock> {
        let view = self.section_view(section, data.len() as u64, data_offset)?;
        {
            let fs = &self.fs_ctx[section];
            if fs.has_sparse_layer {
                warn!("cannot generate encrypted blocks for sparse FS section #{section}");
                return Err(Error::SparseSection);
            }
            if fs.encryption_type == NcaEncryptionType::AesCtrEx {
                return Err(Error::UnsupportedEncryption(fs.encryption_type));
            }
        }

        let data_size = data.len() as u64;
        let content_offset = view.section_offset + data_offset;

        // Aligned blocks encrypt directly.
        if matches!(view.crypto, SectionCrypto::None)
            || (content_offset % view.unit == 0 && data_size % view.unit == 0)
        {
            let mut out = data.to_vec();
            Self::encrypt_span(&view, &mut out, data_offset, content_offset)?;
            return Ok(NcaEncryptedBlock {
                data: out,
                offset: content_offset,
            });
        }

        // Otherwise rebuild the enclosing aligned span around the plaintext.
        let block_start = align_down(data_offset, view.unit);
        let block_end = align_up(data_offset + data_size, view.unit);
        let block_size = (block_end - block_start) as usize;
        let plain_chunk_offset = (data_offset - block_start) as usize;
        let aligned_content_offset = view.section_offset + block_start;

        let mut out = vec![0u8; block_size];
        self.read_section_inner(view, &mut out, block_start, None, staging)?;
        out[plain_chunk_offset..plain_chunk_offset + data.len()].copy_from_slice(data);

        Self::encrypt_span(&view, &mut out, block_start, aligned_content_offset)?;

        Ok(NcaEncryptedBlock {
            data: out,
            offset: aligned_content_offset,
        })
    }
}
