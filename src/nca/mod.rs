//! The NCA archive context: initialization, header codec, key-area codec.
//!
//! An [`NcaContext`] is built once from a block-level storage handle and a
//! key provider. Layout is immutable afterwards; the only mutable state is
//! the plaintext header (mutation helpers mark it dirty) and the
//! written-flags used while splicing encrypted headers and patches into
//! outbound buffers.

pub mod patch;
pub mod section;
pub mod types;

use tracing::{debug, warn};

use crate::crypto;
use crate::error::{Error, Result};
use crate::io::ContentStorage;
use crate::keys::{KaekIndex, KeyProvider, TicketProvider};

pub use patch::{NcaHashTreePatch, NcaPatchEntry};
pub use section::{NcaEncryptedBlock, NcaFsSectionContext, SectionCrypto};
use types::*;

/// Where the archive bytes live. Gamecard storage is removable, which is
/// relevant for ticket lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    BuiltInSystem,
    BuiltInUser,
    SdCard,
    GameCard,
}

impl StorageKind {
    pub fn is_removable(self) -> bool {
        matches!(self, StorageKind::GameCard)
    }
}

/// Processing context for one content archive.
pub struct NcaContext {
    storage: Box<dyn ContentStorage>,
    storage_kind: StorageKind,
    content_id: ContentId,
    content_id_str: String,
    content_size: u64,
    format_version: NcaFormatVersion,
    key_generation: u8,
    rights_id_available: bool,
    titlekey: Option<[u8; 0x10]>,
    valid_main_signature: bool,
    header: NcaHeader,
    encrypted_header: [u8; NCA_HEADER_LENGTH],
    header_hash: [u8; 0x20],
    decrypted_key_area: [[u8; 0x10]; 4],
    pub(crate) fs_ctx: [NcaFsSectionContext; NCA_FS_HEADER_COUNT],
    header_written: bool,
}

impl NcaContext {
    /// Read and decrypt the archive header, resolve keys and enumerate the
    /// FS sections.
    ///
    /// `content_size` is the declared archive size; it must match the
    /// header's own `content_size`. Per-section problems disable the
    /// affected slot only; the archive stays inspectable even when no slot
    /// survives.
    pub fn new(
        storage: Box<dyn ContentStorage>,
        storage_kind: StorageKind,
        content_size: u64,
        content_id: ContentId,
        keys: &dyn KeyProvider,
        tickets: Option<&dyn TicketProvider>,
    ) -> Result<Self> {
        if content_size < NCA_FULL_HEADER_LENGTH {
            return Err(Error::TruncatedArchive(content_size));
        }

        let header_key = keys.header_key().ok_or(Error::MissingHeaderKey)?;
        let (hk_1, hk_2) = split_xts_key(&header_key);

        let mut storage = storage;
        let mut encrypted_header = [0u8; NCA_HEADER_LENGTH];
        storage.read_at(0, &mut encrypted_header)?;

        let mut plain = encrypted_header;
        crypto::xts_decrypt(&hk_1, &hk_2, &mut plain, 0, NCA_FS_SECTOR_SIZE as usize)?;
        let header = NcaHeader::from_bytes(&plain)?;

        let format_version = header
            .format_version()
            .ok_or(Error::InvalidMagic(header.magic))?;
        if header.content_size != content_size {
            return Err(Error::SizeMismatch {
                header: header.content_size,
                actual: content_size,
            });
        }

        let key_generation = header.key_generation_value();
        let rights_id_available = header.rights_id_present();
        let header_hash = crypto::sha256(&plain);

        let valid_main_signature = verify_main_signature(&header, &plain, keys);
        if !valid_main_signature {
            debug!(
                content_id = %hex::encode(content_id),
                "NCA main signature did not verify"
            );
        }

        let titlekey = if rights_id_available {
            let key = tickets
                .and_then(|t| t.title_key(&header.rights_id, storage_kind.is_removable()));
            if key.is_none() {
                warn!(
                    content_id = %hex::encode(content_id),
                    "no title key available for rights id {}",
                    hex::encode(header.rights_id)
                );
            }
            key
        } else {
            None
        };

        // Rights-id archives keep their key area encrypted and unused.
        let decrypted_key_area = if rights_id_available {
            [[0u8; 0x10]; 4]
        } else {
            decrypt_key_area(&header, format_version, key_generation, keys)?
        };

        let mut ctx = Self {
            storage,
            storage_kind,
            content_id,
            content_id_str: hex::encode(content_id),
            content_size,
            format_version,
            key_generation,
            rights_id_available,
            titlekey,
            valid_main_signature,
            header,
            encrypted_header,
            header_hash,
            decrypted_key_area,
            fs_ctx: Default::default(),
            header_written: false,
        };

        ctx.read_fs_headers(&hk_1, &hk_2)?;
        ctx.initialize_sections();

        if !ctx.fs_ctx.iter().any(|fs| fs.enabled) {
            warn!(
                content_id = %ctx.content_id_str,
                "no valid FS sections in archive"
            );
        }

        Ok(ctx)
    }

    /// Read raw (encrypted) archive bytes through the block reader.
    pub fn read_content(&mut self, offset: u64, out: &mut [u8]) -> Result<()> {
        if out.is_empty() {
            return Err(Error::InvalidArgument("empty content read"));
        }
        let end = offset
            .checked_add(out.len() as u64)
            .ok_or(Error::OutOfRange {
                offset,
                size: out.len() as u64,
            })?;
        if end > self.content_size {
            return Err(Error::OutOfRange {
                offset,
                size: out.len() as u64,
            });
        }
        self.storage.read_at(offset, out)?;
        Ok(())
    }

    /// Re-encrypt the plaintext headers into their on-disk form.
    ///
    /// A no-op when the header was never mutated.
    pub fn encrypt_header(&mut self, keys: &dyn KeyProvider) -> Result<()> {
        if !self.is_header_dirty() {
            return Ok(());
        }

        let header_key = keys.header_key().ok_or(Error::MissingHeaderKey)?;
        let (hk_1, hk_2) = split_xts_key(&header_key);

        let mut plain = self.header.to_bytes()?;
        crypto::xts_encrypt(&hk_1, &hk_2, &mut plain, 0, NCA_FS_SECTOR_SIZE as usize)?;
        self.encrypted_header = plain;

        for i in 0..NCA_FS_HEADER_COUNT {
            if !self.header.fs_info[i].is_populated() {
                continue;
            }
            let sector = self.fs_header_sector(i);
            let mut buf = self.fs_ctx[i].raw_header;
            match self.format_version {
                // NCA0 section headers use the key area XTS pair, not the
                // header key.
                NcaFormatVersion::Nca0 => crypto::xts_encrypt(
                    &self.decrypted_key_area[0],
                    &self.decrypted_key_area[1],
                    &mut buf,
                    sector,
                    NCA_FS_SECTOR_SIZE as usize,
                )?,
                _ => crypto::xts_encrypt(
                    &hk_1,
                    &hk_2,
                    &mut buf,
                    sector,
                    NCA_FS_SECTOR_SIZE as usize,
                )?,
            }
            self.fs_ctx[i].encrypted_header = buf;
        }

        Ok(())
    }

    /// Whether the plaintext header differs from the one read at init.
    pub fn is_header_dirty(&self) -> bool {
        match self.header.to_bytes() {
            Ok(bytes) => crypto::sha256(&bytes) != self.header_hash,
            Err(_) => true,
        }
    }

    /// Splice the encrypted archive header and section headers into a
    /// caller buffer covering archive range `[buf_offset, buf_offset+len)`.
    ///
    /// Tracks per-header written flags across batches; call
    /// [`Self::header_written`] to see whether everything landed.
    pub fn write_encrypted_header(&mut self, buf: &mut [u8], buf_offset: u64) {
        if self.header_written
            || buf.is_empty()
            || buf_offset.saturating_add(buf.len() as u64) > self.content_size
        {
            return;
        }

        self.header_written = true;

        if buf_offset < NCA_HEADER_LENGTH as u64
            && !patch::overlay(&self.encrypted_header, 0, buf, buf_offset)
        {
            self.header_written = false;
            return;
        }

        for i in 0..NCA_FS_HEADER_COUNT {
            let header_offset = match self.format_version {
                NcaFormatVersion::Nca0 => self.fs_ctx[i].section_offset,
                _ => NCA_HEADER_LENGTH as u64 + (i * NCA_FS_HEADER_LENGTH) as u64,
            };
            let fs = &mut self.fs_ctx[i];
            if !fs.enabled || fs.header_written {
                continue;
            }
            fs.header_written = patch::overlay(&fs.encrypted_header, header_offset, buf, buf_offset);
            if !fs.header_written {
                self.header_written = false;
            }
        }
    }

    /// Flip the distribution type to `Download` (gamecard rips are usually
    /// re-distributed this way).
    pub fn set_download_distribution(&mut self) {
        if self.header.distribution_type == NcaDistributionType::Download {
            return;
        }
        self.header.distribution_type = NcaDistributionType::Download;
        debug!(
            content_id = %self.content_id_str,
            "set download distribution type"
        );
    }

    /// Convert a titlekey-crypto archive to standard key-area crypto: the
    /// title key becomes the key-area CTR entry, the key area is
    /// re-encrypted and the rights id wiped.
    pub fn remove_titlekey_crypto(&mut self, keys: &dyn KeyProvider) -> Result<()> {
        if !self.rights_id_available {
            return Ok(());
        }
        let titlekey = self
            .titlekey
            .ok_or(Error::InvalidArgument("title key was never resolved"))?;

        // AES-XTS is never used by sections of a rights-id archive, and
        // patch RomFS sections key CTR-Ex from the same CTR slot.
        self.decrypted_key_area[2] = titlekey;
        self.encrypt_key_area(keys)?;

        self.header.rights_id = [0; 0x10];
        self.rights_id_available = false;

        debug!(content_id = %self.content_id_str, "removed titlekey crypto");
        Ok(())
    }

    /// Refresh the content id (and its hex form) after re-hashing a
    /// modified archive.
    pub fn update_content_id(&mut self, hash: &[u8; 0x20]) {
        self.content_id.copy_from_slice(&hash[..0x10]);
        self.content_id_str = hex::encode(self.content_id);
    }

    fn encrypt_key_area(&mut self, keys: &dyn KeyProvider) -> Result<()> {
        let key_count = self.used_key_count();

        if self.is_version0_plaintext_key_area() {
            for i in 0..4 {
                self.header.encrypted_key_area[i] = self.decrypted_key_area[i];
            }
            return Ok(());
        }

        let index = KaekIndex::try_from(self.header.kaek_index)?;
        let kaek = keys
            .key_area_key(index, self.key_generation)
            .ok_or(Error::MissingKeyAreaKey {
                index,
                generation: self.key_generation,
            })?;

        for i in 0..4 {
            self.header.encrypted_key_area[i] = [0; 0x10];
        }
        for i in 0..key_count {
            let src = &self.decrypted_key_area[i];
            if src.iter().all(|&b| b == 0) {
                continue;
            }
            self.header.encrypted_key_area[i] = crypto::ecb_encrypt_block(&kaek, src);
        }

        Ok(())
    }

    fn used_key_count(&self) -> usize {
        match self.format_version {
            NcaFormatVersion::Nca0 => 2,
            _ => 4,
        }
    }

    fn is_version0_plaintext_key_area(&self) -> bool {
        is_version0_plaintext_key_area(&self.header, self.format_version)
    }

    /// XTS sector number for section header `i`, depending on the format:
    /// NCA3 numbers sectors contiguously after the two header sectors,
    /// NCA2 encrypts every section header as its own sector 0, and NCA0
    /// numbers sectors across the whole archive minus the two header
    /// sectors.
    fn fs_header_sector(&self, i: usize) -> u64 {
        match self.format_version {
            NcaFormatVersion::Nca3 => 2 + i as u64,
            NcaFormatVersion::Nca2 => 0,
            NcaFormatVersion::Nca0 => {
                (self.header.fs_info[i].start_sector as u64).wrapping_sub(2)
            }
        }
    }

    fn fs_header_offset(&self, i: usize) -> u64 {
        match self.format_version {
            NcaFormatVersion::Nca0 => fs_sector_offset(self.header.fs_info[i].start_sector),
            _ => NCA_HEADER_LENGTH as u64 + (i * NCA_FS_HEADER_LENGTH) as u64,
        }
    }

    fn read_fs_headers(&mut self, hk_1: &[u8; 0x10], hk_2: &[u8; 0x10]) -> Result<()> {
        for i in 0..NCA_FS_HEADER_COUNT {
            if !self.header.fs_info[i].is_populated() {
                continue;
            }

            let header_offset = self.fs_header_offset(i);
            let sector = self.fs_header_sector(i);

            let mut encrypted = [0u8; NCA_FS_HEADER_LENGTH];
            self.read_content(header_offset, &mut encrypted)?;

            let mut plain = encrypted;
            match self.format_version {
                NcaFormatVersion::Nca0 => crypto::xts_decrypt(
                    &self.decrypted_key_area[0],
                    &self.decrypted_key_area[1],
                    &mut plain,
                    sector,
                    NCA_FS_SECTOR_SIZE as usize,
                )?,
                _ => crypto::xts_decrypt(
                    hk_1,
                    hk_2,
                    &mut plain,
                    sector,
                    NCA_FS_SECTOR_SIZE as usize,
                )?,
            }

            let fs = &mut self.fs_ctx[i];
            fs.section_num = i;
            fs.encrypted_header = encrypted;
            fs.raw_header = plain;
        }

        Ok(())
    }

    /// Type, bounds and crypto resolution for every populated slot. A slot
    /// that fails any check is left disabled; the archive stays usable as
    /// long as one slot survives.
    fn initialize_sections(&mut self) {
        for i in 0..NCA_FS_HEADER_COUNT {
            if !self.header.fs_info[i].is_populated() {
                continue;
            }

            // A checksum mismatch silently disables the slot.
            let hash = crypto::sha256(&self.fs_ctx[i].raw_header);
            if hash != self.header.fs_header_hash[i] {
                warn!(
                    content_id = %self.content_id_str,
                    "FS section #{i} header hash mismatch, disabling"
                );
                continue;
            }

            let header = match NcaFsHeader::from_bytes(&self.fs_ctx[i].raw_header) {
                Ok(header) => header,
                Err(err) => {
                    warn!(
                        content_id = %self.content_id_str,
                        "FS section #{i} header failed to parse ({err}), disabling"
                    );
                    continue;
                }
            };

            let section_offset = fs_sector_offset(self.header.fs_info[i].start_sector);
            let section_size =
                fs_sector_offset(self.header.fs_info[i].end_sector).saturating_sub(section_offset);
            if section_offset < NCA_HEADER_LENGTH as u64 || section_size == 0 {
                continue;
            }

            let encryption_type = match self.resolve_encryption_type(i, &header) {
                Some(enc) => enc,
                None => continue,
            };

            let section_type = self.resolve_section_type(&header, encryption_type);
            if section_type == NcaFsSectionType::Invalid {
                continue;
            }

            let has_sparse_layer = header.sparse_info.generation != 0;
            let mut sparse_table_offset = 0;
            let mut sparse_table_size = 0;
            if has_sparse_layer {
                let sparse = &header.sparse_info;
                let raw_offset = sparse.physical_offset;
                let raw_size = sparse.bucket.offset.saturating_add(sparse.bucket.size);
                if sparse.bucket.header.magic != NCA_BKTR_MAGIC
                    || sparse.bucket.header.version != NCA_BKTR_VERSION
                    || raw_offset < NCA_HEADER_LENGTH as u64
                    || raw_size == 0
                    || raw_offset.saturating_add(raw_size) > self.content_size
                    || sparse.bucket.header.entry_count == 0
                {
                    warn!(
                        content_id = %self.content_id_str,
                        "FS section #{i} has an invalid sparse bucket, disabling"
                    );
                    continue;
                }
                sparse_table_offset = sparse.physical_offset + sparse.bucket.offset;
                sparse_table_size = sparse.bucket.size;
            } else if section_offset.saturating_add(section_size) > self.content_size {
                continue;
            }

            let crypto_state = match self.resolve_section_crypto(i, &header, encryption_type) {
                Some(state) => state,
                None => continue,
            };

            let fs = &mut self.fs_ctx[i];
            fs.section_type = section_type;
            fs.encryption_type = encryption_type;
            fs.section_offset = section_offset;
            fs.section_size = section_size;
            fs.has_sparse_layer = has_sparse_layer;
            fs.sparse_table_offset = sparse_table_offset;
            fs.sparse_table_size = sparse_table_size;
            fs.sparse_upper_iv = upper_iv_with_generation(
                header.aes_ctr_upper_iv,
                (header.sparse_info.generation as u32) << 16,
            );
            fs.crypto = crypto_state;
            fs.header = Some(header);
            fs.enabled = true;
        }
    }

    fn resolve_encryption_type(
        &self,
        section_num: usize,
        header: &NcaFsHeader,
    ) -> Option<NcaEncryptionType> {
        // NCA0 predates the encryption type field; sections are always XTS.
        let mut encryption_type = if self.format_version == NcaFormatVersion::Nca0 {
            NcaEncryptionType::AesXts
        } else {
            header.encryption_type
        };

        if encryption_type == NcaEncryptionType::Auto {
            encryption_type = match section_num {
                0 | 1 => NcaEncryptionType::AesCtr, // ExeFS / RomFS
                2 => NcaEncryptionType::None,       // logo partition
                _ => NcaEncryptionType::Auto,
            };
        }

        match encryption_type {
            NcaEncryptionType::None
            | NcaEncryptionType::AesXts
            | NcaEncryptionType::AesCtr
            | NcaEncryptionType::AesCtrEx => Some(encryption_type),
            _ => None,
        }
    }

    fn resolve_section_type(
        &self,
        header: &NcaFsHeader,
        encryption_type: NcaEncryptionType,
    ) -> NcaFsSectionType {
        match (header.fs_type, header.hash_type) {
            (NcaFsType::PartitionFs, NcaHashType::HierarchicalSha256) => {
                NcaFsSectionType::PartitionFs
            }
            (NcaFsType::RomFs, NcaHashType::HierarchicalIntegrity) => {
                if encryption_type == NcaEncryptionType::AesCtrEx {
                    NcaFsSectionType::PatchRomFs
                } else {
                    NcaFsSectionType::RomFs
                }
            }
            (NcaFsType::RomFs, NcaHashType::HierarchicalSha256)
                if self.format_version == NcaFormatVersion::Nca0 =>
            {
                NcaFsSectionType::Nca0RomFs
            }
            _ => NcaFsSectionType::Invalid,
        }
    }

    fn resolve_section_crypto(
        &self,
        section_num: usize,
        header: &NcaFsHeader,
        encryption_type: NcaEncryptionType,
    ) -> Option<SectionCrypto> {
        let upper_iv = header.aes_ctr_upper_iv;

        match encryption_type {
            NcaEncryptionType::None => Some(SectionCrypto::None),
            NcaEncryptionType::AesCtr | NcaEncryptionType::AesCtrEx => {
                // Rights-id archives use the title key; everything else uses
                // key-area slot 2 -- including CTR-Ex, which never touches
                // slot 3.
                let key = if self.rights_id_available {
                    match self.titlekey {
                        Some(key) => key,
                        None => {
                            warn!(
                                content_id = %self.content_id_str,
                                "FS section #{section_num} needs a title key, disabling"
                            );
                            return None;
                        }
                    }
                } else {
                    self.decrypted_key_area[2]
                };
                if encryption_type == NcaEncryptionType::AesCtr {
                    Some(SectionCrypto::Ctr { key, upper_iv })
                } else {
                    Some(SectionCrypto::CtrEx { key, upper_iv })
                }
            }
            NcaEncryptionType::AesXts => {
                if self.rights_id_available {
                    warn!(
                        content_id = %self.content_id_str,
                        "FS section #{section_num} mixes XTS with titlekey crypto, disabling"
                    );
                    return None;
                }
                Some(SectionCrypto::Xts {
                    key_1: self.decrypted_key_area[0],
                    key_2: self.decrypted_key_area[1],
                })
            }
            _ => None,
        }
    }

    // --- accessors ---

    pub fn header(&self) -> &NcaHeader {
        &self.header
    }

    pub fn content_id(&self) -> &ContentId {
        &self.content_id
    }

    pub fn content_id_str(&self) -> &str {
        &self.content_id_str
    }

    pub fn content_size(&self) -> u64 {
        self.content_size
    }

    pub fn storage_kind(&self) -> StorageKind {
        self.storage_kind
    }

    pub fn format_version(&self) -> NcaFormatVersion {
        self.format_version
    }

    pub fn key_generation(&self) -> u8 {
        self.key_generation
    }

    pub fn rights_id_available(&self) -> bool {
        self.rights_id_available
    }

    pub fn titlekey(&self) -> Option<[u8; 0x10]> {
        self.titlekey
    }

    /// Result of the RSA-2048-PSS main-signature check performed at init.
    /// Never fatal; policy is the caller's.
    pub fn valid_main_signature(&self) -> bool {
        self.valid_main_signature
    }

    pub fn decrypted_key_area(&self) -> &[[u8; 0x10]; 4] {
        &self.decrypted_key_area
    }

    pub fn header_written(&self) -> bool {
        self.header_written
    }

    pub fn fs_section(&self, section: usize) -> Option<&NcaFsSectionContext> {
        self.fs_ctx.get(section).filter(|fs| fs.enabled)
    }

    /// Human-readable section type ("ExeFS" for the first partition of a
    /// program archive).
    pub fn section_type_name(&self, section: usize) -> &'static str {
        let Some(fs) = self.fs_section(section) else {
            return "Invalid";
        };
        match fs.section_type {
            NcaFsSectionType::PartitionFs => {
                if self.header.content_type == NcaContentType::Program && section == 0 {
                    "ExeFS"
                } else {
                    "Partition FS"
                }
            }
            NcaFsSectionType::RomFs => "RomFS",
            NcaFsSectionType::PatchRomFs => "Patch RomFS [BKTR]",
            NcaFsSectionType::Nca0RomFs => "NCA0 RomFS",
            NcaFsSectionType::Invalid => "Invalid",
        }
    }
}

/// Replace the generation half (low 32 bits) of an upper IV.
fn upper_iv_with_generation(upper_iv: u64, generation: u32) -> u64 {
    (upper_iv & 0xFFFF_FFFF_0000_0000) | generation as u64
}

fn split_xts_key(key: &[u8; 0x20]) -> ([u8; 0x10], [u8; 0x10]) {
    let mut k1 = [0u8; 0x10];
    let mut k2 = [0u8; 0x10];
    k1.copy_from_slice(&key[..0x10]);
    k2.copy_from_slice(&key[0x10..]);
    (k1, k2)
}

fn verify_main_signature(header: &NcaHeader, plain: &[u8], keys: &dyn KeyProvider) -> bool {
    let Some(modulus) = keys.main_signature_modulus(header.main_signature_key_generation) else {
        return false;
    };

    // The signature covers the header from the magic onwards.
    let signed = &plain[0x200..0x200 + NCA_SIGNATURE_AREA_SIZE];
    crypto::rsa2048_verify_pss_sha256(
        signed,
        &header.main_signature,
        &modulus,
        &NCA_MAIN_SIGNATURE_EXPONENT,
    )
}

fn is_version0_plaintext_key_area(header: &NcaHeader, format_version: NcaFormatVersion) -> bool {
    if format_version != NcaFormatVersion::Nca0 {
        return false;
    }
    let mut used = [0u8; NCA_USED_KEY_AREA_SIZE];
    for (i, slot) in header.used_key_area().iter().enumerate() {
        used[i * 0x10..(i + 1) * 0x10].copy_from_slice(slot);
    }
    crypto::sha256(&used) == NCA0_PLAINTEXT_KEY_AREA_HASH
}

fn decrypt_key_area(
    header: &NcaHeader,
    format_version: NcaFormatVersion,
    key_generation: u8,
    keys: &dyn KeyProvider,
) -> Result<[[u8; 0x10]; 4]> {
    // NCA0 archives may carry their key area in the clear; the marker hash
    // identifies those.
    if is_version0_plaintext_key_area(header, format_version) {
        return Ok(header.used_key_area());
    }

    let key_count = match format_version {
        NcaFormatVersion::Nca0 => 2,
        _ => 4,
    };
    let index = KaekIndex::try_from(header.kaek_index)?;

    let mut decrypted = [[0u8; 0x10]; 4];
    for i in 0..key_count {
        let src = &header.encrypted_key_area[i];
        if src.iter().all(|&b| b == 0) {
            continue;
        }
        decrypted[i] = keys
            .decrypt_key_area_entry(index, key_generation, src)
            .ok_or(Error::KeyAreaDecrypt(i))?;
    }

    Ok(decrypted)
}
