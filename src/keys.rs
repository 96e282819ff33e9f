//! Key material resolution.
//!
//! The engine never ships keys; it consumes a [`KeyProvider`] for console
//! key material (header key, key-area encryption keys, signature moduli) and
//! a [`TicketProvider`] for title keys. [`Keyset`] and [`TitleKeys`] are
//! file-backed implementations using the common `prod.keys` / `title.keys`
//! formats.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read};
use std::path::Path;

use hex::FromHex;
use tracing::{debug, info, warn};

use crate::crypto;
use crate::error::{Error, Result};

/// Key-area encryption key family, selected by the header's `kaek_index`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KaekIndex {
    Application,
    Ocean,
    System,
}

impl KaekIndex {
    pub fn key_name(self) -> &'static str {
        match self {
            KaekIndex::Application => "key_area_key_application",
            KaekIndex::Ocean => "key_area_key_ocean",
            KaekIndex::System => "key_area_key_system",
        }
    }
}

impl TryFrom<u8> for KaekIndex {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(KaekIndex::Application),
            1 => Ok(KaekIndex::Ocean),
            2 => Ok(KaekIndex::System),
            other => Err(Error::InvalidKaekIndex(other)),
        }
    }
}

/// Resolves console key material.
///
/// `key_generation` values are the raw header values; generations 0 and 1
/// both map to master key 0, which implementations handle internally.
pub trait KeyProvider {
    /// The 32-byte header key (two AES-XTS halves).
    fn header_key(&self) -> Option<[u8; 0x20]>;

    /// Key-area encryption key for `(index, key_generation)`.
    fn key_area_key(&self, index: KaekIndex, key_generation: u8) -> Option<[u8; 0x10]>;

    /// Decrypt a single key-area slot.
    fn decrypt_key_area_entry(
        &self,
        index: KaekIndex,
        key_generation: u8,
        encrypted: &[u8; 0x10],
    ) -> Option<[u8; 0x10]> {
        let kaek = self.key_area_key(index, key_generation)?;
        Some(crypto::ecb_decrypt_block(&kaek, encrypted))
    }

    /// Modulus for the header main signature, by signature key generation.
    fn main_signature_modulus(&self, key_generation: u8) -> Option<[u8; 0x100]>;
}

/// Resolves decrypted title keys for rights-id protected content.
pub trait TicketProvider {
    /// Look up the title key for `rights_id`. `removable` tells the provider
    /// whether the content comes from removable media (gamecard), which may
    /// select a different ticket source.
    fn title_key(&self, rights_id: &[u8; 0x10], removable: bool) -> Option<[u8; 0x10]>;
}

/// Generations 0 and 1 are both master key 0; later generations are offset
/// by one.
fn master_key_index(key_generation: u8) -> u8 {
    key_generation.saturating_sub(1)
}

/// Console keys parsed from a `prod.keys`-style file.
#[derive(Clone, Default)]
pub struct Keyset {
    raw_keys: HashMap<String, Vec<u8>>,
    header_key_cache: Option<[u8; 0x20]>,
}

impl Keyset {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::from_reader(File::open(path)?)
    }

    /// Parse `name = hexvalue` lines; `;`-prefixed comments and malformed
    /// lines are skipped.
    pub fn from_reader(reader: impl Read) -> Result<Self> {
        let mut keyset = Keyset::default();
        let mut keys_loaded = 0usize;

        for line in BufReader::new(reader).lines() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with(';') || line.starts_with('#') {
                continue;
            }

            let Some((name, value)) = line.split_once('=') else {
                continue;
            };
            let name = name.trim().to_string();
            let value = value.trim().split(';').next().unwrap_or("").trim();

            match Vec::from_hex(value) {
                Ok(data) => {
                    keyset.raw_keys.insert(name, data);
                    keys_loaded += 1;
                }
                Err(_) => warn!("invalid hex value for key {name}"),
            }
        }

        keyset.update_caches();
        debug!("loaded {keys_loaded} keys");

        Ok(keyset)
    }

    pub fn insert(&mut self, name: &str, value: Vec<u8>) {
        self.raw_keys.insert(name.to_string(), value);
        self.update_caches();
    }

    fn update_caches(&mut self) {
        self.header_key_cache = self.get_key::<0x20>("header_key");
    }

    /// Fixed-size key lookup by exact name. Returns `None` on a size
    /// mismatch as well as on a missing entry.
    pub fn get_key<const N: usize>(&self, name: &str) -> Option<[u8; N]> {
        let data = self.raw_keys.get(name)?;
        <[u8; N]>::try_from(data.as_slice()).ok()
    }

    fn get_generation_key<const N: usize>(&self, prefix: &str, generation: u8) -> Option<[u8; N]> {
        self.get_key(&format!("{prefix}_{generation:02x}"))
    }
}

impl KeyProvider for Keyset {
    fn header_key(&self) -> Option<[u8; 0x20]> {
        self.header_key_cache
    }

    fn key_area_key(&self, index: KaekIndex, key_generation: u8) -> Option<[u8; 0x10]> {
        self.get_generation_key(index.key_name(), master_key_index(key_generation))
    }

    fn main_signature_modulus(&self, key_generation: u8) -> Option<[u8; 0x100]> {
        if let Some(modulus) = self.get_generation_key("nca_hdr_fixed_key_modulus", key_generation)
        {
            return Some(modulus);
        }
        // Older key files carry only the unsuffixed generation-0 modulus.
        if key_generation == 0 {
            return self.get_key("nca_hdr_fixed_key_modulus");
        }
        None
    }
}

/// Decrypted title keys, keyed by uppercase rights-id hex.
#[derive(Default, Debug)]
pub struct TitleKeys {
    keys: HashMap<String, [u8; 0x10]>,
}

impl TitleKeys {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_title_key(&mut self, rights_id: &str, key: [u8; 0x10]) {
        self.keys.insert(rights_id.to_uppercase(), key);
    }

    /// Decrypt a kek-encrypted title key (as carried in a common ticket) and
    /// store the plaintext key.
    pub fn add_encrypted_title_key(&mut self, rights_id: &str, key: &[u8; 0x10], kek: &[u8; 0x10]) {
        self.add_title_key(rights_id, crypto::ecb_decrypt_block(kek, key));
    }

    /// Load a `title.keys` file (`rights_id = hex_key` per line).
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let reader = BufReader::new(File::open(&path)?);
        let mut keys = TitleKeys::new();

        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with("//") {
                continue;
            }

            let Some((rights_id, key_hex)) = line.split_once('=') else {
                continue;
            };
            let rights_id = rights_id.trim();
            if rights_id.len() != 0x20 {
                continue;
            }

            match <[u8; 0x10]>::from_hex(key_hex.trim()) {
                Ok(key) => keys.add_title_key(rights_id, key),
                Err(err) => warn!(
                    "skipping malformed title key at line {}: {err}",
                    line_num + 1
                ),
            }
        }

        info!(
            "loaded {} title keys from {}",
            keys.len(),
            path.as_ref().display()
        );
        Ok(keys)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl TicketProvider for TitleKeys {
    fn title_key(&self, rights_id: &[u8; 0x10], _removable: bool) -> Option<[u8; 0x10]> {
        self.keys
            .get(&hex::encode_upper(rights_id))
            .copied()
    }
}
