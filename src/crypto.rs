//! Crypto primitives used by the NCA envelope.
//!
//! Everything here is a thin layer over the RustCrypto crates: AES-128 in
//! XTS (with the console's big-endian sector tweak), CTR, single-block ECB,
//! SHA-256 and RSA-2048-PSS verification. The NCA-specific parts are the
//! tweak and the partial-counter layouts.

use aes::Aes128;
use cipher::generic_array::GenericArray;
use cipher::{BlockDecrypt, BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use rsa::{BigUint, Pss, RsaPublicKey};
use sha2::{Digest, Sha256};
use xts_mode::Xts128;

use crate::error::{Error, Result};

pub const AES_BLOCK_SIZE: u64 = 0x10;
pub const XTS_SECTOR_SIZE: u64 = 0x200;
pub const SHA256_HASH_SIZE: usize = 0x20;

/// XTS tweak for NCA crypto: the sector index stored big-endian.
///
/// Standard XTS (IEEE 1619) stores it little-endian; the console reverses it.
pub fn nintendo_tweak(sector_index: u128) -> [u8; 0x10] {
    sector_index.to_be_bytes()
}

/// Build the XTS cipher from a split key pair (data half, tweak half).
pub fn xts_128(key_1: &[u8; 0x10], key_2: &[u8; 0x10]) -> Xts128<Aes128> {
    Xts128::new(Aes128::new(key_1.into()), Aes128::new(key_2.into()))
}

/// AES-128-XTS decrypt `buf` in place, starting at `first_sector`.
pub fn xts_decrypt(
    key_1: &[u8; 0x10],
    key_2: &[u8; 0x10],
    buf: &mut [u8],
    first_sector: u64,
    sector_size: usize,
) -> Result<()> {
    if sector_size == 0 || buf.len() % sector_size != 0 {
        return Err(Error::InvalidArgument(
            "XTS span must be a whole number of sectors",
        ));
    }
    xts_128(key_1, key_2).decrypt_area(buf, sector_size, first_sector as u128, nintendo_tweak);
    Ok(())
}

/// AES-128-XTS encrypt `buf` in place, starting at `first_sector`.
pub fn xts_encrypt(
    key_1: &[u8; 0x10],
    key_2: &[u8; 0x10],
    buf: &mut [u8],
    first_sector: u64,
    sector_size: usize,
) -> Result<()> {
    if sector_size == 0 || buf.len() % sector_size != 0 {
        return Err(Error::InvalidArgument(
            "XTS span must be a whole number of sectors",
        ));
    }
    xts_128(key_1, key_2).encrypt_area(buf, sector_size, first_sector as u128, nintendo_tweak);
    Ok(())
}

/// AES-128-CTR keystream application (encrypt and decrypt are the same).
pub fn ctr_crypt(key: &[u8; 0x10], iv: &[u8; 0x10], buf: &mut [u8]) {
    let mut cipher = ctr::Ctr128BE::<Aes128>::new(key.into(), iv.into());
    cipher.apply_keystream(buf);
}

/// Seed the section counter for a given absolute content offset.
///
/// Layout: `upper_iv` big-endian in bytes 0..8, `offset / 16` big-endian in
/// bytes 8..16.
pub fn partial_ctr(upper_iv: u64, offset: u64) -> [u8; 0x10] {
    let mut ctr = [0u8; 0x10];
    ctr[..8].copy_from_slice(&upper_iv.to_be_bytes());
    ctr[8..].copy_from_slice(&(offset >> 4).to_be_bytes());
    ctr
}

/// [`partial_ctr`] with a caller-supplied 32-bit generation replacing the
/// low half of the upper IV (counter bytes 4..8). Used by patch-RomFS
/// (BKTR) storage.
pub fn partial_ctr_ex(upper_iv: u64, ctr_val: u32, offset: u64) -> [u8; 0x10] {
    let mut ctr = partial_ctr(upper_iv, offset);
    ctr[4..8].copy_from_slice(&ctr_val.to_be_bytes());
    ctr
}

/// Encrypt one 16-byte block with AES-128-ECB (key-area slots).
pub fn ecb_encrypt_block(key: &[u8; 0x10], block: &[u8; 0x10]) -> [u8; 0x10] {
    let cipher = Aes128::new(key.into());
    let mut out = GenericArray::clone_from_slice(block);
    cipher.encrypt_block(&mut out);
    out.into()
}

/// Decrypt one 16-byte block with AES-128-ECB (key-area slots).
pub fn ecb_decrypt_block(key: &[u8; 0x10], block: &[u8; 0x10]) -> [u8; 0x10] {
    let cipher = Aes128::new(key.into());
    let mut out = GenericArray::clone_from_slice(block);
    cipher.decrypt_block(&mut out);
    out.into()
}

pub fn sha256(data: &[u8]) -> [u8; SHA256_HASH_SIZE] {
    Sha256::digest(data).into()
}

/// Verify an RSA-2048 PSS signature over SHA-256(`data`).
///
/// `modulus` is the raw 0x100-byte big-endian modulus, `exponent` the raw
/// public exponent. Returns `false` on any parse or verification failure.
pub fn rsa2048_verify_pss_sha256(
    data: &[u8],
    signature: &[u8],
    modulus: &[u8],
    exponent: &[u8],
) -> bool {
    let key = match RsaPublicKey::new(
        BigUint::from_bytes_be(modulus),
        BigUint::from_bytes_be(exponent),
    ) {
        Ok(key) => key,
        Err(err) => {
            tracing::warn!("invalid RSA public key material: {err}");
            return false;
        }
    };

    let digest = Sha256::digest(data);
    key.verify(Pss::new::<Sha256>(), &digest, signature).is_ok()
}
