use thiserror::Error;

use crate::keys::KaekIndex;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("FS section #{0} is disabled")]
    SectionDisabled(usize),

    #[error("unsupported encryption type {0:?} for this operation")]
    UnsupportedEncryption(crate::nca::types::NcaEncryptionType),

    #[error("operation not supported on sparse FS sections")]
    SparseSection,

    #[error("header key unavailable from the key provider")]
    MissingHeaderKey,

    #[error("KAEK unavailable for index {index:?}, key generation {generation:#04x}")]
    MissingKeyAreaKey { index: KaekIndex, generation: u8 },

    #[error("failed to decrypt key area entry #{0}")]
    KeyAreaDecrypt(usize),

    #[error("invalid KAEK index {0:#04x}")]
    InvalidKaekIndex(u8),

    #[error("invalid NCA magic {0:02x?}")]
    InvalidMagic([u8; 4]),

    #[error("content size mismatch: header says {header:#x}, storage has {actual:#x}")]
    SizeMismatch { header: u64, actual: u64 },

    #[error("archive smaller than the full NCA header ({0:#x} bytes)")]
    TruncatedArchive(u64),

    #[error("invalid hash layer geometry in FS section #{0}")]
    InvalidLayer(usize),

    #[error("FS section #{0} carries no patchable hash tree")]
    UnsupportedHashType(usize),

    #[error("read of {size:#x} bytes at {offset:#x} exceeds the valid range")]
    OutOfRange { offset: u64, size: u64 },

    #[error("failed to parse header structure: {0}")]
    HeaderParse(#[from] binrw::Error),
}
