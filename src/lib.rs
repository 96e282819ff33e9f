//! Processing engine for Nintendo content archives (NCAs).
//!
//! An NCA bundles up to four filesystem sections under a layered crypto
//! envelope: an RSA-signed, AES-XTS encrypted header, an AES-ECB encrypted
//! key area, per-section AES-XTS/CTR payload crypto and per-section hash
//! trees that authenticate section contents.
//!
//! This crate covers the container layer only: decrypting and re-encrypting
//! headers and key areas, random-access reads from encrypted sections, and
//! generating hash-tree patches that rewrite a byte range of a section while
//! keeping every hash layer (up to the master hash in the section header)
//! consistent. Extracting the filesystems *inside* a section (PFS0, RomFS)
//! is out of scope.
//!
//! Keys are never bundled. The engine consumes a [`keys::KeyProvider`] and an
//! optional [`keys::TicketProvider`]; [`keys::Keyset`] and [`keys::TitleKeys`]
//! are ready-made implementations backed by the usual `prod.keys` /
//! `title.keys` files.

pub mod crypto;
pub mod error;
pub mod io;
pub mod keys;
pub mod nca;

pub use error::{Error, Result};
pub use nca::{NcaContext, NcaFsSectionContext, StorageKind};
