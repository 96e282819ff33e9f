//! Block-level storage access and the shared crypto staging buffer.

use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Mutex;

/// Size of the process-wide staging buffer used for unaligned crypto spans.
pub const CRYPTO_BUFFER_SIZE: usize = 0x80_0000; // 8 MiB

/// Align `value` down to a power-of-two boundary.
pub const fn align_down(value: u64, align: u64) -> u64 {
    value & !(align - 1)
}

/// Align `value` up to a power-of-two boundary.
pub const fn align_up(value: u64, align: u64) -> u64 {
    (value + (align - 1)) & !(align - 1)
}

/// Random-access reader over the raw (encrypted) archive bytes.
///
/// The engine only ever reads through this interface; write-back happens via
/// patch sets spliced into caller-owned buffers.
pub trait ContentStorage {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()>;
}

/// [`ContentStorage`] over anything seekable (a file, a `Cursor`, ...).
pub struct StorageReader<R: Read + Seek> {
    inner: R,
}

impl<R: Read + Seek> StorageReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R: Read + Seek> ContentStorage for StorageReader<R> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(offset))?;
        self.inner.read_exact(buf)
    }
}

/// Wrapper adding a fixed base offset to every read.
///
/// Raw-device storage (gamecard) exposes the whole medium; the archive lives
/// at some entry offset inside it.
pub struct OffsetStorage<S: ContentStorage> {
    inner: S,
    base_offset: u64,
}

impl<S: ContentStorage> OffsetStorage<S> {
    pub fn new(inner: S, base_offset: u64) -> Self {
        Self { inner, base_offset }
    }
}

impl<S: ContentStorage> ContentStorage for OffsetStorage<S> {
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.inner.read_at(self.base_offset + offset, buf)
    }
}

static CRYPTO_BUFFER: Mutex<Option<Box<[u8]>>> = Mutex::new(None);

/// Run `f` with exclusive access to the shared staging buffer.
///
/// The buffer is allocated on first use and held for the whole call,
/// including any internal recursion on spans larger than the buffer.
pub(crate) fn with_crypto_buffer<T>(f: impl FnOnce(&mut [u8]) -> T) -> T {
    let mut guard = CRYPTO_BUFFER.lock().unwrap_or_else(|e| e.into_inner());
    let buf = guard.get_or_insert_with(|| vec![0u8; CRYPTO_BUFFER_SIZE].into_boxed_slice());
    f(buf)
}

/// Release the shared staging buffer.
///
/// Safe to call at any time; the next crypto operation reallocates it.
pub fn free_crypto_buffer() {
    let mut guard = CRYPTO_BUFFER.lock().unwrap_or_else(|e| e.into_inner());
    *guard = None;
}
