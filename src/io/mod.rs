//! Container-facing I/O: byte-range access, AES-CBC primitives, and the
//! group codec for the compressed container format.

use std::{fmt, io};

use dyn_clone::DynClone;

pub(crate) mod codec;
pub(crate) mod stream;

/// SHA-1 hash bytes
pub type HashBytes = [u8; 20];

/// AES key bytes
pub type KeyBytes = [u8; 16];

/// Byte-range read/write against the underlying image container.
///
/// Implemented once per container backend; the engine only issues reads
/// aligned to the sector size and hash-tree writes aligned to the group size.
pub trait SectorIO: DynClone + Send + Sync {
    /// Reads `out.len()` bytes at the given absolute byte offset.
    fn read_raw(&mut self, offset: u64, out: &mut [u8]) -> io::Result<()>;

    /// Writes `buf` at the given absolute byte offset.
    fn write_raw(&mut self, offset: u64, buf: &[u8]) -> io::Result<()>;
}

dyn_clone::clone_trait_object!(SectorIO);

/// Compression applied to a group blob by the outer container.
///
/// Decompression is the container's business; the codec itself only handles
/// [`None`](Compression::None) blobs and rejects everything else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    /// No compression; the blob carries a SHA-1 integrity suffix instead.
    #[default]
    None,
    /// BZIP2
    Bzip2,
    /// LZMA
    Lzma,
    /// LZMA2
    Lzma2,
    /// Zstandard
    Zstandard,
}

impl fmt::Display for Compression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Compression::None => write!(f, "None"),
            Compression::Bzip2 => write!(f, "BZIP2"),
            Compression::Lzma => write!(f, "LZMA"),
            Compression::Lzma2 => write!(f, "LZMA2"),
            Compression::Zstandard => write!(f, "Zstandard"),
        }
    }
}

impl TryFrom<u32> for Compression {
    type Error = crate::Error;

    fn try_from(value: u32) -> crate::Result<Self> {
        match value {
            0 => Ok(Self::None),
            2 => Ok(Self::Bzip2),
            3 => Ok(Self::Lzma),
            4 => Ok(Self::Lzma2),
            5 => Ok(Self::Zstandard),
            v => Err(crate::Error::DiscFormat(format!("Invalid compression type {}", v))),
        }
    }
}

/// Encrypts data in-place using AES-128-CBC with the given key and IV.
pub(crate) fn aes_encrypt(key: &KeyBytes, iv: KeyBytes, data: &mut [u8]) {
    use aes::cipher::{block_padding::NoPadding, BlockEncryptMut, KeyIvInit};
    <cbc::Encryptor<aes::Aes128>>::new(key.into(), &aes::Block::from(iv))
        .encrypt_padded_mut::<NoPadding>(data, data.len())
        .unwrap(); // Safe: using NoPadding
}

/// Decrypts data in-place using AES-128-CBC with the given key and IV.
pub(crate) fn aes_decrypt(key: &KeyBytes, iv: KeyBytes, data: &mut [u8]) {
    use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};
    <cbc::Decryptor<aes::Aes128>>::new(key.into(), &aes::Block::from(iv))
        .decrypt_padded_mut::<NoPadding>(data)
        .unwrap(); // Safe: using NoPadding
}
