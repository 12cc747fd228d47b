//! Persisted partition metadata: ticket, TMD, and partition header layouts,
//! plus the title-key schedule that yields the per-partition AES key.

use std::{ffi::CStr, mem::size_of};

use zerocopy::{big_endian::*, AsBytes, FromBytes, FromZeroes};

use crate::{
    disc::DiscHeader,
    io::{aes_decrypt, HashBytes, KeyBytes},
    static_assert, Error, Result,
};

// ppki (Retail)
const RVL_CERT_ISSUER_PPKI_TICKET: &str = "Root-CA00000001-XS00000003";
#[rustfmt::skip]
const RETAIL_COMMON_KEYS: [KeyBytes; 3] = [
    /* RVL_KEY_RETAIL */
    [0xeb, 0xe4, 0x2a, 0x22, 0x5e, 0x85, 0x93, 0xe4, 0x48, 0xd9, 0xc5, 0x45, 0x73, 0x81, 0xaa, 0xf7],
    /* RVL_KEY_KOREAN */
    [0x63, 0xb8, 0x2b, 0xb4, 0xf4, 0x61, 0x4e, 0x2e, 0x13, 0xf2, 0xfe, 0xfb, 0xba, 0x4c, 0x9b, 0x7e],
    /* vWii_KEY_RETAIL */
    [0x30, 0xbf, 0xc7, 0x6e, 0x7c, 0x19, 0xaf, 0xbb, 0x23, 0x16, 0x33, 0x30, 0xce, 0xd7, 0xc2, 0x8d],
];

// dpki (Debug)
const RVL_CERT_ISSUER_DPKI_TICKET: &str = "Root-CA00000002-XS00000006";
#[rustfmt::skip]
const DEBUG_COMMON_KEYS: [KeyBytes; 3] = [
    /* RVL_KEY_DEBUG */
    [0xa1, 0x60, 0x4a, 0x6a, 0x71, 0x23, 0xb5, 0x29, 0xae, 0x8b, 0xec, 0x32, 0xc8, 0x16, 0xfc, 0xaa],
    /* RVL_KEY_KOREAN_DEBUG */
    [0x67, 0x45, 0x8b, 0x6b, 0xc6, 0x23, 0x7b, 0x32, 0x69, 0x98, 0x3c, 0x64, 0x73, 0x48, 0x33, 0x66],
    /* vWii_KEY_DEBUG */
    [0x2f, 0x5c, 0x1b, 0x29, 0x44, 0xe7, 0xfd, 0x6f, 0xc3, 0x97, 0x96, 0x4b, 0x05, 0x76, 0x91, 0xfa],
];

/// Signature wrapper preceding the ticket and TMD bodies.
#[derive(Debug, Clone, PartialEq, FromBytes, FromZeroes, AsBytes)]
#[repr(C, align(4))]
pub struct SignedHeader {
    /// Signature type, always 0x00010001 (RSA-2048)
    pub sig_type: U32,
    /// RSA-2048 signature
    pub sig: [u8; 256],
    _pad: [u8; 60],
}

static_assert!(size_of::<SignedHeader>() == 0x140);

/// Time limit entry within a ticket.
#[derive(Debug, Clone, PartialEq, Default, FromBytes, FromZeroes, AsBytes)]
#[repr(C, align(4))]
pub struct TicketTimeLimit {
    /// Whether the time limit is enabled.
    pub enable_time_limit: U32,
    /// The time limit in seconds.
    pub time_limit: U32,
}

static_assert!(size_of::<TicketTimeLimit>() == 8);

/// The partition ticket, carrying the encrypted title key.
#[derive(Debug, Clone, PartialEq, FromBytes, FromZeroes, AsBytes)]
#[repr(C, align(4))]
pub struct Ticket {
    /// Signature header.
    pub header: SignedHeader,
    /// Certificate issuer chain.
    pub sig_issuer: [u8; 64],
    /// ECDH data.
    pub ecdh: [u8; 60],
    /// Ticket version.
    pub version: u8,
    _pad1: U16,
    /// The title key, encrypted under a common key.
    pub title_key: KeyBytes,
    _pad2: u8,
    /// Ticket ID.
    pub ticket_id: [u8; 8],
    /// Console ID.
    pub console_id: [u8; 4],
    /// Title ID, also the title-key decryption IV.
    pub title_id: [u8; 8],
    _pad3: U16,
    /// Title version.
    pub ticket_title_version: U16,
    /// Permitted titles mask.
    pub permitted_titles_mask: U32,
    /// Permit mask.
    pub permit_mask: U32,
    /// Whether title export is allowed.
    pub title_export_allowed: u8,
    /// Index into the common key set.
    pub common_key_idx: u8,
    _pad4: [u8; 48],
    /// Content access permissions.
    pub content_access_permissions: [u8; 64],
    _pad5: [u8; 2],
    /// Time limits.
    pub time_limits: [TicketTimeLimit; 8],
}

static_assert!(size_of::<Ticket>() == 0x2A4);

impl Ticket {
    /// Decrypts the title key with the common key selected by the ticket's
    /// certificate issuer and common key index.
    pub fn decrypt_title_key(&self) -> Result<KeyBytes> {
        let mut iv: KeyBytes = [0; 16];
        iv[..8].copy_from_slice(&self.title_id);
        let cert_issuer_ticket =
            CStr::from_bytes_until_nul(&self.sig_issuer).ok().and_then(|c| c.to_str().ok());
        let common_keys = match cert_issuer_ticket {
            Some(RVL_CERT_ISSUER_PPKI_TICKET) => &RETAIL_COMMON_KEYS,
            Some(RVL_CERT_ISSUER_DPKI_TICKET) => &DEBUG_COMMON_KEYS,
            Some(v) => {
                return Err(Error::DiscFormat(format!("unknown certificate issuer {:?}", v)));
            }
            None => {
                return Err(Error::DiscFormat("failed to parse certificate issuer".to_string()));
            }
        };
        let common_key = common_keys.get(self.common_key_idx as usize).ok_or(Error::DiscFormat(
            format!("unknown common key index {}", self.common_key_idx),
        ))?;
        let mut title_key = self.title_key;
        aes_decrypt(common_key, iv, &mut title_key);
        Ok(title_key)
    }
}

/// Title metadata (TMD) header.
#[derive(Debug, Clone, PartialEq, FromBytes, FromZeroes, AsBytes)]
#[repr(C, align(4))]
pub struct TmdHeader {
    /// Signature header.
    pub header: SignedHeader,
    /// Certificate issuer chain.
    pub sig_issuer: [u8; 64],
    /// TMD version.
    pub version: u8,
    /// CA CRL version.
    pub ca_crl_version: u8,
    /// Signer CRL version.
    pub signer_crl_version: u8,
    /// Whether this is a vWii title.
    pub is_vwii: u8,
    /// IOS ID.
    pub ios_id: [u8; 8],
    /// Title ID.
    pub title_id: [u8; 8],
    /// Title type.
    pub title_type: u32,
    /// Group ID.
    pub group_id: U16,
    _pad1: [u8; 2],
    /// Region.
    pub region: U16,
    /// Ratings.
    pub ratings: KeyBytes,
    _pad2: [u8; 12],
    /// IPC mask.
    pub ipc_mask: [u8; 12],
    _pad3: [u8; 18],
    /// Access flags.
    pub access_flags: U32,
    /// Title version.
    pub title_version: U16,
    /// Number of content records following the header.
    pub num_contents: U16,
    /// Boot content index.
    pub boot_idx: U16,
    /// Minor version.
    pub minor_version: U16,
}

static_assert!(size_of::<TmdHeader>() == 0x1E4);

/// One TMD content record. For disc partitions, record 0's hash is the H4
/// digest over the partition's H3 table.
#[derive(Debug, Clone, PartialEq, FromBytes, FromZeroes, AsBytes)]
#[repr(C, align(4))]
pub struct TmdContent {
    /// Content ID.
    pub content_id: U32,
    /// Content index.
    pub index: U16,
    /// Content type flags.
    pub kind: U16,
    /// Content size in bytes.
    pub size: U64,
    /// SHA-1 digest of the content.
    pub hash: HashBytes,
}

static_assert!(size_of::<TmdContent>() == 0x24);

/// Borrowed view over a raw TMD blob.
#[derive(Debug, Clone, Copy)]
pub struct Tmd<'a> {
    /// The TMD header.
    pub header: &'a TmdHeader,
    /// The content records following the header.
    pub contents: &'a [TmdContent],
}

impl<'a> Tmd<'a> {
    /// Parses a raw TMD blob, validating that the declared content count fits
    /// within the buffer.
    pub fn parse(raw: &'a [u8]) -> Result<Self> {
        let header = TmdHeader::ref_from_prefix(raw)
            .ok_or_else(|| Error::DiscFormat("TMD too small".to_string()))?;
        let count = header.num_contents.get() as usize;
        let (contents, _) =
            TmdContent::slice_from_prefix(&raw[size_of::<TmdHeader>()..], count).ok_or_else(
                || Error::DiscFormat(format!("TMD content table truncated ({} records)", count)),
            )?;
        Ok(Self { header, contents })
    }

    /// The H4 root digest, absent when the TMD declares no contents (an
    /// unhashed partition).
    pub fn h4_root(&self) -> Option<&'a HashBytes> { self.contents.first().map(|c| &c.hash) }
}

/// Size of the H3 table region in the partition header area.
pub const H3_TABLE_SIZE: usize = 0x18000;

/// Wii partition header, at the start of each partition.
#[derive(Debug, Clone, PartialEq, FromBytes, FromZeroes, AsBytes)]
#[repr(C, align(4))]
pub struct WiiPartitionHeader {
    /// The partition ticket.
    pub ticket: Ticket,
    tmd_size: U32,
    tmd_off: U32,
    cert_chain_size: U32,
    cert_chain_off: U32,
    h3_table_off: U32,
    data_off: U32,
    data_size: U32,
}

static_assert!(size_of::<WiiPartitionHeader>() == 0x2C0);

impl WiiPartitionHeader {
    /// TMD size in bytes.
    pub fn tmd_size(&self) -> u64 { self.tmd_size.get() as u64 }

    /// TMD offset within the partition.
    pub fn tmd_off(&self) -> u64 { (self.tmd_off.get() as u64) << 2 }

    /// H3 table offset within the partition.
    pub fn h3_table_off(&self) -> u64 { (self.h3_table_off.get() as u64) << 2 }

    /// H3 table size in bytes, fixed by the format.
    pub fn h3_table_size(&self) -> u64 { H3_TABLE_SIZE as u64 }

    /// Encrypted data offset within the partition.
    pub fn data_off(&self) -> u64 { (self.data_off.get() as u64) << 2 }

    /// Encrypted data size in bytes.
    pub fn data_size(&self) -> u64 { (self.data_size.get() as u64) << 2 }
}

/// The per-partition AES key and whether sector data is actually encrypted
/// with it.
#[derive(Debug, Clone)]
pub struct PartitionKey {
    /// The decrypted title key.
    pub key: KeyBytes,
    /// False when the disc header opts out of partition encryption.
    pub is_encrypted: bool,
}

impl PartitionKey {
    /// Derives the partition key from a ticket, honoring the disc header's
    /// encryption opt-out flag.
    pub fn from_ticket(ticket: &Ticket, disc_header: &DiscHeader) -> Result<Self> {
        Ok(Self {
            key: ticket.decrypt_title_key()?,
            is_encrypted: disc_header.has_partition_encryption(),
        })
    }
}
