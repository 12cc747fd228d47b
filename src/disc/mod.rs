//! Wii disc partition layout: fixed geometry constants and the disc header.

use std::{mem::size_of, str::from_utf8};

use zerocopy::{big_endian::*, AsBytes, FromBytes, FromZeroes};

use crate::static_assert;

pub(crate) mod hashes;
pub(crate) mod sector;
pub(crate) mod verify;
pub(crate) mod wii;

/// Size in bytes of a disc sector.
pub const SECTOR_SIZE: usize = 0x8000;

/// Size in bytes of the hash area at the start of each sector.
pub const HASHES_SIZE: usize = 0x400;

/// Size in bytes of the payload portion of each sector.
pub const SECTOR_DATA_SIZE: usize = SECTOR_SIZE - HASHES_SIZE; // 0x7C00

/// Size in bytes of one individually hashed payload sub-block.
pub const SUB_BLOCK_SIZE: usize = 0x400;

/// Number of hashed payload sub-blocks per sector (H0 count).
pub const NUM_SUB_BLOCKS: usize = SECTOR_DATA_SIZE / SUB_BLOCK_SIZE; // 31

/// Number of sectors sharing one H1 table (a subgroup).
pub const SECTORS_PER_SUBGROUP: usize = 8;

/// Number of subgroups sharing one H2 table (a group).
pub const SUBGROUPS_PER_GROUP: usize = 8;

/// Number of sectors in a group, the atomic unit of hashing and encryption.
pub const GROUP_SECTORS: usize = SECTORS_PER_SUBGROUP * SUBGROUPS_PER_GROUP; // 64

/// Size in bytes of one group on disc. (2 MiB)
pub const GROUP_SIZE: usize = SECTOR_SIZE * GROUP_SECTORS;

/// Size in bytes of one group's payload, hash areas excluded.
pub const GROUP_DATA_SIZE: usize = SECTOR_DATA_SIZE * GROUP_SECTORS; // 0x1F0000

/// Size in bytes of a SHA-1 digest.
pub const HASH_SIZE: usize = 20;

/// Wii disc header.
///
/// Stored at the start of the disc image and within each partition. Only the
/// fields this engine consults are named; the rest of the 0x400-byte block is
/// opaque padding.
#[derive(Clone, Debug, PartialEq, FromBytes, FromZeroes, AsBytes)]
#[repr(C, align(4))]
pub struct DiscHeader {
    /// Game ID (e.g. RSBE01)
    pub game_id: [u8; 6],
    /// Used in multi-disc games
    pub disc_num: u8,
    /// Disc version
    pub disc_version: u8,
    /// Audio streaming enabled
    pub audio_streaming: u8,
    /// Audio streaming buffer size
    pub audio_stream_buf_size: u8,
    _pad1: [u8; 14],
    /// If this is a Wii disc, this will be 0x5D1C9EA3
    pub wii_magic: U32,
    /// If this is a GameCube disc, this will be 0xC2339F3D
    pub gcn_magic: U32,
    /// Game title
    pub game_title: [u8; 64],
    /// If 1, disc omits partition hashes
    pub no_partition_hashes: u8,
    /// If 1, disc omits partition encryption
    pub no_partition_encryption: u8,
    _pad2: [u8; 926],
}

static_assert!(size_of::<DiscHeader>() == 0x400);

impl DiscHeader {
    /// Game ID as a string.
    pub fn game_id_str(&self) -> &str { from_utf8(&self.game_id).unwrap_or("[invalid]") }

    /// Whether this is a Wii disc.
    pub fn is_wii(&self) -> bool { self.wii_magic.get() == 0x5D1C9EA3 }

    /// Whether the disc stores partition data without hash trees.
    pub fn has_partition_hashes(&self) -> bool { self.no_partition_hashes == 0 }

    /// Whether the disc stores partition data unencrypted.
    pub fn has_partition_encryption(&self) -> bool { self.no_partition_encryption == 0 }
}
