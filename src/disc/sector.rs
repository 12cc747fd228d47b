//! Typed views over sectors and 64-sector groups.
//!
//! A sector's first 0x400 bytes are its hash area: 31 H0 digests over its own
//! payload sub-blocks, the 8-entry H1 table shared by its subgroup, and the
//! 8-entry H2 table shared by the whole group, each region zero-padded to a
//! 0x40-byte boundary. The remaining 0x7C00 bytes are payload.

use std::mem::size_of;

use zerocopy::{AsBytes, FromBytes, FromZeroes};

use crate::{
    disc::{
        GROUP_DATA_SIZE, GROUP_SECTORS, HASHES_SIZE, NUM_SUB_BLOCKS, SECTORS_PER_SUBGROUP,
        SECTOR_DATA_SIZE, SECTOR_SIZE, SUBGROUPS_PER_GROUP, SUB_BLOCK_SIZE,
    },
    io::{HashBytes, KeyBytes},
    static_assert,
    util::{div_rem, zeroed_box},
    Error, Result,
};

/// Byte offset of the payload AES-CBC IV within a sector's encrypted hash area.
pub(crate) const DATA_IV_OFFSET: usize = 0x3D0;

/// One 32 KiB disc sector: hash area followed by payload.
///
/// The field layout matches the on-disc format exactly, so a sector can be
/// reinterpreted to and from raw bytes without copying.
#[derive(Clone, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
pub struct Sector {
    pub(crate) h0: [HashBytes; NUM_SUB_BLOCKS],
    _pad0: [u8; 20],
    pub(crate) h1: [HashBytes; SECTORS_PER_SUBGROUP],
    _pad1: [u8; 32],
    pub(crate) h2: [HashBytes; SUBGROUPS_PER_GROUP],
    _pad2: [u8; 32],
    pub(crate) data: [[u8; SUB_BLOCK_SIZE]; NUM_SUB_BLOCKS],
}

static_assert!(size_of::<Sector>() == SECTOR_SIZE);

impl Sector {
    /// The sector's 31 H0 digests, one per payload sub-block.
    pub fn h0(&self) -> &[HashBytes; NUM_SUB_BLOCKS] { &self.h0 }

    /// The subgroup's H1 table. Entry `i` is the H1 digest of sector `i`
    /// within the subgroup; byte-identical across all 8 sectors after a
    /// rebuild.
    pub fn h1_table(&self) -> &[HashBytes; SECTORS_PER_SUBGROUP] { &self.h1 }

    /// The group's H2 table. Entry `g` is the H2 digest of subgroup `g`;
    /// byte-identical across all 64 sectors after a rebuild.
    pub fn h2_table(&self) -> &[HashBytes; SUBGROUPS_PER_GROUP] { &self.h2 }

    /// One 0x400-byte payload sub-block.
    pub fn sub_block(&self, idx: usize) -> &[u8; SUB_BLOCK_SIZE] { &self.data[idx] }

    /// The sector's 0x7C00-byte payload as a flat slice.
    pub fn payload(&self) -> &[u8] { self.data.as_bytes() }

    /// Mutable view of the payload.
    pub fn payload_mut(&mut self) -> &mut [u8] { self.data.as_bytes_mut() }

    /// The H0 region as raw bytes (the input to this sector's H1 digest).
    pub(crate) fn h0_bytes(&self) -> &[u8] { self.h0.as_bytes() }

    /// The H1 table region as raw bytes (the input to the subgroup's H2
    /// digest).
    pub(crate) fn h1_bytes(&self) -> &[u8] { self.h1.as_bytes() }

    /// The H2 table region as raw bytes (the input to the group's H3 digest).
    pub(crate) fn h2_bytes(&self) -> &[u8] { self.h2.as_bytes() }

    /// The full 0x400-byte hash area.
    pub(crate) fn hash_area(&self) -> &[u8] { &self.as_bytes()[..HASHES_SIZE] }

    /// Mutable view of the full hash area.
    pub(crate) fn hash_area_mut(&mut self) -> &mut [u8] {
        &mut self.as_bytes_mut()[..HASHES_SIZE]
    }

    /// Zeroes the hash area, including padding.
    pub(crate) fn clear_hash_area(&mut self) { self.hash_area_mut().fill(0) }

    /// The payload IV: the last 16 bytes of the H2 table region. Read from
    /// ciphertext when decrypting, from the just-encrypted hash area when
    /// encrypting.
    pub(crate) fn data_iv(&self) -> KeyBytes {
        let mut iv = [0u8; 16];
        iv.copy_from_slice(&self.as_bytes()[DATA_IV_OFFSET..DATA_IV_OFFSET + 16]);
        iv
    }
}

/// A group of 64 sectors (2 MiB), the atomic unit of every hash-tree and
/// encryption operation. Exclusively owned by the single in-flight call
/// operating on it.
pub struct SectorGroup {
    sectors: Box<[Sector; GROUP_SECTORS]>,
}

// Not derived: Box's Clone stages the cloned array on the stack, which is
// not acceptable at 2 MiB in unoptimized builds.
impl Clone for SectorGroup {
    fn clone(&self) -> Self {
        let mut copy = Self::new();
        copy.as_bytes_mut().copy_from_slice(self.as_bytes());
        copy
    }
}

impl Default for SectorGroup {
    fn default() -> Self { Self::new() }
}

impl SectorGroup {
    /// Allocates a zeroed group.
    pub fn new() -> Self { Self { sectors: zeroed_box() } }

    /// The group's sectors.
    pub fn sectors(&self) -> &[Sector; GROUP_SECTORS] { &self.sectors }

    /// Mutable view of the group's sectors.
    pub fn sectors_mut(&mut self) -> &mut [Sector; GROUP_SECTORS] { &mut self.sectors }

    /// The full 2 MiB group as raw bytes, hash areas included.
    pub fn as_bytes(&self) -> &[u8] { self.sectors.as_bytes() }

    /// Mutable view of the full group.
    pub fn as_bytes_mut(&mut self) -> &mut [u8] { self.sectors.as_bytes_mut() }

    /// Copies the group's payload (hash areas excluded) into `out`.
    pub fn copy_payload_to(&self, out: &mut [u8; GROUP_DATA_SIZE]) {
        for (i, sector) in self.sectors.iter().enumerate() {
            out[i * SECTOR_DATA_SIZE..(i + 1) * SECTOR_DATA_SIZE]
                .copy_from_slice(sector.payload());
        }
    }

    /// Replaces the group's payload, leaving hash areas untouched.
    pub fn load_payload(&mut self, payload: &[u8; GROUP_DATA_SIZE]) {
        for (i, sector) in self.sectors.iter_mut().enumerate() {
            sector
                .payload_mut()
                .copy_from_slice(&payload[i * SECTOR_DATA_SIZE..(i + 1) * SECTOR_DATA_SIZE]);
        }
    }

    /// Writes `data` into the group's payload space at `offset`, scattering
    /// across sector payload regions as needed.
    pub fn write_payload(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(data.len())
            .ok_or_else(|| Error::DiscFormat("payload range overflow".to_string()))?;
        if end > GROUP_DATA_SIZE {
            return Err(Error::DiscFormat(format!(
                "payload range {:#X}..{:#X} exceeds group data size {:#X}",
                offset, end, GROUP_DATA_SIZE
            )));
        }
        let mut remaining = data;
        let (mut sector_idx, mut sector_off) = div_rem(offset, SECTOR_DATA_SIZE);
        while !remaining.is_empty() {
            let len = remaining.len().min(SECTOR_DATA_SIZE - sector_off);
            self.sectors[sector_idx].payload_mut()[sector_off..sector_off + len]
                .copy_from_slice(&remaining[..len]);
            remaining = &remaining[len..];
            sector_idx += 1;
            sector_off = 0;
        }
        Ok(())
    }
}
