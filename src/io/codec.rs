//! Group blob codec for compressed containers.
//!
//! A group is stored as an exception list plus a segment list. The exception
//! list captures every hash slot whose stored value differs from what a
//! rebuild over the payload would produce, so a decoded group is
//! byte-identical to the original even when its tree was deliberately
//! altered. The segment list stores only the non-zero payload runs; zeros
//! are implied. Uncompressed blobs carry a trailing SHA-1 over the framing
//! as an integrity check.
//!
//! Exception offsets address a flat virtual hash space: sector index times
//! 0x400 plus the offset within that sector's hash area. 64 sectors of
//! 0x400 bytes is exactly the u16 range.

use zerocopy::{big_endian::*, AsBytes, FromBytes, FromZeroes};

use crate::{
    disc::{
        hashes::{compute_h0, compute_h1, compute_h2, encrypt_sector, hash_bytes, replicate},
        sector::SectorGroup,
        wii::PartitionKey,
        GROUP_DATA_SIZE, GROUP_SECTORS, HASHES_SIZE, HASH_SIZE, SECTORS_PER_SUBGROUP,
        SECTOR_SIZE,
    },
    io::{Compression, HashBytes},
    util::{
        div_rem,
        read::{read_box_slice, read_from, read_u16_be},
        zeroed_box,
    },
    Error, Result, ResultContext,
};

/// Zero gaps up to this length (the size of a segment header) are folded
/// into the surrounding segment rather than starting a new one.
pub const SEGMENT_MERGE_GAP: usize = 8;

const H1_TABLE_OFFSET: usize = 0x280;
const H2_TABLE_OFFSET: usize = 0x340;

/// One stored-vs-recomputed hash difference.
#[derive(Clone, Debug, PartialEq, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
struct ExceptionRecord {
    /// Offset into the group's virtual hash space.
    offset: U16,
    hash: HashBytes,
}

/// Segment list entry header; `size` data bytes follow. `{0, 0}` terminates
/// the list.
#[derive(Clone, Debug, PartialEq, FromBytes, FromZeroes, AsBytes)]
#[repr(C)]
struct SegmentHeader {
    offset: U32,
    size: U32,
}

/// A hash slot the codec diffs during encode: each sector's own H0 entries,
/// each sector's own H1 table entry, and each subgroup's H2 entry in the
/// subgroup's first sector. Replica copies are derived, never diffed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CanonicalSlot {
    H0 { sector: usize, index: usize },
    H1 { sector: usize },
    H2 { subgroup: usize },
}

/// Classifies an exception offset. `None` for replica copies, padding bytes,
/// and unaligned offsets; those are applied byte-wise after replication.
fn canonical_slot(offset: u16) -> Option<CanonicalSlot> {
    let (sector, within) = div_rem(offset as usize, HASHES_SIZE);
    if within < H1_TABLE_OFFSET {
        if within % HASH_SIZE != 0 {
            return None;
        }
        let index = within / HASH_SIZE;
        return (index < 31).then_some(CanonicalSlot::H0 { sector, index });
    }
    if within >= H1_TABLE_OFFSET && within < H2_TABLE_OFFSET {
        let rel = within - H1_TABLE_OFFSET;
        if rel % HASH_SIZE != 0 {
            return None;
        }
        let entry = rel / HASH_SIZE;
        return (entry < SECTORS_PER_SUBGROUP && entry == sector % SECTORS_PER_SUBGROUP)
            .then_some(CanonicalSlot::H1 { sector });
    }
    if within >= H2_TABLE_OFFSET {
        let rel = within - H2_TABLE_OFFSET;
        if rel % HASH_SIZE != 0 {
            return None;
        }
        let entry = rel / HASH_SIZE;
        return (entry < 8 && sector == entry * SECTORS_PER_SUBGROUP)
            .then_some(CanonicalSlot::H2 { subgroup: entry });
    }
    None
}

/// Encodes a decrypted group into an uncompressed blob: exception list,
/// 4-byte alignment padding, non-zero payload segments, terminator, SHA-1
/// suffix.
///
/// Only canonical slots are diffed; the H1 and H2 replica tables must be
/// byte-identical across their subgroup and group, which holds for any
/// rebuilt group.
pub fn encode_group(group: &SectorGroup) -> Vec<u8> {
    // Rebuild the canonical tree from the payload in a scratch copy, then
    // diff the stored tree against it.
    let mut scratch = group.clone();
    compute_h0(&mut scratch);
    let h1 = compute_h1(&scratch);
    let h2 = compute_h2(&h1);

    let mut exceptions = Vec::<ExceptionRecord>::new();
    for (sector_idx, sector) in group.sectors().iter().enumerate() {
        let base = sector_idx * HASHES_SIZE;
        for (block_idx, stored) in sector.h0().iter().enumerate() {
            if *stored != scratch.sectors()[sector_idx].h0()[block_idx] {
                exceptions.push(ExceptionRecord {
                    offset: U16::new((base + block_idx * HASH_SIZE) as u16),
                    hash: *stored,
                });
            }
        }
        let own_entry = sector_idx % SECTORS_PER_SUBGROUP;
        if sector.h1_table()[own_entry] != h1[sector_idx] {
            exceptions.push(ExceptionRecord {
                offset: U16::new((base + H1_TABLE_OFFSET + own_entry * HASH_SIZE) as u16),
                hash: sector.h1_table()[own_entry],
            });
        }
    }
    for (subgroup, expected) in h2.iter().enumerate() {
        let sector = &group.sectors()[subgroup * SECTORS_PER_SUBGROUP];
        if sector.h2_table()[subgroup] != *expected {
            let base = subgroup * SECTORS_PER_SUBGROUP * HASHES_SIZE;
            exceptions.push(ExceptionRecord {
                offset: U16::new((base + H2_TABLE_OFFSET + subgroup * HASH_SIZE) as u16),
                hash: sector.h2_table()[subgroup],
            });
        }
    }

    let mut blob = Vec::<u8>::new();
    blob.extend_from_slice(&(exceptions.len() as u16).to_be_bytes());
    for record in &exceptions {
        blob.extend_from_slice(record.as_bytes());
    }
    while blob.len() % 4 != 0 {
        blob.push(0);
    }

    let mut payload = zeroed_box::<u8, GROUP_DATA_SIZE>();
    group.copy_payload_to(&mut payload);
    for (start, end) in segment_runs(payload.as_ref()) {
        let header =
            SegmentHeader { offset: U32::new(start as u32), size: U32::new((end - start) as u32) };
        blob.extend_from_slice(header.as_bytes());
        blob.extend_from_slice(&payload[start..end]);
    }
    blob.extend_from_slice(SegmentHeader::new_zeroed().as_bytes());

    let digest = hash_bytes(&blob);
    blob.extend_from_slice(&digest);
    blob
}

/// Non-zero runs of `payload` as `(start, end)` pairs, with zero gaps up to
/// [`SEGMENT_MERGE_GAP`] folded into the preceding run.
fn segment_runs(payload: &[u8]) -> Vec<(usize, usize)> {
    let mut runs = Vec::<(usize, usize)>::new();
    for (idx, byte) in payload.iter().enumerate() {
        if *byte == 0 {
            continue;
        }
        match runs.last_mut() {
            Some((_, end)) if idx - *end <= SEGMENT_MERGE_GAP => *end = idx + 1,
            _ => runs.push((idx, idx + 1)),
        }
    }
    runs
}

/// Decodes a group blob back into a full 2 MiB group.
///
/// Only uncompressed blobs are handled here; decompression belongs to the
/// outer container, and any other mode is rejected. The payload is
/// zero-filled and segments copied in, the hash tree is rebuilt, canonical
/// exceptions are patched before replication, and the group is encrypted
/// only when `key` marks the partition encrypted.
pub fn decode_group(
    blob: &[u8],
    compression: Compression,
    key: Option<&PartitionKey>,
) -> Result<SectorGroup> {
    if compression != Compression::None {
        return Err(Error::UnsupportedCompression(compression));
    }
    if blob.len() < HASH_SIZE {
        return Err(Error::DiscFormat("Group blob too short for digest".to_string()));
    }
    let (body, suffix) = blob.split_at(blob.len() - HASH_SIZE);
    if hash_bytes(body) != *suffix {
        return Err(Error::DiscFormat("Group blob digest mismatch".to_string()));
    }

    let mut reader = body;
    let num_exceptions = read_u16_be(&mut reader).context("Reading exception count")?;
    let exceptions = read_box_slice::<ExceptionRecord, _>(&mut reader, num_exceptions as usize)
        .context("Reading exception list")?;
    let consumed = 2 + num_exceptions as usize * 22;
    let mut align = [0u8; 3];
    let pad = (4 - consumed % 4) % 4;
    std::io::Read::read_exact(&mut reader, &mut align[..pad])
        .context("Reading exception list padding")?;

    let mut group = SectorGroup::new();
    loop {
        let header = read_from::<SegmentHeader, _>(&mut reader).context("Reading segment header")?;
        let offset = header.offset.get() as usize;
        let size = header.size.get() as usize;
        if offset == 0 && size == 0 {
            break;
        }
        if size == 0 {
            return Err(Error::DiscFormat(format!("Zero-length segment at {:#X}", offset)));
        }
        if offset.saturating_add(size) > GROUP_DATA_SIZE {
            return Err(Error::DiscFormat(format!(
                "Segment {:#X}..{:#X} exceeds group data size {:#X}",
                offset,
                offset + size,
                GROUP_DATA_SIZE
            )));
        }
        let data = read_box_slice::<u8, _>(&mut reader, size).context("Reading segment data")?;
        group.write_payload(offset, &data)?;
    }

    compute_h0(&mut group);
    let mut h1 = compute_h1(&group);
    let mut h2 = compute_h2(&h1);
    let mut deferred = Vec::<&ExceptionRecord>::new();
    for record in exceptions.iter() {
        match canonical_slot(record.offset.get()) {
            Some(CanonicalSlot::H0 { sector, index }) => {
                group.sectors_mut()[sector].h0[index] = record.hash;
            }
            Some(CanonicalSlot::H1 { sector }) => h1[sector] = record.hash,
            Some(CanonicalSlot::H2 { subgroup }) => h2[subgroup] = record.hash,
            None => deferred.push(record),
        }
    }
    replicate(&mut group, &h1, &h2);
    for record in deferred {
        let start = record.offset.get() as usize;
        let (sector, within) = div_rem(start, HASHES_SIZE);
        log::warn!(
            "Non-canonical hash exception at sector {}, offset {:#X}; applying verbatim",
            sector,
            within
        );
        // Offsets address a flat hash space, so a record may spill across a
        // sector boundary. Truncate only past the last sector.
        for (idx, byte) in record.hash.iter().enumerate() {
            let (sector, within) = div_rem(start + idx, HASHES_SIZE);
            if sector >= GROUP_SECTORS {
                break;
            }
            group.as_bytes_mut()[sector * SECTOR_SIZE + within] = *byte;
        }
    }

    if let Some(key) = key {
        if key.is_encrypted {
            for sector in group.sectors_mut() {
                encrypt_sector(sector, &key.key);
            }
        }
    }
    Ok(group)
}
