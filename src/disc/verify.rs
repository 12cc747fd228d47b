//! Hash tree verification for partition groups and whole partitions.
//!
//! Verification proceeds bottom-up within a group (H0, then H1, then H2/H3),
//! but every level is checked independently against the as-stored values, so
//! a lower-level failure never suppresses a higher-level check. Mismatches
//! are collected into a [`VerifyReport`] up to a caller-chosen budget; the H4
//! root check over the partition's H3 table is a separate final step,
//! independent of per-group results.

use std::{
    cmp::min,
    fmt,
    sync::atomic::{AtomicBool, Ordering},
};

use crate::{
    disc::{
        hashes::{decrypt_sector, hash_bytes},
        sector::SectorGroup,
        wii::{PartitionKey, Tmd},
        GROUP_SECTORS, HASH_SIZE, SECTORS_PER_SUBGROUP, SECTOR_SIZE,
    },
    io::{stream::PartitionInfo, HashBytes, SectorIO},
    util::div_rem,
    Error, Result, ResultContext,
};

/// The tree level (or replication rule) a mismatch was detected at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MismatchKind {
    /// A payload sub-block does not match its stored H0 digest.
    H0,
    /// A sector's H0 area does not match its stored H1 table entry.
    H1,
    /// A sector's H1 table is not byte-identical to its subgroup's.
    H1Copy,
    /// The first-seen sector's H1 table does not match its stored H2 entry.
    H2,
    /// A sector's H2 table is not byte-identical to the group's.
    H2Copy,
    /// The stored H2 table does not match the partition's H3 entry.
    H3,
    /// The H3 table does not match the title-metadata root digest.
    H4,
}

impl fmt::Display for MismatchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MismatchKind::H0 => write!(f, "H0"),
            MismatchKind::H1 => write!(f, "H1"),
            MismatchKind::H1Copy => write!(f, "H1 copy"),
            MismatchKind::H2 => write!(f, "H2"),
            MismatchKind::H2Copy => write!(f, "H2 copy"),
            MismatchKind::H3 => write!(f, "H3"),
            MismatchKind::H4 => write!(f, "H4"),
        }
    }
}

/// One detected hash mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mismatch {
    /// The check that failed.
    pub kind: MismatchKind,
    /// Group index within the partition.
    pub group: u32,
    /// Sector index within the group.
    pub sector: u32,
    /// Byte offset of the checked value: within the sector's hash area for
    /// H0–H2 kinds, within the H3 table for H3, zero for H4.
    pub offset: u32,
}

/// Partition verification state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum VerifyStatus {
    /// Structural validation failed before any hashing. Terminal.
    Invalid,
    /// Title metadata marks the partition unhashed; nothing to check.
    NoHash,
    /// Verification is in progress.
    #[default]
    Scanning,
    /// Every check passed.
    Ok,
    /// At least one mismatch was found; the full list fits the budget.
    Differ,
    /// The mismatch budget was exceeded and verification stopped early.
    Aborted,
}

impl fmt::Display for VerifyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VerifyStatus::Invalid => write!(f, "invalid"),
            VerifyStatus::NoHash => write!(f, "no hashes"),
            VerifyStatus::Scanning => write!(f, "scanning"),
            VerifyStatus::Ok => write!(f, "ok"),
            VerifyStatus::Differ => write!(f, "differ"),
            VerifyStatus::Aborted => write!(f, "aborted"),
        }
    }
}

/// Accumulated verification results for one partition.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    status: VerifyStatus,
    mismatches: Vec<Mismatch>,
    limit: usize,
    truncated: bool,
}

impl VerifyReport {
    /// Creates an empty report with the given mismatch budget.
    pub fn new(limit: usize) -> Self {
        Self { status: VerifyStatus::Scanning, mismatches: Vec::new(), limit, truncated: false }
    }

    /// The partition's verification state.
    pub fn status(&self) -> VerifyStatus { self.status }

    /// Every recorded mismatch, in detection order.
    pub fn mismatches(&self) -> &[Mismatch] { &self.mismatches }

    /// Whether the budget was exceeded; if true, more mismatches may exist
    /// beyond those listed.
    pub fn truncated(&self) -> bool { self.truncated }

    pub(crate) fn record(&mut self, mismatch: Mismatch) -> Result<()> {
        if self.mismatches.len() >= self.limit {
            self.truncated = true;
            self.status = VerifyStatus::Aborted;
            return Err(Error::HashMismatchLimit(self.limit));
        }
        log::debug!(
            "{} mismatch: group {}, sector {}, offset {:#X}",
            mismatch.kind,
            mismatch.group,
            mismatch.sector,
            mismatch.offset
        );
        self.mismatches.push(mismatch);
        Ok(())
    }

    pub(crate) fn set_status(&mut self, status: VerifyStatus) { self.status = status; }

    pub(crate) fn finish(&mut self) {
        self.status = if self.truncated {
            VerifyStatus::Aborted
        } else if self.mismatches.is_empty() {
            VerifyStatus::Ok
        } else {
            VerifyStatus::Differ
        };
    }
}

/// Verifies one group against its stored hash tree and the partition's H3
/// entry, recording mismatches into `report`.
///
/// Only sectors marked in `used` are examined; unused sectors are skipped
/// without decoding. When `key` marks the partition encrypted, used sectors
/// are decrypted in place first.
pub fn verify_group(
    group: &mut SectorGroup,
    used: &[bool; GROUP_SECTORS],
    key: Option<&PartitionKey>,
    group_index: u32,
    h3_ref: &HashBytes,
    report: &mut VerifyReport,
) -> Result<()> {
    if let Some(key) = key {
        if key.is_encrypted {
            for (sector_idx, sector) in group.sectors_mut().iter_mut().enumerate() {
                if used[sector_idx] {
                    decrypt_sector(sector, &key.key);
                }
            }
        }
    }

    let mut first_in_subgroup = [None::<usize>; SECTORS_PER_SUBGROUP];
    let mut first_in_group = None::<usize>;
    for sector_idx in 0..GROUP_SECTORS {
        if !used[sector_idx] {
            continue;
        }
        let sector = &group.sectors()[sector_idx];
        let (subgroup, sector_in_subgroup) = div_rem(sector_idx, SECTORS_PER_SUBGROUP);

        // H0: every payload sub-block against its stored digest.
        for block_idx in 0..sector.h0().len() {
            if hash_bytes(sector.sub_block(block_idx)) != sector.h0()[block_idx] {
                report.record(Mismatch {
                    kind: MismatchKind::H0,
                    group: group_index,
                    sector: sector_idx as u32,
                    offset: (block_idx * HASH_SIZE) as u32,
                })?;
            }
        }

        // H1: the sector's own table entry against its stored H0 area.
        if hash_bytes(sector.h0_bytes()) != sector.h1_table()[sector_in_subgroup] {
            report.record(Mismatch {
                kind: MismatchKind::H1,
                group: group_index,
                sector: sector_idx as u32,
                offset: (0x280 + sector_in_subgroup * HASH_SIZE) as u32,
            })?;
        }

        // H1 replication: byte-identical to the first used sector of the
        // subgroup. No re-hash.
        match first_in_subgroup[subgroup] {
            None => first_in_subgroup[subgroup] = Some(sector_idx),
            Some(first_idx) => {
                if sector.h1_bytes() != group.sectors()[first_idx].h1_bytes() {
                    report.record(Mismatch {
                        kind: MismatchKind::H1Copy,
                        group: group_index,
                        sector: sector_idx as u32,
                        offset: 0x280,
                    })?;
                }
            }
        }

        match first_in_group {
            None => {
                first_in_group = Some(sector_idx);
                // H2: the first used sector's table entry against its stored
                // H1 table.
                if hash_bytes(sector.h1_bytes()) != sector.h2_table()[subgroup] {
                    report.record(Mismatch {
                        kind: MismatchKind::H2,
                        group: group_index,
                        sector: sector_idx as u32,
                        offset: (0x340 + subgroup * HASH_SIZE) as u32,
                    })?;
                }
                // H3: the stored H2 table against the partition's H3 entry.
                if hash_bytes(sector.h2_bytes()) != *h3_ref {
                    report.record(Mismatch {
                        kind: MismatchKind::H3,
                        group: group_index,
                        sector: sector_idx as u32,
                        offset: group_index * HASH_SIZE as u32,
                    })?;
                }
            }
            Some(first_idx) => {
                // H2 replication.
                if sector.h2_bytes() != group.sectors()[first_idx].h2_bytes() {
                    report.record(Mismatch {
                        kind: MismatchKind::H2Copy,
                        group: group_index,
                        sector: sector_idx as u32,
                        offset: 0x340,
                    })?;
                }
            }
        }
    }
    Ok(())
}

/// Verifies the H4 root: the digest of the partition's H3 table against the
/// title-metadata content record. Returns the mismatch rather than recording
/// it, so callers can treat the root check independently of per-group
/// results. `None` when the check passes or the TMD declares no contents.
pub fn verify_h3_table(h3_table: &[u8], tmd: &Tmd) -> Option<Mismatch> {
    let root = tmd.h4_root()?;
    let digest = hash_bytes(h3_table);
    if digest != *root {
        let mut got_bytes = [0u8; 40];
        let got = base16ct::lower::encode_str(&digest, &mut got_bytes).unwrap(); // Safe: fixed buffer size
        let mut expected_bytes = [0u8; 40];
        let expected = base16ct::lower::encode_str(root, &mut expected_bytes).unwrap(); // Safe: fixed buffer size
        log::debug!("H3 table does not match TMD root:\n\texpected: {}\n\tgot:      {}", expected, got);
        return Some(Mismatch { kind: MismatchKind::H4, group: 0, sector: 0, offset: 0 });
    }
    None
}

/// Verifies every group of a partition, then the H4 root.
///
/// `used` holds one entry per data sector; unused sectors are skipped. The
/// cancellation flag is polled between groups only, so at most one group's
/// work is lost; cancellation surfaces as [`Error::Interrupted`].
pub fn verify_partition(
    io: &mut dyn SectorIO,
    part: &PartitionInfo,
    used: &[bool],
    max_mismatches: usize,
    cancel: &AtomicBool,
) -> Result<VerifyReport> {
    let mut report = VerifyReport::new(max_mismatches);
    if part.no_hashes() {
        report.set_status(VerifyStatus::NoHash);
        return Ok(report);
    }
    let sector_count = (part.data_end_sector() - part.data_start_sector()) as usize;
    if used.len() != sector_count {
        log::warn!(
            "Partition {}: usage table covers {} sectors, expected {}",
            part.index(),
            used.len(),
            sector_count
        );
        report.set_status(VerifyStatus::Invalid);
        return Ok(report);
    }
    let tmd = match part.tmd() {
        Ok(tmd) => tmd,
        Err(e) => {
            log::warn!("Partition {}: structural validation failed: {}", part.index(), e);
            report.set_status(VerifyStatus::Invalid);
            return Ok(report);
        }
    };

    let mut group = SectorGroup::new();
    for group_idx in 0..part.group_count() {
        if cancel.load(Ordering::Relaxed) {
            return Err(Error::Interrupted);
        }
        let first_sector = part.data_start_sector() + group_idx * GROUP_SECTORS as u32;
        let avail = min(GROUP_SECTORS, (part.data_end_sector() - first_sector) as usize);
        io.read_raw(
            first_sector as u64 * SECTOR_SIZE as u64,
            &mut group.as_bytes_mut()[..avail * SECTOR_SIZE],
        )
        .with_context(|| format!("Reading group {}", group_idx))?;
        group.as_bytes_mut()[avail * SECTOR_SIZE..].fill(0);

        let mut group_used = [false; GROUP_SECTORS];
        let base = group_idx as usize * GROUP_SECTORS;
        group_used[..avail].copy_from_slice(&used[base..base + avail]);

        match verify_group(
            &mut group,
            &group_used,
            Some(part.key()),
            group_idx,
            part.h3_ref(group_idx),
            &mut report,
        ) {
            Ok(()) => {}
            Err(Error::HashMismatchLimit(_)) => {
                report.finish();
                return Ok(report);
            }
            Err(e) => return Err(e),
        }
    }

    if let Some(mismatch) = verify_h3_table(part.h3_table(), &tmd) {
        if report.record(mismatch).is_err() {
            report.finish();
            return Ok(report);
        }
    }
    report.finish();
    if report.status() != VerifyStatus::Ok {
        log::warn!(
            "Partition {}: {} hash mismatches ({})",
            part.index(),
            report.mismatches().len(),
            report.status()
        );
    }
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disc::hashes::{
        build_group,
        tests::{random_group, TEST_KEY},
    };
    use crate::disc::wii::{TmdContent, TmdHeader};
    use zerocopy::{AsBytes, FromZeroes};

    const ALL_USED: [bool; GROUP_SECTORS] = [true; GROUP_SECTORS];

    fn kinds(report: &VerifyReport) -> Vec<MismatchKind> {
        report.mismatches().iter().map(|m| m.kind).collect()
    }

    #[test]
    fn clean_group_passes_unkeyed() {
        let mut group = random_group(10);
        let h3 = build_group(&mut group, None);
        let mut report = VerifyReport::new(16);
        verify_group(&mut group, &ALL_USED, None, 0, &h3, &mut report).unwrap();
        report.finish();
        assert_eq!(report.status(), VerifyStatus::Ok);
        assert!(report.mismatches().is_empty());
    }

    #[test]
    fn clean_group_passes_keyed() {
        let key = PartitionKey { key: TEST_KEY, is_encrypted: true };
        let mut group = random_group(11);
        let h3 = build_group(&mut group, Some(&key));
        let mut report = VerifyReport::new(16);
        verify_group(&mut group, &ALL_USED, Some(&key), 0, &h3, &mut report).unwrap();
        report.finish();
        assert_eq!(report.status(), VerifyStatus::Ok);
    }

    #[test]
    fn payload_flip_reports_h0() {
        let mut group = random_group(12);
        let h3 = build_group(&mut group, None);
        group.sectors_mut()[9].payload_mut()[5 * 0x400 + 3] ^= 0x80;
        let mut report = VerifyReport::new(64);
        verify_group(&mut group, &ALL_USED, None, 2, &h3, &mut report).unwrap();
        let found = report
            .mismatches()
            .iter()
            .find(|m| m.kind == MismatchKind::H0)
            .expect("H0 mismatch not reported");
        assert_eq!(found.group, 2);
        assert_eq!(found.sector, 9);
        assert_eq!(found.offset, 5 * HASH_SIZE as u32);
    }

    #[test]
    fn h0_flip_reports_h0_and_h1() {
        let mut group = random_group(13);
        let h3 = build_group(&mut group, None);
        group.sectors_mut()[4].h0[7][0] ^= 1;
        let mut report = VerifyReport::new(64);
        verify_group(&mut group, &ALL_USED, None, 0, &h3, &mut report).unwrap();
        let kinds = kinds(&report);
        assert!(kinds.contains(&MismatchKind::H0));
        assert!(kinds.contains(&MismatchKind::H1));
    }

    #[test]
    fn h1_flip_reports_h1() {
        let mut group = random_group(14);
        let h3 = build_group(&mut group, None);
        // Sector 3's own entry, so both the recompute and the replication
        // check against sector 0 can fire.
        group.sectors_mut()[3].h1[3][10] ^= 1;
        let mut report = VerifyReport::new(64);
        verify_group(&mut group, &ALL_USED, None, 0, &h3, &mut report).unwrap();
        let kinds = kinds(&report);
        assert!(kinds.contains(&MismatchKind::H1));
        assert!(kinds.contains(&MismatchKind::H1Copy));
    }

    #[test]
    fn h2_flip_reports_h2_level() {
        let mut group = random_group(15);
        let h3 = build_group(&mut group, None);
        group.sectors_mut()[40].h2[1][0] ^= 1;
        let mut report = VerifyReport::new(64);
        verify_group(&mut group, &ALL_USED, None, 0, &h3, &mut report).unwrap();
        assert!(kinds(&report).contains(&MismatchKind::H2Copy));
    }

    #[test]
    fn first_sector_h2_flip_reports_h2_and_h3() {
        let mut group = random_group(16);
        let h3 = build_group(&mut group, None);
        group.sectors_mut()[0].h2[0][19] ^= 1;
        // One H2 and one H3 mismatch, plus an H2Copy per remaining sector.
        let mut report = VerifyReport::new(128);
        verify_group(&mut group, &ALL_USED, None, 0, &h3, &mut report).unwrap();
        let kinds = kinds(&report);
        assert!(kinds.contains(&MismatchKind::H2));
        assert!(kinds.contains(&MismatchKind::H3));
    }

    #[test]
    fn unused_sectors_are_skipped() {
        let mut group = random_group(17);
        let h3 = build_group(&mut group, None);
        group.sectors_mut()[20].payload_mut()[0] ^= 0xFF;
        let mut used = ALL_USED;
        used[20] = false;
        let mut report = VerifyReport::new(64);
        verify_group(&mut group, &used, None, 0, &h3, &mut report).unwrap();
        report.finish();
        assert_eq!(report.status(), VerifyStatus::Ok);
    }

    #[test]
    fn budget_exceeded_aborts_with_truncated_report() {
        let mut group = random_group(18);
        let h3 = build_group(&mut group, None);
        for sector in group.sectors_mut() {
            sector.payload_mut().fill(0xAB);
        }
        let mut report = VerifyReport::new(3);
        let err = verify_group(&mut group, &ALL_USED, None, 0, &h3, &mut report).unwrap_err();
        assert!(matches!(err, Error::HashMismatchLimit(3)));
        assert_eq!(report.mismatches().len(), 3);
        assert!(report.truncated());
        assert_eq!(report.status(), VerifyStatus::Aborted);
    }

    #[test]
    fn h4_check_is_independent_of_groups() {
        // Two groups' worth of H3 entries; corrupt the second entry only.
        let mut group = random_group(19);
        let h3 = build_group(&mut group, None);
        let mut h3_table = vec![0u8; crate::disc::wii::H3_TABLE_SIZE];
        h3_table[..20].copy_from_slice(&h3);
        h3_table[20..40].copy_from_slice(&[0x11; 20]);

        let mut tmd_raw = TmdHeader::new_zeroed();
        tmd_raw.num_contents = 1.into();
        let mut content = TmdContent::new_zeroed();
        content.hash = hash_bytes(&h3_table);
        let mut raw = tmd_raw.as_bytes().to_vec();
        raw.extend_from_slice(content.as_bytes());
        let tmd = Tmd::parse(&raw).unwrap();

        // Group 0 still verifies against its own entry.
        let mut report = VerifyReport::new(16);
        verify_group(&mut group, &ALL_USED, None, 0, &h3, &mut report).unwrap();
        report.finish();
        assert_eq!(report.status(), VerifyStatus::Ok);

        // The intact table matches the root; corrupting one entry fails H4.
        assert!(verify_h3_table(&h3_table, &tmd).is_none());
        h3_table[25] ^= 1;
        let mismatch = verify_h3_table(&h3_table, &tmd).expect("H4 mismatch not reported");
        assert_eq!(mismatch.kind, MismatchKind::H4);
    }
}
