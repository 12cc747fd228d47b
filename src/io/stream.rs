//! Partition metadata and the streaming read front end.
//!
//! [`PartitionStream`] presents a partition's decrypted payload as a flat
//! `Read + Seek` byte stream. All access is routed through a one-group
//! cache: whatever group the current position falls in is read, decrypted,
//! and optionally verified as a whole, then sub-ranges are served from it
//! until the position crosses into another group. Clones share the cache,
//! guarded by a single `Mutex`.

use std::{
    cmp::min,
    io,
    io::{Read, Seek, SeekFrom},
    sync::{Arc, Mutex},
};

use crate::{
    array_ref,
    disc::{
        hashes::{build_group, decrypt_sector},
        sector::SectorGroup,
        verify::{verify_group, VerifyReport},
        wii::{PartitionKey, Tmd, H3_TABLE_SIZE},
        GROUP_DATA_SIZE, GROUP_SECTORS, HASH_SIZE, SECTOR_DATA_SIZE, SECTOR_SIZE,
    },
    io::{HashBytes, SectorIO},
    Error, Result, ResultContext,
};

/// Everything the engine needs to know about one partition: where its data
/// sectors live, its key material, and its stored H3 table and raw TMD.
#[derive(Clone)]
pub struct PartitionInfo {
    index: u32,
    data_start_sector: u32,
    data_end_sector: u32,
    key: PartitionKey,
    no_hashes: bool,
    h3_table: Box<[u8]>,
    raw_tmd: Box<[u8]>,
}

impl PartitionInfo {
    /// Validates the sector range and H3 table size up front, so accessors
    /// can index without re-checking.
    pub fn new(
        index: u32,
        data_start_sector: u32,
        data_end_sector: u32,
        key: PartitionKey,
        no_hashes: bool,
        h3_table: Box<[u8]>,
        raw_tmd: Box<[u8]>,
    ) -> Result<Self> {
        if data_end_sector <= data_start_sector {
            return Err(Error::DiscFormat(format!(
                "Partition {}: invalid data sector range {}..{}",
                index, data_start_sector, data_end_sector
            )));
        }
        if h3_table.len() != H3_TABLE_SIZE {
            return Err(Error::DiscFormat(format!(
                "Partition {}: H3 table size {:#X}, expected {:#X}",
                index,
                h3_table.len(),
                H3_TABLE_SIZE
            )));
        }
        let part = Self { index, data_start_sector, data_end_sector, key, no_hashes, h3_table, raw_tmd };
        if part.group_count() as usize * HASH_SIZE > H3_TABLE_SIZE {
            return Err(Error::DiscFormat(format!(
                "Partition {}: {} groups exceed H3 table capacity",
                index,
                part.group_count()
            )));
        }
        Ok(part)
    }

    /// Partition index within the disc.
    pub fn index(&self) -> u32 { self.index }

    /// First data sector (absolute).
    pub fn data_start_sector(&self) -> u32 { self.data_start_sector }

    /// One past the last data sector (absolute).
    pub fn data_end_sector(&self) -> u32 { self.data_end_sector }

    /// The partition's title key and encryption flag.
    pub fn key(&self) -> &PartitionKey { &self.key }

    /// Whether the disc header disables partition hashes entirely.
    pub fn no_hashes(&self) -> bool { self.no_hashes }

    /// Number of data sectors.
    pub fn sector_count(&self) -> u32 { self.data_end_sector - self.data_start_sector }

    /// Number of groups, the last possibly partial.
    pub fn group_count(&self) -> u32 {
        self.sector_count().div_ceil(GROUP_SECTORS as u32)
    }

    /// Total decrypted payload length in bytes.
    pub fn data_len(&self) -> u64 { self.sector_count() as u64 * SECTOR_DATA_SIZE as u64 }

    /// The stored H3 table.
    pub fn h3_table(&self) -> &[u8] { &self.h3_table }

    /// The stored H3 entry for one group. `group` must be below
    /// [`group_count`](Self::group_count).
    pub fn h3_ref(&self, group: u32) -> &HashBytes {
        array_ref![self.h3_table, group as usize * HASH_SIZE, 20]
    }

    /// Parses the partition's raw title metadata.
    pub fn tmd(&self) -> Result<Tmd<'_>> { Tmd::parse(&self.raw_tmd) }
}

/// One decrypted group, keyed by group index. `u32::MAX` marks the cache
/// empty.
struct GroupCache {
    group_idx: u32,
    group: SectorGroup,
}

impl GroupCache {
    fn new() -> Self { Self { group_idx: u32::MAX, group: SectorGroup::new() } }
}

/// Streaming reader over a partition's decrypted payload.
pub struct PartitionStream {
    io: Box<dyn SectorIO>,
    part: Arc<PartitionInfo>,
    cache: Arc<Mutex<GroupCache>>,
    pos: u64,
    validate: bool,
}

impl Clone for PartitionStream {
    fn clone(&self) -> Self {
        Self {
            io: self.io.clone(),
            part: self.part.clone(),
            cache: self.cache.clone(),
            pos: 0,
            validate: self.validate,
        }
    }
}

impl PartitionStream {
    /// Creates a stream positioned at the start of the partition's payload.
    /// With `validate` set, every group is verified against the hash tree as
    /// it is loaded, and a mismatch fails the read.
    pub fn new(io: Box<dyn SectorIO>, part: PartitionInfo, validate: bool) -> Self {
        Self {
            io,
            part: Arc::new(part),
            cache: Arc::new(Mutex::new(GroupCache::new())),
            pos: 0,
            validate,
        }
    }

    /// The partition this stream reads from.
    pub fn partition(&self) -> &PartitionInfo { &self.part }

    /// Rebuilds one group from a full payload image and writes it back,
    /// hash areas and all. Returns the group's new H3 digest; the caller
    /// owns updating the partition's H3 table. The cache entry for the
    /// group is dropped so subsequent reads observe the new contents.
    pub fn write_group(&mut self, group_idx: u32, payload: &[u8; GROUP_DATA_SIZE]) -> Result<HashBytes> {
        if group_idx >= self.part.group_count() {
            return Err(Error::DiscFormat(format!(
                "Group {} out of range ({} groups)",
                group_idx,
                self.part.group_count()
            )));
        }
        let mut group = SectorGroup::new();
        group.load_payload(payload);
        let h3 = build_group(&mut group, Some(&self.part.key));

        let first_sector = self.part.data_start_sector + group_idx * GROUP_SECTORS as u32;
        let avail = min(GROUP_SECTORS, (self.part.data_end_sector - first_sector) as usize);
        self.io
            .write_raw(
                first_sector as u64 * SECTOR_SIZE as u64,
                &group.as_bytes()[..avail * SECTOR_SIZE],
            )
            .with_context(|| format!("Writing group {}", group_idx))?;

        let mut cache = self.cache.lock().unwrap(); // Safe: no panics while held
        if cache.group_idx == group_idx {
            cache.group_idx = u32::MAX;
        }
        Ok(h3)
    }

    /// Loads, decrypts, and optionally verifies one group into the cache.
    fn load_group(
        io: &mut dyn SectorIO,
        part: &PartitionInfo,
        validate: bool,
        cache: &mut GroupCache,
        group_idx: u32,
    ) -> io::Result<()> {
        let first_sector = part.data_start_sector + group_idx * GROUP_SECTORS as u32;
        let avail = min(GROUP_SECTORS, (part.data_end_sector - first_sector) as usize);
        io.read_raw(
            first_sector as u64 * SECTOR_SIZE as u64,
            &mut cache.group.as_bytes_mut()[..avail * SECTOR_SIZE],
        )?;
        cache.group.as_bytes_mut()[avail * SECTOR_SIZE..].fill(0);

        if validate && !part.no_hashes {
            let mut used = [false; GROUP_SECTORS];
            used[..avail].fill(true);
            // A budget of zero turns the first mismatch into a hard failure.
            let mut report = VerifyReport::new(0);
            verify_group(
                &mut cache.group,
                &used,
                Some(&part.key),
                group_idx,
                part.h3_ref(group_idx),
                &mut report,
            )
            .map_err(|e| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("Hash mismatch in group {}: {}", group_idx, e),
                )
            })?;
        } else if part.key.is_encrypted {
            for sector in &mut cache.group.sectors_mut()[..avail] {
                decrypt_sector(sector, &part.key.key);
            }
        }
        cache.group_idx = group_idx;
        Ok(())
    }
}

impl Read for PartitionStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let total = self.part.data_len();
        if self.pos >= total || buf.is_empty() {
            return Ok(0);
        }
        let group_idx = (self.pos / GROUP_DATA_SIZE as u64) as u32;
        let mut cache = self.cache.lock().unwrap(); // Safe: no panics while held
        if cache.group_idx != group_idx {
            Self::load_group(&mut *self.io, &self.part, self.validate, &mut cache, group_idx)?;
        }

        // Serve up to the end of the current sector's payload.
        let group_offset = (self.pos % GROUP_DATA_SIZE as u64) as usize;
        let sector = group_offset / SECTOR_DATA_SIZE;
        let sector_offset = group_offset % SECTOR_DATA_SIZE;
        let len = min(
            min(buf.len() as u64, (SECTOR_DATA_SIZE - sector_offset) as u64),
            total - self.pos,
        ) as usize;
        buf[..len].copy_from_slice(
            &cache.group.sectors()[sector].payload()[sector_offset..sector_offset + len],
        );
        self.pos += len as u64;
        Ok(len)
    }
}

impl Seek for PartitionStream {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = match pos {
            SeekFrom::Start(v) => v,
            SeekFrom::End(_) => {
                return Err(io::Error::new(
                    io::ErrorKind::Unsupported,
                    "PartitionStream: SeekFrom::End is not supported".to_string(),
                ));
            }
            SeekFrom::Current(v) => self.pos.saturating_add_signed(v),
        };
        Ok(self.pos)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicBool;

    use rand::{rngs::StdRng, RngCore, SeedableRng};
    use zerocopy::{AsBytes, FromZeroes};

    use super::*;
    use crate::{
        disc::{
            hashes::{hash_bytes, tests::TEST_KEY},
            verify::{verify_partition, MismatchKind, VerifyStatus},
            wii::{TmdContent, TmdHeader},
        },
        util::zeroed_box,
    };

    /// Flat in-memory image with bounds-checked raw access. Clones share
    /// the backing buffer, like handles onto one file.
    #[derive(Clone)]
    pub(crate) struct MemorySectorIO {
        data: Arc<Mutex<Vec<u8>>>,
    }

    impl MemorySectorIO {
        pub(crate) fn new(data: Vec<u8>) -> Self { Self { data: Arc::new(Mutex::new(data)) } }

        pub(crate) fn flip(&self, offset: usize, mask: u8) {
            self.data.lock().unwrap()[offset] ^= mask;
        }
    }

    impl SectorIO for MemorySectorIO {
        fn read_raw(&mut self, offset: u64, out: &mut [u8]) -> io::Result<()> {
            let data = self.data.lock().unwrap();
            let offset = offset as usize;
            let end = offset + out.len();
            if end > data.len() {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past image end"));
            }
            out.copy_from_slice(&data[offset..end]);
            Ok(())
        }

        fn write_raw(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
            let mut data = self.data.lock().unwrap();
            let offset = offset as usize;
            let end = offset + buf.len();
            if end > data.len() {
                return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "write past image end"));
            }
            data[offset..end].copy_from_slice(buf);
            Ok(())
        }
    }

    const DATA_START: u32 = 4;
    // 1.5 groups, so the second group is partial.
    const SECTORS: u32 = 96;

    fn tmd_for(h3_table: &[u8]) -> Vec<u8> {
        let mut header = TmdHeader::new_zeroed();
        header.num_contents = 1.into();
        let mut content = TmdContent::new_zeroed();
        content.hash = hash_bytes(h3_table);
        let mut raw = header.as_bytes().to_vec();
        raw.extend_from_slice(content.as_bytes());
        raw
    }

    /// Builds an encrypted two-group image plus the plaintext payload it was
    /// built from.
    pub(crate) fn test_image(seed: u64) -> (MemorySectorIO, PartitionInfo, Vec<u8>) {
        let key = PartitionKey { key: TEST_KEY, is_encrypted: true };
        let mut rng = StdRng::seed_from_u64(seed);
        let mut plaintext = vec![0u8; SECTORS as usize * SECTOR_DATA_SIZE];
        rng.fill_bytes(&mut plaintext);

        let mut image = vec![0u8; (DATA_START + SECTORS) as usize * SECTOR_SIZE];
        let mut h3_table = vec![0u8; H3_TABLE_SIZE].into_boxed_slice();
        for group_idx in 0..2u32 {
            let mut group = SectorGroup::new();
            let avail = min(GROUP_SECTORS, (SECTORS - group_idx * GROUP_SECTORS as u32) as usize);
            for s in 0..avail {
                let src = (group_idx as usize * GROUP_SECTORS + s) * SECTOR_DATA_SIZE;
                group.sectors_mut()[s]
                    .payload_mut()
                    .copy_from_slice(&plaintext[src..src + SECTOR_DATA_SIZE]);
            }
            let h3 = build_group(&mut group, Some(&key));
            let base = group_idx as usize * HASH_SIZE;
            h3_table[base..base + HASH_SIZE].copy_from_slice(&h3);
            let dst = (DATA_START as usize + group_idx as usize * GROUP_SECTORS) * SECTOR_SIZE;
            image[dst..dst + avail * SECTOR_SIZE]
                .copy_from_slice(&group.as_bytes()[..avail * SECTOR_SIZE]);
        }
        let raw_tmd = tmd_for(&h3_table).into_boxed_slice();
        let part = PartitionInfo::new(
            0,
            DATA_START,
            DATA_START + SECTORS,
            key,
            false,
            h3_table,
            raw_tmd,
        )
        .unwrap();
        (MemorySectorIO::new(image), part, plaintext)
    }

    #[test]
    fn reads_decrypted_payload_across_sectors() {
        let (io, part, plaintext) = test_image(30);
        let mut stream = PartitionStream::new(Box::new(io), part, false);
        // Straddles a sector payload boundary.
        let start = SECTOR_DATA_SIZE as u64 - 100;
        stream.seek(SeekFrom::Start(start)).unwrap();
        let mut buf = [0u8; 200];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], &plaintext[start as usize..start as usize + 200]);
    }

    #[test]
    fn cache_follows_group_switches() {
        let (io, part, plaintext) = test_image(31);
        let mut stream = PartitionStream::new(Box::new(io), part, false);
        let group1_start = GROUP_DATA_SIZE as u64;
        let mut buf = [0u8; 64];

        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], &plaintext[..64]);
        assert_eq!(stream.cache.lock().unwrap().group_idx, 0);

        stream.seek(SeekFrom::Start(group1_start)).unwrap();
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], &plaintext[group1_start as usize..group1_start as usize + 64]);
        assert_eq!(stream.cache.lock().unwrap().group_idx, 1);

        stream.seek(SeekFrom::Start(0)).unwrap();
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], &plaintext[..64]);
        assert_eq!(stream.cache.lock().unwrap().group_idx, 0);
    }

    #[test]
    fn read_stops_at_partition_end() {
        let (io, part, plaintext) = test_image(32);
        let total = part.data_len();
        let mut stream = PartitionStream::new(Box::new(io), part, false);
        stream.seek(SeekFrom::Start(total - 10)).unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).unwrap();
        assert_eq!(n, 10);
        assert_eq!(&buf[..10], &plaintext[plaintext.len() - 10..]);
        assert_eq!(stream.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn seek_from_end_is_unsupported() {
        let (io, part, _) = test_image(33);
        let mut stream = PartitionStream::new(Box::new(io), part, false);
        let err = stream.seek(SeekFrom::End(0)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::Unsupported);
    }

    #[test]
    fn validating_stream_rejects_tampered_group() {
        let (io, part, _) = test_image(34);
        // Flip a payload byte in the second group's first sector.
        let offset = (DATA_START as usize + GROUP_SECTORS) * SECTOR_SIZE + 0x400 + 7;
        io.flip(offset, 1);
        let mut stream = PartitionStream::new(Box::new(io), part, true);

        // The first group is untouched.
        let mut buf = [0u8; 16];
        stream.read_exact(&mut buf).unwrap();

        stream.seek(SeekFrom::Start(GROUP_DATA_SIZE as u64)).unwrap();
        let err = stream.read_exact(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn write_group_round_trips_and_invalidates_cache() {
        let (io, part, _) = test_image(35);
        let mut stream = PartitionStream::new(Box::new(io), part, false);
        let mut buf = [0u8; 32];
        stream.read_exact(&mut buf).unwrap();

        let mut payload = zeroed_box::<u8, GROUP_DATA_SIZE>();
        payload[..11].copy_from_slice(b"hello world");
        let h3 = stream.write_group(0, &payload).unwrap();
        assert_ne!(h3, *stream.partition().h3_ref(0));

        stream.seek(SeekFrom::Start(0)).unwrap();
        let mut buf = [0u8; 11];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], b"hello world");
    }

    #[test]
    fn clones_share_the_cache() {
        let (io, part, plaintext) = test_image(36);
        let mut stream = PartitionStream::new(Box::new(io), part, false);
        let mut buf = [0u8; 16];
        stream.read_exact(&mut buf).unwrap();

        let mut clone = stream.clone();
        assert_eq!(clone.cache.lock().unwrap().group_idx, 0);
        clone.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], &plaintext[..16]);
    }

    #[test]
    fn verify_partition_passes_on_clean_image() {
        let (mut io, part, _) = test_image(37);
        let used = vec![true; SECTORS as usize];
        let cancel = AtomicBool::new(false);
        let report = verify_partition(&mut io, &part, &used, 16, &cancel).unwrap();
        assert_eq!(report.status(), VerifyStatus::Ok);
    }

    #[test]
    fn verify_partition_localizes_payload_tampering() {
        let (mut io, part, _) = test_image(38);
        let offset = (DATA_START as usize + 70) * SECTOR_SIZE + 0x900;
        io.flip(offset, 0x40);
        let used = vec![true; SECTORS as usize];
        let cancel = AtomicBool::new(false);
        let report = verify_partition(&mut io, &part, &used, 16, &cancel).unwrap();
        assert_eq!(report.status(), VerifyStatus::Differ);
        // Ciphertext tampering lands somewhere in sector 70 of group 1;
        // AES-CBC decryption spreads it across at most one sub-block pair.
        assert!(report
            .mismatches()
            .iter()
            .any(|m| m.kind == MismatchKind::H0 && m.group == 1 && m.sector == 6));
    }

    #[test]
    fn verify_partition_skips_unused_sectors() {
        let (mut io, part, _) = test_image(39);
        let offset = (DATA_START as usize + 70) * SECTOR_SIZE + 0x900;
        io.flip(offset, 0x40);
        let mut used = vec![true; SECTORS as usize];
        used[70] = false;
        let cancel = AtomicBool::new(false);
        let report = verify_partition(&mut io, &part, &used, 16, &cancel).unwrap();
        assert_eq!(report.status(), VerifyStatus::Ok);
    }

    #[test]
    fn verify_partition_honors_cancellation() {
        let (mut io, part, _) = test_image(40);
        let used = vec![true; SECTORS as usize];
        let cancel = AtomicBool::new(true);
        let err = verify_partition(&mut io, &part, &used, 16, &cancel).unwrap_err();
        assert!(matches!(err, Error::Interrupted));
    }

    #[test]
    fn verify_partition_reports_no_hash_partitions() {
        let (mut io, part, _) = test_image(41);
        let part = PartitionInfo::new(
            0,
            part.data_start_sector(),
            part.data_end_sector(),
            part.key().clone(),
            true,
            part.h3_table().to_vec().into_boxed_slice(),
            vec![].into_boxed_slice(),
        )
        .unwrap();
        let used = vec![true; SECTORS as usize];
        let cancel = AtomicBool::new(false);
        let report = verify_partition(&mut io, &part, &used, 16, &cancel).unwrap();
        assert_eq!(report.status(), VerifyStatus::NoHash);
    }

    #[test]
    fn verify_partition_flags_bad_usage_table() {
        let (mut io, part, _) = test_image(42);
        let used = vec![true; 10];
        let cancel = AtomicBool::new(false);
        let report = verify_partition(&mut io, &part, &used, 16, &cancel).unwrap();
        assert_eq!(report.status(), VerifyStatus::Invalid);
    }

    #[test]
    fn verify_partition_flags_unparseable_tmd() {
        let (mut io, part, _) = test_image(43);
        let part = PartitionInfo::new(
            0,
            part.data_start_sector(),
            part.data_end_sector(),
            part.key().clone(),
            false,
            part.h3_table().to_vec().into_boxed_slice(),
            vec![0u8; 4].into_boxed_slice(),
        )
        .unwrap();
        let used = vec![true; SECTORS as usize];
        let cancel = AtomicBool::new(false);
        let report = verify_partition(&mut io, &part, &used, 16, &cancel).unwrap();
        assert_eq!(report.status(), VerifyStatus::Invalid);
    }

    #[test]
    fn write_group_keeps_verification_consistent() {
        let (mut io, part, _) = test_image(44);
        // The stream's clone of the mock shares the image buffer.
        let mut stream = PartitionStream::new(Box::new(io.clone()), part.clone(), false);
        let mut payload = zeroed_box::<u8, GROUP_DATA_SIZE>();
        payload[1000..1016].copy_from_slice(&[0x77; 16]);
        let h3 = stream.write_group(1, &payload).unwrap();

        // Rebuild the partition info with the updated H3 entry, then the
        // whole image verifies again.
        let mut h3_table = part.h3_table().to_vec();
        h3_table[HASH_SIZE..2 * HASH_SIZE].copy_from_slice(&h3);
        let raw_tmd = tmd_for(&h3_table).into_boxed_slice();
        let part = PartitionInfo::new(
            0,
            part.data_start_sector(),
            part.data_end_sector(),
            part.key().clone(),
            false,
            h3_table.into_boxed_slice(),
            raw_tmd,
        )
        .unwrap();
        let used = vec![true; SECTORS as usize];
        let cancel = AtomicBool::new(false);
        let report = verify_partition(&mut io, &part, &used, 16, &cancel).unwrap();
        assert_eq!(report.status(), VerifyStatus::Ok);
    }
}
