//! Hash tree construction for partition groups.
//!
//! In a sector, following the 0x400 byte block of hashes, each 0x400 bytes of
//! decrypted data is hashed, yielding 31 H0 hashes. Then, 8 sectors are
//! aggregated into a subgroup, and the 31 H0 hashes for each sector are
//! hashed, yielding 8 H1 hashes, replicated into every sector of the
//! subgroup. Then, 8 subgroups are aggregated into a group, and the 8 H1
//! hashes for each subgroup are hashed, yielding 8 H2 hashes, replicated into
//! every sector of the group. Finally, the 8 H2 hashes are hashed, yielding
//! the group's H3 hash, stored in the partition's H3 table.
//!
//! Encryption happens strictly after hashing: per sector, the hash area is
//! encrypted with a zero IV, then the payload with an IV taken from the
//! encrypted hash area. Sectors are independent cipher streams.

use sha1::{Digest, Sha1};
use zerocopy::AsBytes;

use crate::{
    disc::{
        sector::{Sector, SectorGroup},
        wii::PartitionKey,
        GROUP_SECTORS, SECTORS_PER_SUBGROUP, SUBGROUPS_PER_GROUP,
    },
    io::{aes_decrypt, aes_encrypt, HashBytes, KeyBytes},
};

/// SHA-1 digest of `buf`.
#[inline]
pub fn hash_bytes(buf: &[u8]) -> HashBytes {
    let mut hasher = Sha1::new();
    hasher.update(buf);
    hasher.finalize().into()
}

/// Zeroes every hash area and computes all 64 × 31 H0 digests in place.
pub fn compute_h0(group: &mut SectorGroup) {
    for sector in group.sectors_mut() {
        sector.clear_hash_area();
        for idx in 0..sector.h0.len() {
            let digest = hash_bytes(sector.sub_block(idx));
            sector.h0[idx] = digest;
        }
    }
}

/// Computes the 64 per-sector H1 digests from the stored H0 areas.
pub fn compute_h1(group: &SectorGroup) -> [HashBytes; GROUP_SECTORS] {
    let mut h1 = [[0u8; 20]; GROUP_SECTORS];
    for (sector_idx, sector) in group.sectors().iter().enumerate() {
        h1[sector_idx] = hash_bytes(sector.h0_bytes());
    }
    h1
}

/// Computes the 8 per-subgroup H2 digests from the H1 values.
pub fn compute_h2(h1: &[HashBytes; GROUP_SECTORS]) -> [HashBytes; SUBGROUPS_PER_GROUP] {
    let mut h2 = [[0u8; 20]; SUBGROUPS_PER_GROUP];
    for (subgroup, chunk) in h1.chunks_exact(SECTORS_PER_SUBGROUP).enumerate() {
        let mut hasher = Sha1::new();
        for digest in chunk {
            hasher.update(digest);
        }
        h2[subgroup] = hasher.finalize().into();
    }
    h2
}

/// The group's H3 digest over the H2 table.
pub fn group_h3(h2: &[HashBytes; SUBGROUPS_PER_GROUP]) -> HashBytes { hash_bytes(h2.as_bytes()) }

/// Replicates the H1 tables into every sector of each subgroup and the H2
/// table into every sector of the group.
pub fn replicate(
    group: &mut SectorGroup,
    h1: &[HashBytes; GROUP_SECTORS],
    h2: &[HashBytes; SUBGROUPS_PER_GROUP],
) {
    for (sector_idx, sector) in group.sectors_mut().iter_mut().enumerate() {
        let subgroup = sector_idx / SECTORS_PER_SUBGROUP;
        let table: &[HashBytes] =
            &h1[subgroup * SECTORS_PER_SUBGROUP..(subgroup + 1) * SECTORS_PER_SUBGROUP];
        sector.h1.copy_from_slice(table);
        sector.h2 = *h2;
    }
}

/// Rebuilds the full hash tree for a group and returns its H3 digest.
///
/// The caller supplies 64 sectors with payload populated; hash areas are
/// overwritten. If `key` is supplied and marks the partition encrypted, every
/// sector is encrypted in place after hashing completes.
pub fn build_group(group: &mut SectorGroup, key: Option<&PartitionKey>) -> HashBytes {
    compute_h0(group);
    let h1 = compute_h1(group);
    let h2 = compute_h2(&h1);
    replicate(group, &h1, &h2);
    let h3 = group_h3(&h2);
    if let Some(key) = key {
        if key.is_encrypted {
            for sector in group.sectors_mut() {
                encrypt_sector(sector, &key.key);
            }
        }
    }
    h3
}

/// Encrypts one sector in place: hash area with a zero IV, then payload with
/// the IV read from the encrypted hash area.
pub(crate) fn encrypt_sector(sector: &mut Sector, key: &KeyBytes) {
    aes_encrypt(key, [0u8; 16], sector.hash_area_mut());
    let iv = sector.data_iv();
    aes_encrypt(key, iv, sector.payload_mut());
}

/// Decrypts one sector in place. The payload IV round-trips through the
/// ciphertext hash area, so it is read before the hash area is decrypted.
pub(crate) fn decrypt_sector(sector: &mut Sector, key: &KeyBytes) {
    let iv = sector.data_iv();
    aes_decrypt(key, [0u8; 16], sector.hash_area_mut());
    aes_decrypt(key, iv, sector.payload_mut());
}

#[cfg(test)]
pub(crate) mod tests {
    use rand::{rngs::StdRng, RngCore, SeedableRng};

    use super::*;
    use crate::disc::SECTOR_SIZE;

    pub(crate) const TEST_KEY: KeyBytes =
        [0x00, 0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88, 0x99, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff];

    pub(crate) fn hex20(s: &str) -> HashBytes {
        let mut out = [0u8; 20];
        base16ct::lower::decode(s, &mut out).unwrap();
        out
    }

    pub(crate) fn random_group(seed: u64) -> SectorGroup {
        let mut rng = StdRng::seed_from_u64(seed);
        let mut group = SectorGroup::new();
        for sector in group.sectors_mut() {
            rng.fill_bytes(sector.payload_mut());
        }
        group
    }

    #[test]
    fn zero_group_golden_tree() {
        let mut group = SectorGroup::new();
        let h3 = build_group(&mut group, None);
        let sector = &group.sectors()[0];
        assert_eq!(sector.h0()[0], hex20("60cacbf3d72e1e7834203da608037b1bf83b40e8"));
        assert_eq!(sector.h1_table()[0], hex20("269462c3c085ad493d26ca70a00cb7268c7ba04c"));
        assert_eq!(sector.h2_table()[0], hex20("9e69b0ac677295a0b45714dd84d5fd4d24639366"));
        assert_eq!(h3, hex20("bc0d5a473154064e3b330dc1a5265d8a677058bb"));
        assert_eq!(
            hash_bytes(sector.hash_area()),
            hex20("ec3ab530a9c3e9c271461a05e31a9b0c79005de3")
        );
    }

    #[test]
    fn zero_group_golden_ciphertext() {
        let key = PartitionKey { key: TEST_KEY, is_encrypted: true };
        let mut group = SectorGroup::new();
        let h3 = build_group(&mut group, Some(&key));
        assert_eq!(h3, hex20("bc0d5a473154064e3b330dc1a5265d8a677058bb"));
        let bytes = group.as_bytes();
        assert_eq!(
            &bytes[..16],
            &[
                0xc6, 0xdf, 0xb0, 0xf7, 0x11, 0x7b, 0xc0, 0x89, 0x4f, 0xb1, 0xba, 0x87, 0x71,
                0xc7, 0x2b, 0x8d
            ]
        );
        assert_eq!(
            hash_bytes(&bytes[..SECTOR_SIZE]),
            hex20("66a156a6cd0dd48ad83cf53c6061140d247c20e6")
        );
        assert_eq!(hash_bytes(bytes), hex20("b9a54753b9e5a2d4a60c9870a0490cfb4d1c2d01"));
    }

    #[test]
    fn replication_invariants_hold() {
        let mut group = random_group(1);
        build_group(&mut group, None);
        let first = &group.sectors()[0];
        for (idx, sector) in group.sectors().iter().enumerate() {
            assert_eq!(sector.h2_bytes(), first.h2_bytes(), "H2 differs at sector {}", idx);
            let subgroup_first = &group.sectors()[(idx / 8) * 8];
            assert_eq!(sector.h1_bytes(), subgroup_first.h1_bytes(), "H1 differs at sector {}", idx);
        }
    }

    #[test]
    fn h0_covers_each_sub_block() {
        let mut group = random_group(2);
        build_group(&mut group, None);
        let sector = &group.sectors()[37];
        for idx in 0..31 {
            assert_eq!(sector.h0()[idx], hash_bytes(sector.sub_block(idx)));
        }
    }

    #[test]
    fn encryption_round_trips_per_sector() {
        let key = PartitionKey { key: TEST_KEY, is_encrypted: true };
        let mut group = random_group(3);
        build_group(&mut group, Some(&key));
        let ciphertext = group.as_bytes().to_vec();

        // Decrypt, then re-encrypt: must reproduce the ciphertext exactly.
        for sector in group.sectors_mut() {
            decrypt_sector(sector, &key.key);
        }
        for (idx, sector) in group.sectors().iter().enumerate() {
            assert_eq!(sector.h0()[0], hash_bytes(sector.sub_block(0)), "sector {}", idx);
        }
        for sector in group.sectors_mut() {
            encrypt_sector(sector, &key.key);
        }
        assert_eq!(group.as_bytes(), ciphertext.as_slice());
    }
}
