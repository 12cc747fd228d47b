#![warn(missing_docs)]
//! Integrity and encryption engine for Wii optical disc partition data.
//!
//! Partition data is organized into 32 KiB sectors, each carrying a 0x400-byte
//! hash area over its 0x7C00-byte payload. Sectors aggregate into 2 MiB groups
//! of 64, bound together by a SHA-1 tree: per-sub-block H0 digests, per-sector
//! H1 digests replicated across each 8-sector subgroup, per-subgroup H2
//! digests replicated across the group, a per-group H3 entry in the
//! partition's H3 table, and an H4 root over that table stored in the title
//! metadata. Sector contents are encrypted with AES-128-CBC under the
//! partition's title key, with the payload IV taken from the encrypted hash
//! area, so ciphertext and tree are mutually binding.
//!
//! The crate covers four concerns:
//! - rebuilding the tree and ciphertext for a group ([`build_group`]);
//! - verifying stored trees and collecting mismatches ([`verify_group`],
//!   [`verify_partition`]);
//! - the exception + segment blob codec used by compressed containers
//!   ([`encode_group`], [`decode_group`]);
//! - streaming decrypted payload through a one-group cache
//!   ([`PartitionStream`]).
//!
//! # Examples
//!
//! Rebuilding a group's hash tree and verifying it:
//!
//! ```
//! use rvl::{build_group, verify_group, SectorGroup, VerifyReport, GROUP_SECTORS};
//!
//! let mut group = SectorGroup::new();
//! group.write_payload(0x1234, b"payload bytes").unwrap();
//! let h3 = build_group(&mut group, None);
//!
//! let mut report = VerifyReport::new(16);
//! verify_group(&mut group, &[true; GROUP_SECTORS], None, 0, &h3, &mut report)
//!     .expect("mismatch budget exceeded");
//! assert!(report.mismatches().is_empty());
//! ```

pub use disc::{
    hashes::{build_group, compute_h0, compute_h1, compute_h2, group_h3, hash_bytes, replicate},
    sector::{Sector, SectorGroup},
    verify::{
        verify_group, verify_h3_table, verify_partition, Mismatch, MismatchKind, VerifyReport,
        VerifyStatus,
    },
    wii::{
        PartitionKey, SignedHeader, Ticket, TicketTimeLimit, Tmd, TmdContent, TmdHeader,
        WiiPartitionHeader, H3_TABLE_SIZE,
    },
    DiscHeader, GROUP_DATA_SIZE, GROUP_SECTORS, GROUP_SIZE, HASHES_SIZE, HASH_SIZE,
    NUM_SUB_BLOCKS, SECTORS_PER_SUBGROUP, SECTOR_DATA_SIZE, SECTOR_SIZE, SUBGROUPS_PER_GROUP,
    SUB_BLOCK_SIZE,
};
pub use io::{
    codec::{decode_group, encode_group, SEGMENT_MERGE_GAP},
    stream::{PartitionInfo, PartitionStream},
    Compression, HashBytes, KeyBytes, SectorIO,
};

mod disc;
mod io;
mod util;

/// Error types for the engine.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An error for disc format related issues.
    #[error("disc format error: {0}")]
    DiscFormat(String),
    /// Verification stopped after collecting this many hash mismatches.
    #[error("hash mismatch limit reached ({0})")]
    HashMismatchLimit(usize),
    /// An operation was cancelled at a group boundary.
    #[error("interrupted")]
    Interrupted,
    /// A group blob uses a compression mode this engine does not decode.
    #[error("unsupported compression: {0}")]
    UnsupportedCompression(Compression),
    /// A general I/O error.
    #[error("I/O error: {0}")]
    Io(String, #[source] std::io::Error),
    /// An unknown error.
    #[error("error: {0}")]
    Other(String),
}

impl From<&str> for Error {
    #[inline]
    fn from(s: &str) -> Error { Error::Other(s.to_string()) }
}

impl From<String> for Error {
    #[inline]
    fn from(s: String) -> Error { Error::Other(s) }
}

/// Helper result type for [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Helper trait for adding context to errors.
pub trait ErrorContext {
    /// Adds context to an error.
    fn context(self, context: impl Into<String>) -> Error;
}

impl ErrorContext for std::io::Error {
    #[inline]
    fn context(self, context: impl Into<String>) -> Error { Error::Io(context.into(), self) }
}

/// Helper trait for adding context to result errors.
pub trait ResultContext<T> {
    /// Adds context to a result error.
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Adds context to a result error using a closure.
    fn with_context<F>(self, f: F) -> Result<T>
    where F: FnOnce() -> String;
}

impl<T, E> ResultContext<T> for Result<T, E>
where E: ErrorContext
{
    #[inline]
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    #[inline]
    fn with_context<F>(self, f: F) -> Result<T>
    where F: FnOnce() -> String {
        self.map_err(|e| e.context(f()))
    }
}
