//! Utilities for reading the PostgreSQL on-disk and on-wire formats that the
//! rewind tool has to understand: the control file, relation file naming, WAL
//! segment naming and the WAL record stream itself.
//!
//! Many of the functions and constants here have been copied from PostgreSQL,
//! and keep the names of their server counterparts instead of following the
//! usual Rust naming conventions.

pub mod controlfile_utils;
pub mod pg_constants;
pub mod relfile_utils;
#[cfg(any(test, feature = "testing"))]
pub mod wal_generator;
pub mod waldecoder;
pub mod xlog_utils;

pub use controlfile_utils::{CheckPoint, ControlFileData, DBState};
pub use relfile_utils::RelTag;

pub type Oid = u32;
pub type TransactionId = u32;
pub type BlockNumber = u32;
pub type TimeLineID = u32;
pub type XLogSegNo = u64;

/// Size of a relation data page.
pub const BLCKSZ: u16 = 8192;
/// Relation segment size, in pages. A segment file never grows past
/// `RELSEG_SIZE * BLCKSZ` bytes.
pub const RELSEG_SIZE: u32 = 128 * 1024;

/// Size of a WAL page, which is not necessarily the same as the relation
/// page size.
pub const XLOG_BLCKSZ: usize = 8192;
pub const WAL_SEGMENT_SIZE: usize = 16 * 1024 * 1024;
