//! Constants lifted from the PostgreSQL headers. Only the ones the rewind
//! tool actually looks at; the server has many more.

/// The default tablespace, `base/`.
pub const DEFAULTTABLESPACE_OID: u32 = 1663;
/// The tablespace of shared catalogs, `global/`.
pub const GLOBALTABLESPACE_OID: u32 = 1664;

/// Directory inside a non-default tablespace that holds the per-database
/// subdirectories. Depends on the server build.
pub const TABLESPACE_VERSION_DIRECTORY: &str = "PG_14_202107181";

/// Name of the WAL directory inside a data directory, and prefix of
/// temporary files and directories.
pub const XLOG_DIR: &str = "pg_xlog";
pub const PG_TEMP_FILES_DIR: &str = "pgsql_tmp";

pub const PG_CONTROL_VERSION: u32 = 1300;
pub const CATALOG_VERSION_NO: u32 = 202107181;
pub const PG_DATA_CHECKSUM_VERSION: u32 = 1;

/*
 * WAL page headers
 */
pub const XLOG_PAGE_MAGIC: u16 = 0xD10D;
pub const XLP_FIRST_IS_CONTRECORD: u16 = 0x0001;
pub const XLP_LONG_HEADER: u16 = 0x0002;

/*
 * Resource managers and the xlog rmgr's record types
 */
pub const RM_XLOG_ID: u8 = 0;
pub const XLOG_CHECKPOINT_SHUTDOWN: u8 = 0x00;
pub const XLOG_CHECKPOINT_ONLINE: u8 = 0x10;
pub const XLOG_SWITCH: u8 = 0x40;

/// The rmgr-specific part of `xl_info`; the low nibble is reserved for the
/// WAL machinery itself.
pub const XLR_RMGR_INFO_MASK: u8 = 0xF0;

/*
 * Record block header ids. Ids up to XLR_MAX_BLOCK_ID reference data pages,
 * the values down from 255 introduce other header types.
 */
pub const XLR_MAX_BLOCK_ID: u8 = 32;
pub const XLR_BLOCK_ID_DATA_SHORT: u8 = 255;
pub const XLR_BLOCK_ID_DATA_LONG: u8 = 254;
pub const XLR_BLOCK_ID_ORIGIN: u8 = 253;
pub const XLR_BLOCK_ID_TOPLEVEL_XID: u8 = 252;

pub const BKPBLOCK_FORK_MASK: u8 = 0x0F;
pub const BKPBLOCK_HAS_IMAGE: u8 = 0x10;
pub const BKPBLOCK_HAS_DATA: u8 = 0x20;
pub const BKPBLOCK_WILL_INIT: u8 = 0x40;
pub const BKPBLOCK_SAME_REL: u8 = 0x80;

pub const BKPIMAGE_HAS_HOLE: u8 = 0x01;
pub const BKPIMAGE_APPLY: u8 = 0x02;
/// Any of the per-algorithm compression bits.
pub const BKPIMAGE_COMPRESS_MASK: u8 = 0x1C;
