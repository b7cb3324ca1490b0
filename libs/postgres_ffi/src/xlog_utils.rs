//
// This file contains common utilities for dealing with PostgreSQL WAL files
// and LSNs.
//
// Many of these functions have been copied from PostgreSQL, and rewritten in
// Rust. That's why they don't follow the usual Rust naming conventions, they
// have been named the same as the corresponding PostgreSQL functions instead.
//

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{TimeLineID, XLogSegNo, WAL_SEGMENT_SIZE};

pub const XLOG_FNAME_LEN: usize = 24;

pub const XLOG_SIZE_OF_XLOG_SHORT_PHD: usize = 24;
pub const XLOG_SIZE_OF_XLOG_LONG_PHD: usize = 40;
pub const XLOG_SIZE_OF_XLOG_RECORD: usize = 24;

/// Offset of `xl_crc` within the record header; the CRC covers the record
/// payload followed by the header bytes up to this offset.
pub const XLOG_RECORD_CRC_OFFS: usize = 4 + 4 + 8 + 1 + 1 + 2;

#[allow(non_snake_case)]
pub fn XLogSegmentsPerXLogId(wal_segsz_bytes: usize) -> XLogSegNo {
    (0x100000000u64 / wal_segsz_bytes as u64) as XLogSegNo
}

#[allow(non_snake_case)]
pub fn XLogSegNoOffsetToRecPtr(segno: XLogSegNo, offset: u32, wal_segsz_bytes: usize) -> u64 {
    segno * (wal_segsz_bytes as u64) + (offset as u64)
}

#[allow(non_snake_case)]
pub fn XLogFileName(tli: TimeLineID, log_segno: XLogSegNo, wal_segsz_bytes: usize) -> String {
    format!(
        "{:>08X}{:>08X}{:>08X}",
        tli,
        log_segno / XLogSegmentsPerXLogId(wal_segsz_bytes),
        log_segno % XLogSegmentsPerXLogId(wal_segsz_bytes)
    )
}

#[allow(non_snake_case)]
pub fn IsXLogFileName(fname: &str) -> bool {
    fname.len() == XLOG_FNAME_LEN && fname.chars().all(|c| c.is_ascii_hexdigit())
}

/// Name of the timeline history file of `tli`, relative to the WAL directory.
#[allow(non_snake_case)]
pub fn TLHistoryFileName(tli: TimeLineID) -> String {
    format!("{:>08X}.history", tli)
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XLogPageHeaderData {
    pub xlp_magic: u16,
    pub xlp_info: u16,
    pub xlp_tli: TimeLineID,
    pub xlp_pageaddr: u64,
    /// Bytes of a record continued from the previous page, if
    /// `XLP_FIRST_IS_CONTRECORD` is set.
    pub xlp_rem_len: u32,
}

impl XLogPageHeaderData {
    pub fn from_bytes<B: Buf>(buf: &mut B) -> XLogPageHeaderData {
        let hdr = XLogPageHeaderData {
            xlp_magic: buf.get_u16_le(),
            xlp_info: buf.get_u16_le(),
            xlp_tli: buf.get_u32_le(),
            xlp_pageaddr: buf.get_u64_le(),
            xlp_rem_len: buf.get_u32_le(),
        };
        buf.advance(4); // alignment padding
        hdr
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(XLOG_SIZE_OF_XLOG_SHORT_PHD);
        buf.put_u16_le(self.xlp_magic);
        buf.put_u16_le(self.xlp_info);
        buf.put_u32_le(self.xlp_tli);
        buf.put_u64_le(self.xlp_pageaddr);
        buf.put_u32_le(self.xlp_rem_len);
        buf.put_u32_le(0);
        buf.freeze()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XLogLongPageHeaderData {
    pub std: XLogPageHeaderData,
    pub xlp_sysid: u64,
    pub xlp_seg_size: u32,
    pub xlp_xlog_blcksz: u32,
}

impl XLogLongPageHeaderData {
    pub fn from_bytes<B: Buf>(buf: &mut B) -> XLogLongPageHeaderData {
        XLogLongPageHeaderData {
            std: XLogPageHeaderData::from_bytes(buf),
            xlp_sysid: buf.get_u64_le(),
            xlp_seg_size: buf.get_u32_le(),
            xlp_xlog_blcksz: buf.get_u32_le(),
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(XLOG_SIZE_OF_XLOG_LONG_PHD);
        buf.extend_from_slice(&self.std.encode());
        buf.put_u64_le(self.xlp_sysid);
        buf.put_u32_le(self.xlp_seg_size);
        buf.put_u32_le(self.xlp_xlog_blcksz);
        buf.freeze()
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XLogRecord {
    pub xl_tot_len: u32,
    pub xl_xid: u32,
    pub xl_prev: u64,
    pub xl_info: u8,
    pub xl_rmid: u8,
    pub xl_crc: u32,
}

impl XLogRecord {
    pub fn from_bytes<B: Buf>(buf: &mut B) -> XLogRecord {
        XLogRecord {
            xl_tot_len: buf.get_u32_le(),
            xl_xid: buf.get_u32_le(),
            xl_prev: buf.get_u64_le(),
            xl_info: buf.get_u8(),
            xl_rmid: buf.get_u8(),
            xl_crc: {
                buf.advance(2); // alignment padding
                buf.get_u32_le()
            },
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(XLOG_SIZE_OF_XLOG_RECORD);
        buf.put_u32_le(self.xl_tot_len);
        buf.put_u32_le(self.xl_xid);
        buf.put_u64_le(self.xl_prev);
        buf.put_u8(self.xl_info);
        buf.put_u8(self.xl_rmid);
        buf.put_u16_le(0);
        buf.put_u32_le(self.xl_crc);
        buf.freeze()
    }

    // Is this record an XLOG_SWITCH record? They need some special processing.
    pub fn is_xlog_switch_record(&self) -> bool {
        self.xl_info == crate::pg_constants::XLOG_SWITCH
            && self.xl_rmid == crate::pg_constants::RM_XLOG_ID
    }
}

/// Name of the WAL segment file holding `lsn` on timeline `tli`, with the
/// default segment size.
pub fn wal_file_name(tli: TimeLineID, lsn: utils::lsn::Lsn) -> String {
    XLogFileName(tli, lsn.segment_number(WAL_SEGMENT_SIZE), WAL_SEGMENT_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xlog_file_name() {
        assert_eq!(
            XLogFileName(1, 1, WAL_SEGMENT_SIZE),
            "000000010000000000000001"
        );
        // 256 segments of 16MB per logical xlog id
        assert_eq!(
            XLogFileName(3, 259, WAL_SEGMENT_SIZE),
            "000000030000000100000003"
        );
        assert_eq!(
            XLogSegNoOffsetToRecPtr(259, 0x10, WAL_SEGMENT_SIZE),
            0x0000000103000010
        );
        assert!(IsXLogFileName("000000010000000000000001"));
        assert!(!IsXLogFileName("00000001000000000000000"));
        assert!(!IsXLogFileName("00000001000000000000000g"));
    }

    #[test]
    fn test_history_file_name() {
        assert_eq!(TLHistoryFileName(2), "00000002.history");
        assert_eq!(TLHistoryFileName(0x1F), "0000001F.history");
    }

    #[test]
    fn test_record_header_roundtrip() {
        let rec = XLogRecord {
            xl_tot_len: 66,
            xl_xid: 7,
            xl_prev: 0x0000000001000028,
            xl_info: 0x10,
            xl_rmid: 10,
            xl_crc: 0xCAFEBABE,
        };
        let buf = rec.encode();
        assert_eq!(buf.len(), XLOG_SIZE_OF_XLOG_RECORD);
        assert_eq!(XLogRecord::from_bytes(&mut buf.clone()), rec);
    }
}
