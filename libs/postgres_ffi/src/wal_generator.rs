//! Synthetic WAL for tests.
//!
//! [`WalGenerator`] lays out CRC-valid records into properly page-headered
//! segment images, so that the decoding side can be exercised without a
//! running server. Only available in test builds (`testing` feature).

use std::cmp::min;

use bytes::{BufMut, Bytes, BytesMut};
use crc32c::crc32c_append;

use crate::controlfile_utils::CheckPoint;
use crate::pg_constants;
use crate::xlog_utils::{
    XLogLongPageHeaderData, XLogPageHeaderData, XLogRecord, XLOG_RECORD_CRC_OFFS,
    XLOG_SIZE_OF_XLOG_LONG_PHD, XLOG_SIZE_OF_XLOG_SHORT_PHD, XLOG_SIZE_OF_XLOG_RECORD,
};
use crate::{BlockNumber, RelTag, TimeLineID, XLogSegNo, WAL_SEGMENT_SIZE, XLOG_BLCKSZ};
use utils::lsn::Lsn;

/// Assemble one record: header, block references without payload, main data.
pub fn build_record(
    xl_prev: Lsn,
    xl_xid: u32,
    xl_rmid: u8,
    xl_info: u8,
    blocks: &[(RelTag, BlockNumber)],
    main_data: &[u8],
) -> Bytes {
    let mut body = BytesMut::new();
    for (i, (rel, blkno)) in blocks.iter().enumerate() {
        assert!(i as u8 <= pg_constants::XLR_MAX_BLOCK_ID);
        body.put_u8(i as u8);
        body.put_u8(rel.forknum); // no image, no data
        body.put_u16_le(0);
        body.put_u32_le(rel.spcnode);
        body.put_u32_le(rel.dbnode);
        body.put_u32_le(rel.relnode);
        body.put_u32_le(*blkno);
    }
    if !main_data.is_empty() {
        if main_data.len() <= u8::MAX as usize {
            body.put_u8(pg_constants::XLR_BLOCK_ID_DATA_SHORT);
            body.put_u8(main_data.len() as u8);
        } else {
            body.put_u8(pg_constants::XLR_BLOCK_ID_DATA_LONG);
            body.put_u32_le(main_data.len() as u32);
        }
    }

    let xl_tot_len = XLOG_SIZE_OF_XLOG_RECORD + body.len() + main_data.len();
    let mut hdr = XLogRecord {
        xl_tot_len: xl_tot_len as u32,
        xl_xid,
        xl_prev: xl_prev.0,
        xl_info,
        xl_rmid,
        xl_crc: 0,
    };

    let mut crc = 0u32;
    crc = crc32c_append(crc, &body);
    crc = crc32c_append(crc, main_data);
    crc = crc32c_append(crc, &hdr.encode()[0..XLOG_RECORD_CRC_OFFS]);
    hdr.xl_crc = crc;

    let mut rec = BytesMut::with_capacity(xl_tot_len);
    rec.extend_from_slice(&hdr.encode());
    rec.extend_from_slice(&body);
    rec.extend_from_slice(main_data);
    rec.freeze()
}

/// Builds a contiguous stretch of WAL, starting at a segment boundary.
pub struct WalGenerator {
    tli: TimeLineID,
    sysid: u64,
    start_segno: XLogSegNo,
    buf: BytesMut,
    lsn: Lsn,
    prev_lsn: Lsn,
    last_record_end: Lsn,
}

impl WalGenerator {
    pub fn new(tli: TimeLineID, sysid: u64, start_segno: XLogSegNo) -> WalGenerator {
        let lsn = Lsn(start_segno * WAL_SEGMENT_SIZE as u64);
        WalGenerator {
            tli,
            sysid,
            start_segno,
            buf: BytesMut::new(),
            lsn,
            prev_lsn: Lsn::INVALID,
            last_record_end: Lsn::INVALID,
        }
    }

    /// End of the last appended record's content, before alignment padding.
    /// This is what the decoder reports as the record's end LSN.
    pub fn end_of_last_record(&self) -> Lsn {
        self.last_record_end
    }

    /// Where the next appended record will start.
    pub fn position(&self) -> Lsn {
        if self.lsn.segment_offset(WAL_SEGMENT_SIZE) == 0 {
            self.lsn + XLOG_SIZE_OF_XLOG_LONG_PHD as u64
        } else if self.lsn.block_offset(XLOG_BLCKSZ as u64) == 0 {
            self.lsn + XLOG_SIZE_OF_XLOG_SHORT_PHD as u64
        } else {
            self.lsn
        }
    }

    /// Append a record with the given block references (payload-free) and
    /// main data. Returns the record's start LSN.
    pub fn append_record(
        &mut self,
        xl_rmid: u8,
        xl_info: u8,
        blocks: &[(RelTag, BlockNumber)],
        main_data: &[u8],
    ) -> Lsn {
        let rec = build_record(self.prev_lsn, 0, xl_rmid, xl_info, blocks, main_data);
        let start = self.append_raw(&rec);
        self.prev_lsn = start;
        start
    }

    /// Append a checkpoint record. The redo pointer defaults to the record's
    /// own location, as the server does for a shutdown checkpoint.
    pub fn append_checkpoint(&mut self, xl_info: u8, redo: Option<Lsn>) -> Lsn {
        let start = self.position();
        let body = CheckPoint {
            redo: redo.unwrap_or(start),
            this_timeline_id: self.tli,
        }
        .encode();
        self.append_record(pg_constants::RM_XLOG_ID, xl_info, &[], &body)
    }

    /// Pad the last segment with zeros and return the finished segment
    /// images, in order.
    pub fn finish(mut self) -> Vec<(XLogSegNo, Bytes)> {
        let seg_off = self.lsn.segment_offset(WAL_SEGMENT_SIZE);
        if seg_off != 0 {
            self.buf.put_bytes(0, WAL_SEGMENT_SIZE - seg_off);
        }
        let bytes = self.buf.freeze();
        bytes
            .chunks(WAL_SEGMENT_SIZE)
            .enumerate()
            .map(|(i, chunk)| (self.start_segno + i as u64, Bytes::copy_from_slice(chunk)))
            .collect()
    }

    fn append_raw(&mut self, rec: &[u8]) -> Lsn {
        let mut written = 0usize;
        let mut start = None;
        while written < rec.len() {
            if self.lsn.block_offset(XLOG_BLCKSZ as u64) == 0 {
                let cont = if written > 0 { rec.len() - written } else { 0 };
                self.push_page_header(cont);
                continue;
            }
            if start.is_none() {
                start = Some(self.lsn);
            }
            let pageleft = XLOG_BLCKSZ - self.lsn.block_offset(XLOG_BLCKSZ as u64) as usize;
            let n = min(pageleft, rec.len() - written);
            self.buf.extend_from_slice(&rec[written..written + n]);
            self.lsn += n as u64;
            written += n;
        }
        self.last_record_end = self.lsn;
        let pad = (self.lsn.align().0 - self.lsn.0) as usize;
        self.buf.put_bytes(0, pad);
        self.lsn += pad as u64;
        start.expect("empty record")
    }

    fn push_page_header(&mut self, cont_remaining: usize) {
        let long = self.lsn.segment_offset(WAL_SEGMENT_SIZE) == 0;
        let mut xlp_info = 0u16;
        if cont_remaining > 0 {
            xlp_info |= pg_constants::XLP_FIRST_IS_CONTRECORD;
        }
        if long {
            xlp_info |= pg_constants::XLP_LONG_HEADER;
        }
        let std = XLogPageHeaderData {
            xlp_magic: pg_constants::XLOG_PAGE_MAGIC,
            xlp_info,
            xlp_tli: self.tli,
            xlp_pageaddr: self.lsn.0,
            xlp_rem_len: cont_remaining as u32,
        };
        if long {
            let hdr = XLogLongPageHeaderData {
                std,
                xlp_sysid: self.sysid,
                xlp_seg_size: WAL_SEGMENT_SIZE as u32,
                xlp_xlog_blcksz: XLOG_BLCKSZ as u32,
            };
            self.buf.extend_from_slice(&hdr.encode());
            self.lsn += XLOG_SIZE_OF_XLOG_LONG_PHD as u64;
        } else {
            self.buf.extend_from_slice(&std.encode());
            self.lsn += XLOG_SIZE_OF_XLOG_SHORT_PHD as u64;
        }
    }
}
