//!
//! Basic WAL stream decoding.
//!
//! [`WalStreamDecoder`] is fed raw WAL bytes and reassembles whole records,
//! walking and validating the page headers in between and checking each
//! record's CRC. [`decode_wal_record`] then takes a complete record apart far
//! enough to enumerate the data pages it references, which is all the rewind
//! planner needs to know about a record.
//!
use std::cmp::min;

use anyhow::{bail, ensure};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc32c::crc32c_append;

use crate::pg_constants;
use crate::relfile_utils::INIT_FORKNUM;
use crate::xlog_utils::{
    XLogPageHeaderData, XLogRecord, XLOG_RECORD_CRC_OFFS, XLOG_SIZE_OF_XLOG_LONG_PHD,
    XLOG_SIZE_OF_XLOG_RECORD, XLOG_SIZE_OF_XLOG_SHORT_PHD,
};
use crate::{BlockNumber, Oid, WAL_SEGMENT_SIZE, XLOG_BLCKSZ};
use utils::lsn::Lsn;

pub struct WalStreamDecoder {
    lsn: Lsn,

    startlsn: Lsn, // LSN where this record starts
    contlen: usize,
    padlen: usize,

    inputbuf: BytesMut,
    recordbuf: BytesMut,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("{msg} at {lsn}")]
pub struct WalDecodeError {
    pub msg: String,
    pub lsn: Lsn,
}

impl WalStreamDecoder {
    /// Create a new decoder. The stream must be fed starting at `lsn`, which
    /// has to be the beginning of a record (or of a WAL page).
    pub fn new(lsn: Lsn) -> WalStreamDecoder {
        WalStreamDecoder {
            lsn,
            startlsn: Lsn(0),
            contlen: 0,
            padlen: 0,
            inputbuf: BytesMut::new(),
            recordbuf: BytesMut::new(),
        }
    }

    /// The LSN one past the last byte fed to the decoder so far.
    pub fn available(&self) -> Lsn {
        self.lsn + self.inputbuf.remaining() as u64
    }

    /// Start LSN of the most recently decoded record.
    pub fn record_start_lsn(&self) -> Lsn {
        self.startlsn
    }

    pub fn feed_bytes(&mut self, buf: &[u8]) {
        self.inputbuf.extend_from_slice(buf);
    }

    /// Attempt to decode another record from the input that has been fed to
    /// the decoder so far.
    ///
    /// Returns one of the following:
    ///     Ok(None): there is not enough data in the input buffer. Feed more
    ///         and try again.
    ///     Ok(Some((end_lsn, record))): a whole record, including its header,
    ///         with `end_lsn` pointing just past it.
    ///     Err(err): the data stream is invalid at the current position.
    pub fn poll_decode(&mut self) -> Result<Option<(Lsn, Bytes)>, WalDecodeError> {
        loop {
            // parse and verify page boundaries as we go
            if self.lsn.segment_offset(WAL_SEGMENT_SIZE) == 0 {
                if self.inputbuf.remaining() < XLOG_SIZE_OF_XLOG_LONG_PHD {
                    return Ok(None);
                }
                let hdr = XLogPageHeaderData::from_bytes(&mut self.inputbuf);
                self.validate_page_header(&hdr)?;
                // The rest of the long header (system id, segment size, WAL
                // block size) describes the stream, not our position in it.
                self.inputbuf
                    .advance(XLOG_SIZE_OF_XLOG_LONG_PHD - XLOG_SIZE_OF_XLOG_SHORT_PHD);
                self.lsn += XLOG_SIZE_OF_XLOG_LONG_PHD as u64;
                continue;
            } else if self.lsn.block_offset(XLOG_BLCKSZ as u64) == 0 {
                if self.inputbuf.remaining() < XLOG_SIZE_OF_XLOG_SHORT_PHD {
                    return Ok(None);
                }
                let hdr = XLogPageHeaderData::from_bytes(&mut self.inputbuf);
                self.validate_page_header(&hdr)?;
                self.lsn += XLOG_SIZE_OF_XLOG_SHORT_PHD as u64;
                continue;
            }

            if self.padlen > 0 {
                // skip padding to an 8-byte boundary
                let n = min(self.padlen, self.inputbuf.remaining());
                if n == 0 {
                    return Ok(None);
                }
                self.inputbuf.advance(n);
                self.lsn += n as u64;
                self.padlen -= n;
            } else if self.contlen == 0 {
                // need to have at least the xl_tot_len field; it never crosses
                // a page boundary because records are 8-byte aligned
                if self.inputbuf.remaining() < 4 {
                    return Ok(None);
                }

                // peek xl_tot_len at the beginning of the record
                let xl_tot_len = self.inputbuf.get_u32_le() as usize;
                if xl_tot_len < XLOG_SIZE_OF_XLOG_RECORD {
                    return Err(WalDecodeError {
                        msg: format!("invalid xl_tot_len {xl_tot_len}"),
                        lsn: self.lsn,
                    });
                }
                self.startlsn = self.lsn;
                self.lsn += 4;

                self.recordbuf.clear();
                self.recordbuf.reserve(xl_tot_len);
                self.recordbuf.put_u32_le(xl_tot_len as u32);

                self.contlen = xl_tot_len - 4;
            } else {
                // we're continuing a record, possibly from a previous page
                let pageleft = XLOG_BLCKSZ - self.lsn.block_offset(XLOG_BLCKSZ as u64) as usize;

                // read the rest of the record, or as much as fits on this page
                let n = min(min(self.contlen, pageleft), self.inputbuf.remaining());
                if n == 0 {
                    return Ok(None);
                }

                self.recordbuf.put(self.inputbuf.split_to(n));
                self.lsn += n as u64;
                self.contlen -= n;

                if self.contlen == 0 {
                    let recordbuf = std::mem::take(&mut self.recordbuf).freeze();

                    // XLOG_SWITCH records are special. If we see one, we need
                    // to skip to the next WAL segment.
                    let xlogswitch = {
                        let mut hdrbuf = recordbuf.clone();
                        XLogRecord::from_bytes(&mut hdrbuf).is_xlog_switch_record()
                    };

                    let mut crc = 0u32;
                    crc = crc32c_append(crc, &recordbuf[XLOG_SIZE_OF_XLOG_RECORD..]);
                    crc = crc32c_append(crc, &recordbuf[0..XLOG_RECORD_CRC_OFFS]);
                    let wal_crc = LittleEndian::read_u32(
                        &recordbuf[XLOG_RECORD_CRC_OFFS..XLOG_RECORD_CRC_OFFS + 4],
                    );
                    if crc != wal_crc {
                        return Err(WalDecodeError {
                            msg: format!("WAL record crc mismatch: {crc:08X} vs {wal_crc:08X}"),
                            lsn: self.startlsn,
                        });
                    }

                    if xlogswitch {
                        // everything up to the next segment boundary is padding
                        log::trace!("XLOG_SWITCH record at {}", self.startlsn);
                        let seg_off = self.lsn.segment_offset(WAL_SEGMENT_SIZE);
                        self.padlen = if seg_off == 0 {
                            0
                        } else {
                            WAL_SEGMENT_SIZE - seg_off
                        };
                    } else {
                        self.padlen = (self.lsn.align().0 - self.lsn.0) as usize;
                    }

                    return Ok(Some((self.lsn, recordbuf)));
                }
            }
        }
    }

    fn validate_page_header(&self, hdr: &XLogPageHeaderData) -> Result<(), WalDecodeError> {
        if hdr.xlp_magic != pg_constants::XLOG_PAGE_MAGIC {
            return Err(WalDecodeError {
                msg: format!("invalid xlog page header magic {:04X}", hdr.xlp_magic),
                lsn: self.lsn,
            });
        }
        if hdr.xlp_pageaddr != self.lsn.0 {
            return Err(WalDecodeError {
                msg: format!(
                    "invalid xlog page header pageaddr {}, expected {}",
                    Lsn(hdr.xlp_pageaddr),
                    self.lsn
                ),
                lsn: self.lsn,
            });
        }
        let contrecord = hdr.xlp_info & pg_constants::XLP_FIRST_IS_CONTRECORD != 0;
        if self.contlen == 0 && contrecord {
            return Err(WalDecodeError {
                msg: "unexpected XLP_FIRST_IS_CONTRECORD".into(),
                lsn: self.lsn,
            });
        }
        if self.contlen != 0 {
            if !contrecord {
                return Err(WalDecodeError {
                    msg: "XLP_FIRST_IS_CONTRECORD flag missing in page header".into(),
                    lsn: self.lsn,
                });
            }
            if hdr.xlp_rem_len as usize != self.contlen {
                return Err(WalDecodeError {
                    msg: format!(
                        "unexpected xlp_rem_len {}, expected {}",
                        hdr.xlp_rem_len, self.contlen
                    ),
                    lsn: self.lsn,
                });
            }
        }
        Ok(())
    }
}

/// Reference to one data page, decoded from a record's block headers.
#[derive(Debug, Clone, Copy)]
pub struct DecodedBkpBlock {
    pub rnode_spcnode: Oid,
    pub rnode_dbnode: Oid,
    pub rnode_relnode: Oid,
    pub forknum: u8,
    pub blkno: BlockNumber,

    pub has_image: bool,
    pub has_data: bool,
    pub will_init: bool,
}

#[derive(Debug)]
pub struct DecodedWALRecord {
    pub xl_xid: u32,
    pub xl_info: u8,
    pub xl_rmid: u8,
    pub xl_prev: Lsn,

    pub blocks: Vec<DecodedBkpBlock>,
    main_data_offset: usize,
    main_data_len: usize,
    record: Bytes,
}

impl DecodedWALRecord {
    /// The rmgr-specific payload at the end of the record.
    pub fn main_data(&self) -> &[u8] {
        &self.record[self.main_data_offset..self.main_data_offset + self.main_data_len]
    }
}

fn need<B: Buf>(buf: &B, n: usize) -> anyhow::Result<()> {
    ensure!(
        buf.remaining() >= n,
        "WAL record too short for its block headers"
    );
    Ok(())
}

/// Take a whole record (as returned by [`WalStreamDecoder`]) apart into its
/// header fields and block references. Block images and per-block data are
/// not materialized, only accounted for; the main data payload stays
/// addressable through the returned struct.
pub fn decode_wal_record(record: Bytes) -> anyhow::Result<DecodedWALRecord> {
    let mut buf = record.clone();

    ensure!(buf.remaining() >= XLOG_SIZE_OF_XLOG_RECORD, "record too short");
    let xlogrec = XLogRecord::from_bytes(&mut buf);
    ensure!(
        xlogrec.xl_tot_len as usize == record.len(),
        "xl_tot_len {} does not match record length {}",
        xlogrec.xl_tot_len,
        record.len()
    );

    // Decode the headers: a sequence of block references followed (in header
    // position, not payload position) by the main-data length marker.
    let mut rnode: Option<(Oid, Oid, Oid)> = None;
    let mut blocks: Vec<DecodedBkpBlock> = Vec::new();
    let mut main_data_len: usize = 0;
    let mut datatotal: usize = 0;
    while buf.remaining() > datatotal {
        let block_id = buf.get_u8();

        match block_id {
            pg_constants::XLR_BLOCK_ID_DATA_SHORT => {
                need(&buf, 1)?;
                main_data_len = buf.get_u8() as usize;
                datatotal += main_data_len;
            }

            pg_constants::XLR_BLOCK_ID_DATA_LONG => {
                need(&buf, 4)?;
                main_data_len = buf.get_u32_le() as usize;
                datatotal += main_data_len;
            }

            pg_constants::XLR_BLOCK_ID_ORIGIN => {
                need(&buf, 2)?;
                buf.advance(2);
            }

            pg_constants::XLR_BLOCK_ID_TOPLEVEL_XID => {
                need(&buf, 4)?;
                buf.advance(4);
            }

            0..=pg_constants::XLR_MAX_BLOCK_ID => {
                /* XLogRecordBlockHeader */
                need(&buf, 3)?;
                let fork_flags = buf.get_u8();
                let forknum = fork_flags & pg_constants::BKPBLOCK_FORK_MASK;
                ensure!(forknum <= INIT_FORKNUM, "invalid fork number {forknum}");
                let has_image = fork_flags & pg_constants::BKPBLOCK_HAS_IMAGE != 0;
                let has_data = fork_flags & pg_constants::BKPBLOCK_HAS_DATA != 0;
                let will_init = fork_flags & pg_constants::BKPBLOCK_WILL_INIT != 0;

                let data_len = buf.get_u16_le() as usize;
                ensure!(
                    has_data == (data_len != 0),
                    "BKPBLOCK_HAS_DATA flag inconsistent with block data length {data_len}"
                );
                datatotal += data_len;

                if has_image {
                    /* XLogRecordBlockImageHeader */
                    need(&buf, 5)?;
                    let bimg_len = buf.get_u16_le() as usize;
                    let _hole_offset = buf.get_u16_le();
                    let bimg_info = buf.get_u8();
                    ensure!(
                        bimg_info & pg_constants::BKPIMAGE_COMPRESS_MASK == 0,
                        "compressed page images are not supported"
                    );
                    datatotal += bimg_len;
                }

                if fork_flags & pg_constants::BKPBLOCK_SAME_REL == 0 {
                    need(&buf, 12)?;
                    rnode = Some((buf.get_u32_le(), buf.get_u32_le(), buf.get_u32_le()));
                } else if rnode.is_none() {
                    bail!("BKPBLOCK_SAME_REL set but no previous rel");
                }
                need(&buf, 4)?;
                let blkno = buf.get_u32_le();

                let (rnode_spcnode, rnode_dbnode, rnode_relnode) = rnode.unwrap();
                blocks.push(DecodedBkpBlock {
                    rnode_spcnode,
                    rnode_dbnode,
                    rnode_relnode,
                    forknum,
                    blkno,
                    has_image,
                    has_data,
                    will_init,
                });
            }

            _ => bail!("invalid block_id {block_id} in WAL record"),
        }
    }
    ensure!(
        buf.remaining() == datatotal,
        "WAL record headers inconsistent with record length"
    );

    // The main data is the last payload in the record.
    let main_data_offset = record.len() - main_data_len;

    Ok(DecodedWALRecord {
        xl_xid: xlogrec.xl_xid,
        xl_info: xlogrec.xl_info,
        xl_rmid: xlogrec.xl_rmid,
        xl_prev: Lsn(xlogrec.xl_prev),
        blocks,
        main_data_offset,
        main_data_len,
        record,
    })
}
