//!
//! Reading the target cluster's own WAL: enumerating the data pages it
//! changed after the fork point, locating the last common checkpoint to
//! rewind from, and the one-record read used to decide whether a rewind is
//! needed at all.
//!

use std::fs::File;
use std::io::Read;
use std::os::unix::fs::FileExt;

use anyhow::{bail, Context};
use bytes::Bytes;
use camino::Utf8Path;
use tracing::debug;

use postgres_ffi::controlfile_utils::CheckPoint;
use postgres_ffi::pg_constants::{
    RM_XLOG_ID, XLOG_CHECKPOINT_ONLINE, XLOG_CHECKPOINT_SHUTDOWN, XLOG_DIR, XLOG_PAGE_MAGIC,
    XLP_FIRST_IS_CONTRECORD, XLR_RMGR_INFO_MASK,
};
use postgres_ffi::waldecoder::{decode_wal_record, WalDecodeError, WalStreamDecoder};
use postgres_ffi::xlog_utils::{
    XLogFileName, XLogLongPageHeaderData, XLOG_SIZE_OF_XLOG_LONG_PHD, XLOG_SIZE_OF_XLOG_SHORT_PHD,
};
use postgres_ffi::{BlockNumber, RelTag, TimeLineID, XLogSegNo, WAL_SEGMENT_SIZE, XLOG_BLCKSZ};
use utils::lsn::Lsn;

/// Sequential record reader over the WAL segment files of one timeline.
struct WalReader<'a> {
    datadir: &'a Utf8Path,
    tli: TimeLineID,
    decoder: WalStreamDecoder,
    segno: XLogSegNo,
    seg_file: Option<File>,
    seg_offset: usize,
}

impl<'a> WalReader<'a> {
    /// `start` must be the beginning of a record (or of a WAL page).
    fn new(datadir: &'a Utf8Path, tli: TimeLineID, start: Lsn) -> WalReader<'a> {
        WalReader {
            datadir,
            tli,
            decoder: WalStreamDecoder::new(start),
            segno: start.segment_number(WAL_SEGMENT_SIZE),
            seg_file: None,
            seg_offset: start.segment_offset(WAL_SEGMENT_SIZE),
        }
    }

    /// The next record as `(start_lsn, end_lsn, record)`, or `None` at a
    /// clean end of WAL (missing or truncated next segment).
    fn next_record(&mut self) -> anyhow::Result<Option<(Lsn, Lsn, Bytes)>> {
        loop {
            if let Some((end_lsn, rec)) = self.decoder.poll_decode()? {
                return Ok(Some((self.decoder.record_start_lsn(), end_lsn, rec)));
            }
            if !self.feed_more()? {
                return Ok(None);
            }
        }
    }

    /// Feed the decoder from the segment files. Returns false at end of WAL.
    fn feed_more(&mut self) -> anyhow::Result<bool> {
        if self.seg_offset >= WAL_SEGMENT_SIZE {
            self.segno += 1;
            self.seg_offset = 0;
            self.seg_file = None;
        }
        if self.seg_file.is_none() {
            let path = segment_path(self.datadir, self.tli, self.segno);
            match File::open(&path) {
                Ok(file) => self.seg_file = Some(file),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("could not open WAL segment \"{path}\""))
                }
            }
        }

        let file = self.seg_file.as_ref().unwrap();
        let mut buf = [0u8; XLOG_BLCKSZ];
        let n = file
            .read_at(&mut buf, self.seg_offset as u64)
            .with_context(|| {
                format!(
                    "could not read WAL segment \"{}\"",
                    segment_path(self.datadir, self.tli, self.segno)
                )
            })?;
        if n == 0 {
            // truncated segment; nothing more to read
            return Ok(false);
        }
        self.decoder.feed_bytes(&buf[..n]);
        self.seg_offset += n;
        Ok(true)
    }
}

fn segment_path(datadir: &Utf8Path, tli: TimeLineID, segno: XLogSegNo) -> camino::Utf8PathBuf {
    datadir
        .join(XLOG_DIR)
        .join(XLogFileName(tli, segno, WAL_SEGMENT_SIZE))
}

/// Read WAL from `startpoint` on timeline `tli`, reporting every data page
/// referenced by a record to the callback. The scan stops at `endpoint` when
/// given, and otherwise at the end of the readable, valid WAL; the target
/// was shut down cleanly, so whatever follows its last record is not ours to
/// interpret.
pub fn extract_page_map(
    datadir: &Utf8Path,
    startpoint: Lsn,
    tli: TimeLineID,
    endpoint: Option<Lsn>,
    cb: &mut dyn FnMut(RelTag, BlockNumber) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    let mut reader = WalReader::new(datadir, tli, startpoint);
    let mut nrecords = 0u64;
    loop {
        let (start, _end, rec) = match reader.next_record() {
            Ok(Some(rec)) => rec,
            Ok(None) => break,
            Err(e) if e.downcast_ref::<WalDecodeError>().is_some() => {
                debug!("end of target WAL reached: {e:#}");
                break;
            }
            Err(e) => return Err(e),
        };
        if endpoint.is_some_and(|endpoint| start >= endpoint) {
            break;
        }

        let decoded = decode_wal_record(rec)
            .with_context(|| format!("could not decode WAL record at {start}"))?;
        for blk in &decoded.blocks {
            let rel = RelTag {
                forknum: blk.forknum,
                spcnode: blk.rnode_spcnode,
                dbnode: blk.rnode_dbnode,
                relnode: blk.rnode_relnode,
            };
            cb(rel, blk.blkno)?;
        }
        nrecords += 1;
    }
    debug!("extracted page references from {nrecords} WAL records");
    Ok(())
}

/// Find the most recent checkpoint in the WAL that starts before `searchptr`
/// and whose redo pointer is at or before it. Scans one segment at a time,
/// walking backwards; within a segment the records are decoded forward from
/// the segment's first record boundary.
///
/// Returns `(checkpoint_lsn, checkpoint_tli, redo_lsn)`.
pub fn find_last_checkpoint(
    datadir: &Utf8Path,
    searchptr: Lsn,
    tli: TimeLineID,
) -> anyhow::Result<(Lsn, TimeLineID, Lsn)> {
    let mut segno = searchptr.segment_number(WAL_SEGMENT_SIZE);
    loop {
        let start_lsn = first_record_in_segment(datadir, tli, segno).with_context(|| {
            format!("could not find last common checkpoint before {searchptr}")
        })?;

        let mut found = None;
        let mut reader = WalReader::new(datadir, tli, start_lsn);
        loop {
            let (start, _end, rec) = match reader.next_record() {
                Ok(Some(rec)) => rec,
                Ok(None) => break,
                Err(e) if e.downcast_ref::<WalDecodeError>().is_some() => {
                    debug!("checkpoint scan stopped: {e:#}");
                    break;
                }
                Err(e) => return Err(e),
            };
            if start >= searchptr {
                break;
            }

            let decoded = decode_wal_record(rec)
                .with_context(|| format!("could not decode WAL record at {start}"))?;
            if decoded.xl_rmid == RM_XLOG_ID {
                let info = decoded.xl_info & XLR_RMGR_INFO_MASK;
                if info == XLOG_CHECKPOINT_SHUTDOWN || info == XLOG_CHECKPOINT_ONLINE {
                    let chkpt = CheckPoint::decode(decoded.main_data())
                        .with_context(|| format!("invalid checkpoint record at {start}"))?;
                    if chkpt.redo <= searchptr {
                        found = Some((start, chkpt.this_timeline_id, chkpt.redo));
                    }
                }
            }
        }

        if let Some(found) = found {
            return Ok(found);
        }
        if segno == 0 {
            bail!("could not find last common checkpoint before {searchptr}");
        }
        segno -= 1;
    }
}

/// Read the single record beginning at `ptr` and return the position where
/// it ends.
pub fn read_one_record(datadir: &Utf8Path, ptr: Lsn, tli: TimeLineID) -> anyhow::Result<Lsn> {
    let mut reader = WalReader::new(datadir, tli, ptr);
    match reader.next_record() {
        Ok(Some((_start, end, _rec))) => Ok(end),
        Ok(None) => bail!("could not read WAL record at {ptr}: unexpected end of WAL"),
        Err(e) => Err(e).with_context(|| format!("could not read WAL record at {ptr}")),
    }
}

/// LSN of the first record boundary in a segment, skipping the page header
/// and any continuation of a record begun in the previous segment.
fn first_record_in_segment(
    datadir: &Utf8Path,
    tli: TimeLineID,
    segno: XLogSegNo,
) -> anyhow::Result<Lsn> {
    let path = segment_path(datadir, tli, segno);
    let mut file =
        File::open(&path).with_context(|| format!("could not open WAL segment \"{path}\""))?;
    let mut buf = [0u8; XLOG_SIZE_OF_XLOG_LONG_PHD];
    file.read_exact(&mut buf)
        .with_context(|| format!("could not read WAL segment \"{path}\""))?;
    let hdr = XLogLongPageHeaderData::from_bytes(&mut &buf[..]);

    let seg_start = Lsn(segno * WAL_SEGMENT_SIZE as u64);
    if hdr.std.xlp_magic != XLOG_PAGE_MAGIC || hdr.std.xlp_pageaddr != seg_start.0 {
        bail!("\"{path}\" is not a valid WAL segment");
    }

    let mut lsn = seg_start + XLOG_SIZE_OF_XLOG_LONG_PHD as u64;
    if hdr.std.xlp_info & XLP_FIRST_IS_CONTRECORD != 0 {
        // Skip over the continuation, which may span further pages.
        let mut remaining = hdr.std.xlp_rem_len as usize;
        loop {
            let pageleft = XLOG_BLCKSZ - lsn.block_offset(XLOG_BLCKSZ as u64) as usize;
            let n = std::cmp::min(remaining, pageleft);
            lsn += n as u64;
            remaining -= n;
            if remaining == 0 {
                break;
            }
            lsn += XLOG_SIZE_OF_XLOG_SHORT_PHD as u64;
        }
        lsn = lsn.align();
    }
    Ok(lsn)
}

#[cfg(test)]
mod tests {
    use super::*;
    use postgres_ffi::pg_constants;
    use postgres_ffi::wal_generator::WalGenerator;

    fn rel(relnode: u32) -> RelTag {
        RelTag {
            forknum: 0,
            spcnode: pg_constants::DEFAULTTABLESPACE_OID,
            dbnode: 1,
            relnode,
        }
    }

    fn write_wal(datadir: &Utf8Path, tli: TimeLineID, gen: WalGenerator) {
        let wal_dir = datadir.join(XLOG_DIR);
        std::fs::create_dir_all(&wal_dir).unwrap();
        for (segno, bytes) in gen.finish() {
            let path = wal_dir.join(XLogFileName(tli, segno, WAL_SEGMENT_SIZE));
            std::fs::write(path, &bytes).unwrap();
        }
    }

    #[test]
    fn extract_and_find_checkpoint() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut gen = WalGenerator::new(1, 42, 1);

        let chkpt = gen.append_checkpoint(pg_constants::XLOG_CHECKPOINT_SHUTDOWN, None);
        let r1 = gen.append_record(10, 0x00, &[(rel(2001), 0)], b"r1");
        let _r2 = gen.append_record(10, 0x00, &[(rel(2001), 1), (rel(2002), 7)], b"r2");
        let divergence = gen.position();
        let end_chkpt = gen.append_checkpoint(pg_constants::XLOG_CHECKPOINT_SHUTDOWN, None);
        write_wal(dir.path(), 1, gen);

        // the checkpoint at/after the divergence must not be chosen
        let (rec, tli, redo) = find_last_checkpoint(dir.path(), divergence, 1).unwrap();
        assert_eq!((rec, tli, redo), (chkpt, 1, chkpt));
        assert!(end_chkpt >= divergence);

        // page extraction sees the block references of all records
        let mut changes = Vec::new();
        extract_page_map(dir.path(), chkpt, 1, None, &mut |rel, blkno| {
            changes.push((rel.relnode, blkno));
            Ok(())
        })
        .unwrap();
        assert_eq!(changes, vec![(2001, 0), (2001, 1), (2002, 7)]);

        // bounded extraction stops at the endpoint
        let mut changes = Vec::new();
        extract_page_map(dir.path(), chkpt, 1, Some(r1), &mut |rel, blkno| {
            changes.push((rel.relnode, blkno));
            Ok(())
        })
        .unwrap();
        assert!(changes.is_empty());

        // a single record read returns its end position
        let end = read_one_record(dir.path(), r1, 1).unwrap();
        assert!(end > r1);
    }

    #[test]
    fn checkpoint_in_previous_segment() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut gen = WalGenerator::new(1, 42, 1);

        let chkpt = gen.append_checkpoint(pg_constants::XLOG_CHECKPOINT_SHUTDOWN, None);
        // a record crossing into the next segment
        let big = vec![7u8; WAL_SEGMENT_SIZE + XLOG_BLCKSZ];
        gen.append_record(10, 0x00, &[], &big);
        gen.append_record(10, 0x00, &[(rel(2001), 5)], b"tail");
        let searchptr = gen.position();
        write_wal(dir.path(), 1, gen);

        assert_eq!(searchptr.segment_number(WAL_SEGMENT_SIZE), 2);
        let (rec, tli, redo) = find_last_checkpoint(dir.path(), searchptr, 1).unwrap();
        assert_eq!((rec, tli, redo), (chkpt, 1, chkpt));
    }

    #[test]
    fn missing_wal_is_an_error() {
        let dir = camino_tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(XLOG_DIR)).unwrap();

        assert!(read_one_record(dir.path(), Lsn(0x1000028), 1).is_err());
        assert!(find_last_checkpoint(dir.path(), Lsn(0x1000028), 1)
            .unwrap_err()
            .to_string()
            .contains("could not find last common checkpoint"));
    }
}
