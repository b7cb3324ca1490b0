//! Decode the `global/pg_control` artifact.
//!
//! The control file is a fixed-size blob; the interesting fields sit at fixed
//! little-endian offsets at the front and the rest is zero padding. The layout
//! here must match the server build the tool is used against.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::TimeLineID;
use utils::lsn::Lsn;

/// Total size of the control file on disk. A blob of any other size is not a
/// control file of a compatible server.
pub const PG_CONTROL_FILE_SIZE: usize = 8192;

/// Size of the portion of the file that carries data, including the CRC.
const PG_CONTROL_DATA_SIZE: usize = 60;

#[derive(Debug, thiserror::Error)]
pub enum ControlFileError {
    #[error("unexpected control file size {actual}, expected {PG_CONTROL_FILE_SIZE}")]
    WrongSize { actual: usize },
    #[error("unrecognized cluster state {value} in control file")]
    InvalidState { value: u32 },
}

/// Database cluster state, as recorded by the server at its last state
/// transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DBState {
    StartingUp = 0,
    Shutdowned = 1,
    ShutdownedInRecovery = 2,
    ShuttingDown = 3,
    InCrashRecovery = 4,
    InArchiveRecovery = 5,
    InProduction = 6,
}

impl TryFrom<u32> for DBState {
    type Error = ControlFileError;

    fn try_from(value: u32) -> Result<Self, ControlFileError> {
        match value {
            0 => Ok(DBState::StartingUp),
            1 => Ok(DBState::Shutdowned),
            2 => Ok(DBState::ShutdownedInRecovery),
            3 => Ok(DBState::ShuttingDown),
            4 => Ok(DBState::InCrashRecovery),
            5 => Ok(DBState::InArchiveRecovery),
            6 => Ok(DBState::InProduction),
            value => Err(ControlFileError::InvalidState { value }),
        }
    }
}

/// Body of a checkpoint WAL record, also stored in the control file as a copy
/// of the last checkpoint's body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CheckPoint {
    /// Where WAL replay must begin to restore a consistent state.
    pub redo: Lsn,
    pub this_timeline_id: TimeLineID,
}

/// Encoded size, with trailing alignment padding.
pub const SIZEOF_CHECKPOINT: usize = 16;

impl CheckPoint {
    pub fn decode(buf: &[u8]) -> anyhow::Result<CheckPoint> {
        anyhow::ensure!(
            buf.len() >= SIZEOF_CHECKPOINT,
            "checkpoint body too short: {} bytes",
            buf.len()
        );
        let mut buf = buf;
        let redo = Lsn(buf.get_u64_le());
        let this_timeline_id = buf.get_u32_le();
        Ok(CheckPoint {
            redo,
            this_timeline_id,
        })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SIZEOF_CHECKPOINT);
        buf.put_u64_le(self.redo.0);
        buf.put_u32_le(self.this_timeline_id);
        buf.put_u32_le(0); // alignment padding
        buf.freeze()
    }
}

/// The decoded control file fields. Read-only snapshot, digested once per
/// cluster per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlFileData {
    pub system_identifier: u64,
    pub pg_control_version: u32,
    pub catalog_version_no: u32,
    pub state: DBState,
    /// Location of the last checkpoint record.
    pub checkpoint: Lsn,
    /// Copy of the last checkpoint record's body.
    pub checkpoint_copy: CheckPoint,
    pub data_checksum_version: u32,
    pub wal_log_hints: bool,
    /// CRC of the data portion. Decoded but not verified here.
    pub crc: u32,
}

impl ControlFileData {
    /// Decode a control file blob. The size must match exactly; everything
    /// else about the contents is taken on faith (the CRC is not checked).
    pub fn decode(buf: &[u8]) -> Result<ControlFileData, ControlFileError> {
        if buf.len() != PG_CONTROL_FILE_SIZE {
            return Err(ControlFileError::WrongSize { actual: buf.len() });
        }

        let mut buf = buf;
        let system_identifier = buf.get_u64_le();
        let pg_control_version = buf.get_u32_le();
        let catalog_version_no = buf.get_u32_le();
        let state = DBState::try_from(buf.get_u32_le())?;
        buf.advance(4); // alignment padding
        let checkpoint = Lsn(buf.get_u64_le());
        let redo = Lsn(buf.get_u64_le());
        let this_timeline_id = buf.get_u32_le();
        buf.advance(4); // checkpoint body padding
        let data_checksum_version = buf.get_u32_le();
        let wal_log_hints = buf.get_u8() != 0;
        buf.advance(3); // alignment padding
        let crc = buf.get_u32_le();

        Ok(ControlFileData {
            system_identifier,
            pg_control_version,
            catalog_version_no,
            state,
            checkpoint,
            checkpoint_copy: CheckPoint {
                redo,
                this_timeline_id,
            },
            data_checksum_version,
            wal_log_hints,
            crc,
        })
    }

    /// Produce a full-size control file blob. The inverse of `decode`.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PG_CONTROL_FILE_SIZE);
        buf.put_u64_le(self.system_identifier);
        buf.put_u32_le(self.pg_control_version);
        buf.put_u32_le(self.catalog_version_no);
        buf.put_u32_le(self.state as u32);
        buf.put_u32_le(0);
        buf.put_u64_le(self.checkpoint.0);
        buf.put_u64_le(self.checkpoint_copy.redo.0);
        buf.put_u32_le(self.checkpoint_copy.this_timeline_id);
        buf.put_u32_le(0);
        buf.put_u32_le(self.data_checksum_version);
        buf.put_u8(self.wal_log_hints as u8);
        buf.put_bytes(0, 3);
        buf.put_u32_le(self.crc);
        debug_assert_eq!(buf.len(), PG_CONTROL_DATA_SIZE);
        buf.resize(PG_CONTROL_FILE_SIZE, 0);
        buf.freeze()
    }
}
