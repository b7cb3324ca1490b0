//!
//! Mutations of the target data directory: positioned writes into data
//! files, creations, removals, truncations, and the recovery anchor written
//! at the end of a run. Every mutation is a no-op in dry-run mode.
//!

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use postgres_ffi::xlog_utils::wal_file_name;
use postgres_ffi::TimeLineID;
use utils::lsn::Lsn;

use crate::filemap::{FileEntry, FileType};

/// Writes into the target data directory. Keeps at most one destination file
/// open at a time: consecutive writes to the same path reuse the descriptor,
/// a different path or a truncating open closes and reopens.
pub struct TargetWriter {
    datadir: Utf8PathBuf,
    dry_run: bool,
    open_file: Option<(String, File)>,
}

impl TargetWriter {
    pub fn new(datadir: &Utf8Path, dry_run: bool) -> TargetWriter {
        TargetWriter {
            datadir: datadir.to_owned(),
            dry_run,
            open_file: None,
        }
    }

    pub fn open_target_file(&mut self, path: &str, trunc: bool) -> anyhow::Result<()> {
        if self.dry_run {
            return Ok(());
        }
        if let Some((openpath, _)) = &self.open_file {
            if openpath == path && !trunc {
                return Ok(()); // already open
            }
        }
        self.close()?;

        let fullpath = self.datadir.join(path);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(trunc)
            .open(&fullpath)
            .with_context(|| format!("could not open destination file \"{fullpath}\""))?;
        self.open_file = Some((path.to_string(), file));
        Ok(())
    }

    /// Positioned write into the currently open destination file.
    pub fn write_range(&mut self, buf: &[u8], begin: u64) -> anyhow::Result<()> {
        if self.dry_run {
            return Ok(());
        }
        let (path, file) = self
            .open_file
            .as_mut()
            .expect("write_range without an open destination file");
        file.write_all_at(buf, begin)
            .with_context(|| format!("could not write file \"{path}\""))?;
        Ok(())
    }

    pub fn close(&mut self) -> anyhow::Result<()> {
        if let Some((path, file)) = self.open_file.take() {
            file.sync_data()
                .with_context(|| format!("could not flush destination file \"{path}\""))?;
        }
        Ok(())
    }

    pub fn truncate_file(&mut self, path: &str, newsize: u64) -> anyhow::Result<()> {
        if self.dry_run {
            return Ok(());
        }
        let fullpath = self.datadir.join(path);
        let file = OpenOptions::new()
            .write(true)
            .open(&fullpath)
            .with_context(|| format!("could not open file \"{fullpath}\" for truncation"))?;
        file.set_len(newsize)
            .with_context(|| format!("could not truncate file \"{fullpath}\" to {newsize} bytes"))?;
        Ok(())
    }

    /// Remove a file, tolerating a file that is already gone.
    pub fn remove_target_file(&mut self, path: &str, missing_ok: bool) -> anyhow::Result<()> {
        if self.dry_run {
            return Ok(());
        }
        // if the file is the open destination, let go of it first
        if matches!(&self.open_file, Some((openpath, _)) if openpath == path) {
            self.open_file = None;
        }
        let fullpath = self.datadir.join(path);
        match std::fs::remove_file(&fullpath) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound && missing_ok => Ok(()),
            Err(e) => Err(e).with_context(|| format!("could not remove file \"{fullpath}\"")),
        }
    }

    pub fn create_entry(&mut self, entry: &FileEntry) -> anyhow::Result<()> {
        if self.dry_run {
            return Ok(());
        }
        // A directory or symlink that is already in place is fine: a
        // tablespace path may be reachable through a symlink created a moment
        // ago, and re-running a plan must converge rather than trip over its
        // own earlier creations.
        let fullpath = self.datadir.join(&entry.path);
        match entry.ftype {
            FileType::Directory => match std::fs::create_dir(&fullpath) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
                Err(e) => {
                    Err(e).with_context(|| format!("could not create directory \"{fullpath}\""))
                }
            },
            FileType::Symlink => {
                let link_target = entry
                    .link_target
                    .as_deref()
                    .with_context(|| format!("no link target recorded for \"{fullpath}\""))?;
                match std::os::unix::fs::symlink(link_target, &fullpath) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(()),
                    Err(e) => Err(e).with_context(|| {
                        format!("could not create symbolic link at \"{fullpath}\"")
                    }),
                }
            }
            // can't happen with a correct planner
            FileType::Regular => bail!("invalid action (CREATE) for regular file \"{fullpath}\""),
        }
    }

    pub fn remove_entry(&mut self, entry: &FileEntry) -> anyhow::Result<()> {
        if self.dry_run {
            return Ok(());
        }
        match entry.ftype {
            FileType::Regular | FileType::Symlink => self.remove_target_file(&entry.path, true),
            FileType::Directory => {
                let fullpath = self.datadir.join(&entry.path);
                match std::fs::remove_dir(&fullpath) {
                    Ok(()) => Ok(()),
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => {
                        Err(e).with_context(|| format!("could not remove directory \"{fullpath}\""))
                    }
                }
            }
        }
    }
}

/// Create a `backup_label` file that forces recovery to begin at the last
/// common checkpoint. Overwrites any stale label.
pub fn create_backup_label(
    datadir: &Utf8Path,
    startpoint: Lsn,
    starttli: TimeLineID,
    checkpointloc: Lsn,
    dry_run: bool,
) -> anyhow::Result<()> {
    if dry_run {
        return Ok(());
    }

    let xlogfilename = wal_file_name(starttli, startpoint);
    let stamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S %Z");
    let content = format!(
        "START WAL LOCATION: {startpoint} (file {xlogfilename})\n\
         CHECKPOINT LOCATION: {checkpointloc}\n\
         BACKUP METHOD: rewound with pg_rewind\n\
         BACKUP FROM: master\n\
         START TIME: {stamp}\n"
    );

    let labelpath = datadir.join("backup_label");
    debug!("writing {labelpath}");
    std::fs::write(&labelpath, content)
        .with_context(|| format!("could not write backup label file \"{labelpath}\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use postgres_ffi::WAL_SEGMENT_SIZE;

    #[test]
    fn writer_reuses_descriptor_and_respects_truncation() {
        let dir = camino_tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"0123456789").unwrap();

        let mut writer = TargetWriter::new(dir.path(), false);
        writer.open_target_file("f", false).unwrap();
        writer.write_range(b"AB", 2).unwrap();
        // same path, no reopen; previous content preserved
        writer.open_target_file("f", false).unwrap();
        writer.write_range(b"Z", 9).unwrap();
        writer.close().unwrap();
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"01AB45678Z");

        let mut writer = TargetWriter::new(dir.path(), false);
        writer.open_target_file("f", true).unwrap();
        writer.write_range(b"new", 0).unwrap();
        writer.close().unwrap();
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"new");
    }

    #[test]
    fn dry_run_mutates_nothing() {
        let dir = camino_tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("f"), b"keep").unwrap();

        let mut writer = TargetWriter::new(dir.path(), true);
        writer.open_target_file("f", true).unwrap();
        writer.write_range(b"clobber", 0).unwrap();
        writer.truncate_file("f", 1).unwrap();
        writer.remove_target_file("f", false).unwrap();
        writer.close().unwrap();
        assert_eq!(std::fs::read(dir.path().join("f")).unwrap(), b"keep");

        create_backup_label(dir.path(), Lsn(0x1000028), 1, Lsn(0x1000028), true).unwrap();
        assert!(!dir.path().join("backup_label").exists());
    }

    #[test]
    fn backup_label_shape() {
        let dir = camino_tempfile::tempdir().unwrap();
        let start = Lsn((WAL_SEGMENT_SIZE + 0x28) as u64);
        create_backup_label(dir.path(), start, 2, Lsn(0x1000060), false).unwrap();

        let label = std::fs::read_to_string(dir.path().join("backup_label")).unwrap();
        let lines: Vec<&str> = label.lines().collect();
        assert_eq!(lines.len(), 5);
        assert_eq!(
            lines[0],
            "START WAL LOCATION: 0/1000028 (file 000000020000000000000001)"
        );
        assert_eq!(lines[1], "CHECKPOINT LOCATION: 0/1000060");
        assert_eq!(lines[2], "BACKUP METHOD: rewound with pg_rewind");
        assert_eq!(lines[3], "BACKUP FROM: master");
        assert!(lines[4].starts_with("START TIME: "));
    }
}
