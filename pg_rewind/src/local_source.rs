//!
//! Fetching from a source that is a plain data directory on the local
//! filesystem: recursive inventory scan, chunked positioned reads, and the
//! local flavor of plan execution.
//!

use std::cmp::min;
use std::fs::File;
use std::os::unix::fs::{FileExt, MetadataExt};

use anyhow::{bail, Context};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::warn;

use postgres_ffi::pg_constants::XLOG_DIR;
use postgres_ffi::BLCKSZ;

use crate::fetch::{slurp_file, FetchBackend};
use crate::filemap::{FileAction, FileListSink, FileMap, FileType};
use crate::target::TargetWriter;

pub struct LocalSource {
    datadir: Utf8PathBuf,
}

impl LocalSource {
    pub fn new(datadir: &Utf8Path) -> LocalSource {
        LocalSource {
            datadir: datadir.to_owned(),
        }
    }

    /// Copy a byte range of one file from the source to the target.
    fn copy_file_range(
        &self,
        path: &str,
        begin: u64,
        end: u64,
        trunc: bool,
        writer: &mut TargetWriter,
    ) -> anyhow::Result<()> {
        let srcpath = self.datadir.join(path);
        let file = File::open(&srcpath)
            .with_context(|| format!("could not open source file \"{srcpath}\""))?;

        writer.open_target_file(path, trunc)?;

        let mut buf = [0u8; BLCKSZ as usize];
        let mut begin = begin;
        while begin < end {
            let len = min(buf.len() as u64, end - begin) as usize;
            let readlen = file
                .read_at(&mut buf[..len], begin)
                .with_context(|| format!("could not read file \"{srcpath}\""))?;
            if readlen == 0 {
                bail!("unexpected EOF while reading file \"{srcpath}\"");
            }
            writer.write_range(&buf[..readlen], begin)?;
            begin += readlen as u64;
        }
        Ok(())
    }
}

impl FetchBackend for LocalSource {
    fn list_files(&mut self, sink: &mut dyn FileListSink) -> anyhow::Result<()> {
        traverse_datadir(&self.datadir, sink)
    }

    fn fetch_file(&mut self, path: &str) -> anyhow::Result<Vec<u8>> {
        Ok(slurp_file(&self.datadir, path)?)
    }

    fn execute_map(&mut self, map: &FileMap, writer: &mut TargetWriter) -> anyhow::Result<()> {
        for entry in map.entries() {
            for blkno in entry.pagemap.iter() {
                let offset = blkno as u64 * BLCKSZ as u64;
                self.copy_file_range(&entry.path, offset, offset + BLCKSZ as u64, false, writer)?;
            }

            match entry.action {
                FileAction::None => {}
                FileAction::Copy => {
                    self.copy_file_range(&entry.path, 0, entry.newsize, true, writer)?
                }
                FileAction::CopyTail => {
                    self.copy_file_range(&entry.path, entry.oldsize, entry.newsize, false, writer)?
                }
                FileAction::Truncate => writer.truncate_file(&entry.path, entry.newsize)?,
                FileAction::Create => writer.create_entry(entry)?,
                FileAction::Remove => writer.remove_entry(entry)?,
            }
        }
        writer.close()
    }

    fn check_same(&mut self, target_root: &Utf8Path) -> anyhow::Result<()> {
        let source = self
            .datadir
            .metadata()
            .with_context(|| format!("could not stat \"{}\"", self.datadir))?;
        let target = target_root
            .metadata()
            .with_context(|| format!("could not stat \"{target_root}\""))?;
        if source.dev() == target.dev() && source.ino() == target.ino() {
            bail!("source and target data directories are the same directory");
        }
        Ok(())
    }
}

/// Traverse through all files in a data directory, reporting each one to the
/// sink. Used for the source in local mode and always for the target.
pub fn traverse_datadir(datadir: &Utf8Path, sink: &mut dyn FileListSink) -> anyhow::Result<()> {
    recurse_dir(datadir, None, sink)
}

/// `parentpath` is the current subdirectory's path relative to `datadir`, or
/// `None` at the top level.
fn recurse_dir(
    datadir: &Utf8Path,
    parentpath: Option<&str>,
    sink: &mut dyn FileListSink,
) -> anyhow::Result<()> {
    let fullparentpath = match parentpath {
        Some(p) => datadir.join(p),
        None => datadir.to_owned(),
    };

    let dir = fullparentpath
        .read_dir_utf8()
        .with_context(|| format!("could not open directory \"{fullparentpath}\""))?;
    for entry in dir {
        let entry = entry.with_context(|| format!("could not read directory \"{fullparentpath}\""))?;
        let name = entry.file_name();
        let path = match parentpath {
            Some(p) => format!("{p}/{name}"),
            None => name.to_string(),
        };

        let meta = match entry.path().symlink_metadata() {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Fine if the source is running and the file was just
                // removed: a data file leaves a WAL record of its removal,
                // and anything else wasn't critical.
                warn!("could not stat file \"{}\": {e}", entry.path());
                continue;
            }
            Err(e) => {
                return Err(e).with_context(|| format!("could not stat file \"{}\"", entry.path()))
            }
        };

        let ftype = meta.file_type();
        if ftype.is_file() {
            sink.on_file(&path, FileType::Regular, meta.len(), None)?;
        } else if ftype.is_dir() {
            sink.on_file(&path, FileType::Directory, 0, None)?;
            recurse_dir(datadir, Some(&path), sink)?;
        } else if ftype.is_symlink() {
            let link_target = entry
                .path()
                .read_link_utf8()
                .with_context(|| format!("readlink() failed on \"{}\"", entry.path()))?;
            sink.on_file(&path, FileType::Symlink, 0, Some(link_target.as_str()))?;

            // Symlinks within pg_tblspc hold the tablespaces, and the WAL
            // directory itself may be a symlink; both need to be entered.
            // Symlinks anywhere else are recorded but not followed.
            if parentpath == Some("pg_tblspc") || path == XLOG_DIR {
                recurse_dir(datadir, Some(&path), sink)?;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Collect(Vec<(String, FileType, u64, Option<String>)>);

    impl FileListSink for Collect {
        fn on_file(
            &mut self,
            path: &str,
            ftype: FileType,
            size: u64,
            link_target: Option<&str>,
        ) -> anyhow::Result<()> {
            self.0
                .push((path.to_string(), ftype, size, link_target.map(Into::into)));
            Ok(())
        }
    }

    #[test]
    fn scanner_reports_types_and_descends_selectively() {
        let dir = camino_tempfile::tempdir().unwrap();
        let root = dir.path();
        std::fs::create_dir_all(root.join("base/1")).unwrap();
        std::fs::write(root.join("base/1/2001"), vec![0u8; 100]).unwrap();
        std::fs::create_dir(root.join("pg_tblspc")).unwrap();

        // a tablespace directory, reachable only through its symlink
        let tsdir = camino_tempfile::tempdir().unwrap();
        std::fs::create_dir(tsdir.path().join("PG_14_202107181")).unwrap();
        std::fs::write(tsdir.path().join("PG_14_202107181/f"), b"ts").unwrap();
        std::os::unix::fs::symlink(tsdir.path(), root.join("pg_tblspc/16385")).unwrap();

        // a random symlink that must not be followed
        let outside = camino_tempfile::tempdir().unwrap();
        std::fs::write(outside.path().join("secret"), b"no").unwrap();
        std::os::unix::fs::symlink(outside.path(), root.join("stray")).unwrap();

        let mut sink = Collect(Vec::new());
        traverse_datadir(root, &mut sink).unwrap();
        let mut paths: Vec<&str> = sink.0.iter().map(|(p, ..)| p.as_str()).collect();
        paths.sort();

        assert!(paths.contains(&"base/1/2001"));
        assert!(paths.contains(&"pg_tblspc/16385"));
        assert!(paths.contains(&"pg_tblspc/16385/PG_14_202107181/f"));
        assert!(paths.contains(&"stray"));
        assert!(!paths.iter().any(|p| p.contains("secret")));

        let (_, ftype, _, link) = sink
            .0
            .iter()
            .find(|(p, ..)| p == "pg_tblspc/16385")
            .unwrap();
        assert_eq!(*ftype, FileType::Symlink);
        assert_eq!(link.as_deref(), Some(tsdir.path().as_str()));

        let (_, ftype, size, _) = sink.0.iter().find(|(p, ..)| p == "base/1/2001").unwrap();
        assert_eq!(*ftype, FileType::Regular);
        assert_eq!(*size, 100);
    }

    #[test]
    fn same_directory_check() {
        let dir = camino_tempfile::tempdir().unwrap();
        let mut source = LocalSource::new(dir.path());
        let err = source.check_same(dir.path()).unwrap_err();
        assert!(err.to_string().contains("same directory"), "{err}");

        let other = camino_tempfile::tempdir().unwrap();
        source.check_same(other.path()).unwrap();
    }
}
