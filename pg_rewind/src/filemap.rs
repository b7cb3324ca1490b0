//!
//! The rewind plan: one entry per path that exists in either cluster, saying
//! what to do with it. The map is filled in three strictly ordered passes
//! (source inventory, target inventory, page changes from the target's WAL)
//! and then finalized into an execution-ordered array.
//!

use std::cmp::Ordering;

use anyhow::{bail, ensure, Context};
use camino::{Utf8Path, Utf8PathBuf};
use tracing::debug;

use postgres_ffi::pg_constants::PG_TEMP_FILES_DIR;
use postgres_ffi::relfile_utils::is_rel_data_file;
use postgres_ffi::{BlockNumber, RelTag, BLCKSZ, RELSEG_SIZE};

use crate::datapagemap::DataPageMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
}

/// What to do with a path. `None` entries may still have blocks to fetch in
/// their page map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    /// No action, but modified blocks found in the WAL are still fetched.
    None,
    /// Copy the whole file, overwriting any previous contents.
    Copy,
    /// Copy the range `[oldsize, newsize)`; the target file is shorter than
    /// the source's.
    CopyTail,
    /// Truncate the target file down to `newsize`.
    Truncate,
    /// Create a directory or symlink that only the source has.
    Create,
    /// Remove a path that only the target has.
    Remove,
}

impl FileAction {
    /// Position of the action in the execution order.
    ///
    /// Creations come first so that parent directories exist before anything
    /// is put into them, and removals last so that directory contents can be
    /// unlinked before their parent. This is an explicit property of the
    /// plan, not a side effect of the enum's declaration order.
    fn sort_rank(self) -> u8 {
        match self {
            FileAction::Create => 0,
            FileAction::Copy => 1,
            FileAction::CopyTail => 2,
            FileAction::None => 3,
            FileAction::Truncate => 4,
            FileAction::Remove => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            FileAction::None => "NONE",
            FileAction::Copy => "COPY",
            FileAction::CopyTail => "COPY_TAIL",
            FileAction::Truncate => "TRUNCATE",
            FileAction::Create => "CREATE",
            FileAction::Remove => "REMOVE",
        }
    }
}

#[derive(Debug)]
pub struct FileEntry {
    pub path: String,
    pub ftype: FileType,
    pub action: FileAction,
    pub oldsize: u64,
    pub newsize: u64,
    pub link_target: Option<String>,
    pub pagemap: DataPageMap,
}

/// Sink for data directory inventory events. The backends and the local
/// directory scanner push what they find into one of these; the planner
/// stays in control of what becomes of each path.
pub trait FileListSink {
    fn on_file(
        &mut self,
        path: &str,
        ftype: FileType,
        size: u64,
        link_target: Option<&str>,
    ) -> anyhow::Result<()>;
}

/// Adapter feeding the source cluster's inventory into a [`FileMap`].
pub struct SourceFileSink<'a>(pub &'a mut FileMap);

impl FileListSink for SourceFileSink<'_> {
    fn on_file(
        &mut self,
        path: &str,
        ftype: FileType,
        size: u64,
        link_target: Option<&str>,
    ) -> anyhow::Result<()> {
        self.0.process_source_file(path, ftype, size, link_target)
    }
}

/// Adapter feeding the target cluster's inventory into a [`FileMap`]. Must
/// only run after the source inventory is complete.
pub struct TargetFileSink<'a>(pub &'a mut FileMap);

impl FileListSink for TargetFileSink<'_> {
    fn on_file(
        &mut self,
        path: &str,
        ftype: FileType,
        size: u64,
        link_target: Option<&str>,
    ) -> anyhow::Result<()> {
        self.0.process_target_file(path, ftype, size, link_target)
    }
}

/// Two-phase container: entries accumulate in `list` during the source pass;
/// the first target-pass call moves them into `array`, sorted by path for
/// lookups; `finalize` appends the removals gathered in the meantime and
/// re-sorts everything into execution order.
pub struct FileMap {
    datadir_target: Utf8PathBuf,
    list: Vec<FileEntry>,
    array: Vec<FileEntry>,
    finalized: bool,
}

/// Completely ignore some special files in source and destination.
fn is_special_file(path: &str) -> bool {
    path == "postmaster.pid" || path == "postmaster.opts"
}

/// Temporary files and directories, in any component of the path.
fn is_temp_path(path: &str) -> bool {
    path.split('/').any(|c| c.starts_with(PG_TEMP_FILES_DIR))
}

impl FileMap {
    pub fn new(datadir_target: &Utf8Path) -> FileMap {
        FileMap {
            datadir_target: datadir_target.to_owned(),
            list: Vec::new(),
            array: Vec::new(),
            finalized: false,
        }
    }

    /// Decide what to do about a file present on the source.
    ///
    /// Skips the special and temporary files; for everything else, stats the
    /// corresponding target path and classifies: missing directories and
    /// symlinks get created, relation files that exist on both sides are
    /// sized against each other, and all other regular files are copied
    /// whole (except `PG_VERSION`, which should be identical anyway and is
    /// left alone out of paranoia).
    pub fn process_source_file(
        &mut self,
        path: &str,
        ftype: FileType,
        newsize: u64,
        link_target: Option<&str>,
    ) -> anyhow::Result<()> {
        ensure!(
            self.array.is_empty() && !self.finalized,
            "source file \"{path}\" reported after the source inventory was closed"
        );

        if is_special_file(path) || is_temp_path(path) {
            return Ok(());
        }

        // sanity check: a filename that looks like a data file better be a
        // regular file
        if ftype != FileType::Regular && is_rel_data_file(path) {
            bail!("data file \"{path}\" in source is not a regular file");
        }

        let localpath = self.datadir_target.join(path);
        let meta = match localpath.symlink_metadata() {
            Ok(meta) => Some(meta),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(e).with_context(|| format!("could not stat file \"{localpath}\""))
            }
        };

        let (action, oldsize) = match ftype {
            FileType::Directory => match &meta {
                Some(meta) if !meta.is_dir() => {
                    // it's a directory in source, but not in target. Strange..
                    bail!("\"{localpath}\" is not a directory");
                }
                Some(_) => (FileAction::None, 0),
                None => (FileAction::Create, 0),
            },
            FileType::Symlink => match &meta {
                Some(meta) if !meta.file_type().is_symlink() => {
                    bail!("\"{localpath}\" is not a symbolic link");
                }
                Some(_) => (FileAction::None, 0),
                None => (FileAction::Create, 0),
            },
            FileType::Regular => {
                if let Some(meta) = &meta {
                    if !meta.is_file() {
                        bail!("\"{localpath}\" is not a regular file");
                    }
                }
                match &meta {
                    Some(meta) if is_rel_data_file(path) => {
                        // A data file that exists in both. If it's larger in
                        // the target, truncate it; WAL replay would get there
                        // eventually, but we might as well do it now. If it's
                        // smaller, copy the missing tail; we can't tell
                        // whether the target truncated it or the source
                        // extended it, and copying the range is correct
                        // either way. Equal sizes need nothing here: locally
                        // modified blocks are picked up from the target's
                        // WAL, remotely modified ones by replay after the
                        // rewind.
                        let oldsize = meta.len();
                        let action = match oldsize.cmp(&newsize) {
                            Ordering::Less => FileAction::CopyTail,
                            Ordering::Greater => FileAction::Truncate,
                            Ordering::Equal => FileAction::None,
                        };
                        (action, oldsize)
                    }
                    _ => {
                        // Missing in the target, or a non-data file with no
                        // special processing: copy it in toto. PG_VERSION is
                        // the exception; it should be identical, so avoid
                        // rewriting it.
                        if path.ends_with("PG_VERSION") {
                            (FileAction::None, meta.as_ref().map_or(0, |m| m.len()))
                        } else {
                            (FileAction::Copy, 0)
                        }
                    }
                }
            }
        };

        self.list.push(FileEntry {
            path: path.to_string(),
            ftype,
            action,
            oldsize,
            newsize,
            link_target: link_target.map(str::to_string),
            pagemap: DataPageMap::new(),
        });
        Ok(())
    }

    /// Mark target-only paths for removal.
    ///
    /// All source files must be processed before calling this; the first call
    /// turns the accumulated source entries into the sorted lookup array.
    pub fn process_target_file(
        &mut self,
        path: &str,
        ftype: FileType,
        oldsize: u64,
        link_target: Option<&str>,
    ) -> anyhow::Result<()> {
        ensure!(
            !self.finalized,
            "target file \"{path}\" reported after the file map was finalized"
        );
        if self.array.is_empty() {
            ensure!(!self.list.is_empty(), "source file list is empty");
            self.array.append(&mut self.list);
            self.array.sort_by(|a, b| a.path.cmp(&b.path));
        }

        if is_special_file(path) {
            return Ok(());
        }

        if self.lookup(path).is_none() {
            // Remove any file or directory that doesn't exist in the source.
            self.list.push(FileEntry {
                path: path.to_string(),
                ftype,
                action: FileAction::Remove,
                oldsize,
                newsize: 0,
                link_target: link_target.map(str::to_string),
                pagemap: DataPageMap::new(),
            });
        }
        Ok(())
    }

    /// Note a block that changed in the target's WAL after the fork.
    ///
    /// Only meaningful between the inventory passes and `finalize`.
    pub fn process_block_change(&mut self, rel: RelTag, blkno: BlockNumber) -> anyhow::Result<()> {
        ensure!(
            !self.array.is_empty() && !self.finalized,
            "page change reported outside the WAL extraction phase"
        );

        let segno = blkno / RELSEG_SIZE;
        let blkno_inseg = blkno % RELSEG_SIZE;
        let path = rel.segment_path(segno);

        let Some(idx) = self.lookup(&path) else {
            // No record of this file in the map: the relation doesn't exist
            // on the source, and was subsequently removed from the target
            // too. Safe to ignore.
            return Ok(());
        };
        let entry = &mut self.array[idx];
        match entry.action {
            FileAction::None | FileAction::CopyTail | FileAction::Truncate => {
                // skip if we're truncating away the modified block anyway
                if (blkno_inseg as u64 + 1) * BLCKSZ as u64 <= entry.newsize {
                    entry.pagemap.add(blkno_inseg);
                }
            }
            // A full copy subsumes block fetches, and a removal discards them.
            FileAction::Copy | FileAction::Remove => {}
            FileAction::Create => {
                bail!(
                    "unexpected page modification for directory or symbolic link \"{}\"",
                    entry.path
                );
            }
        }
        Ok(())
    }

    /// Close the map and sort it into execution order: by action rank, then
    /// by path, descending for removals so that `foo/bar` goes before `foo`.
    pub fn finalize(&mut self) {
        assert!(!self.finalized, "file map finalized twice");
        self.array.append(&mut self.list);
        self.array.sort_by(final_cmp);
        self.finalized = true;

        #[cfg(debug_assertions)]
        for entry in &self.array {
            for blkno in entry.pagemap.iter() {
                debug_assert!(
                    (blkno as u64 + 1) * BLCKSZ as u64 <= entry.newsize,
                    "block {} of \"{}\" survives past newsize {}",
                    blkno,
                    entry.path,
                    entry.newsize
                );
            }
        }

        debug!("file map finalized with {} entries", self.array.len());
    }

    /// The execution plan. Only valid once `finalize` has run.
    pub fn entries(&self) -> &[FileEntry] {
        assert!(self.finalized, "file map used before finalize");
        &self.array
    }

    /// Print the plan, one line per path with something to do.
    pub fn print(&self) {
        for entry in &self.array {
            if entry.action != FileAction::None || !entry.pagemap.is_empty() {
                println!("{} ({})", entry.path, entry.action.as_str());
                if !entry.pagemap.is_empty() {
                    print!("{}", entry.pagemap);
                }
            }
        }
    }

    fn lookup(&self, path: &str) -> Option<usize> {
        self.array
            .binary_search_by(|e| e.path.as_str().cmp(path))
            .ok()
    }
}

fn final_cmp(a: &FileEntry, b: &FileEntry) -> Ordering {
    a.action
        .sort_rank()
        .cmp(&b.action.sort_rank())
        .then_with(|| {
            if a.action == FileAction::Remove {
                b.path.cmp(&a.path)
            } else {
                a.path.cmp(&b.path)
            }
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::Utf8TempDir;
    use std::fs;

    fn rel(relnode: u32) -> RelTag {
        RelTag {
            forknum: 0,
            spcnode: postgres_ffi::pg_constants::DEFAULTTABLESPACE_OID,
            dbnode: 1,
            relnode,
        }
    }

    /// A target datadir with one two-block relation file.
    fn target_dir() -> Utf8TempDir {
        let dir = camino_tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("base/1")).unwrap();
        fs::write(dir.path().join("base/1/2001"), vec![0u8; 2 * BLCKSZ as usize]).unwrap();
        dir
    }

    fn base_entries(map: &mut FileMap, rel_2001_size: u64) {
        map.process_source_file("base", FileType::Directory, 0, None)
            .unwrap();
        map.process_source_file("base/1", FileType::Directory, 0, None)
            .unwrap();
        map.process_source_file("base/1/2001", FileType::Regular, rel_2001_size, None)
            .unwrap();
    }

    fn find<'a>(map: &'a FileMap, path: &str) -> &'a FileEntry {
        map.entries().iter().find(|e| e.path == path).unwrap()
    }

    #[test]
    fn tail_append() {
        let dir = target_dir();
        let mut map = FileMap::new(dir.path());
        base_entries(&mut map, 4 * BLCKSZ as u64);
        map.process_target_file("base/1/2001", FileType::Regular, 2 * BLCKSZ as u64, None)
            .unwrap();
        map.finalize();

        let e = find(&map, "base/1/2001");
        assert_eq!(e.action, FileAction::CopyTail);
        assert_eq!(e.oldsize, 2 * BLCKSZ as u64);
        assert_eq!(e.newsize, 4 * BLCKSZ as u64);
    }

    #[test]
    fn shrink_drops_late_blocks() {
        let dir = target_dir();
        let mut map = FileMap::new(dir.path());
        base_entries(&mut map, BLCKSZ as u64);
        map.process_target_file("base/1/2001", FileType::Regular, 2 * BLCKSZ as u64, None)
            .unwrap();
        map.process_block_change(rel(2001), 0).unwrap();
        map.process_block_change(rel(2001), 1).unwrap();
        map.finalize();

        let e = find(&map, "base/1/2001");
        assert_eq!(e.action, FileAction::Truncate);
        assert_eq!(e.newsize, BLCKSZ as u64);
        let blocks: Vec<_> = e.pagemap.iter().collect();
        assert_eq!(blocks, vec![0]);
    }

    #[test]
    fn removed_on_source() {
        let dir = target_dir();
        let mut map = FileMap::new(dir.path());
        base_entries(&mut map, 2 * BLCKSZ as u64);
        map.process_target_file("base/1/2001", FileType::Regular, 2 * BLCKSZ as u64, None)
            .unwrap();
        map.process_target_file("base/1/9999", FileType::Regular, 100, None)
            .unwrap();
        // a change to a relation that exists on neither side is ignored
        map.process_block_change(rel(7777), 3).unwrap();
        map.finalize();

        let e = find(&map, "base/1/9999");
        assert_eq!(e.action, FileAction::Remove);
        assert!(map.entries().iter().all(|e| !e.path.contains("7777")));
    }

    #[test]
    fn special_and_temp_files_skipped() {
        let dir = target_dir();
        let mut map = FileMap::new(dir.path());
        base_entries(&mut map, 2 * BLCKSZ as u64);
        map.process_source_file("postmaster.pid", FileType::Regular, 10, None)
            .unwrap();
        map.process_source_file("base/1/pgsql_tmp", FileType::Directory, 0, None)
            .unwrap();
        map.process_source_file("base/1/pgsql_tmp/pgsql_tmp123.4", FileType::Regular, 9, None)
            .unwrap();
        map.process_target_file("postmaster.opts", FileType::Regular, 10, None)
            .unwrap();
        map.finalize();

        assert!(map
            .entries()
            .iter()
            .all(|e| !e.path.contains("postmaster") && !e.path.contains("pgsql_tmp")));
    }

    #[test]
    fn pg_version_never_copied() {
        let dir = target_dir();
        let mut map = FileMap::new(dir.path());
        base_entries(&mut map, 2 * BLCKSZ as u64);
        map.process_source_file("PG_VERSION", FileType::Regular, 3, None)
            .unwrap();
        map.process_source_file("base/1/PG_VERSION", FileType::Regular, 3, None)
            .unwrap();
        map.process_target_file("base/1/2001", FileType::Regular, 2 * BLCKSZ as u64, None)
            .unwrap();
        map.finalize();

        assert_eq!(find(&map, "PG_VERSION").action, FileAction::None);
        assert_eq!(find(&map, "base/1/PG_VERSION").action, FileAction::None);
    }

    #[test]
    fn execution_order() {
        let dir = target_dir();
        fs::create_dir_all(dir.path().join("old/sub")).unwrap();
        fs::write(dir.path().join("old/sub/file"), b"x").unwrap();

        let mut map = FileMap::new(dir.path());
        base_entries(&mut map, 2 * BLCKSZ as u64);
        map.process_source_file("base/1/3003", FileType::Regular, 100, None)
            .unwrap();
        map.process_source_file("newdir", FileType::Directory, 0, None)
            .unwrap();
        map.process_source_file("newdir/file", FileType::Regular, 7, None)
            .unwrap();
        map.process_target_file("base/1/2001", FileType::Regular, 2 * BLCKSZ as u64, None)
            .unwrap();
        map.process_target_file("old", FileType::Directory, 0, None)
            .unwrap();
        map.process_target_file("old/sub", FileType::Directory, 0, None)
            .unwrap();
        map.process_target_file("old/sub/file", FileType::Regular, 1, None)
            .unwrap();
        map.finalize();

        let paths: Vec<&str> = map.entries().iter().map(|e| e.path.as_str()).collect();
        // the new directory is created before the file inside it is copied
        let dir_pos = paths.iter().position(|p| *p == "newdir").unwrap();
        let file_pos = paths.iter().position(|p| *p == "newdir/file").unwrap();
        assert!(dir_pos < file_pos);
        // removals come last, children before parents
        let n = paths.len();
        assert_eq!(&paths[n - 3..], &["old/sub/file", "old/sub", "old"]);
    }

    #[test]
    fn source_dir_over_target_file_is_fatal() {
        let dir = target_dir();
        fs::write(dir.path().join("clog"), b"oops").unwrap();
        let mut map = FileMap::new(dir.path());
        let err = map
            .process_source_file("clog", FileType::Directory, 0, None)
            .unwrap_err();
        assert!(err.to_string().contains("is not a directory"), "{err}");
    }

    #[test]
    fn rel_file_of_wrong_type_is_fatal() {
        let dir = target_dir();
        let mut map = FileMap::new(dir.path());
        let err = map
            .process_source_file("base/1/2001", FileType::Directory, 0, None)
            .unwrap_err();
        assert!(err.to_string().contains("not a regular file"), "{err}");
    }

    #[test]
    fn page_change_for_created_path_is_fatal() {
        let dir = target_dir();
        let mut map = FileMap::new(dir.path());
        base_entries(&mut map, 2 * BLCKSZ as u64);
        // a directory whose name collides with a relation path shape cannot
        // happen via process_source_file (it rejects it), so force the
        // situation through a symlink entry
        map.process_source_file("base/1/2002", FileType::Regular, BLCKSZ as u64, None)
            .unwrap();
        map.process_target_file("base/1/2001", FileType::Regular, 2 * BLCKSZ as u64, None)
            .unwrap();

        // rewrite the entry into a Create to simulate the planner bug
        let idx = map
            .array
            .binary_search_by(|e| e.path.as_str().cmp("base/1/2002"))
            .unwrap();
        map.array[idx].action = FileAction::Create;

        let err = map.process_block_change(rel(2002), 0).unwrap_err();
        assert!(
            err.to_string().contains("unexpected page modification"),
            "{err}"
        );
    }
}
