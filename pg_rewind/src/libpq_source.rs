//!
//! Fetching from a live source server over a single synchronous connection.
//!
//! The heavy lifting happens server-side through a private `rewind_support`
//! schema of superuser helper functions, installed on connect and dropped at
//! the end of the run. Listing is one recursive query; block fetches are
//! batched into a temporary table and streamed back row by row.
//!

use std::cmp::min;
use std::io::Write;

use anyhow::{ensure, Context};
use camino::Utf8Path;
use postgres::fallible_iterator::FallibleIterator;
use postgres::{Client, NoTls};
use tracing::{debug, info, warn};

use postgres_ffi::BLCKSZ;

use crate::fetch::{FetchBackend, FileReadError};
use crate::filemap::{FileAction, FileListSink, FileMap, FileType};
use crate::target::TargetWriter;

/// Maximum size of a single chunk request; larger ranges are split.
const CHUNK_MAX: u64 = 1_000_000;

const SUPPORT_SCHEMA: &str = "rewind_support";
const SUPPORT_LIB: &str = "$libdir/pg_rewind_support";

/// Recursive directory listing of the whole source data directory. The join
/// against pg_tablespace recovers the tablespace symlink targets; there is
/// no backend function to read an arbitrary symlink, so custom symlinks in
/// the data directory come back as plain entries.
const LIST_FILES_SQL: &str = "\
with recursive files (path, filename, size, isdir) as (
  select '' as path, filename, size, isdir
  from rewind_support.ls_dir('.', true) as fn(filename),
       rewind_support.stat_file(fn.filename, true) as this
  union all
  select parent.path || parent.filename || '/' as path,
         fn.filename, this.size, this.isdir
  from files as parent,
       rewind_support.ls_dir(parent.path || parent.filename, true) as fn(filename),
       rewind_support.stat_file(parent.path || parent.filename || '/' || fn.filename, true) as this
  where parent.isdir
)
select path || filename as path, size, isdir,
       pg_tablespace_location(pg_tablespace.oid) as link_target
from files
left outer join pg_tablespace
     on files.path = 'pg_tblspc/'
    and pg_tablespace.oid::text = files.filename";

/// Fetch all the chunks listed in the temp table. NULL bytes mean the file
/// vanished on the source after the map was built.
const FETCH_CHUNKS_SQL: &str = "\
select path, begin, rewind_support.read_binary_file(path, begin, len, true) as chunk
from fetchchunks";

pub struct LibpqSource {
    client: Client,
}

impl LibpqSource {
    /// Connect to the source server, verify it is fit to copy from, and
    /// install the support schema.
    pub fn connect(connstr: &str) -> anyhow::Result<LibpqSource> {
        let client = Client::connect(connstr, NoTls)
            .context("could not connect to source server")?;
        info!("connected to source server");

        let mut source = LibpqSource { client };

        let in_recovery: bool = source
            .client
            .query_one("SELECT pg_is_in_recovery()", &[])?
            .get(0);
        ensure!(!in_recovery, "source server must not be in recovery mode");

        let fpw: String = source.client.query_one("SHOW full_page_writes", &[])?.get(0);
        ensure!(
            fpw == "on",
            "full_page_writes must be enabled in the source server"
        );

        // Run with our own session defaults: no waiting for synchronous
        // standbys on the temp-table traffic, and no influence from the
        // server's search_path on the queries below.
        source
            .client
            .batch_execute("SET synchronous_commit = off; SET search_path = '';")?;

        source.install_support()?;
        Ok(source)
    }

    fn install_support(&mut self) -> anyhow::Result<()> {
        let sql = format!(
            "SET client_min_messages = warning;
             DROP SCHEMA IF EXISTS {schema} CASCADE;
             CREATE SCHEMA {schema};
             CREATE OR REPLACE FUNCTION {schema}.ls_dir(text, boolean)
                 RETURNS SETOF text
                 AS '{lib}', 'rewind_support_ls_dir' LANGUAGE C STRICT;
             CREATE OR REPLACE FUNCTION {schema}.stat_file(
                 IN filename text, IN missing_ok boolean,
                 OUT size bigint,
                 OUT access timestamp with time zone,
                 OUT modification timestamp with time zone,
                 OUT change timestamp with time zone,
                 OUT creation timestamp with time zone,
                 OUT isdir boolean)
                 RETURNS record
                 AS '{lib}', 'rewind_support_stat_file' LANGUAGE C STRICT;
             CREATE OR REPLACE FUNCTION {schema}.read_binary_file(text, bigint, bigint, boolean)
                 RETURNS bytea
                 AS '{lib}', 'rewind_support_read_binary_file' LANGUAGE C STRICT;
             RESET client_min_messages;",
            schema = SUPPORT_SCHEMA,
            lib = SUPPORT_LIB,
        );
        self.client
            .batch_execute(&sql)
            .context("could not install the rewind support functions on the source server")
    }

    /// Stream back the chunks requested in the fetchchunks table and write
    /// them into the target files. One row at a time; a chunk is released
    /// before the next one is read.
    fn receive_chunks(&mut self, writer: &mut TargetWriter) -> anyhow::Result<()> {
        let params: Vec<String> = Vec::new();
        let mut rows = self
            .client
            .query_raw(FETCH_CHUNKS_SQL, params)
            .context("could not fetch file chunks from the source server")?;

        while let Some(row) = rows
            .next()
            .context("unexpected result while fetching file chunks")?
        {
            let path: String = row.get("path");
            let begin: i32 = row.get("begin");
            let chunk: Option<Vec<u8>> = row.get("chunk");

            let Some(chunk) = chunk else {
                // The file was deleted on the source after we built the map.
                // Treat it as if it had never been there.
                warn!("received NULL chunk for file \"{path}\", file has been deleted on the source");
                writer.remove_target_file(&path, true)?;
                continue;
            };

            debug!(
                "received chunk for file \"{path}\", off {begin}, len {}",
                chunk.len()
            );
            writer.open_target_file(&path, false)?;
            writer.write_range(&chunk, begin as u64)?;
        }
        Ok(())
    }
}

/// Queue a byte range of a file for fetching, split into CHUNK_MAX pieces.
fn queue_range(
    copy: &mut impl Write,
    path: &str,
    mut begin: u64,
    end: u64,
) -> anyhow::Result<()> {
    while begin < end {
        let len = min(end - begin, CHUNK_MAX);
        writeln!(copy, "{path}\t{begin}\t{len}")
            .context("error sending chunk list to the source server")?;
        begin += len;
    }
    Ok(())
}

impl FetchBackend for LibpqSource {
    fn list_files(&mut self, sink: &mut dyn FileListSink) -> anyhow::Result<()> {
        let rows = self
            .client
            .query(LIST_FILES_SQL, &[])
            .context("unexpected result while fetching the source file list")?;
        for row in rows {
            let path: String = row.get("path");
            let size: Option<i64> = row.get("size");
            let isdir: Option<bool> = row.get("isdir");
            let link_target: Option<String> = row.get("link_target");

            // The file was removed from the server while the query was
            // running. Ignore it.
            let Some(size) = size else { continue };

            let (ftype, size, link) = match link_target.as_deref() {
                Some(target) if !target.is_empty() => (FileType::Symlink, 0, Some(target)),
                _ if isdir.unwrap_or(false) => (FileType::Directory, 0, None),
                _ => (FileType::Regular, size as u64, None),
            };
            sink.on_file(&path, ftype, size, link)?;
        }
        Ok(())
    }

    fn fetch_file(&mut self, path: &str) -> anyhow::Result<Vec<u8>> {
        let row = self
            .client
            .query_one(
                "select rewind_support.read_binary_file($1, 0, -1, false)",
                &[&path],
            )
            .map_err(|e| FileReadError {
                path: path.to_string(),
                source: crate::fetch::io_error(e),
            })?;
        let content: Vec<u8> = row.get(0);
        debug!("fetched file \"{path}\", length {}", content.len());
        Ok(content)
    }

    fn execute_map(&mut self, map: &FileMap, writer: &mut TargetWriter) -> anyhow::Result<()> {
        // First create a temporary table and load it with the chunks we need
        // to fetch.
        self.client
            .batch_execute("create temporary table fetchchunks(path text, begin int4, len int4)")
            .context("error creating temporary table")?;

        let mut copy = self
            .client
            .copy_in("copy fetchchunks from stdin")
            .context("unexpected result while sending the chunk list")?;

        for entry in map.entries() {
            for blkno in entry.pagemap.iter() {
                let offset = blkno as u64 * BLCKSZ as u64;
                queue_range(&mut copy, &entry.path, offset, offset + BLCKSZ as u64)?;
            }

            match entry.action {
                FileAction::None => {}
                FileAction::Copy => {
                    // Truncate the old file out of the way, if any.
                    writer.open_target_file(&entry.path, true)?;
                    queue_range(&mut copy, &entry.path, 0, entry.newsize)?;
                }
                FileAction::CopyTail => {
                    queue_range(&mut copy, &entry.path, entry.oldsize, entry.newsize)?
                }
                FileAction::Truncate => writer.truncate_file(&entry.path, entry.newsize)?,
                FileAction::Create => writer.create_entry(entry)?,
                FileAction::Remove => writer.remove_entry(entry)?,
            }
        }

        copy.finish().context("error finishing the chunk list copy")?;

        // The chunk list is on the server; now receive the data.
        self.receive_chunks(writer)?;
        writer.close()
    }

    fn check_same(&mut self, _target_root: &Utf8Path) -> anyhow::Result<()> {
        // A live server is never the same directory as the (shut down)
        // target; nothing to compare.
        Ok(())
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.client
            .batch_execute(
                "SET client_min_messages = warning;
                 DROP SCHEMA IF EXISTS rewind_support CASCADE;
                 RESET client_min_messages;",
            )
            .context("could not drop the rewind support schema")
    }
}
