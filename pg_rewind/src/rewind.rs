//!
//! The rewind driver: digest and cross-check the control files, find the
//! divergence point, decide whether a rewind is needed at all, build the
//! file map and hand it to the backend for execution.
//!

use anyhow::{bail, Context};
use camino::Utf8PathBuf;
use tracing::{debug, info};

use postgres_ffi::controlfile_utils::{ControlFileData, DBState};
use postgres_ffi::pg_constants::{
    CATALOG_VERSION_NO, PG_CONTROL_VERSION, PG_DATA_CHECKSUM_VERSION, XLOG_DIR,
};
use postgres_ffi::xlog_utils::TLHistoryFileName;

use crate::fetch::{slurp_file, FetchBackend};
use crate::filemap::{FileMap, SourceFileSink, TargetFileSink};
use crate::libpq_source::LibpqSource;
use crate::local_source::{traverse_datadir, LocalSource};
use crate::parsexlog::{extract_page_map, find_last_checkpoint, read_one_record};
use crate::target::{create_backup_label, TargetWriter};
use crate::timeline::{find_common_ancestor, parse_timeline_history, timeline_1_history};

#[derive(Debug, Clone)]
pub struct RewindOptions {
    /// Existing data directory to modify.
    pub datadir_target: Utf8PathBuf,
    /// Source data directory to sync with.
    pub datadir_source: Option<Utf8PathBuf>,
    /// Source server to sync with.
    pub connstr_source: Option<String>,
    /// Stop before modifying anything.
    pub dry_run: bool,
    /// Print the whole file map before executing it.
    pub print_filemap: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewindOutcome {
    /// The target was rewound to match the source.
    Completed,
    /// The target is a direct ancestor of the source; nothing to do.
    NoRewindNeeded,
}

pub fn run(opts: &RewindOptions) -> anyhow::Result<RewindOutcome> {
    let mut backend: Box<dyn FetchBackend> = match (&opts.datadir_source, &opts.connstr_source) {
        (Some(datadir), None) => Box::new(LocalSource::new(datadir)),
        (None, Some(connstr)) => Box::new(LibpqSource::connect(connstr)?),
        _ => bail!("exactly one of --source-pgdata and --source-server must be given"),
    };
    backend.check_same(&opts.datadir_target)?;

    // Read in all the information we need from both clusters.
    let buf = slurp_file(&opts.datadir_target, "global/pg_control")?;
    let control_target = ControlFileData::decode(&buf)
        .context("could not parse the target cluster's control file")?;
    let buf = backend.fetch_file("global/pg_control")?;
    let control_source = ControlFileData::decode(&buf)
        .context("could not parse the source cluster's control file")?;
    sanity_checks(&control_target, &control_source)?;

    let target_tli = control_target.checkpoint_copy.this_timeline_id;
    let source_tli = control_source.checkpoint_copy.this_timeline_id;

    // If both clusters are already on the same timeline, there's nothing
    // to do.
    if target_tli == source_tli {
        bail!("source and target cluster are both on the same timeline");
    }

    let history = if source_tli == 1 {
        // Timeline 1 does not have a history file.
        timeline_1_history()
    } else {
        let path = format!("{}/{}", XLOG_DIR, TLHistoryFileName(source_tli));
        let buf = backend.fetch_file(&path)?;
        let text = String::from_utf8(buf)
            .with_context(|| format!("history file \"{path}\" is not valid text"))?;
        parse_timeline_history(&text, source_tli)?
    };
    let (divergerec, lastcommontli) = find_common_ancestor(&history, target_tli)?;
    println!("The servers diverged at WAL position {divergerec} on timeline {lastcommontli}.");

    // Check for the possibility that the target is in fact a direct ancestor
    // of the source. In that case, there is no divergent history in the
    // target that needs rewinding.
    let rewind_needed = if control_target.checkpoint >= divergerec {
        true
    } else {
        // If the histories diverged exactly at the end of the shutdown
        // checkpoint record on the target, there are no WAL records in the
        // target that don't belong in the source's history, and no rewind is
        // needed.
        let chkptendrec = read_one_record(
            &opts.datadir_target,
            control_target.checkpoint,
            target_tli,
        )?;
        chkptendrec != divergerec
    };
    if !rewind_needed {
        println!("No rewind required.");
        return Ok(RewindOutcome::NoRewindNeeded);
    }

    let (chkptrec, chkpttli, chkptredo) =
        find_last_checkpoint(&opts.datadir_target, divergerec, lastcommontli)?;
    println!("Rewinding from last common checkpoint at {chkptrec} on timeline {chkpttli}");

    let mut map = FileMap::new(&opts.datadir_target);
    backend.list_files(&mut SourceFileSink(&mut map))?;
    traverse_datadir(&opts.datadir_target, &mut TargetFileSink(&mut map))?;

    // Read the target WAL from the last checkpoint before the point of fork,
    // to extract all the pages that were modified on the target cluster
    // after the fork.
    extract_page_map(
        &opts.datadir_target,
        chkptrec,
        lastcommontli,
        None,
        &mut |rel, blkno| map.process_block_change(rel, blkno),
    )?;
    map.finalize();

    if opts.print_filemap || opts.dry_run {
        map.print();
    }
    if opts.dry_run {
        info!("dry run: no files will be modified");
    }

    // Ok, we're ready to start copying things over.
    let mut writer = TargetWriter::new(&opts.datadir_target, opts.dry_run);
    backend.execute_map(&map, &mut writer)?;

    create_backup_label(
        &opts.datadir_target,
        chkptredo,
        chkpttli,
        chkptrec,
        opts.dry_run,
    )?;
    backend.finish()?;

    println!("Done!");
    Ok(RewindOutcome::Completed)
}

fn sanity_checks(
    target: &ControlFileData,
    source: &ControlFileData,
) -> anyhow::Result<()> {
    if target.system_identifier != source.system_identifier {
        bail!("source and target clusters are from different systems");
    }
    if target.pg_control_version != PG_CONTROL_VERSION
        || source.pg_control_version != PG_CONTROL_VERSION
        || target.catalog_version_no != CATALOG_VERSION_NO
        || source.catalog_version_no != CATALOG_VERSION_NO
    {
        bail!("clusters are not compatible with this version of pg_rewind");
    }

    // The target must use checksums or hint-bit WAL logging; without either,
    // hint bit updates would not leave a trace in the WAL and the rewound
    // pages could be silently torn.
    if target.data_checksum_version != PG_DATA_CHECKSUM_VERSION && !target.wal_log_hints {
        bail!("target server needs to use either data checksums or \"wal_log_hints = on\"");
    }

    // The target better not be running. This doesn't guard against someone
    // starting it concurrently.
    if target.state != DBState::Shutdowned {
        bail!("target server must be shut down cleanly");
    }

    debug!(
        "sanity checks passed: system {}, target on timeline {}, source on timeline {}",
        target.system_identifier,
        target.checkpoint_copy.this_timeline_id,
        source.checkpoint_copy.this_timeline_id,
    );
    Ok(())
}
