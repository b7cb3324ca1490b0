//! Command line entry point. Option handling and exit codes only; the work
//! happens in the `pg_rewind` library crate.

use std::process::exit;

use camino::Utf8PathBuf;
use clap::{ArgAction, Parser};
use tracing::error;
use tracing::level_filters::LevelFilter;

use pg_rewind::{FileReadError, RewindOptions};

/// pg_rewind resynchronizes a cluster with another copy of the cluster.
#[derive(Parser)]
#[command(
    name = "pg_rewind",
    version,
    disable_help_flag = true,
    disable_version_flag = true,
    group = clap::ArgGroup::new("source").required(true).args(["source_pgdata", "source_server"]),
)]
struct Args {
    /// existing data directory to modify
    #[arg(short = 'D', long, value_name = "DIRECTORY")]
    target_pgdata: Utf8PathBuf,

    /// source data directory to sync with
    #[arg(long, value_name = "DIRECTORY")]
    source_pgdata: Option<Utf8PathBuf>,

    /// source server to sync with
    #[arg(long, value_name = "CONNSTR")]
    source_server: Option<String>,

    /// stop before modifying anything
    #[arg(short = 'n', long)]
    dry_run: bool,

    /// write a lot of progress messages
    #[arg(short = 'v', long)]
    verbose: bool,

    /// show this help, then exit
    #[arg(short = '?', long, action = ArgAction::Help)]
    help: Option<bool>,

    /// output version information, then exit
    #[arg(short = 'V', long, action = ArgAction::Version)]
    version: Option<bool>,
}

fn main() {
    let args = Args::parse();

    let default_level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };
    if let Err(e) = utils::logging::init(default_level) {
        eprintln!("could not initialize logging: {e:#}");
        exit(1);
    }

    let opts = RewindOptions {
        datadir_target: args.target_pgdata,
        datadir_source: args.source_pgdata,
        connstr_source: args.source_server,
        dry_run: args.dry_run,
        print_filemap: args.verbose,
    };

    match pg_rewind::run(&opts) {
        Ok(_) => {}
        Err(e) => {
            error!("{e:#}");
            // Unreadable required artifacts (control file, history) exit
            // with 2, everything else with 1.
            let unreadable = e
                .chain()
                .any(|cause| cause.downcast_ref::<FileReadError>().is_some());
            exit(if unreadable { 2 } else { 1 });
        }
    }
}
