//! Relation data file naming: mapping between (tablespace, database,
//! relation, fork, segment) and the file paths the server uses, plus the
//! "does this path look like relation data" classification the planner needs.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;

use crate::pg_constants::{
    DEFAULTTABLESPACE_OID, GLOBALTABLESPACE_OID, TABLESPACE_VERSION_DIRECTORY,
};
use crate::Oid;

pub const MAIN_FORKNUM: u8 = 0;
pub const FSM_FORKNUM: u8 = 1;
pub const VISIBILITYMAP_FORKNUM: u8 = 2;
pub const INIT_FORKNUM: u8 = 3;

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum FilePathError {
    #[error("invalid relation fork name")]
    InvalidForkName,
}

/// Convert fork number to the right suffix of the relation data file.
pub fn forknumber_to_suffix(forknum: u8) -> Option<&'static str> {
    match forknum {
        MAIN_FORKNUM => None,
        FSM_FORKNUM => Some("fsm"),
        VISIBILITYMAP_FORKNUM => Some("vm"),
        INIT_FORKNUM => Some("init"),
        _ => Some("UNKNOWN FORKNUM"),
    }
}

/// Convert a fork name suffix to a fork number. `None` means the main fork.
pub fn forkname_to_number(forkname: Option<&str>) -> Result<u8, FilePathError> {
    match forkname {
        None => Ok(MAIN_FORKNUM),
        Some("fsm") => Ok(FSM_FORKNUM),
        Some("vm") => Ok(VISIBILITYMAP_FORKNUM),
        Some("init") => Ok(INIT_FORKNUM),
        Some(_) => Err(FilePathError::InvalidForkName),
    }
}

/// A reference to one fork of one relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RelTag {
    pub forknum: u8,
    pub spcnode: Oid,
    pub dbnode: Oid,
    pub relnode: Oid,
}

impl fmt::Display for RelTag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if let Some(suffix) = forknumber_to_suffix(self.forknum) {
            write!(
                f,
                "{}/{}/{}_{}",
                self.spcnode, self.dbnode, self.relnode, suffix
            )
        } else {
            write!(f, "{}/{}/{}", self.spcnode, self.dbnode, self.relnode)
        }
    }
}

impl RelTag {
    /// Canonical path of this relation's first segment file, relative to the
    /// data directory root.
    ///
    /// Shared catalogs live in `global/`, relations in the default tablespace
    /// in `base/<db>/`, and everything else under the tablespace symlink
    /// directory.
    pub fn rel_path(&self) -> String {
        let mut name = if self.spcnode == GLOBALTABLESPACE_OID {
            format!("global/{}", self.relnode)
        } else if self.spcnode == DEFAULTTABLESPACE_OID {
            format!("base/{}/{}", self.dbnode, self.relnode)
        } else {
            format!(
                "pg_tblspc/{}/{}/{}/{}",
                self.spcnode, TABLESPACE_VERSION_DIRECTORY, self.dbnode, self.relnode
            )
        };
        if let Some(suffix) = forknumber_to_suffix(self.forknum) {
            name.push('_');
            name.push_str(suffix);
        }
        name
    }

    /// Like `rel_path`, but for the given segment of the relation. Segments
    /// beyond the first carry a `.<segno>` suffix.
    pub fn segment_path(&self, segno: u32) -> String {
        let mut path = self.rel_path();
        if segno > 0 {
            path.push('.');
            path.push_str(&segno.to_string());
        }
        path
    }
}

/// Relation data files can be in one of the following directories:
///
/// global/
///     shared relations
///
/// base/<db oid>/
///     regular relations, default tablespace
///
/// pg_tblspc/<tblspc oid>/<tblspc version>/<db oid>/
///     within a non-default tablespace (the name of the directory
///     depends on version)
///
/// And the relation data files themselves have a filename like:
///
/// <oid>[_fsm|_vm|_init][.<segment number>]
static REL_DATA_FILE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"^(global|base/[0-9]+|pg_tblspc/[0-9]+/[A-Z0-9_.]+/[0-9]+)/[0-9]+(_fsm|_vm|_init)?(\.[0-9]+)?$",
    )
    .unwrap()
});

/// Does it look like a relation data file?
///
/// The path must be relative to the data directory root, in the canonical
/// form produced by the directory scanners.
pub fn is_rel_data_file(path: &str) -> bool {
    REL_DATA_FILE_RE.is_match(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rel_paths() {
        let rel = RelTag {
            forknum: MAIN_FORKNUM,
            spcnode: DEFAULTTABLESPACE_OID,
            dbnode: 1,
            relnode: 2001,
        };
        assert_eq!(rel.rel_path(), "base/1/2001");
        assert_eq!(rel.segment_path(0), "base/1/2001");
        assert_eq!(rel.segment_path(3), "base/1/2001.3");

        let shared = RelTag {
            forknum: VISIBILITYMAP_FORKNUM,
            spcnode: GLOBALTABLESPACE_OID,
            dbnode: 0,
            relnode: 1262,
        };
        assert_eq!(shared.rel_path(), "global/1262_vm");

        let spc = RelTag {
            forknum: FSM_FORKNUM,
            spcnode: 16385,
            dbnode: 16384,
            relnode: 16390,
        };
        assert_eq!(
            spc.segment_path(1),
            format!(
                "pg_tblspc/16385/{}/16384/16390_fsm.1",
                TABLESPACE_VERSION_DIRECTORY
            )
        );
    }

    #[test]
    fn classification() {
        assert!(is_rel_data_file("global/1262"));
        assert!(is_rel_data_file("base/1/2001"));
        assert!(is_rel_data_file("base/1/2001.12"));
        assert!(is_rel_data_file("base/1/2001_fsm"));
        assert!(is_rel_data_file("base/1/2001_vm.1"));
        assert!(is_rel_data_file(&format!(
            "pg_tblspc/16385/{}/16384/16390",
            TABLESPACE_VERSION_DIRECTORY
        )));

        assert!(!is_rel_data_file("base/1"));
        assert!(!is_rel_data_file("base/1/PG_VERSION"));
        assert!(!is_rel_data_file("base/1/2001_foo"));
        assert!(!is_rel_data_file("base/1/2001.x"));
        assert!(!is_rel_data_file("pg_xlog/000000010000000000000001"));
        assert!(!is_rel_data_file("postgresql.conf"));
        assert!(!is_rel_data_file("pg_tblspc/16385/16384/16390"));
    }

    #[test]
    fn fork_names() {
        assert_eq!(forkname_to_number(None), Ok(MAIN_FORKNUM));
        assert_eq!(forkname_to_number(Some("vm")), Ok(VISIBILITYMAP_FORKNUM));
        assert_eq!(
            forkname_to_number(Some("bogus")),
            Err(FilePathError::InvalidForkName)
        );
    }
}
