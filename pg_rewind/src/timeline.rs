//!
//! Timeline history: parse the source's history file and find the point
//! where the target's timeline stopped being an ancestor of the source's.
//!

use anyhow::{bail, ensure, Context};

use postgres_ffi::TimeLineID;
use utils::lsn::Lsn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimelineHistoryEntry {
    pub tli: TimeLineID,
    pub begin: Lsn,
    pub end: Lsn,
}

/// Parse a timeline history file.
///
/// Each data line is `<tli>\t<switchpoint>\t<reason>`; blank lines and `#`
/// comments are ignored. The entries form a prefix sequence: each entry ends
/// where the next begins, and a final open-ended entry is appended for
/// `current_tli` itself (which the file does not mention).
pub fn parse_timeline_history(
    buffer: &str,
    current_tli: TimeLineID,
) -> anyhow::Result<Vec<TimelineHistoryEntry>> {
    let mut entries: Vec<TimelineHistoryEntry> = Vec::new();
    let mut lasttli: TimeLineID = 0;
    let mut prevend = Lsn::INVALID;

    for line in buffer.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = line.split_whitespace();
        let (Some(tli_field), Some(lsn_field)) = (fields.next(), fields.next()) else {
            bail!("syntax error in history file: {line}");
        };
        let tli: TimeLineID = tli_field
            .parse()
            .with_context(|| format!("expected a numeric timeline ID in history file line: {line}"))?;
        let end: Lsn = lsn_field.parse().map_err(|_| {
            anyhow::anyhow!("expected a write-ahead log switchpoint location in history file line: {line}")
        })?;

        ensure!(
            entries.is_empty() || tli > lasttli,
            "timeline IDs must be in increasing sequence in history file"
        );

        entries.push(TimelineHistoryEntry {
            tli,
            begin: prevend,
            end,
        });
        lasttli = tli;
        prevend = end;
    }

    ensure!(
        current_tli > lasttli,
        "timeline IDs in history file must be less than the current timeline's ID"
    );
    entries.push(TimelineHistoryEntry {
        tli: current_tli,
        begin: prevend,
        end: Lsn::INVALID,
    });

    Ok(entries)
}

/// History of a cluster that is still on timeline 1: a single open-ended
/// entry, no file to read.
pub fn timeline_1_history() -> Vec<TimelineHistoryEntry> {
    vec![TimelineHistoryEntry {
        tli: 1,
        begin: Lsn::INVALID,
        end: Lsn::INVALID,
    }]
}

/// Determine the last timeline common to both clusters, walking the source's
/// history backwards to the entry for the target's current timeline. Its
/// `end` is where the histories diverged: the first WAL position that is not
/// the same in both clusters.
pub fn find_common_ancestor(
    history: &[TimelineHistoryEntry],
    target_tli: TimeLineID,
) -> anyhow::Result<(Lsn, TimeLineID)> {
    for entry in history.iter().rev() {
        if entry.tli == target_tli {
            return Ok((entry.end, entry.tli));
        }
    }
    bail!("could not find common ancestor of the source and target cluster's timelines");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_simple_history() {
        let text = "\
# comment line

1\t0/16D3FD8\tno recovery target specified
2\t0/2000000\tat restore point \"before upgrade\"
";
        let entries = parse_timeline_history(text, 3).unwrap();
        assert_eq!(
            entries,
            vec![
                TimelineHistoryEntry {
                    tli: 1,
                    begin: Lsn::INVALID,
                    end: Lsn(0x16D3FD8),
                },
                TimelineHistoryEntry {
                    tli: 2,
                    begin: Lsn(0x16D3FD8),
                    end: Lsn(0x2000000),
                },
                TimelineHistoryEntry {
                    tli: 3,
                    begin: Lsn(0x2000000),
                    end: Lsn::INVALID,
                },
            ]
        );
    }

    #[test]
    fn parse_errors() {
        assert!(parse_timeline_history("bogus\t0/0\tx", 2)
            .unwrap_err()
            .to_string()
            .contains("numeric timeline ID"));
        assert!(parse_timeline_history("1\tnotanlsn\tx", 2)
            .unwrap_err()
            .to_string()
            .contains("switchpoint location"));
        // decreasing timeline ids
        assert!(parse_timeline_history("2\t0/1000000\tx\n1\t0/2000000\ty", 3)
            .unwrap_err()
            .to_string()
            .contains("increasing sequence"));
        // history must end before the current timeline
        assert!(parse_timeline_history("5\t0/1000000\tx", 5)
            .unwrap_err()
            .to_string()
            .contains("less than the current timeline"));
    }

    #[test]
    fn ancestor_search() {
        let text = "1\t0/16D3FD8\tx\n2\t0/2000000\ty\n";
        let history = parse_timeline_history(text, 4).unwrap();

        assert_eq!(
            find_common_ancestor(&history, 1).unwrap(),
            (Lsn(0x16D3FD8), 1)
        );
        assert_eq!(
            find_common_ancestor(&history, 2).unwrap(),
            (Lsn(0x2000000), 2)
        );
        assert!(find_common_ancestor(&history, 7)
            .unwrap_err()
            .to_string()
            .contains("common ancestor"));
    }

    #[test]
    fn timeline_1_synthesized() {
        let history = timeline_1_history();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].tli, 1);
        assert!(!history[0].end.is_valid());
    }
}
