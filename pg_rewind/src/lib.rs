//!
//! pg_rewind resynchronizes a data directory that has diverged from a new
//! primary, without copying the whole cluster over: it figures out where the
//! histories forked, which data pages the old primary changed after that
//! point, and rewrites just enough of the data directory that the cluster can
//! rejoin the new primary's timeline by replaying its WAL.
//!
//! The overall flow, driven by [`rewind::run`]:
//!   1. digest both clusters' control files and cross-check them,
//!   2. locate the divergence point in the source's timeline history,
//!   3. replay the target's own WAL from the last common checkpoint to
//!      collect every page it changed after the fork,
//!   4. join the source and target file inventories with the page set into a
//!      per-path action plan,
//!   5. apply the plan through a fetch backend (local directory or live
//!      server) onto the target.
//!
pub mod datapagemap;
pub mod fetch;
pub mod filemap;
pub mod libpq_source;
pub mod local_source;
pub mod parsexlog;
pub mod rewind;
pub mod target;
pub mod timeline;

pub use fetch::FileReadError;
pub use rewind::{run, RewindOptions, RewindOutcome};
