//! Shared helpers for the rewind tool crates.

/// Tracing subscriber bootstrap.
pub mod logging;
/// Postgres log sequence numbers.
pub mod lsn;
