//! Collector daemon library: TCP ingest plus the SQLite feeder.
//!
//! The binary in `main.rs` wires these together; `spoor-import` reuses
//! the schema and feeder for its one-shot XML conversion.

pub mod db;
pub mod tcp;

pub use db::{feed_entry, init_schema, Db, FeedError};
pub use tcp::{run_acceptor, CollectorState, EntryStored};

/// Default ingest port, shared with the hook library's TCP sink.
pub const DEFAULT_PORT: u16 = 12382;
