use std::path::{Path, PathBuf};

use rusqlite::Connection;

mod feeder;
mod schema;

pub use feeder::{feed_entry, FeedError};
pub use schema::init_schema;

/// Handle to the trace database file. Workers open their own
/// connections; SQLite in WAL mode arbitrates.
#[derive(Debug, Clone)]
pub struct Db {
    path: PathBuf,
}

impl Db {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn open(&self) -> Result<Connection, String> {
        Connection::open(&self.path).map_err(|error| format!("open trace database: {error}"))
    }
}
