//! TCP ingest listener.
//!
//! One task per accepted connection. Each connection owns a sentinel
//! framer whose buffer persists across reads, so entries may straddle
//! read boundaries; the trailing slice is decoded at EOF. A slice that
//! fails to decode or store is logged and dropped; the connection (and
//! the daemon) carry on.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use spoor_wire::{decode_entry, Framer};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::db::{feed_entry, Db};

/// Grace period for in-flight connections after a shutdown signal.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(3);

const READ_BUFFER_BYTES: usize = 64 * 1024;

/// Broadcast to interested parties after each stored entry.
#[derive(Debug, Clone)]
pub struct EntryStored {
    pub trace_entry_id: i64,
    pub process_name: String,
    pub pid: u32,
    pub tid: u32,
}

#[derive(Clone)]
pub struct CollectorState {
    db: Arc<Db>,
    entry_stored: broadcast::Sender<EntryStored>,
}

impl CollectorState {
    pub fn new(db_path: PathBuf) -> Self {
        let (entry_stored, _) = broadcast::channel(256);
        Self {
            db: Arc::new(Db::new(db_path)),
            entry_stored,
        }
    }

    pub fn db(&self) -> &Db {
        &self.db
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EntryStored> {
        self.entry_stored.subscribe()
    }
}

/// Accept loop. Returns once `shutdown` flips, after giving in-flight
/// connections a bounded grace period to finish their transactions.
pub async fn run_acceptor(
    listener: TcpListener,
    state: CollectorState,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    info!(%addr, "trace connection accepted");
                    let state = state.clone();
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(stream, state, shutdown).await {
                            error!(%addr, %e, "trace connection error");
                        }
                    });
                }
                Err(e) => error!(%e, "TCP accept failed"),
            },
            _ = shutdown.changed() => break,
        }
        // Reap finished connection tasks as we go.
        while connections.try_join_next().is_some() {}
    }

    drop(listener);
    let drain = async {
        while connections.join_next().await.is_some() {}
    };
    if tokio::time::timeout(SHUTDOWN_GRACE, drain).await.is_err() {
        warn!(
            grace_secs = SHUTDOWN_GRACE.as_secs(),
            "shutdown grace elapsed with connections still active"
        );
        connections.abort_all();
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    state: CollectorState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), String> {
    let mut framer = Framer::new();
    let mut buf = vec![0u8; READ_BUFFER_BYTES];

    loop {
        let read = tokio::select! {
            read = stream.read(&mut buf) => read.map_err(|e| format!("read trace stream: {e}"))?,
            _ = shutdown.changed() => break,
        };
        if read == 0 {
            break; // EOF
        }
        for slice in framer.push(&buf[..read]) {
            store_slice(&state, slice).await;
        }
    }

    // The stream ends without a final sentinel; whatever is buffered is
    // the last entry.
    if let Some(tail) = framer.finish() {
        store_slice(&state, tail).await;
    }
    debug!("trace connection closed");
    Ok(())
}

/// Decode and store one framed slice. Failures affect only this slice.
async fn store_slice(state: &CollectorState, slice: Vec<u8>) {
    let entry = match decode_entry(&slice) {
        Ok(entry) => entry,
        Err(e) => {
            warn!(%e, slice_bytes = slice.len(), "dropping undecodable entry slice");
            return;
        }
    };

    let db = state.db.clone();
    let stored = tokio::task::spawn_blocking(move || {
        let mut conn = db.open()?;
        let trace_entry_id = feed_entry(&mut conn, &entry).map_err(|e| e.to_string())?;
        Ok::<_, String>(EntryStored {
            trace_entry_id,
            process_name: entry.process_name,
            pid: entry.pid,
            tid: entry.tid,
        })
    })
    .await
    .map_err(|e| format!("feeder task: {e}"))
    .and_then(|inner| inner);

    match stored {
        Ok(notice) => {
            debug!(
                trace_entry_id = notice.trace_entry_id,
                process_name = %notice.process_name,
                "trace entry stored"
            );
            // Nobody listening is fine.
            let _ = state.entry_stored.send(notice);
        }
        Err(e) => warn!(%e, "failed to store trace entry"),
    }
}
