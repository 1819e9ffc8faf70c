//! Output sinks: where serialized payloads go.
//!
//! The dispatcher holds exactly one sink behind a mutex and calls it
//! synchronously from hit threads, so a sink write must be bounded. The
//! TCP sink therefore hands payloads to a background connector thread
//! through a bounded queue and drops entries when the peer is away or
//! the queue is full; `visit` never blocks on the network.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::net::TcpStream;
use std::path::PathBuf;
use std::sync::mpsc;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    Io {
        context: &'static str,
        message: String,
    },
    /// The TCP sink's bounded queue was full; the payload was dropped.
    BufferFull,
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io { context, message } => write!(f, "{context}: {message}"),
            Self::BufferFull => write!(f, "send buffer full, payload dropped"),
        }
    }
}

impl std::error::Error for SinkError {}

pub trait Output: Send {
    fn write(&mut self, payload: &[u8]) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Line-buffered standard output.
#[derive(Debug, Default)]
pub struct StdoutOutput;

impl StdoutOutput {
    pub fn new() -> Self {
        Self
    }
}

impl Output for StdoutOutput {
    fn write(&mut self, payload: &[u8]) -> Result<(), SinkError> {
        let stdout = std::io::stdout();
        let mut lock = stdout.lock();
        lock.write_all(payload).map_err(|e| SinkError::Io {
            context: "write to stdout",
            message: e.to_string(),
        })?;
        if payload.ends_with(b"\n") {
            lock.flush().map_err(|e| SinkError::Io {
                context: "flush stdout",
                message: e.to_string(),
            })?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        std::io::stdout().flush().map_err(|e| SinkError::Io {
            context: "flush stdout",
            message: e.to_string(),
        })
    }
}

/// Append-mode file sink. Reopens the file when the inode under the
/// path changes (log rotation), best-effort.
pub struct FileOutput {
    path: PathBuf,
    append: bool,
    file: Option<File>,
    #[cfg(unix)]
    inode: u64,
}

impl FileOutput {
    pub fn new(path: PathBuf, append: bool) -> Self {
        Self {
            path,
            append,
            file: None,
            #[cfg(unix)]
            inode: 0,
        }
    }

    fn open(&mut self) -> Result<(), SinkError> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(self.append)
            .truncate(!self.append)
            .open(&self.path)
            .map_err(|e| SinkError::Io {
                context: "open trace file",
                message: format!("{}: {e}", self.path.display()),
            })?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            self.inode = file.metadata().map(|m| m.ino()).unwrap_or(0);
        }
        self.file = Some(file);
        Ok(())
    }

    fn reopen_if_rotated(&mut self) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            let current = std::fs::metadata(&self.path).map(|m| m.ino()).unwrap_or(0);
            if self.file.is_some() && current != self.inode {
                debug!(path = %self.path.display(), "trace file rotated, reopening");
                self.file = None;
            }
        }
    }
}

impl Output for FileOutput {
    fn write(&mut self, payload: &[u8]) -> Result<(), SinkError> {
        self.reopen_if_rotated();
        if self.file.is_none() {
            self.open()?;
        }
        let file = self
            .file
            .as_mut()
            .expect("invariant violated: file is open after open()");
        file.write_all(payload).map_err(|e| SinkError::Io {
            context: "write trace file",
            message: e.to_string(),
        })
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        if let Some(file) = self.file.as_mut() {
            file.flush().map_err(|e| SinkError::Io {
                context: "flush trace file",
                message: e.to_string(),
            })?;
        }
        Ok(())
    }
}

const TCP_QUEUE_DEPTH: usize = 1024;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const BACKOFF_INITIAL: Duration = Duration::from_millis(100);
const BACKOFF_CAP: Duration = Duration::from_secs(30);

enum TcpCommand {
    Payload(Vec<u8>),
    Flush(mpsc::SyncSender<()>),
}

/// TCP sink: payloads go to a connector thread over a bounded queue.
/// While the peer is unreachable the thread reconnects with exponential
/// backoff (100 ms doubling to a 30 s cap, ±20 % jitter) and everything
/// handed to it is dropped.
pub struct TcpOutput {
    tx: mpsc::SyncSender<TcpCommand>,
}

impl TcpOutput {
    pub fn new(host: &str, port: u16) -> Self {
        let (tx, rx) = mpsc::sync_channel(TCP_QUEUE_DEPTH);
        let addr = format!("{host}:{port}");
        std::thread::Builder::new()
            .name("spoor-tcp-sink".into())
            .spawn(move || connector_loop(&addr, rx))
            .expect("spawn tcp sink thread");
        Self { tx }
    }
}

impl Output for TcpOutput {
    fn write(&mut self, payload: &[u8]) -> Result<(), SinkError> {
        match self.tx.try_send(TcpCommand::Payload(payload.to_vec())) {
            Ok(()) => Ok(()),
            Err(mpsc::TrySendError::Full(_)) => Err(SinkError::BufferFull),
            Err(mpsc::TrySendError::Disconnected(_)) => Err(SinkError::Io {
                context: "tcp sink thread",
                message: "connector thread is gone".into(),
            }),
        }
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        if self.tx.try_send(TcpCommand::Flush(ack_tx)).is_err() {
            return Ok(()); // queue full or thread gone: nothing to wait for
        }
        let _ = ack_rx.recv_timeout(Duration::from_secs(1));
        Ok(())
    }
}

fn connector_loop(addr: &str, rx: mpsc::Receiver<TcpCommand>) {
    let mut stream: Option<TcpStream> = None;
    let mut backoff = BACKOFF_INITIAL;
    let mut dropped: u64 = 0;

    loop {
        if stream.is_none() {
            match try_connect(addr) {
                Some(connected) => {
                    debug!(%addr, dropped, "trace collector connected");
                    stream = Some(connected);
                    backoff = BACKOFF_INITIAL;
                }
                None => {
                    // Keep draining while waiting out the backoff so the
                    // bounded queue keeps accepting (and dropping) fresh
                    // payloads instead of filling up.
                    let deadline = std::time::Instant::now() + jittered(backoff);
                    loop {
                        let remaining =
                            deadline.saturating_duration_since(std::time::Instant::now());
                        if remaining.is_zero() {
                            break;
                        }
                        match rx.recv_timeout(remaining) {
                            Ok(TcpCommand::Payload(_)) => dropped += 1,
                            Ok(TcpCommand::Flush(ack)) => drop(ack),
                            Err(mpsc::RecvTimeoutError::Timeout) => break,
                            Err(mpsc::RecvTimeoutError::Disconnected) => return,
                        }
                    }
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                    continue;
                }
            }
        }

        match rx.recv() {
            Ok(TcpCommand::Payload(payload)) => {
                let connected = stream
                    .as_mut()
                    .expect("invariant violated: connected before entering send state");
                if let Err(e) = connected.write_all(&payload) {
                    warn!(%addr, %e, "trace collector connection lost");
                    stream = None;
                    dropped += 1;
                }
            }
            Ok(TcpCommand::Flush(ack)) => {
                if let Some(connected) = stream.as_mut() {
                    let _ = connected.flush();
                }
                drop(ack); // receiver unblocks on channel close
            }
            Err(mpsc::RecvError) => return, // sink dropped
        }
    }
}

fn try_connect(addr: &str) -> Option<TcpStream> {
    use std::net::ToSocketAddrs;
    let resolved = addr.to_socket_addrs().ok()?.next()?;
    let stream = TcpStream::connect_timeout(&resolved, CONNECT_TIMEOUT).ok()?;
    stream.set_nodelay(true).ok();
    Some(stream)
}

fn jittered(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    base.mul_f64(factor)
}
