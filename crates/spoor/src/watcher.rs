//! Configuration file watcher.
//!
//! A polling thread observes mtime/size/existence of the resolved config
//! path. Any change triggers a re-parse off the hit path; a parse
//! failure (or the file disappearing) leaves the installed configuration
//! in force. Polling keeps the watcher dependency-free and portable; the
//! period is coarse because config edits are human-paced.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::{debug, warn};

use crate::dispatcher::Dispatcher;

const POLL_PERIOD: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileState {
    Missing,
    Present { mtime: Option<SystemTime>, len: u64 },
}

fn observe(path: &std::path::Path) -> FileState {
    match std::fs::metadata(path) {
        Ok(meta) => FileState::Present {
            mtime: meta.modified().ok(),
            len: meta.len(),
        },
        Err(_) => FileState::Missing,
    }
}

pub(crate) struct WatcherHandle {
    stop: Arc<AtomicBool>,
}

impl Drop for WatcherHandle {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
    }
}

pub(crate) fn spawn(dispatcher: &'static Dispatcher, path: PathBuf) -> WatcherHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();

    std::thread::Builder::new()
        .name("spoor-config-watcher".into())
        .spawn(move || {
            let mut last = observe(&path);
            while !stop_flag.load(Ordering::Relaxed) {
                std::thread::sleep(POLL_PERIOD);
                let current = observe(&path);
                if current == last {
                    continue;
                }
                last = current;

                match current {
                    FileState::Missing => {
                        // Last-known-good configuration stays in force.
                        debug!(path = %path.display(), "configuration file disappeared");
                    }
                    FileState::Present { .. } => match dispatcher.reload_configuration(&path) {
                        Ok(generation) => {
                            debug!(path = %path.display(), generation, "configuration reloaded")
                        }
                        Err(e) => {
                            warn!(path = %path.display(), %e, "configuration reload failed, keeping previous")
                        }
                    },
                }
            }
        })
        .expect("spawn config watcher thread");

    WatcherHandle { stop }
}
