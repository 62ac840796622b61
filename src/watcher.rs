//! Watches the service directory and requests rescans.
//!
//! The watcher only ever emits `Event::Rescan`; the loader owns the actual
//! diff. Changes are debounced so a package manager dropping a batch of
//! service files triggers one reconcile, not one per file.

use std::path::Path;
use std::time::{Duration, Instant};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::supervisor::Event;
use crate::Result;

pub struct DirWatcher {
    /// Kept alive for the daemon's lifetime; dropping it stops the watch.
    _watcher: RecommendedWatcher,
}

impl DirWatcher {
    /// Start watching `dir`, forwarding debounced rescan requests into the
    /// supervisor's event channel.
    pub fn start(
        dir: &Path,
        debounce: Duration,
        events: mpsc::UnboundedSender<Event>,
    ) -> Result<Self> {
        let (tx, mut rx) = mpsc::channel(100);

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<notify::Event, notify::Error>| {
                let _ = tx.blocking_send(res);
            },
            notify::Config::default(),
        )?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        debug!(dir = %dir.display(), "watching service directory");

        tokio::spawn(async move {
            let mut last_emit: Option<Instant> = None;
            while let Some(res) = rx.recv().await {
                match res {
                    Ok(event) => {
                        if !is_relevant(&event) {
                            continue;
                        }
                        let now = Instant::now();
                        if let Some(last) = last_emit {
                            if now.duration_since(last) < debounce {
                                continue;
                            }
                        }
                        last_emit = Some(now);
                        if events.send(Event::Rescan).is_err() {
                            break;
                        }
                    }
                    Err(err) => {
                        warn!(%err, "service directory watch error");
                    }
                }
            }
        });

        Ok(DirWatcher { _watcher: watcher })
    }
}

/// Creations, removals, renames, and content changes all alter the set of
/// service entries; metadata-only events (access times) do not.
fn is_relevant(event: &notify::Event) -> bool {
    event.kind.is_create() || event.kind.is_remove() || event.kind.is_modify()
}
