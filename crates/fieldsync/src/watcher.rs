//! Scratch file watcher
//!
//! Event-driven watching of a single file with the `notify` crate, plus an
//! optional periodic check of the file's modification stamp for platforms or
//! filesystems where events go missing.

use crate::error::{Result, SyncError};
use notify::event::ModifyKind;
use notify::{Event, EventKind, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tokio::sync::mpsc;
use tokio::time::{Interval, MissedTickBehavior};
use tracing::{debug, trace};

/// Configuration for the change watcher
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    /// Quiet period after the last filesystem event before a change is emitted
    pub debounce: Duration,
    /// Fallback stamp check interval; `None` relies on filesystem events only
    pub poll_interval: Option<Duration>,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_millis(50),
            poll_interval: Some(Duration::from_secs(2)),
        }
    }
}

/// The watched file's content may have changed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeEvent {
    pub path: PathBuf,
    /// Session the watcher was started for.
    pub generation: u64,
}

/// Watches one file and reports content changes.
pub struct ChangeWatcher {
    path: PathBuf,
    generation: u64,
    config: WatcherConfig,
}

impl ChangeWatcher {
    pub fn new(path: PathBuf, generation: u64, config: Option<WatcherConfig>) -> Self {
        Self {
            path,
            generation,
            config: config.unwrap_or_default(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Starts watching and sends a [`ChangeEvent`] to `tx` after each settled
    /// burst of modifications. Must be called from within a tokio runtime.
    ///
    /// The parent directory is watched (editors that save by renaming a new
    /// file into place would otherwise detach a file-level watch) and events
    /// are filtered down to the exact path.
    pub fn start(self, tx: mpsc::Sender<ChangeEvent>) -> Result<WatcherHandle> {
        let watch_start = |source: notify::Error| SyncError::WatchStart {
            path: self.path.clone(),
            source,
        };
        let parent = self
            .path
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| watch_start(notify::Error::path_not_found()))?;

        // Event paths come back canonical on some platforms (/private/var on macOS).
        let targets = watch_targets(&self.path);

        // Capacity 1: a pending notification already means "go look".
        let (raw_tx, mut raw_rx) = mpsc::channel::<()>(1);
        let mut watcher =
            notify::recommended_watcher(move |res: std::result::Result<Event, notify::Error>| {
                match res {
                    Ok(event) => {
                        if is_content_change(&event.kind)
                            && event.paths.iter().any(|p| targets.contains(p))
                        {
                            let _ = raw_tx.try_send(());
                        }
                    }
                    Err(e) => debug!("watch error: {}", e),
                }
            })
            .map_err(watch_start)?;
        watcher
            .watch(&parent, RecursiveMode::NonRecursive)
            .map_err(watch_start)?;

        let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
        let path = self.path.clone();
        let generation = self.generation;
        let debounce = self.config.debounce;
        let mut poll = self.config.poll_interval.map(|period| {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            interval
        });

        let task = tokio::spawn(async move {
            // Owned by the loop so the OS watch is released when it ends.
            let _watcher = watcher;
            let mut last_stamp = file_stamp(&path);

            loop {
                tokio::select! {
                    _ = stop_rx.recv() => break,

                    Some(()) = raw_rx.recv() => {
                        if !settle(&mut raw_rx, &mut stop_rx, debounce).await {
                            break;
                        }
                        last_stamp = file_stamp(&path);
                        trace!(path = %path.display(), "change detected");
                        let event = ChangeEvent { path: path.clone(), generation };
                        if tx.send(event).await.is_err() {
                            break; // Receiver dropped
                        }
                    }

                    _ = tick(&mut poll) => {
                        let stamp = file_stamp(&path);
                        if stamp.is_some() && stamp != last_stamp {
                            last_stamp = stamp;
                            trace!(path = %path.display(), "change detected by poll");
                            let event = ChangeEvent { path: path.clone(), generation };
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                    }
                }
            }
            debug!(path = %path.display(), "watcher stopped");
        });

        Ok(WatcherHandle {
            path: self.path,
            stop_tx,
            task,
        })
    }
}

/// Handle to control a running watcher. Dropping it also stops the watcher,
/// without waiting.
pub struct WatcherHandle {
    path: PathBuf,
    stop_tx: mpsc::Sender<()>,
    task: tokio::task::JoinHandle<()>,
}

impl WatcherHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stops delivery and waits until the OS watch has been released and the
    /// event sender dropped. Nothing is delivered after this returns.
    pub async fn close(self) {
        let _ = self.stop_tx.send(()).await;
        if let Err(e) = self.task.await {
            debug!("watcher task ended abnormally: {}", e);
        }
    }
}

/// Waits until no notification arrived for `debounce`. Returns `false` when
/// asked to stop meanwhile.
async fn settle(
    raw_rx: &mut mpsc::Receiver<()>,
    stop_rx: &mut mpsc::Receiver<()>,
    debounce: Duration,
) -> bool {
    loop {
        tokio::select! {
            _ = stop_rx.recv() => return false,
            more = raw_rx.recv() => {
                if more.is_none() {
                    return true;
                }
            }
            _ = tokio::time::sleep(debounce) => return true,
        }
    }
}

async fn tick(poll: &mut Option<Interval>) {
    match poll {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn is_content_change(kind: &EventKind) -> bool {
    match kind {
        EventKind::Modify(ModifyKind::Metadata(_)) => false,
        EventKind::Modify(_) | EventKind::Create(_) => true,
        _ => false,
    }
}

fn watch_targets(path: &Path) -> Vec<PathBuf> {
    let mut targets = vec![path.to_path_buf()];
    if let Some(canonical) = path
        .parent()
        .and_then(|parent| parent.canonicalize().ok())
        .zip(path.file_name())
        .map(|(parent, name)| parent.join(name))
        && canonical != targets[0]
    {
        targets.push(canonical);
    }
    targets
}

fn file_stamp(path: &Path) -> Option<(SystemTime, u64)> {
    let meta = std::fs::metadata(path).ok()?;
    Some((meta.modified().ok()?, meta.len()))
}
