//! Serialized pushes from a scratch file to the remote field.
//!
//! One [`Pusher`] task runs per session. At most one `write_field` call is in
//! flight at a time. Change events that arrive meanwhile are folded into a
//! single pending slot, and the file is only read when that slot is served,
//! so the push that follows always carries the newest content.

use crate::error::{StoreError, SyncError};
use crate::reference::RecordReference;
use crate::report::SyncReport;
use crate::store::FieldStore;
use crate::watcher::ChangeEvent;
use chrono::Local;
use similar::{ChangeTag, TextDiff};
use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};

/// Holds at most one change waiting for the in-flight push to finish.
#[derive(Debug, Default)]
pub(crate) struct PendingSlot {
    event: Option<ChangeEvent>,
    coalesced: usize,
}

impl PendingSlot {
    /// Stores `event`, replacing whatever was waiting.
    pub(crate) fn offer(&mut self, event: ChangeEvent) {
        if self.event.replace(event).is_some() {
            self.coalesced += 1;
        }
    }

    pub(crate) fn take(&mut self) -> Option<ChangeEvent> {
        self.event.take()
    }

    /// Events that were superseded before being served.
    pub(crate) fn coalesced(&self) -> usize {
        self.coalesced
    }
}

pub(crate) struct Pusher {
    store: Arc<dyn FieldStore>,
    reference: RecordReference,
    path: PathBuf,
    generation: u64,
    in_flight: Arc<AtomicBool>,
    reports: broadcast::Sender<SyncReport>,
    skip_unchanged: bool,
    last_pushed: Option<String>,
}

impl Pusher {
    pub(crate) fn new(
        store: Arc<dyn FieldStore>,
        reference: RecordReference,
        path: PathBuf,
        generation: u64,
        reports: broadcast::Sender<SyncReport>,
    ) -> Self {
        Self {
            store,
            reference,
            path,
            generation,
            in_flight: Arc::new(AtomicBool::new(false)),
            reports,
            skip_unchanged: true,
            last_pushed: None,
        }
    }

    /// Content known to be on the remote side already.
    pub(crate) fn with_last_pushed(mut self, content: String) -> Self {
        self.last_pushed = Some(content);
        self
    }

    pub(crate) fn with_skip_unchanged(mut self, skip: bool) -> Self {
        self.skip_unchanged = skip;
        self
    }

    /// Set while a `write_field` call is outstanding.
    pub(crate) fn in_flight(&self) -> Arc<AtomicBool> {
        self.in_flight.clone()
    }

    /// Serves events until the watcher side of `events` is closed, then
    /// finishes whatever is still pending.
    pub(crate) async fn run(mut self, mut events: mpsc::Receiver<ChangeEvent>) {
        let mut slot = PendingSlot::default();
        let mut open = true;

        loop {
            let event = match slot.take() {
                Some(event) => event,
                None if open => match events.recv().await {
                    Some(event) => event,
                    None => break,
                },
                None => break,
            };
            if event.generation != self.generation || event.path != self.path {
                debug!(
                    generation = event.generation,
                    "ignoring change event from another session"
                );
                continue;
            }

            let push = self.push_latest();
            tokio::pin!(push);
            loop {
                tokio::select! {
                    biased;
                    () = &mut push => break,
                    received = events.recv(), if open => match received {
                        Some(event) => slot.offer(event),
                        None => open = false,
                    },
                }
            }
        }

        if slot.coalesced() > 0 {
            debug!(
                reference = %self.reference,
                coalesced = slot.coalesced(),
                "change events folded into later pushes"
            );
        }
    }

    async fn push_latest(&mut self) {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Late event for a file that was disposed or is mid-rename.
                debug!(path = %self.path.display(), "scratch file gone, ignoring change");
                return;
            }
            Err(e) => {
                self.fail(StoreError::Transport(Box::new(e)));
                return;
            }
        };

        if self.skip_unchanged && self.last_pushed.as_deref() == Some(content.as_str()) {
            debug!(reference = %self.reference, "content unchanged, skipping push");
            let _ = self.reports.send(SyncReport::PushSkipped {
                reference: self.reference.clone(),
            });
            return;
        }

        self.in_flight.store(true, Ordering::SeqCst);
        let result = self
            .store
            .write_field(
                self.reference.entity_type(),
                self.reference.entity_id(),
                self.reference.field_name(),
                &content,
            )
            .await;
        self.in_flight.store(false, Ordering::SeqCst);

        match result {
            Ok(true) => {
                let lines_changed =
                    changed_lines(self.last_pushed.as_deref().unwrap_or(""), &content);
                info!(
                    reference = %self.reference,
                    bytes = content.len(),
                    lines_changed,
                    "record updated"
                );
                let _ = self.reports.send(SyncReport::Pushed {
                    reference: self.reference.clone(),
                    bytes: content.len(),
                    lines_changed,
                    at: Local::now(),
                });
                self.last_pushed = Some(content);
            }
            Ok(false) => self.fail(StoreError::Rejected),
            Err(e) => self.fail(e),
        }
    }

    fn fail(&self, source: StoreError) {
        let err = SyncError::RemotePush {
            reference: self.reference.clone(),
            source,
        };
        warn!("{}", err);
        let _ = self.reports.send(SyncReport::PushFailed {
            reference: self.reference.clone(),
            error: err.to_string(),
        });
    }
}

fn changed_lines(old: &str, new: &str) -> usize {
    TextDiff::from_lines(old, new)
        .iter_all_changes()
        .filter(|change| change.tag() != ChangeTag::Equal)
        .count()
}
