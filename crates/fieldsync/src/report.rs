//! Outcomes broadcast by a running [`SyncEngine`](crate::SyncEngine).

use crate::reference::RecordReference;
use chrono::{DateTime, Local};
use std::fmt;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub enum SyncReport {
    /// A session is live and its scratch file is being watched.
    Watching {
        reference: RecordReference,
        path: PathBuf,
    },
    /// The remote field now holds the scratch file's content.
    Pushed {
        reference: RecordReference,
        bytes: usize,
        lines_changed: usize,
        at: DateTime<Local>,
    },
    /// The file changed on disk but its content equals the last push.
    PushSkipped { reference: RecordReference },
    /// The push failed; the next save retries.
    PushFailed {
        reference: RecordReference,
        error: String,
    },
    /// The session was torn down and its scratch file removed.
    Closed { reference: RecordReference },
}

impl SyncReport {
    pub fn reference(&self) -> &RecordReference {
        match self {
            SyncReport::Watching { reference, .. }
            | SyncReport::Pushed { reference, .. }
            | SyncReport::PushSkipped { reference }
            | SyncReport::PushFailed { reference, .. }
            | SyncReport::Closed { reference } => reference,
        }
    }
}

impl fmt::Display for SyncReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncReport::Watching { reference, path } => {
                write!(f, "Watching {} at {}", reference, path.display())
            }
            SyncReport::Pushed {
                reference,
                bytes,
                lines_changed,
                at,
            } => write!(
                f,
                "[{}] Record updated: {} ({} bytes, {} line{} changed)",
                at.format("%H:%M:%S"),
                reference,
                bytes,
                lines_changed,
                if *lines_changed == 1 { "" } else { "s" }
            ),
            SyncReport::PushSkipped { reference } => {
                write!(f, "No changes to push for {}", reference)
            }
            SyncReport::PushFailed { reference, error } => {
                write!(f, "Failed to update {}: {}", reference, error)
            }
            SyncReport::Closed { reference } => write!(f, "Stopped watching {}", reference),
        }
    }
}
