//! Sync sessions and the engine that owns them.

use crate::config::SyncConfig;
use crate::error::{Result, StoreError, SyncError};
use crate::push::Pusher;
use crate::reference::{self, RecordReference};
use crate::report::SyncReport;
use crate::scratch::{self, ExtensionResolver, ScratchDir, ScratchFile};
use crate::store::FieldStore;
use crate::watcher::{ChangeWatcher, WatcherHandle};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Where the engine is in a session's lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Resolving,
    Fetching,
    Watching,
    /// Watching, with a write to the remote store in flight.
    Pushing,
    Closing,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::Resolving => "resolving",
            SessionState::Fetching => "fetching",
            SessionState::Watching => "watching",
            SessionState::Pushing => "pushing",
            SessionState::Closing => "closing",
        };
        f.write_str(name)
    }
}

/// One live binding between a remote field, its scratch file and a watcher.
///
/// Sessions are never modified once started; switching records tears the
/// current one down completely and builds a new one.
pub struct SyncSession {
    reference: RecordReference,
    generation: u64,
    watcher: WatcherHandle,
    pusher: JoinHandle<()>,
    in_flight: Arc<AtomicBool>,
    scratch: ScratchFile,
}

impl SyncSession {
    pub fn reference(&self) -> &RecordReference {
        &self.reference
    }

    pub fn scratch_file(&self) -> &ScratchFile {
        &self.scratch
    }

    pub fn path(&self) -> &Path {
        self.scratch.path()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_pushing(&self) -> bool {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Watcher first, so no event can arrive for a file about to disappear;
    /// then the push task, which finishes a push already in flight plus any
    /// change queued before the watcher stopped; then the file.
    async fn teardown(mut self) -> Result<()> {
        self.watcher.close().await;
        if let Err(e) = self.pusher.await {
            warn!(reference = %self.reference, "push task ended abnormally: {}", e);
        }
        self.scratch.dispose()
    }
}

impl fmt::Debug for SyncSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncSession")
            .field("reference", &self.reference)
            .field("generation", &self.generation)
            .field("path", &self.scratch.path())
            .finish()
    }
}

/// Drives at most one [`SyncSession`] at a time.
///
/// # Example
///
/// ```rust,no_run
/// use fieldsync::{FixedExtension, MemoryStore, RemoteRecord, SyncConfig, SyncEngine};
/// use std::sync::Arc;
///
/// # async fn run() -> fieldsync::Result<()> {
/// let store = MemoryStore::new().with_record(
///     "ir.ui.view",
///     288,
///     RemoteRecord::default().with_field("arch_base", "<template/>"),
/// );
/// let mut engine = SyncEngine::new(
///     Arc::new(store),
///     Arc::new(FixedExtension::new("xml")),
///     SyncConfig::default(),
/// )?;
///
/// let session = engine
///     .open("http://localhost:8069/web#id=288&model=ir.ui.view", None)
///     .await?;
/// println!("edit {}", session.path().display());
///
/// engine.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct SyncEngine {
    store: Arc<dyn FieldStore>,
    extensions: Arc<dyn ExtensionResolver>,
    config: SyncConfig,
    state: SessionState,
    generation: u64,
    reports: broadcast::Sender<SyncReport>,
    // Declared before `scratch` so a live session is dropped (and its file
    // removed) before the scratch root goes away.
    active: Option<SyncSession>,
    scratch: ScratchDir,
}

impl SyncEngine {
    /// Creates the engine and its scratch root. Nothing touches the remote
    /// store until [`open`](Self::open).
    pub fn new(
        store: Arc<dyn FieldStore>,
        extensions: Arc<dyn ExtensionResolver>,
        config: SyncConfig,
    ) -> Result<Self> {
        let scratch = match &config.scratch_root {
            Some(root) => ScratchDir::at(root),
            None => ScratchDir::temporary()?,
        };
        let (reports, _) = broadcast::channel(64);
        Ok(Self {
            store,
            extensions,
            config,
            state: SessionState::Idle,
            generation: 0,
            reports,
            active: None,
            scratch,
        })
    }

    /// Receives every [`SyncReport`] emitted from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncReport> {
        self.reports.subscribe()
    }

    pub fn state(&self) -> SessionState {
        match (&self.active, self.state) {
            (Some(session), SessionState::Watching) if session.is_pushing() => {
                SessionState::Pushing
            }
            (_, state) => state,
        }
    }

    pub fn active(&self) -> Option<&SyncSession> {
        self.active.as_ref()
    }

    pub fn scratch_root(&self) -> &Path {
        self.scratch.root()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Starts a session for `locator`, editing `field` (or the configured
    /// default field).
    ///
    /// A session that is already running is closed first, and its file is gone
    /// before the new one is written. On error the engine is left idle and the
    /// caller may simply try again.
    pub async fn open(&mut self, locator: &str, field: Option<&str>) -> Result<&SyncSession> {
        self.close().await?;

        match self.start_session(locator, field).await {
            Ok(session) => {
                self.state = SessionState::Watching;
                Ok(self.active.insert(session))
            }
            Err(e) => {
                self.state = SessionState::Idle;
                warn!(locator, state = %SessionState::Idle, "session not started: {}", e);
                Err(e)
            }
        }
    }

    /// Closes the current session, if any, and opens one for `locator`.
    pub async fn switch_to(&mut self, locator: &str, field: Option<&str>) -> Result<&SyncSession> {
        if let Some(session) = &self.active {
            info!(from = %session.reference(), "switching record");
        }
        self.open(locator, field).await
    }

    /// Stops watching and removes the scratch file. No-op when idle.
    ///
    /// A close or open that was cancelled midway leaves no active session but
    /// a stale state; calling this again resets it to `Idle`.
    pub async fn close(&mut self) -> Result<()> {
        let Some(session) = self.active.take() else {
            self.state = SessionState::Idle;
            return Ok(());
        };
        self.state = SessionState::Closing;
        let reference = session.reference().clone();
        let result = session.teardown().await;
        self.state = SessionState::Idle;

        info!(reference = %reference, "session closed");
        let _ = self.reports.send(SyncReport::Closed { reference });
        result
    }

    async fn start_session(&mut self, locator: &str, field: Option<&str>) -> Result<SyncSession> {
        self.state = SessionState::Resolving;
        let field = field.unwrap_or(&self.config.default_field);
        let reference = reference::resolve(locator, field)?;

        self.state = SessionState::Fetching;
        let record = self
            .store
            .fetch_record(reference.entity_type(), reference.entity_id())
            .await
            .map_err(|source| SyncError::RemoteFetch {
                reference: reference.clone(),
                source,
            })?
            .ok_or_else(|| SyncError::RemoteFetch {
                reference: reference.clone(),
                source: StoreError::NotFound,
            })?;
        let value = record.text(&reference)?;

        let extension = scratch::choose_extension(
            &reference,
            &record,
            &self.config.extension_field,
            self.extensions.as_ref(),
        )
        .await?;
        let display_name = record
            .display_name()
            .unwrap_or(reference.entity_type())
            .to_string();
        let mut scratch =
            self.scratch
                .materialize(&reference, &display_name, &extension, &value)?;

        self.generation += 1;
        let generation = self.generation;
        let (tx, rx) = mpsc::channel(16);
        let watcher = ChangeWatcher::new(
            scratch.path().to_path_buf(),
            generation,
            Some(self.config.watcher.clone()),
        );
        let watcher = match watcher.start(tx) {
            Ok(handle) => handle,
            Err(e) => {
                if let Err(dispose_err) = scratch.dispose() {
                    warn!("failed to remove scratch file after watch error: {}", dispose_err);
                }
                return Err(e);
            }
        };

        let pusher = Pusher::new(
            self.store.clone(),
            reference.clone(),
            scratch.path().to_path_buf(),
            generation,
            self.reports.clone(),
        )
        .with_skip_unchanged(self.config.skip_unchanged)
        .with_last_pushed(value);
        let in_flight = pusher.in_flight();
        let pusher = tokio::spawn(pusher.run(rx));

        info!(
            reference = %reference,
            path = %scratch.path().display(),
            "watching scratch file"
        );
        let _ = self.reports.send(SyncReport::Watching {
            reference: reference.clone(),
            path: scratch.path().to_path_buf(),
        });

        Ok(SyncSession {
            reference,
            generation,
            watcher,
            pusher,
            in_flight,
            scratch,
        })
    }
}
