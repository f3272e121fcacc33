#![doc = include_str!("../README.md")]

pub mod config;
pub mod error;
mod push;
pub mod reference;
pub mod report;
pub mod scratch;
pub mod session;
pub mod store;
pub mod watcher;

pub use config::{DEFAULT_EXTENSION_FIELD, DEFAULT_FIELD, SyncConfig};
pub use error::{Result, StoreError, StoreResult, SyncError};
pub use reference::{RecordReference, resolve};
pub use report::SyncReport;
pub use scratch::{
    ExtensionResolver, FixedExtension, ScratchDir, ScratchFile, choose_extension, snake_case,
};
pub use session::{SessionState, SyncEngine, SyncSession};
pub use store::{FieldStore, MemoryStore, RemoteRecord, WriteCall};
pub use watcher::{ChangeEvent, ChangeWatcher, WatcherConfig, WatcherHandle};
