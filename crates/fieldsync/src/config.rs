use crate::watcher::WatcherConfig;
use std::path::PathBuf;

/// Field edited when the user does not name one.
pub const DEFAULT_FIELD: &str = "arch_base";

/// Field whose path, when set, supplies the scratch file extension.
pub const DEFAULT_EXTENSION_FIELD: &str = "arch_fs";

/// Engine settings.
///
/// # Example
///
/// ```rust
/// use fieldsync::SyncConfig;
///
/// let config = SyncConfig::new()
///     .with_default_field("arch_db")
///     .with_scratch_root("./edit_files");
/// assert_eq!(config.default_field, "arch_db");
/// ```
#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub default_field: String,
    pub extension_field: String,
    /// Fixed scratch root; a temporary directory is used when `None`.
    pub scratch_root: Option<PathBuf>,
    /// Skip pushes whose content equals the last successful push.
    pub skip_unchanged: bool,
    pub watcher: WatcherConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl SyncConfig {
    pub fn new() -> Self {
        Self {
            default_field: DEFAULT_FIELD.to_string(),
            extension_field: DEFAULT_EXTENSION_FIELD.to_string(),
            scratch_root: None,
            skip_unchanged: true,
            watcher: WatcherConfig::default(),
        }
    }

    pub fn with_default_field(mut self, field: impl Into<String>) -> Self {
        self.default_field = field.into();
        self
    }

    pub fn with_extension_field(mut self, field: impl Into<String>) -> Self {
        self.extension_field = field.into();
        self
    }

    pub fn with_scratch_root<P: Into<PathBuf>>(mut self, root: P) -> Self {
        self.scratch_root = Some(root.into());
        self
    }

    pub fn with_skip_unchanged(mut self, skip: bool) -> Self {
        self.skip_unchanged = skip;
        self
    }

    pub fn with_watcher(mut self, watcher: WatcherConfig) -> Self {
        self.watcher = watcher;
        self
    }
}
