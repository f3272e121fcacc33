//! Scratch files: the local, disposable copy of a remote field.
//!
//! Layout under the scratch root:
//!
//! ```text
//! <root>/<entity type>/<snake_case(name + "_" + id)>.<ext>
//! ```
//!
//! e.g. `ir_ui_view/res_partner_form_288.xml`. The same record always maps to
//! the same path. Both [`ScratchDir`] and [`ScratchFile`] clean up after
//! themselves on drop, so every exit path that unwinds removes them.

use crate::error::{Result, SyncError};
use crate::reference::RecordReference;
use crate::store::RemoteRecord;
use async_trait::async_trait;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

/// Picks an extension when the record does not declare one.
#[async_trait]
pub trait ExtensionResolver: Send + Sync {
    async fn resolve_extension(
        &self,
        reference: &RecordReference,
        record: &RemoteRecord,
    ) -> Result<String>;
}

/// Always answers the same extension.
#[derive(Debug, Clone)]
pub struct FixedExtension(String);

impl FixedExtension {
    pub fn new(extension: impl Into<String>) -> Self {
        Self(extension.into())
    }
}

#[async_trait]
impl ExtensionResolver for FixedExtension {
    async fn resolve_extension(
        &self,
        _reference: &RecordReference,
        _record: &RemoteRecord,
    ) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Uses the extension declared in `extension_field` when present, otherwise
/// asks `resolver`. The result is normalized (no leading dot, lowercase).
pub async fn choose_extension(
    reference: &RecordReference,
    record: &RemoteRecord,
    extension_field: &str,
    resolver: &dyn ExtensionResolver,
) -> Result<String> {
    let raw = match record.declared_extension(extension_field) {
        Some(ext) => ext,
        None => resolver.resolve_extension(reference, record).await?,
    };
    normalize_extension(&raw).ok_or(SyncError::InvalidExtension(raw))
}

/// The process-scoped directory holding scratch files.
#[derive(Debug)]
pub struct ScratchDir {
    root: PathBuf,
    // Removes the whole tree on drop when the root was created by us.
    _temp: Option<TempDir>,
}

impl ScratchDir {
    /// A fresh directory under the OS temp dir, removed when dropped.
    pub fn temporary() -> Result<Self> {
        let temp = tempfile::Builder::new().prefix("fieldsync-").tempdir()?;
        Ok(Self {
            root: temp.path().to_path_buf(),
            _temp: Some(temp),
        })
    }

    /// A caller-chosen directory. Only the entries we create are removed.
    pub fn at<P: Into<PathBuf>>(root: P) -> Self {
        Self {
            root: root.into(),
            _temp: None,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory shared by all scratch files of one entity type.
    pub fn session_dir(&self, reference: &RecordReference) -> PathBuf {
        self.root.join(sanitize_token(reference.entity_type()))
    }

    pub fn file_path(
        &self,
        reference: &RecordReference,
        display_name: &str,
        extension: &str,
    ) -> PathBuf {
        let stem = snake_case(&format!("{}_{}", display_name, reference.entity_id()));
        self.session_dir(reference)
            .join(format!("{}.{}", stem, extension))
    }

    /// Writes `value` to the record's scratch path, replacing any previous
    /// content, and returns the owning handle.
    pub fn materialize(
        &self,
        reference: &RecordReference,
        display_name: &str,
        extension: &str,
        value: &str,
    ) -> Result<ScratchFile> {
        let extension = normalize_extension(extension)
            .ok_or_else(|| SyncError::InvalidExtension(extension.to_string()))?;
        let session_dir = self.session_dir(reference);
        let path = self.file_path(reference, display_name, &extension);

        let write_error = |source: std::io::Error| SyncError::Write {
            reference: reference.clone(),
            path: path.clone(),
            source,
        };
        fs::create_dir_all(&session_dir).map_err(write_error)?;
        fs::write(&path, value.as_bytes()).map_err(write_error)?;

        debug!(path = %path.display(), bytes = value.len(), "materialized scratch file");
        Ok(ScratchFile {
            path,
            extension,
            session_dir,
            disposed: false,
        })
    }
}

/// Exclusive handle on one materialized scratch file.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
    extension: String,
    session_dir: PathBuf,
    disposed: bool,
}

impl ScratchFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Removes the file, and its entity directory if nothing else is left in
    /// it. Calling it again is a no-op.
    pub fn dispose(&mut self) -> Result<()> {
        if self.disposed {
            return Ok(());
        }
        match fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        remove_dir_if_empty(&self.session_dir)?;
        self.disposed = true;
        debug!(path = %self.path.display(), "disposed scratch file");
        Ok(())
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            warn!(path = %self.path.display(), "failed to remove scratch file: {}", e);
        }
    }
}

fn remove_dir_if_empty(dir: &Path) -> std::io::Result<()> {
    let mut entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if entries.next().is_some() {
        return Ok(());
    }
    match fs::remove_dir(dir) {
        Ok(()) => Ok(()),
        // Lost a race with another entry being created or the dir going away.
        Err(e) if matches!(e.kind(), ErrorKind::NotFound | ErrorKind::DirectoryNotEmpty) => Ok(()),
        Err(e) => Err(e),
    }
}

/// `"res.partner.form_288"` -> `"res_partner_form_288"`,
/// `"MyView 12"` -> `"my_view_12"`.
///
/// Runs of characters outside `[A-Za-z0-9_]` separate words, as does an
/// uppercase letter following another word character. Words are lowercased and
/// joined with `_`.
pub fn snake_case(input: &str) -> String {
    let mut words: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut prev_word_char = false;

    for c in input.chars() {
        let is_word = c.is_ascii_alphanumeric() || c == '_';
        if !is_word {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            prev_word_char = false;
            continue;
        }
        if c.is_ascii_uppercase() && prev_word_char && !current.is_empty() {
            words.push(std::mem::take(&mut current));
        }
        current.push(c.to_ascii_lowercase());
        prev_word_char = true;
    }
    if !current.is_empty() {
        words.push(current);
    }

    let joined = words.join("_");
    if joined.is_empty() {
        "record".to_string()
    } else {
        joined
    }
}

fn sanitize_token(input: &str) -> String {
    input
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

/// `".XML"` -> `"xml"`. `None` for empty input or anything that is not a
/// plain alphanumeric token.
pub fn normalize_extension(raw: &str) -> Option<String> {
    let ext = raw.trim().trim_start_matches('.');
    if ext.is_empty() || !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
