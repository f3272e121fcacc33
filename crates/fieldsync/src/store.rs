//! The remote side of a sync session.
//!
//! [`FieldStore`] is the only thing the engine knows about the remote system:
//! read a whole record, write back a single text field. `fieldsync-odoo`
//! implements it over JSON-RPC; [`MemoryStore`] keeps everything in process.

use crate::error::{Result, StoreError, StoreResult, SyncError};
use crate::reference::RecordReference;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

/// Remote record store consumed by [`SyncEngine`](crate::SyncEngine).
#[async_trait]
pub trait FieldStore: Send + Sync {
    /// Reads the record, or `None` when it does not exist.
    async fn fetch_record(&self, entity_type: &str, id: u64) -> StoreResult<Option<RemoteRecord>>;

    /// Writes one field. `Ok(false)` means the server declined the write and is
    /// reported exactly like a transport failure.
    async fn write_field(
        &self,
        entity_type: &str,
        id: u64,
        field: &str,
        value: &str,
    ) -> StoreResult<bool>;
}

/// A fetched record: field name to JSON value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RemoteRecord(Map<String, Value>);

impl RemoteRecord {
    pub fn new(fields: Map<String, Value>) -> Self {
        Self(fields)
    }

    /// Wraps a JSON object; anything else is not a record.
    pub fn from_value(value: Value) -> Option<Self> {
        match value {
            Value::Object(fields) => Some(Self(fields)),
            _ => None,
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn fields(&self) -> &Map<String, Value> {
        &self.0
    }

    /// Human readable name used for the scratch file.
    pub fn display_name(&self) -> Option<&str> {
        ["name", "display_name"]
            .iter()
            .filter_map(|key| self.0.get(*key).and_then(Value::as_str))
            .find(|name| !name.trim().is_empty())
    }

    /// Extension of the source path stored in `field`, if any (e.g. the
    /// `arch_fs` of a view shipped in a module).
    pub fn declared_extension(&self, field: &str) -> Option<String> {
        let path = self.0.get(field)?.as_str()?;
        Path::new(path)
            .extension()
            .and_then(|ext| ext.to_str())
            .filter(|ext| !ext.is_empty())
            .map(str::to_string)
    }

    /// Text of the referenced field.
    ///
    /// A missing key is [`SyncError::MissingField`]. `false` and `null` are how
    /// Odoo spells an empty text field and read as `""`; numbers, lists and
    /// objects cannot be edited as text.
    pub fn text(&self, reference: &RecordReference) -> Result<String> {
        let kind = match self.0.get(reference.field_name()) {
            None => {
                return Err(SyncError::MissingField {
                    reference: reference.clone(),
                });
            }
            Some(Value::String(text)) => return Ok(text.clone()),
            Some(Value::Null) | Some(Value::Bool(false)) => return Ok(String::new()),
            Some(Value::Bool(true)) => "boolean",
            Some(Value::Number(_)) => "numeric",
            Some(Value::Array(_)) => "list",
            Some(Value::Object(_)) => "object",
        };
        Err(SyncError::NonTextField {
            reference: reference.clone(),
            kind,
        })
    }
}

/// One call observed by [`MemoryStore::write_field`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteCall {
    pub entity_type: String,
    pub id: u64,
    pub field: String,
    pub value: String,
}

/// In-process [`FieldStore`] keeping records in a map and logging writes.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<HashMap<(String, u64), RemoteRecord>>,
    writes: Mutex<Vec<WriteCall>>,
    reject_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_record(self, entity_type: &str, id: u64, record: RemoteRecord) -> Self {
        self.insert(entity_type, id, record);
        self
    }

    pub fn insert(&self, entity_type: &str, id: u64, record: RemoteRecord) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert((entity_type.to_string(), id), record);
    }

    pub fn record(&self, entity_type: &str, id: u64) -> Option<RemoteRecord> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(entity_type.to_string(), id))
            .cloned()
    }

    /// Every accepted or rejected write, oldest first.
    pub fn writes(&self) -> Vec<WriteCall> {
        self.writes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Makes subsequent writes answer `false`.
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }
}

#[async_trait]
impl FieldStore for MemoryStore {
    async fn fetch_record(&self, entity_type: &str, id: u64) -> StoreResult<Option<RemoteRecord>> {
        Ok(self.record(entity_type, id))
    }

    async fn write_field(
        &self,
        entity_type: &str,
        id: u64,
        field: &str,
        value: &str,
    ) -> StoreResult<bool> {
        self.writes
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(WriteCall {
                entity_type: entity_type.to_string(),
                id,
                field: field.to_string(),
                value: value.to_string(),
            });
        if self.reject_writes.load(Ordering::SeqCst) {
            return Ok(false);
        }
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        match records.get_mut(&(entity_type.to_string(), id)) {
            Some(record) => {
                record.0.insert(field.to_string(), Value::String(value.to_string()));
                Ok(true)
            }
            None => Err(StoreError::NotFound),
        }
    }
}
