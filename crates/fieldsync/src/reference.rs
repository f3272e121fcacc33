//! Record locators.
//!
//! A locator is the URL a user copies out of the browser while looking at a
//! record, e.g. `http://localhost:8069/web#id=288&model=ir.ui.view&view_type=form`.
//! The fragment is consulted first and the query string second; any keys other
//! than the model and id are ignored.

use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fmt;
use url::Url;

/// Locator key holding the entity type.
pub const MODEL_KEY: &str = "model";
/// Locator key holding the numeric record id.
pub const ID_KEY: &str = "id";

/// A resolved pointer at one field of one remote record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RecordReference {
    entity_type: String,
    entity_id: u64,
    field_name: String,
}

impl RecordReference {
    pub fn new(
        entity_type: impl Into<String>,
        entity_id: u64,
        field_name: impl Into<String>,
    ) -> Result<Self> {
        let entity_type = entity_type.into().trim().to_string();
        let field_name = field_name.into().trim().to_string();
        if entity_type.is_empty() {
            return Err(SyncError::InvalidReference {
                locator: format!("{}:{}", entity_type, entity_id),
                reason: "entity type is empty".to_string(),
            });
        }
        if field_name.is_empty() {
            return Err(SyncError::InvalidReference {
                locator: format!("{}:{}", entity_type, entity_id),
                reason: "field name is empty".to_string(),
            });
        }
        Ok(Self {
            entity_type,
            entity_id,
            field_name,
        })
    }

    pub fn entity_type(&self) -> &str {
        &self.entity_type
    }

    pub fn entity_id(&self) -> u64 {
        self.entity_id
    }

    pub fn field_name(&self) -> &str {
        &self.field_name
    }
}

impl fmt::Display for RecordReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}).{}",
            self.entity_type, self.entity_id, self.field_name
        )
    }
}

/// Parses `locator` and binds the result to `field_name`.
///
/// Fails with [`SyncError::InvalidReference`] when the locator is not a URL,
/// or when neither its fragment nor its query carries both a model and a
/// non-negative integer id. Pure parsing, no network access.
pub fn resolve(locator: &str, field_name: &str) -> Result<RecordReference> {
    let invalid = |reason: String| SyncError::InvalidReference {
        locator: locator.to_string(),
        reason,
    };

    let url = Url::parse(locator.trim()).map_err(|e| invalid(e.to_string()))?;

    let model = lookup(&url, MODEL_KEY)
        .filter(|m| !m.trim().is_empty())
        .ok_or_else(|| invalid(format!("no `{}` key in fragment or query", MODEL_KEY)))?;
    let raw_id = lookup(&url, ID_KEY)
        .ok_or_else(|| invalid(format!("no `{}` key in fragment or query", ID_KEY)))?;
    let id = raw_id
        .trim()
        .parse::<u64>()
        .map_err(|_| invalid(format!("`{}` is not a record id", raw_id)))?;

    RecordReference::new(model, id, field_name).map_err(|e| match e {
        SyncError::InvalidReference { reason, .. } => invalid(reason),
        other => other,
    })
}

/// Fragment first, then query; first occurrence wins.
fn lookup(url: &Url, key: &str) -> Option<String> {
    let from_fragment = url.fragment().and_then(|fragment| {
        url::form_urlencoded::parse(fragment.as_bytes())
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    });
    from_fragment.or_else(|| {
        url.query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    })
}
