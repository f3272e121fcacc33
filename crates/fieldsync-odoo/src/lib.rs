//! [`FieldStore`] backed by an Odoo server's JSON-RPC endpoint.
//!
//! ```rust,no_run
//! use fieldsync_odoo::{OdooClient, OdooConfig};
//!
//! # async fn run() -> fieldsync_odoo::Result<()> {
//! let client = OdooClient::connect(&OdooConfig::default()).await?;
//! let record = client.read("ir.ui.view", 288).await?;
//! # Ok(())
//! # }
//! ```

pub mod error;

pub use error::{OdooError, Result};

use async_trait::async_trait;
use fieldsync::{FieldStore, RemoteRecord, StoreResult};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;
use url::Url;

const JSONRPC_PATH: &str = "/jsonrpc";

/// Where and as whom to connect.
#[derive(Debug, Clone)]
pub struct OdooConfig {
    pub base_url: String,
    pub port: Option<u16>,
    pub db: String,
    pub username: String,
    pub password: String,
}

impl Default for OdooConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost".to_string(),
            port: Some(8069),
            db: "odoo".to_string(),
            username: "admin".to_string(),
            password: "admin".to_string(),
        }
    }
}

impl OdooConfig {
    /// `base_url` with `port` applied and the JSON-RPC path appended.
    pub fn endpoint(&self) -> Result<Url> {
        let mut url = Url::parse(self.base_url.trim())?;
        if url.cannot_be_a_base() || url.host_str().is_none() {
            return Err(OdooError::InvalidUrl(self.base_url.clone()));
        }
        if let Some(port) = self.port {
            url.set_port(Some(port))
                .map_err(|_| OdooError::InvalidUrl(self.base_url.clone()))?;
        }
        let path = format!("{}{}", url.path().trim_end_matches('/'), JSONRPC_PATH);
        url.set_path(&path);
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }
}

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    method: &'static str,
    params: RpcParams<'a>,
    id: u64,
}

#[derive(Debug, Serialize)]
struct RpcParams<'a> {
    service: &'a str,
    method: &'a str,
    args: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<RpcErrorData>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorData {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl RpcResponse {
    fn into_result(self) -> Result<Value> {
        if let Some(error) = self.error {
            return Err(OdooError::Rpc(error.describe()));
        }
        self.result
            .ok_or_else(|| OdooError::UnexpectedResponse("neither result nor error".to_string()))
    }
}

impl RpcErrorBody {
    /// The server-side exception message is far more useful than the generic
    /// "Odoo Server Error" wrapper.
    fn describe(&self) -> String {
        match &self.data {
            Some(RpcErrorData {
                message: Some(message),
                name,
            }) if !message.is_empty() => match name {
                Some(name) => format!("{} ({})", message, name),
                None => message.clone(),
            },
            _ => self.message.clone(),
        }
    }
}

/// An authenticated JSON-RPC session.
#[derive(Debug)]
pub struct OdooClient {
    http: reqwest::Client,
    endpoint: Url,
    db: String,
    uid: i64,
    password: String,
    next_id: AtomicU64,
}

impl OdooClient {
    /// Logs in and keeps the resulting uid for later calls.
    pub async fn connect(config: &OdooConfig) -> Result<Self> {
        let endpoint = config.endpoint()?;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        let mut client = Self {
            http,
            endpoint,
            db: config.db.clone(),
            uid: 0,
            password: config.password.clone(),
            next_id: AtomicU64::new(1),
        };

        let uid = client
            .call(
                "common",
                "login",
                json!([config.db, config.username, config.password]),
            )
            .await?;
        client.uid = match uid {
            Value::Number(n) => n.as_i64().ok_or_else(|| {
                OdooError::UnexpectedResponse(format!("login returned uid {}", n))
            })?,
            // `false` is Odoo's answer to bad credentials.
            Value::Bool(false) => {
                return Err(OdooError::Authentication {
                    db: config.db.clone(),
                    username: config.username.clone(),
                });
            }
            other => {
                return Err(OdooError::UnexpectedResponse(format!(
                    "login returned {}",
                    other
                )));
            }
        };
        debug!(endpoint = %client.endpoint, uid = client.uid, "connected");
        Ok(client)
    }

    pub fn uid(&self) -> i64 {
        self.uid
    }

    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    pub fn db(&self) -> &str {
        &self.db
    }

    /// Reads all fields of one record.
    pub async fn read(&self, model: &str, id: u64) -> Result<Option<RemoteRecord>> {
        let records = self.execute_kw(model, "read", json!([[id]]), json!({})).await?;
        match records {
            Value::Array(records) => Ok(records.into_iter().next().and_then(RemoteRecord::from_value)),
            other => Err(OdooError::UnexpectedResponse(format!(
                "read returned {}",
                other
            ))),
        }
    }

    /// Writes one field; `Ok(false)` when the server reports no update.
    pub async fn write(&self, model: &str, id: u64, field: &str, value: &str) -> Result<bool> {
        let mut values = serde_json::Map::new();
        values.insert(field.to_string(), Value::String(value.to_string()));
        let result = self
            .execute_kw(model, "write", json!([[id], values]), json!({}))
            .await?;
        result.as_bool().ok_or_else(|| {
            OdooError::UnexpectedResponse(format!("write returned {}", result))
        })
    }

    async fn execute_kw(&self, model: &str, method: &str, args: Value, kwargs: Value) -> Result<Value> {
        self.call(
            "object",
            "execute_kw",
            json!([self.db, self.uid, self.password, model, method, args, kwargs]),
        )
        .await
    }

    async fn call(&self, service: &str, method: &str, args: Value) -> Result<Value> {
        let request = RpcRequest {
            jsonrpc: "2.0",
            method: "call",
            params: RpcParams {
                service,
                method,
                args,
            },
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
        };
        debug!(service, method, id = request.id, "rpc call");

        let response: RpcResponse = self
            .http
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        response.into_result()
    }
}

#[async_trait]
impl FieldStore for OdooClient {
    async fn fetch_record(&self, entity_type: &str, id: u64) -> StoreResult<Option<RemoteRecord>> {
        Ok(self.read(entity_type, id).await?)
    }

    async fn write_field(
        &self,
        entity_type: &str,
        id: u64,
        field: &str,
        value: &str,
    ) -> StoreResult<bool> {
        Ok(self.write(entity_type, id, field, value).await?)
    }
}
