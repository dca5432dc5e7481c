//! Wire model of the synchronized document.
//!
//! The server treats `links`, `categories`, and `countdowns` as opaque JSON
//! payloads owned by the clients; only `meta` is interpreted here. The
//! server is the sole authority for `meta.updatedAt`, `meta.version`, and
//! `meta.syncKind` — whatever a caller sends in those fields is overwritten
//! on every accepted write.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};

fn default_schema_version() -> u32 {
    1
}

/// How a sync was initiated. Anything unrecognized normalizes to `Auto`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    #[default]
    Auto,
    Manual,
}

impl<'de> Deserialize<'de> for SyncKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(match raw.as_str() {
            "manual" => SyncKind::Manual,
            _ => SyncKind::Auto,
        })
    }
}

/// Server-stamped metadata carried by every document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMeta {
    /// Milliseconds since the epoch; set by the server on every write.
    #[serde(default)]
    pub updated_at: i64,

    /// Identifier of the device that produced the write.
    #[serde(default)]
    pub device_id: String,

    /// Monotonic document version, increased by exactly 1 per accepted write.
    #[serde(default)]
    pub version: u64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,

    #[serde(default)]
    pub sync_kind: SyncKind,
}

impl Default for SyncMeta {
    fn default() -> Self {
        Self {
            updated_at: 0,
            device_id: "unknown".to_string(),
            version: 0,
            browser: None,
            os: None,
            sync_kind: SyncKind::Auto,
        }
    }
}

/// AI-provider configuration. Only `apiKey` is interpreted (it is the one
/// plaintext secret in the document); provider, model, and any future
/// fields flow through untouched.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssistantSettings {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// The shared mutable document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDocument {
    #[serde(default)]
    pub links: Vec<Value>,

    #[serde(default)]
    pub categories: Vec<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub countdowns: Option<Vec<Value>>,

    #[serde(default = "default_schema_version")]
    pub schema_version: u32,

    #[serde(default)]
    pub meta: SyncMeta,

    /// Encrypted vault blob; opaque ciphertext decrypted on admin devices.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vault: Option<Value>,

    /// Encrypted config blob.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_settings: Option<String>,

    /// Privacy settings object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub privacy: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assistant: Option<AssistantSettings>,
}

impl Default for SyncDocument {
    fn default() -> Self {
        Self {
            links: Vec::new(),
            categories: Vec::new(),
            countdowns: None,
            schema_version: default_schema_version(),
            meta: SyncMeta::default(),
            vault: None,
            encrypted_settings: None,
            privacy: None,
            assistant: None,
        }
    }
}

impl SyncDocument {
    /// Normalizes caller-supplied fields the server does not fully control:
    /// empty device ids fall back to `"unknown"`, a zero schema version to
    /// the current default.
    pub fn normalize(&mut self) {
        if self.meta.device_id.trim().is_empty() {
            self.meta.device_id = "unknown".to_string();
        }
        if self.schema_version == 0 {
            self.schema_version = default_schema_version();
        }
    }

    pub fn to_bytes(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(data: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(data)
    }
}

/// Body of a document write: the candidate document plus the optional
/// optimistic-lock field.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WriteRequest {
    #[serde(default)]
    pub expected_version: Option<u64>,

    #[serde(flatten)]
    pub document: SyncDocument,
}
