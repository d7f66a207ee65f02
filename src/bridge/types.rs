//! Request and response types for the control-plane HTTP API.
//!
//! Shared by the in-sandbox server and the orchestrator-side client.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Uniform response wrapper: `{ ok, data?, error? }`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope<T = Value> {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T> Envelope<T> {
    pub fn success(data: T) -> Self {
        Self {
            ok: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            data: None,
            error: Some(error.into()),
        }
    }
}

/// Body of `POST /auth/add`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AddAuthRequest {
    pub provider: String,
    pub key: String,
    #[serde(default)]
    pub mode: Option<String>,
}

/// Body of `POST /command`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandRequest {
    pub args: Vec<String>,
}

/// Body of `POST /auth/login`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub provider: String,
}

/// Response data of `POST /auth/login`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginStarted {
    pub url: String,
}

/// Body of `POST /auth/callback`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallbackRequest {
    pub provider: String,
    pub callback_url: String,
}

/// Response data of `POST /auth/callback`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginCompleted {
    pub provider: String,
    pub output: String,
}

/// What the server did after persisting a config change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReloadOutcome {
    /// Parent signal scheduled.
    Restart,
    /// File written; the runtime picks it up itself.
    HotReload,
    /// `x-reload: false`.
    Skipped,
}

/// Response data of `POST /config/update` and `POST /auth/add`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateResult {
    pub reload: ReloadOutcome,
    pub profiles_changed: bool,
}

/// One entry of `GET /sessions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    pub size: u64,
    pub message_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

/// Response data of `GET /sessions/{id}/history`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionHistory {
    pub id: String,
    pub messages: Vec<Value>,
}
