//! Registrar wire protocol seam.

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Decoded registrar API response.
///
/// `status` 0 means success; any other value is a failure explained by
/// `message`. Throttling arrives as an error, not a response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse {
    pub status: i64,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ApiResponse {
    pub const SUCCESS: i64 = 0;

    pub fn is_success(&self) -> bool {
        self.status == Self::SUCCESS
    }
}

/// Errors surfaced by registrar exchanges.
#[derive(Debug, Error)]
pub enum RegistrarError {
    /// Server asked us to back off; retry no earlier than `until` when given.
    #[error("registrar throttled request (until {until:?})")]
    Throttled { until: Option<DateTime<Utc>> },

    #[error("registrar API error (status {status}): {message}")]
    Api { status: i64, message: String },

    #[error("registrar transport error: {0}")]
    Transport(String),

    #[error("registrar not configured: {0}")]
    NotConfigured(String),
}

/// Authenticated JSON API to the central registrar plus artifact downloads.
///
/// Requests carry platform context; the implementation signs them with the
/// registered identity.
#[async_trait]
pub trait RegistrarApi: Send + Sync {
    /// POST `params` to `url_path` relative to the registrar address.
    async fn call(&self, url_path: &str, params: &Value) -> Result<ApiResponse, RegistrarError>;

    /// Download an artifact (installer archive, signature) to `dest`.
    async fn download(&self, url: &str, dest: &Path) -> Result<(), RegistrarError>;
}
