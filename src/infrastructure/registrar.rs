//! HTTP client for the central registrar.
//!
//! JSON POST exchanges authenticated with a posture token over the device
//! identity; artifact downloads stream to disk. Throttling surfaces as
//! [`RegistrarError::Throttled`] from either HTTP 429 or a `throttled_until`
//! field in the body.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::domain::models::RegistrarConfig;
use crate::domain::ports::{ApiResponse, Identity, RegistrarApi, RegistrarError};

/// Lifetime of the per-request posture token.
const REQUEST_TOKEN_LIFETIME_MINUTES: i64 = 5;

/// reqwest-backed registrar client.
pub struct HttpRegistrarClient {
    base_url: String,
    client: reqwest::Client,
    identity: Arc<Mutex<Box<dyn Identity>>>,
}

impl HttpRegistrarClient {
    pub fn new(
        config: &RegistrarConfig,
        identity: Arc<Mutex<Box<dyn Identity>>>,
    ) -> Result<Self, RegistrarError> {
        if config.address.is_empty() {
            return Err(RegistrarError::NotConfigured(
                "no registrar address configured".to_string(),
            ));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| RegistrarError::Transport(err.to_string()))?;

        Ok(Self {
            base_url: config.address.trim_end_matches('/').to_string(),
            client,
            identity,
        })
    }

    async fn auth_header(&self) -> Option<String> {
        let identity = self.identity.lock().await;
        if !identity.is_signed() {
            return None;
        }
        match identity.sign_posture_token(chrono::Duration::minutes(
            REQUEST_TOKEN_LIFETIME_MINUTES,
        )) {
            Ok(token) => Some(format!("Bearer {token}")),
            Err(err) => {
                warn!(error = %err, "failed to sign request token, sending unauthenticated");
                None
            }
        }
    }

    fn throttled_from_body(body: &Value) -> Option<RegistrarError> {
        let until = body.get("throttled_until")?;
        let parsed: Option<DateTime<Utc>> = until
            .as_str()
            .and_then(|raw| raw.parse().ok())
            .or_else(|| until.as_i64().and_then(|ts| DateTime::from_timestamp(ts, 0)));
        Some(RegistrarError::Throttled { until: parsed })
    }
}

#[async_trait]
impl RegistrarApi for HttpRegistrarClient {
    async fn call(&self, url_path: &str, params: &Value) -> Result<ApiResponse, RegistrarError> {
        let url = format!("{}/{}", self.base_url, url_path.trim_start_matches('/'));
        debug!(url = %url, "registrar API call");

        let mut request = self.client.post(&url).json(params);
        if let Some(authorization) = self.auth_header().await {
            request = request.header(reqwest::header::AUTHORIZATION, authorization);
        }

        let response = request
            .send()
            .await
            .map_err(|err| RegistrarError::Transport(err.to_string()))?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            let until = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse::<i64>().ok())
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs));
            return Err(RegistrarError::Throttled { until });
        }
        let status = response.status();
        if !status.is_success() {
            return Err(RegistrarError::Transport(format!(
                "registrar returned HTTP {status}"
            )));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|err| RegistrarError::Transport(format!("bad response body: {err}")))?;

        if let Some(throttled) = Self::throttled_from_body(&body) {
            return Err(throttled);
        }

        serde_json::from_value(body)
            .map_err(|err| RegistrarError::Transport(format!("malformed API response: {err}")))
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), RegistrarError> {
        debug!(url = %url, dest = %dest.display(), "downloading artifact");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|err| RegistrarError::Transport(err.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(RegistrarError::Transport(format!(
                "download returned HTTP {status}"
            )));
        }

        let mut file = tokio::fs::File::create(dest)
            .await
            .map_err(|err| RegistrarError::Transport(err.to_string()))?;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| RegistrarError::Transport(err.to_string()))?;
            file.write_all(&chunk)
                .await
                .map_err(|err| RegistrarError::Transport(err.to_string()))?;
        }
        file.flush()
            .await
            .map_err(|err| RegistrarError::Transport(err.to_string()))?;
        Ok(())
    }
}
