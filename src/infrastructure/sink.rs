//! HTTP event sink.
//!
//! Delivers routed events to per-stream ingestion endpoints, authenticated
//! with the short-lived credentials the token configuration module keeps
//! fresh. Without credentials the sink reports unavailable and the router
//! buffers.

use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use crate::domain::errors::{AgentError, AgentResult};
use crate::domain::models::AgentEvent;
use crate::domain::ports::EventSink;
use crate::services::token_config::CredentialCell;

/// Event sink posting JSON events to `<endpoint>/<stream>`.
pub struct HttpEventSink {
    endpoint: String,
    client: reqwest::Client,
    credentials: CredentialCell,
}

impl HttpEventSink {
    pub fn new(endpoint: String, credentials: CredentialCell) -> AgentResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|err| AgentError::QueueFailed(err.to_string()))?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            client,
            credentials,
        })
    }
}

#[async_trait]
impl EventSink for HttpEventSink {
    async fn submit(&self, event: &AgentEvent, stream: &str) -> AgentResult<()> {
        let credentials = {
            let cell = self.credentials.try_read().map_err(|_| {
                AgentError::QueueFailed("credential cell contended".to_string())
            })?;
            cell.clone()
        };
        let Some(credentials) = credentials else {
            return Err(AgentError::QueueFailed(
                "no sink credentials provisioned".to_string(),
            ));
        };

        let url = format!("{}/{stream}", self.endpoint);
        let response = self
            .client
            .post(&url)
            .header("x-acme-access-key", credentials.access_key_id)
            .header("x-acme-session-token", credentials.session_token)
            .json(event)
            .send()
            .await
            .map_err(|err| AgentError::QueueFailed(err.to_string()))?;

        if !response.status().is_success() {
            return Err(AgentError::QueueFailed(format!(
                "sink returned HTTP {}",
                response.status()
            )));
        }
        debug!(event_type = %event.event_type, stream = %stream, "event delivered");
        Ok(())
    }

    fn is_available(&self) -> bool {
        self.credentials
            .try_read()
            .map(|cell| cell.is_some())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::RwLock;

    use crate::services::token_config::SinkCredentials;

    fn credentials() -> CredentialCell {
        Arc::new(RwLock::new(Some(SinkCredentials {
            access_key_id: "AKIA_TEST".to_string(),
            secret_access_key: "secret".to_string(),
            session_token: "session".to_string(),
            expiration: None,
        })))
    }

    #[tokio::test]
    async fn test_submit_posts_to_stream_endpoint() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/compliance_status")
            .match_header("x-acme-access-key", "AKIA_TEST")
            .with_status(200)
            .create_async()
            .await;

        let sink = HttpEventSink::new(server.url(), credentials()).unwrap();
        assert!(sink.is_available());
        sink.submit(
            &AgentEvent::new("ComplianceDeviceStatusEvent", "Compliance"),
            "compliance_status",
        )
        .await
        .unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_without_credentials_sink_is_unavailable() {
        let cell: CredentialCell = Arc::new(RwLock::new(None));
        let sink = HttpEventSink::new("http://localhost:1".to_string(), cell).unwrap();
        assert!(!sink.is_available());
        let err = sink
            .submit(&AgentEvent::new("Event", "Area"), "stream")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("credentials"));
    }
}
