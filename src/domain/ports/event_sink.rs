//! Event sink seam.

use async_trait::async_trait;

use crate::domain::errors::AgentResult;
use crate::domain::models::AgentEvent;

/// Destination for routed telemetry events.
///
/// Implementations deliver to a named stream; delivery failure is how the
/// router decides to buffer. Credentials are provisioned out-of-band by the
/// token configuration module.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn submit(&self, event: &AgentEvent, stream: &str) -> AgentResult<()>;

    /// Whether the sink currently believes it can deliver.
    fn is_available(&self) -> bool {
        true
    }
}
