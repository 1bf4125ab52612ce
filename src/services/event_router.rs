//! Event routing and offline buffering.
//!
//! Maps each event to a destination stream (exact type, then subject area,
//! then `"default"`) and hands it to the sink. Failed deliveries append to a
//! disk-backed queue file which flushes oldest-first once the sink is
//! reachable again.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::domain::errors::AgentResult;
use crate::domain::models::{AgentEvent, RouteMap};
use crate::domain::ports::EventSink;

#[derive(Debug, Serialize, Deserialize)]
struct BufferedEvent {
    stream: String,
    event: AgentEvent,
}

/// Routes telemetry events to sink streams, buffering while offline.
pub struct EventRouter {
    route_map: RwLock<RouteMap>,
    sink: Arc<dyn EventSink>,
    /// Offline queue file (JSON lines, oldest first).
    buffer_path: PathBuf,
    buffer_lock: Mutex<()>,
    enabled: AtomicBool,
}

impl EventRouter {
    pub fn new(sink: Arc<dyn EventSink>, route_map: RouteMap, buffer_path: PathBuf) -> Self {
        Self {
            route_map: RwLock::new(route_map),
            sink,
            buffer_path,
            buffer_lock: Mutex::new(()),
            enabled: AtomicBool::new(true),
        }
    }

    /// Feature toggle; a disabled router drops events.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub async fn set_route_map(&self, map: RouteMap) {
        *self.route_map.write().await = map;
    }

    /// Route and deliver one event. Never surfaces delivery failure to the
    /// caller; undeliverable events are buffered.
    pub async fn dispatch(&self, event: AgentEvent) {
        if !self.is_enabled() {
            debug!(event_type = %event.event_type, "event routing disabled, dropping event");
            return;
        }

        let stream = {
            let map = self.route_map.read().await;
            map.stream_for_event(&event)
        };
        let Some(stream) = stream else {
            warn!(event_type = %event.event_type, "no stream route for event, dropping");
            return;
        };

        if self.sink.is_available() {
            match self.sink.submit(&event, &stream).await {
                Ok(()) => {
                    debug!(event_type = %event.event_type, stream = %stream, "event submitted");
                    return;
                }
                Err(err) => {
                    warn!(
                        event_type = %event.event_type,
                        error = %err,
                        "event submission failed, buffering"
                    );
                }
            }
        }

        if let Err(err) = self.buffer(&stream, &event).await {
            error!(event_type = %event.event_type, error = %err, "failed to buffer event");
        }
    }

    async fn buffer(&self, stream: &str, event: &AgentEvent) -> AgentResult<()> {
        let _guard = self.buffer_lock.lock().await;
        let line = serde_json::to_string(&BufferedEvent {
            stream: stream.to_string(),
            event: event.clone(),
        })?;
        let mut contents = match tokio::fs::read_to_string(&self.buffer_path).await {
            Ok(existing) => existing,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err.into()),
        };
        contents.push_str(&line);
        contents.push('\n');
        tokio::fs::write(&self.buffer_path, contents).await?;
        Ok(())
    }

    /// Deliver buffered events oldest-first, stopping at the first failure.
    /// Returns how many were flushed.
    pub async fn flush_buffer(&self) -> usize {
        let _guard = self.buffer_lock.lock().await;

        let contents = match tokio::fs::read_to_string(&self.buffer_path).await {
            Ok(contents) => contents,
            Err(_) => return 0,
        };
        if contents.is_empty() {
            return 0;
        }

        let mut flushed = 0;
        let mut remaining: Vec<&str> = Vec::new();
        let mut stalled = false;

        for line in contents.lines().filter(|l| !l.trim().is_empty()) {
            if stalled {
                remaining.push(line);
                continue;
            }
            match serde_json::from_str::<BufferedEvent>(line) {
                Ok(buffered) => {
                    match self.sink.submit(&buffered.event, &buffered.stream).await {
                        Ok(()) => flushed += 1,
                        Err(err) => {
                            warn!(error = %err, "sink still unavailable, keeping buffered events");
                            stalled = true;
                            remaining.push(line);
                        }
                    }
                }
                Err(err) => {
                    // Unparseable line: drop it rather than wedging the queue.
                    error!(error = %err, "dropping corrupt buffered event");
                }
            }
        }

        let result = if remaining.is_empty() {
            tokio::fs::write(&self.buffer_path, "").await
        } else {
            let mut contents = remaining.join("\n");
            contents.push('\n');
            tokio::fs::write(&self.buffer_path, contents).await
        };
        if let Err(err) = result {
            error!(error = %err, "failed to rewrite event buffer");
        }

        flushed
    }

    /// Number of events currently buffered on disk.
    pub async fn buffered_count(&self) -> usize {
        let _guard = self.buffer_lock.lock().await;
        match tokio::fs::read_to_string(&self.buffer_path).await {
            Ok(contents) => contents.lines().filter(|l| !l.trim().is_empty()).count(),
            Err(_) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::atomic::AtomicUsize;

    use crate::domain::errors::AgentError;

    struct FlakySink {
        available: AtomicBool,
        submitted: AtomicUsize,
    }

    impl FlakySink {
        fn new(available: bool) -> Self {
            Self {
                available: AtomicBool::new(available),
                submitted: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl EventSink for FlakySink {
        async fn submit(&self, _event: &AgentEvent, _stream: &str) -> AgentResult<()> {
            if self.available.load(Ordering::SeqCst) {
                self.submitted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            } else {
                Err(AgentError::QueueFailed("sink offline".to_string()))
            }
        }

        fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }
    }

    fn route_map() -> RouteMap {
        let mut map = HashMap::new();
        map.insert("default".to_string(), "firehose".to_string());
        RouteMap::new(map)
    }

    #[tokio::test]
    async fn test_offline_events_buffer_and_flush_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(FlakySink::new(false));
        let router = EventRouter::new(
            Arc::clone(&sink) as Arc<dyn EventSink>,
            route_map(),
            dir.path().join("karl_queue.data"),
        );

        router
            .dispatch(AgentEvent::new("First", "Compliance"))
            .await;
        router
            .dispatch(AgentEvent::new("Second", "Compliance"))
            .await;
        assert_eq!(router.buffered_count().await, 2);

        sink.available.store(true, Ordering::SeqCst);
        let flushed = router.flush_buffer().await;
        assert_eq!(flushed, 2);
        assert_eq!(router.buffered_count().await, 0);
        assert_eq!(sink.submitted.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_online_events_deliver_directly() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(FlakySink::new(true));
        let router = EventRouter::new(
            Arc::clone(&sink) as Arc<dyn EventSink>,
            route_map(),
            dir.path().join("karl_queue.data"),
        );

        router
            .dispatch(AgentEvent::new("SystemRegInfo", "Registration"))
            .await;
        assert_eq!(sink.submitted.load(Ordering::SeqCst), 1);
        assert_eq!(router.buffered_count().await, 0);
    }

    #[tokio::test]
    async fn test_disabled_router_drops_events() {
        let dir = tempfile::tempdir().unwrap();
        let sink = Arc::new(FlakySink::new(true));
        let router = EventRouter::new(
            Arc::clone(&sink) as Arc<dyn EventSink>,
            route_map(),
            dir.path().join("karl_queue.data"),
        );
        router.set_enabled(false);

        router.dispatch(AgentEvent::new("Ignored", "Nothing")).await;
        assert_eq!(sink.submitted.load(Ordering::SeqCst), 0);
        assert_eq!(router.buffered_count().await, 0);
    }
}
