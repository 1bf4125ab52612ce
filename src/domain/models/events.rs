//! Telemetry event envelope and stream routing.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::domain::errors::AgentResult;

/// A telemetry event bound for the central sink.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentEvent {
    pub uuid: Uuid,
    #[serde(rename = "type")]
    pub event_type: String,
    pub subject_area: String,
    pub date: DateTime<Utc>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

impl AgentEvent {
    pub fn new(event_type: impl Into<String>, subject_area: impl Into<String>) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            event_type: event_type.into(),
            subject_area: subject_area.into(),
            date: Utc::now(),
            payload: Map::new(),
        }
    }

    pub fn with_payload(mut self, payload: Map<String, Value>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_entry(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload.insert(key.into(), value.into());
        self
    }
}

/// Maps event types and subject areas to destination stream names.
///
/// Lookup order: exact event type, then subject area, then `"default"`.
/// Keys match case-insensitively. Persisted as a flat JSON object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteMap {
    map: HashMap<String, String>,
}

impl Default for RouteMap {
    fn default() -> Self {
        let mut map = HashMap::new();
        map.insert("default".to_string(), "default".to_string());
        Self { map }
    }
}

impl RouteMap {
    pub fn new(map: HashMap<String, String>) -> Self {
        Self { map }
    }

    pub fn stream_for_event(&self, event: &AgentEvent) -> Option<String> {
        self.stream_for_key(&event.event_type)
            .or_else(|| self.stream_for_key(&event.subject_area))
            .or_else(|| self.stream_for_key("default"))
    }

    pub fn stream_for_key(&self, key: &str) -> Option<String> {
        self.map
            .iter()
            .find(|(mapped, _)| mapped.eq_ignore_ascii_case(key))
            .map(|(_, stream)| stream.clone())
    }

    pub fn is_loaded(&self) -> bool {
        !self.map.is_empty()
    }

    pub fn load_from_file(path: &Path) -> AgentResult<Self> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    pub fn save_to_file(&self, path: &Path) -> AgentResult<()> {
        let raw = serde_json::to_string(self)?;
        std::fs::write(path, raw)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_map() -> RouteMap {
        let mut map = HashMap::new();
        map.insert(
            "ComplianceDeviceStatusEvent".to_string(),
            "compliance_status".to_string(),
        );
        map.insert("Compliance".to_string(), "compliance".to_string());
        map.insert("default".to_string(), "firehose".to_string());
        RouteMap::new(map)
    }

    #[test]
    fn test_exact_type_match_wins() {
        let map = sample_map();
        let event = AgentEvent::new("ComplianceDeviceStatusEvent", "Compliance");
        assert_eq!(
            map.stream_for_event(&event),
            Some("compliance_status".to_string())
        );
    }

    #[test]
    fn test_subject_area_fallback() {
        let map = sample_map();
        let event = AgentEvent::new("ComplianceModuleStatusEvent", "Compliance");
        assert_eq!(map.stream_for_event(&event), Some("compliance".to_string()));
    }

    #[test]
    fn test_default_fallback() {
        let map = sample_map();
        let event = AgentEvent::new("SystemRegInfo", "Registration");
        assert_eq!(map.stream_for_event(&event), Some("firehose".to_string()));
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let map = sample_map();
        assert_eq!(
            map.stream_for_key("compliance"),
            Some("compliance".to_string())
        );
    }
}
