//! Domain models for the compliance agent.

pub mod agent_config;
pub mod config_entry;
pub mod events;
pub mod execution;
pub mod module;
pub mod results;
pub mod status;

pub use agent_config::{
    AgentConfig, ComplianceConfig, EventsConfig, FeatureControls, LoggingConfig, RegistrarConfig,
    RegistrationConfig, UsherConfig,
};
pub use config_entry::{ConfigurationEntry, InstallerEntry};
pub use events::{AgentEvent, RouteMap};
pub use execution::{ExecutionAction, ExecutionRequest, ExecutionResponse};
pub use module::{ComplianceModule, ModuleSettings, ModuleState};
pub use results::{EvaluationResult, RemediationResult, SupportFile};
pub use status::{
    ComplianceStatus, ExecutionPrerequisites, ExecutionStatus, ExecutionTrigger, ExecutorStatus,
    InstallErrorCode, ModuleStatus, QualificationResult,
};

/// Serde adapters for `chrono::Duration` fields persisted as whole seconds.
///
/// Intervals, skews, and grace times are written to disk as integer seconds;
/// the numeric representation is part of the on-disk format.
pub mod duration_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_i64(value.num_seconds())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = i64::deserialize(deserializer)?;
        Ok(Duration::seconds(secs))
    }
}

/// Serde adapter for optional durations, also as whole seconds.
pub mod opt_duration_secs {
    use chrono::Duration;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&d.num_seconds()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let secs = Option::<i64>::deserialize(deserializer)?;
        Ok(secs.map(Duration::seconds))
    }
}
