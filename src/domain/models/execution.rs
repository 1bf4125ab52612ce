//! Execution queue work items.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::module::ComplianceModule;
use super::status::{ExecutionStatus, ExecutionTrigger};
use crate::domain::ports::ModuleBehavior;

/// Which capability an execution request exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionAction {
    Evaluation,
    Remediation,
}

impl ExecutionAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Evaluation => "evaluation",
            Self::Remediation => "remediation",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "evaluation" | "evaluate" => Some(Self::Evaluation),
            "remediation" | "remediate" => Some(Self::Remediation),
            _ => None,
        }
    }
}

impl std::fmt::Display for ExecutionAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A request for one executor to run evaluate or remediate against a module
/// snapshot.
///
/// The snapshot is a deep copy of the registry's record and rides together
/// with the module's behavior; the executor never touches the live module.
#[derive(Clone)]
pub struct ExecutionRequest {
    pub uuid: Uuid,
    pub module: ComplianceModule,
    pub behavior: Arc<dyn ModuleBehavior>,
    pub trigger: Option<ExecutionTrigger>,
    pub action: ExecutionAction,
    pub data: Option<Value>,
    pub date: DateTime<Utc>,
}

impl std::fmt::Debug for ExecutionRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionRequest")
            .field("uuid", &self.uuid)
            .field("module", &self.module.identifier)
            .field("trigger", &self.trigger)
            .field("action", &self.action)
            .field("date", &self.date)
            .finish_non_exhaustive()
    }
}

impl ExecutionRequest {
    pub fn new(
        module: ComplianceModule,
        behavior: Arc<dyn ModuleBehavior>,
        trigger: Option<ExecutionTrigger>,
        action: ExecutionAction,
        data: Option<Value>,
    ) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            module,
            behavior,
            trigger,
            action,
            data,
            date: Utc::now(),
        }
    }

    /// Queue key: module identifier plus trigger suffix. At most one request
    /// per key may be live within the requeue threshold.
    pub fn queue_id(&self) -> String {
        match self.trigger.and_then(ExecutionTrigger::queue_suffix) {
            Some(suffix) => format!("{}.{}", self.module.identifier, suffix),
            None => self.module.identifier.clone(),
        }
    }
}

/// Progress or terminal report posted by an executor.
#[derive(Debug, Clone)]
pub struct ExecutionResponse {
    pub request_uuid: Uuid,
    pub request_queue_id: String,
    pub status: ExecutionStatus,
    pub module: ComplianceModule,
}

impl ExecutionResponse {
    pub fn new(request: &ExecutionRequest, status: ExecutionStatus, module: ComplianceModule) -> Self {
        Self {
            request_uuid: request.uuid,
            request_queue_id: request.queue_id(),
            status,
            module,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::AgentResult;
    use crate::domain::models::{ComplianceStatus, EvaluationResult, RemediationResult};
    use async_trait::async_trait;

    struct NoopBehavior;

    #[async_trait]
    impl ModuleBehavior for NoopBehavior {
        fn identifier(&self) -> &str {
            "noop"
        }

        async fn evaluate(
            &self,
            _module: &ComplianceModule,
            _trigger: Option<ExecutionTrigger>,
            _data: Option<&Value>,
        ) -> AgentResult<EvaluationResult> {
            Ok(EvaluationResult::new(
                ComplianceStatus::COMPLIANT,
                ExecutionStatus::SUCCESS,
            ))
        }

        async fn remediate(
            &self,
            _module: &ComplianceModule,
            _trigger: Option<ExecutionTrigger>,
            _data: Option<&Value>,
        ) -> AgentResult<RemediationResult> {
            Ok(RemediationResult::new(ExecutionStatus::SUCCESS))
        }
    }

    #[test]
    fn test_queue_id_includes_trigger() {
        let module = ComplianceModule::new("screen_lock");
        let request = ExecutionRequest::new(
            module,
            Arc::new(NoopBehavior),
            Some(ExecutionTrigger::SCHEDULED),
            ExecutionAction::Evaluation,
            None,
        );
        assert_eq!(request.queue_id(), "screen_lock.SCHEDULED");
    }

    #[test]
    fn test_queue_id_without_trigger() {
        let module = ComplianceModule::new("screen_lock");
        let request = ExecutionRequest::new(
            module,
            Arc::new(NoopBehavior),
            None,
            ExecutionAction::Remediation,
            None,
        );
        assert_eq!(request.queue_id(), "screen_lock");
    }

    #[test]
    fn test_request_copy_preserves_uuid() {
        let module = ComplianceModule::new("screen_lock");
        let request = ExecutionRequest::new(
            module,
            Arc::new(NoopBehavior),
            Some(ExecutionTrigger::MANUAL),
            ExecutionAction::Evaluation,
            Some(serde_json::json!({"reason": "operator"})),
        );
        let copy = request.clone();
        assert_eq!(copy.uuid, request.uuid);
        assert_eq!(copy.queue_id(), request.queue_id());
    }
}
