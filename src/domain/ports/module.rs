//! Compliance module behavior seam.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::domain::errors::AgentResult;
use crate::domain::models::{
    ComplianceModule, EvaluationResult, ExecutionTrigger, RemediationResult,
};

/// The executable half of a compliance module.
///
/// The registry owns the serializable [`ComplianceModule`] record; behaviors
/// are stateless and shared across snapshots. An implementation probes one
/// compliance dimension and, when capable, fixes it.
#[async_trait]
pub trait ModuleBehavior: Send + Sync {
    /// Unique module identifier this behavior backs.
    fn identifier(&self) -> &str;

    /// Probe the device and report a result. Errors are absorbed by the
    /// scheduling wrapper into a FATAL outcome.
    async fn evaluate(
        &self,
        module: &ComplianceModule,
        trigger: Option<ExecutionTrigger>,
        data: Option<&Value>,
    ) -> AgentResult<EvaluationResult>;

    /// Attempt to bring the device back into compliance.
    async fn remediate(
        &self,
        module: &ComplianceModule,
        trigger: Option<ExecutionTrigger>,
        data: Option<&Value>,
    ) -> AgentResult<RemediationResult>;

    /// Register files whose content hashes should accompany evaluation
    /// results. Default: none.
    fn register_support_files(&self, _module: &mut ComplianceModule) {}

    /// Whether evaluate and remediate must serialize across executors for
    /// this module.
    fn wants_execution_lock(&self) -> bool {
        false
    }
}

/// A loadable module: the record template plus its behavior.
///
/// Builtin modules register these in the compile-time table the registry
/// loads from; the record carries the module's default policy and cadence
/// before any manifest overrides.
#[derive(Clone)]
pub struct ModuleDefinition {
    pub module: ComplianceModule,
    pub behavior: Arc<dyn ModuleBehavior>,
}

impl ModuleDefinition {
    pub fn new(module: ComplianceModule, behavior: Arc<dyn ModuleBehavior>) -> Self {
        Self { module, behavior }
    }

    pub fn identifier(&self) -> &str {
        &self.module.identifier
    }
}
