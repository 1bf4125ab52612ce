//! Execution qualification.

use std::sync::Arc;

use crate::domain::models::{ComplianceModule, ExecutionTrigger, QualificationResult};
use crate::domain::ports::NetworkStateProvider;

/// Decides whether a module may run given trigger and environment.
///
/// Qualification is a pure function of the module's policy and the current
/// network state; an empty result mask means qualified. Site, probability,
/// frequency, and execution-limit checks are extension hooks that default to
/// passing.
pub struct Qualifier {
    network: Arc<dyn NetworkStateProvider>,
}

impl Qualifier {
    pub fn new(network: Arc<dyn NetworkStateProvider>) -> Self {
        Self { network }
    }

    /// Run every qualification test, returning the failure mask.
    pub fn run_qualifications(
        &self,
        module: &ComplianceModule,
        trigger: Option<ExecutionTrigger>,
    ) -> QualificationResult {
        self.run_qualifications_with_state(module, trigger, self.current_state())
    }

    /// As [`Self::run_qualifications`] with a pre-fetched state mask, so a
    /// caller iterating many modules avoids repeated lookups.
    pub fn run_qualifications_with_state(
        &self,
        module: &ComplianceModule,
        trigger: Option<ExecutionTrigger>,
        current_state: crate::domain::models::ExecutionPrerequisites,
    ) -> QualificationResult {
        let mut results = QualificationResult::QUALIFIED;

        if let Some(trigger) = trigger {
            if !self.qualifies_for_trigger(module, trigger) {
                results |= QualificationResult::TRIGGER_NOT_QUALIFIED;
            }
        }

        if !Self::qualifies_for_state(module, current_state) {
            results |= QualificationResult::PREREQUISITES_NOT_MET;
        }

        results
    }

    /// Current network state mask from the detector.
    pub fn current_state(&self) -> crate::domain::models::ExecutionPrerequisites {
        self.network.current_state()
    }

    /// Whether the module is registered for the given trigger.
    pub fn qualifies_for_trigger(
        &self,
        module: &ComplianceModule,
        trigger: ExecutionTrigger,
    ) -> bool {
        !module.triggers.is_empty() && module.triggers.contains(trigger)
    }

    /// All required prerequisite bits must be present in the state mask.
    pub fn qualifies_for_state(
        module: &ComplianceModule,
        state: crate::domain::models::ExecutionPrerequisites,
    ) -> bool {
        state & module.prerequisites == module.prerequisites
    }
}
