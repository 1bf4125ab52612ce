//! Compliance module registry.
//!
//! Holds the live module records and their behaviors, keyed by identifier.
//! Modules arrive from a compile-time definition table (no dynamic code
//! loading); hot replace swaps the record while preserving runtime state.
//! Callers serialize access through the controller's load lock.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::domain::errors::{AgentError, AgentResult};
use crate::domain::models::{ComplianceModule, ModuleSettings};
use crate::domain::ports::{ModuleBehavior, ModuleDefinition};

/// Outcome of a batch load.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub loaded: Vec<String>,
    pub num_failures: usize,
    pub load_time_ms: i64,
}

/// Registry of loaded compliance modules.
pub struct ModuleRegistry {
    modules: HashMap<String, ComplianceModule>,
    behaviors: HashMap<String, Arc<dyn ModuleBehavior>>,
    state_dir: Option<PathBuf>,
    manifest_dir: Option<PathBuf>,
}

impl ModuleRegistry {
    pub fn new(state_dir: Option<PathBuf>, manifest_dir: Option<PathBuf>) -> Self {
        Self {
            modules: HashMap::new(),
            behaviors: HashMap::new(),
            state_dir,
            manifest_dir,
        }
    }

    /// Load a batch of module definitions. Individual failures are logged
    /// and counted; they never fail the batch.
    pub fn load_definitions(&mut self, definitions: Vec<ModuleDefinition>) -> LoadReport {
        let start = Utc::now();
        let mut report = LoadReport::default();

        for definition in definitions {
            let identifier = definition.identifier().to_string();
            match self.load_module(definition) {
                Ok(()) => {
                    info!(module = %identifier, "loaded compliance module");
                    report.loaded.push(identifier);
                }
                Err(err) => {
                    report.num_failures += 1;
                    error!(module = %identifier, error = %err, "failed to load compliance module");
                }
            }
        }

        report.load_time_ms = (Utc::now() - start).num_milliseconds();
        report
    }

    /// Load one module: allocate its state and manifest locations, restore
    /// settings and state from disk, and merge runtime state from any entry
    /// it replaces.
    pub fn load_module(&mut self, definition: ModuleDefinition) -> AgentResult<()> {
        let ModuleDefinition {
            mut module,
            behavior,
        } = definition;
        let identifier = module.identifier.clone();

        if let Some(state_dir) = &self.state_dir {
            let path = if module.needs_state_dir {
                let dir = state_dir.join(&identifier);
                ensure_dir(&dir)?;
                dir
            } else {
                state_dir.join(format!("{identifier}.json"))
            };
            module.state_path = Some(path);
        }

        if let Some(manifest_dir) = &self.manifest_dir {
            let path = if module.needs_manifest_dir {
                let dir = manifest_dir.join(&identifier);
                ensure_dir(&dir)?;
                dir
            } else {
                manifest_dir.join(format!("{identifier}.json"))
            };
            module.manifest_path = Some(path);
        }

        behavior.register_support_files(&mut module);

        if behavior.wants_execution_lock() && module.execution_lock.is_none() {
            module.execution_lock = Some(Arc::new(tokio::sync::Mutex::new(())));
        }

        module
            .load()
            .map_err(|err| AgentError::ModuleLoadFailed {
                identifier: identifier.clone(),
                reason: err.to_string(),
            })?;

        // Hot replace: carry over the previous entry's runtime state and
        // transient status.
        if let Some(existing) = self.modules.remove(&identifier) {
            debug!(module = %identifier, "replacing loaded module, merging state");
            module.apply_state(existing.state());
            module.status = existing.status;
            if module.execution_lock.is_none() {
                module.execution_lock = existing.execution_lock;
            }
        }

        self.behaviors.insert(identifier.clone(), behavior);
        self.modules.insert(identifier, module);
        Ok(())
    }

    /// Remove a module. Returns the record it held.
    pub fn unload(&mut self, identifier: &str) -> Option<ComplianceModule> {
        self.behaviors.remove(identifier);
        let removed = self.modules.remove(identifier);
        if removed.is_some() {
            info!(module = %identifier, "unloaded compliance module");
        } else {
            warn!(module = %identifier, "module was not loaded");
        }
        removed
    }

    pub fn get(&self, identifier: &str) -> Option<&ComplianceModule> {
        self.modules.get(identifier)
    }

    pub fn get_mut(&mut self, identifier: &str) -> Option<&mut ComplianceModule> {
        self.modules.get_mut(identifier)
    }

    pub fn behavior(&self, identifier: &str) -> Option<Arc<dyn ModuleBehavior>> {
        self.behaviors.get(identifier).cloned()
    }

    pub fn is_loaded(&self, identifier: &str) -> bool {
        self.modules.contains_key(identifier)
    }

    pub fn identifiers(&self) -> Vec<String> {
        self.modules.keys().cloned().collect()
    }

    pub fn modules(&self) -> impl Iterator<Item = &ComplianceModule> {
        self.modules.values()
    }

    pub fn modules_mut(&mut self) -> impl Iterator<Item = &mut ComplianceModule> {
        self.modules.values_mut()
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Re-read settings manifests for every loaded module.
    pub fn reload_settings(&mut self) {
        for module in self.modules.values_mut() {
            if let Err(err) = module.load_settings() {
                error!(module = %module.identifier, error = %err, "failed to reload settings");
            }
        }
    }

    /// Apply a settings document delivered by the configuration pipeline,
    /// persisting it to the module's manifest location.
    pub fn apply_settings(&mut self, settings: ModuleSettings) -> AgentResult<()> {
        let module = self
            .modules
            .get_mut(&settings.identifier)
            .ok_or_else(|| AgentError::ModuleNotFound(settings.identifier.clone()))?;

        if let Some(path) = module.settings_filepath() {
            let doc = serde_json::to_string_pretty(&settings)?;
            let tmp = path.with_extension("json.tmp");
            std::fs::write(&tmp, doc)?;
            std::fs::rename(&tmp, &path)?;
        }
        module.apply_settings(settings);
        Ok(())
    }
}

fn ensure_dir(path: &std::path::Path) -> AgentResult<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::Value;

    use crate::domain::models::{
        ComplianceStatus, EvaluationResult, ExecutionStatus, ExecutionTrigger, ModuleStatus,
        RemediationResult,
    };

    struct StubBehavior {
        identifier: String,
    }

    #[async_trait]
    impl ModuleBehavior for StubBehavior {
        fn identifier(&self) -> &str {
            &self.identifier
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

    fn definition(identifier: &str) -> ModuleDefinition {
        ModuleDefinition::new(
            ComplianceModule::new(identifier),
            Arc::new(StubBehavior {
                identifier: identifier.to_string(),
            }),
        )
    }

    #[test]
    fn test_load_allocates_state_paths() {
        let state = tempfile::tempdir().unwrap();
        let manifest = tempfile::tempdir().unwrap();
        let mut registry = ModuleRegistry::new(
            Some(state.path().to_path_buf()),
            Some(manifest.path().to_path_buf()),
        );

        registry.load_module(definition("screen_lock")).unwrap();
        let module = registry.get("screen_lock").unwrap();
        assert_eq!(
            module.state_path,
            Some(state.path().join("screen_lock.json"))
        );
        assert_eq!(
            module.manifest_path,
            Some(manifest.path().join("screen_lock.json"))
        );
    }

    #[test]
    fn test_dedicated_state_dir_is_created() {
        let state = tempfile::tempdir().unwrap();
        let mut registry = ModuleRegistry::new(Some(state.path().to_path_buf()), None);

        let mut def = definition("patch_level");
        def.module.needs_state_dir = true;
        registry.load_module(def).unwrap();

        assert!(state.path().join("patch_level").is_dir());
    }

    #[test]
    fn test_hot_replace_preserves_state() {
        let mut registry = ModuleRegistry::new(None, None);
        registry.load_module(definition("screen_lock")).unwrap();

        {
            let module = registry.get_mut("screen_lock").unwrap();
            module.status = ModuleStatus::Queued;
            module.first_failure_date = Some(Utc::now());
            module.last_evaluation_result = Some(EvaluationResult::new(
                ComplianceStatus::NONCOMPLIANT,
                ExecutionStatus::SUCCESS,
            ));
        }

        let mut replacement = definition("screen_lock");
        replacement.module.version = Some("2.0".to_string());
        registry.load_module(replacement).unwrap();

        let module = registry.get("screen_lock").unwrap();
        assert_eq!(module.version, Some("2.0".to_string()));
        assert_eq!(module.status, ModuleStatus::Queued);
        assert!(module.first_failure_date.is_some());
        assert!(module.last_evaluation_result.is_some());
    }

    #[test]
    fn test_settings_restored_from_manifest() {
        let manifest = tempfile::tempdir().unwrap();
        std::fs::write(
            manifest.path().join("screen_lock.json"),
            r#"{"identifier": "screen_lock", "priority": 7, "auto_remediate": true, "can_remediate": true}"#,
        )
        .unwrap();

        let mut registry = ModuleRegistry::new(None, Some(manifest.path().to_path_buf()));
        registry.load_module(definition("screen_lock")).unwrap();

        let module = registry.get("screen_lock").unwrap();
        assert_eq!(module.priority, 7);
        assert!(module.auto_remediate);
    }

    #[test]
    fn test_batch_load_counts_failures() {
        let state = tempfile::tempdir().unwrap();
        std::fs::write(state.path().join("broken.json"), "{not json").unwrap();

        let mut registry = ModuleRegistry::new(Some(state.path().to_path_buf()), None);
        let report =
            registry.load_definitions(vec![definition("broken"), definition("screen_lock")]);

        assert_eq!(report.num_failures, 1);
        assert_eq!(report.loaded, vec!["screen_lock".to_string()]);
        assert!(!registry.is_loaded("broken"));
        assert!(registry.is_loaded("screen_lock"));
    }

    #[test]
    fn test_unload() {
        let mut registry = ModuleRegistry::new(None, None);
        registry.load_module(definition("screen_lock")).unwrap();
        assert!(registry.unload("screen_lock").is_some());
        assert!(registry.unload("screen_lock").is_none());
        assert!(registry.is_empty());
    }
}
