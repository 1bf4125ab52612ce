//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use acme_agent::domain::errors::AgentResult;
use acme_agent::domain::models::{
    AgentEvent, ComplianceModule, ComplianceStatus, EvaluationResult, ExecutionStatus,
    ExecutionTrigger, InstallerEntry, RemediationResult,
};
use acme_agent::domain::ports::{
    ApiResponse, EventSink, Identity, ModuleBehavior, ModuleDefinition, PlatformProbe,
    RegistrarApi, RegistrarError,
};

/// Behavior that reports a fixed compliance outcome and counts invocations.
pub struct ScriptedBehavior {
    pub identifier: String,
    pub compliance: ComplianceStatus,
    pub evaluations: AtomicUsize,
    pub remediations: AtomicUsize,
}

impl ScriptedBehavior {
    pub fn compliant(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            compliance: ComplianceStatus::COMPLIANT,
            evaluations: AtomicUsize::new(0),
            remediations: AtomicUsize::new(0),
        }
    }

    pub fn noncompliant(identifier: &str) -> Self {
        Self {
            identifier: identifier.to_string(),
            compliance: ComplianceStatus::NONCOMPLIANT,
            evaluations: AtomicUsize::new(0),
            remediations: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ModuleBehavior for ScriptedBehavior {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn evaluate(
        &self,
        _module: &ComplianceModule,
        _trigger: Option<ExecutionTrigger>,
        _data: Option<&Value>,
    ) -> AgentResult<EvaluationResult> {
        self.evaluations.fetch_add(1, Ordering::SeqCst);
        Ok(EvaluationResult::new(
            self.compliance,
            ExecutionStatus::SUCCESS,
        ))
    }

    async fn remediate(
        &self,
        _module: &ComplianceModule,
        _trigger: Option<ExecutionTrigger>,
        _data: Option<&Value>,
    ) -> AgentResult<RemediationResult> {
        self.remediations.fetch_add(1, Ordering::SeqCst);
        Ok(RemediationResult::new(ExecutionStatus::SUCCESS))
    }
}

/// Build a scheduled-evaluation module definition around a behavior.
pub fn scheduled_definition(
    identifier: &str,
    behavior: Arc<dyn ModuleBehavior>,
) -> ModuleDefinition {
    let mut module = ComplianceModule::new(identifier);
    module.triggers = ExecutionTrigger::SCHEDULED | ExecutionTrigger::MANUAL;
    module.evaluation_interval = Some(chrono::Duration::hours(4));
    ModuleDefinition::new(module, behavior)
}

/// Sink that records delivered events in memory.
#[derive(Default)]
pub struct RecordingSink {
    pub events: std::sync::Mutex<Vec<(String, AgentEvent)>>,
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn submit(&self, event: &AgentEvent, stream: &str) -> AgentResult<()> {
        self.events
            .lock()
            .unwrap()
            .push((stream.to_string(), event.clone()));
        Ok(())
    }
}

/// Registrar serving canned API payloads keyed by URL path and canned
/// artifact bytes keyed by URL.
#[derive(Default)]
pub struct CannedRegistrar {
    pub responses: HashMap<String, Value>,
    pub files: HashMap<String, Vec<u8>>,
}

#[async_trait]
impl RegistrarApi for CannedRegistrar {
    async fn call(&self, url_path: &str, _params: &Value) -> Result<ApiResponse, RegistrarError> {
        match self.responses.get(url_path) {
            Some(data) => Ok(ApiResponse {
                status: 0,
                data: Some(data.clone()),
                message: None,
            }),
            None => Ok(ApiResponse {
                status: 1,
                data: None,
                message: Some(format!("no canned response for {url_path}")),
            }),
        }
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), RegistrarError> {
        let bytes = self
            .files
            .get(url)
            .ok_or_else(|| RegistrarError::Transport(format!("no canned artifact for {url}")))?;
        std::fs::write(dest, bytes).map_err(|err| RegistrarError::Transport(err.to_string()))?;
        Ok(())
    }
}

/// In-memory identity that treats any installed certificate as signed.
pub struct MemoryIdentity {
    pub common_name: Option<String>,
    pub certificate: Option<String>,
}

impl MemoryIdentity {
    pub fn unsigned() -> Self {
        Self {
            common_name: None,
            certificate: None,
        }
    }

    pub fn signed(common_name: &str) -> Self {
        Self {
            common_name: Some(common_name.to_string()),
            certificate: Some("cert".to_string()),
        }
    }
}

impl Identity for MemoryIdentity {
    fn common_name(&self) -> Option<String> {
        self.common_name.clone()
    }

    fn generate(&mut self, common_name: &str) -> AgentResult<()> {
        self.common_name = Some(common_name.to_string());
        self.certificate = None;
        Ok(())
    }

    fn csr_pem(&self) -> AgentResult<String> {
        Ok("-----BEGIN CERTIFICATE REQUEST-----\nx\n-----END CERTIFICATE REQUEST-----".to_string())
    }

    fn install_certificate(&mut self, cert_pem: &str) -> AgentResult<()> {
        self.certificate = Some(cert_pem.to_string());
        Ok(())
    }

    fn certificate_pem(&self) -> Option<String> {
        self.certificate.clone()
    }

    fn is_signed(&self) -> bool {
        self.certificate.is_some()
    }

    fn sign_posture_token(&self, _duration: chrono::Duration) -> AgentResult<String> {
        Ok("header.payload.signature".to_string())
    }

    fn save(&self) -> AgentResult<()> {
        Ok(())
    }

    fn load(&mut self) -> AgentResult<()> {
        Ok(())
    }
}

/// Platform probe with in-memory component versions and a controllable
/// watcher flag.
pub struct MemoryPlatform {
    pub installed: std::sync::Mutex<HashMap<String, String>>,
    pub identifier: std::sync::Mutex<Option<String>>,
    pub watcher_running: bool,
    pub installs: AtomicUsize,
}

impl Default for MemoryPlatform {
    fn default() -> Self {
        Self {
            installed: std::sync::Mutex::new(HashMap::new()),
            identifier: std::sync::Mutex::new(None),
            watcher_running: true,
            installs: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl PlatformProbe for MemoryPlatform {
    fn platform(&self) -> String {
        "Ubuntu".to_string()
    }

    fn platform_version(&self) -> String {
        "22.04".to_string()
    }

    fn current_user(&self) -> Option<String> {
        Some("root".to_string())
    }

    fn system_identifier(&self) -> Option<String> {
        self.identifier.lock().unwrap().clone()
    }

    fn set_system_identifier(&self, identifier: &str) -> AgentResult<()> {
        *self.identifier.lock().unwrap() = Some(identifier.to_string());
        Ok(())
    }

    fn installed_version(&self, identifier: &str) -> Option<String> {
        self.installed.lock().unwrap().get(identifier).cloned()
    }

    fn bad_versions(&self, _identifier: &str) -> Vec<String> {
        Vec::new()
    }

    async fn is_watcher_running(&self) -> bool {
        self.watcher_running
    }

    async fn verify_codesign(&self, _package_path: &Path) -> AgentResult<bool> {
        Ok(true)
    }

    async fn install_package(
        &self,
        entry: &InstallerEntry,
        _package_path: &Path,
    ) -> AgentResult<()> {
        self.installs.fetch_add(1, Ordering::SeqCst);
        if let Some(version) = &entry.version {
            self.installed
                .lock()
                .unwrap()
                .insert(entry.identifier.clone(), version.clone());
        }
        Ok(())
    }

    fn installer_extension(&self) -> &'static str {
        "deb"
    }
}

/// Boxed identity handle in the shape the daemon expects.
pub fn identity_handle(identity: MemoryIdentity) -> Arc<Mutex<Box<dyn Identity>>> {
    Arc::new(Mutex::new(Box::new(identity)))
}
