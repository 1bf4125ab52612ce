//! Daemon wiring.
//!
//! `Agent` owns every subsystem: the compliance controller, the
//! configuration controller and its modules, registration, and the event
//! router. Feature controls gate which subsystems run; `reload` re-reads
//! manifests and applies toggles in a fixed order (pause configuration
//! ticks, drain in-flight responses, swap settings, resume).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::{Mutex, Notify, RwLock};
use tracing::{error, info, warn};

use crate::domain::errors::{AgentError, AgentResult};
use crate::domain::models::{
    AgentConfig, AgentEvent, ComplianceStatus, ExecutionAction, ExecutionTrigger, FeatureControls,
    RouteMap,
};
use crate::domain::ports::{
    EventSink, Identity, ModuleDefinition, NetworkStateProvider, PlatformProbe, RegistrarApi,
};
use crate::infrastructure::crypto::RsaIdentity;
use crate::infrastructure::persistence::StateLayout;
use crate::infrastructure::platform::{FileNetworkState, SystemPlatformProbe};
use crate::infrastructure::registrar::HttpRegistrarClient;
use crate::infrastructure::sink::HttpEventSink;
use crate::services::compliance_config::ComplianceConfigModule;
use crate::services::config_controller::ConfigurationController;
use crate::services::config_files::ConfigFileModule;
use crate::services::controller::ComplianceController;
use crate::services::event_router::EventRouter;
use crate::services::qualifier::Qualifier;
use crate::services::registration::{
    RegistrationManager, RegistrationStatus, SharedRegistration,
};
use crate::services::registry::ModuleRegistry;
use crate::services::token_config::{CredentialCell, StsTokenConfigModule};
use crate::services::usher::UsherConfigModule;

/// Progress of a CLI-triggered evaluation or remediation sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Idle,
    Running,
    Finished,
}

/// Collaborators the daemon core delegates to. Tests inject fakes; the
/// binary wires the system implementations via [`Agent::bootstrap`].
pub struct AgentDeps {
    pub network: Arc<dyn NetworkStateProvider>,
    pub platform: Arc<dyn PlatformProbe>,
    pub identity: Arc<Mutex<Box<dyn Identity>>>,
    pub sink: Arc<dyn EventSink>,
    pub registrar: Option<Arc<dyn RegistrarApi>>,
    pub definitions: Vec<ModuleDefinition>,
}

/// The daemon: subsystem owner and lifecycle driver.
pub struct Agent {
    config: AgentConfig,
    layout: StateLayout,
    started_at: DateTime<Utc>,
    controls: RwLock<FeatureControls>,

    platform: Arc<dyn PlatformProbe>,
    network: Arc<dyn NetworkStateProvider>,
    identity: Arc<Mutex<Box<dyn Identity>>>,
    registrar: Option<Arc<dyn RegistrarApi>>,

    router: Arc<EventRouter>,
    compliance: Arc<ComplianceController>,
    config_controller: Arc<ConfigurationController>,
    registration_manager: Option<Arc<RegistrationManager>>,
    registration_state: SharedRegistration,
    credentials: CredentialCell,
    usher_module: Option<Arc<UsherConfigModule>>,

    definitions: Mutex<Vec<ModuleDefinition>>,
    evaluation_state: Arc<Mutex<ProcessState>>,
    remediation_state: Arc<Mutex<ProcessState>>,
    shutdown: Notify,
}

impl Agent {
    /// Assemble the daemon from explicit collaborators.
    pub fn new(config: AgentConfig, deps: AgentDeps) -> Self {
        let layout = StateLayout::new(&config);
        let registry = Arc::new(Mutex::new(ModuleRegistry::new(
            Some(layout.state_dir.clone()),
            Some(layout.manifest_dir.clone()),
        )));
        let qualifier = Arc::new(Qualifier::new(Arc::clone(&deps.network)));

        let route_map = RouteMap::load_from_file(&layout.routes_path()).unwrap_or_default();
        let router = Arc::new(EventRouter::new(
            Arc::clone(&deps.sink),
            route_map,
            layout.event_buffer_path(),
        ));

        let compliance = Arc::new(ComplianceController::new(
            config.compliance.clone(),
            Arc::clone(&registry),
            qualifier,
            Arc::clone(&router),
        ));

        let registration_state: SharedRegistration = Arc::new(RwLock::new(None));
        let credentials: CredentialCell = Arc::new(RwLock::new(None));
        let config_controller = Arc::new(ConfigurationController::new());

        let registration_manager = deps.registrar.as_ref().map(|registrar| {
            Arc::new(RegistrationManager::new(
                Arc::clone(registrar),
                Arc::clone(&deps.platform),
                Arc::clone(&deps.identity),
                Arc::clone(&registration_state),
                Arc::clone(&router),
                config.registration.clone(),
                layout.manifest_dir.clone(),
            ))
        });

        let usher_module = deps.registrar.as_ref().map(|registrar| {
            Arc::new(UsherConfigModule::new(
                Arc::clone(registrar),
                Arc::clone(&deps.platform),
                Arc::clone(&router),
                Arc::clone(&registration_state),
                layout.installers_dir.clone(),
                layout.installer_staging_dir.clone(),
                layout.config_state_dir.join("usher.json"),
                config.usher.verify_codesign,
                config.usher.watcher_check_attempts,
            ))
        });

        Self {
            config,
            layout,
            started_at: Utc::now(),
            controls: RwLock::new(FeatureControls::default()),
            platform: deps.platform,
            network: deps.network,
            identity: deps.identity,
            registrar: deps.registrar,
            router,
            compliance,
            config_controller,
            registration_manager,
            registration_state,
            credentials,
            usher_module,
            definitions: Mutex::new(deps.definitions),
            evaluation_state: Arc::new(Mutex::new(ProcessState::Idle)),
            remediation_state: Arc::new(Mutex::new(ProcessState::Idle)),
            shutdown: Notify::new(),
        }
    }

    /// Wire the production collaborators from configuration.
    pub fn bootstrap(config: AgentConfig, definitions: Vec<ModuleDefinition>) -> AgentResult<Self> {
        let layout = StateLayout::new(&config);

        let network: Arc<dyn NetworkStateProvider> =
            Arc::new(FileNetworkState::new(layout.network_state_path()));
        let platform: Arc<dyn PlatformProbe> = Arc::new(SystemPlatformProbe::new(
            layout.installers_dir.clone(),
            layout.state_dir.join("system_id"),
        ));
        let identity: Arc<Mutex<Box<dyn Identity>>> = Arc::new(Mutex::new(Box::new(
            RsaIdentity::open(layout.identity_dir.clone()),
        )));

        let credentials: CredentialCell = Arc::new(RwLock::new(None));
        let sink: Arc<dyn EventSink> = Arc::new(HttpEventSink::new(
            config.events.endpoint.clone(),
            Arc::clone(&credentials),
        )?);

        let registrar: Option<Arc<dyn RegistrarApi>> = if config.registrar.address.is_empty() {
            warn!("no registrar address configured; registration, configuration pull, and usher are disabled");
            None
        } else {
            match HttpRegistrarClient::new(&config.registrar, Arc::clone(&identity)) {
                Ok(client) => Some(Arc::new(client)),
                Err(err) => {
                    error!(error = %err, "failed to build registrar client");
                    None
                }
            }
        };

        let mut agent = Self::new(
            config,
            AgentDeps {
                network,
                platform,
                identity,
                sink,
                registrar,
                definitions,
            },
        );
        agent.credentials = credentials;
        Ok(agent)
    }

    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn compliance(&self) -> Arc<ComplianceController> {
        Arc::clone(&self.compliance)
    }

    pub fn router(&self) -> Arc<EventRouter> {
        Arc::clone(&self.router)
    }

    // MARK: Lifecycle

    /// Provision directories, read manifests, and start the enabled
    /// subsystems.
    pub async fn start(self: &Arc<Self>) -> AgentResult<()> {
        info!(version = %Self::version(), "starting agent daemon");

        let failed = self.layout.ensure();
        if !failed.is_empty() {
            warn!(?failed, "some support directories are unavailable; affected subsystems run degraded");
        }

        let controls = FeatureControls::load(&self.config.feature_controls_path())
            .unwrap_or_default();
        *self.controls.write().await = controls;
        self.router.set_enabled(controls.karl_registrar_enabled);

        if controls.compliance_enabled {
            let definitions = self.definitions.lock().await.clone();
            self.compliance.load_modules(definitions, true).await;
            self.compliance.start().await;
        } else {
            info!("compliance is disabled by feature controls");
        }

        if let Some(registrar) = &self.registrar {
            self.register_config_modules(registrar, controls).await;
            self.config_controller.start().await;

            if let Some(manager) = &self.registration_manager {
                if let Err(err) = manager.load_registration_data().await {
                    warn!(error = %err, "could not load registration data");
                }
                manager.start().await;

                // Successful registration restarts configuration pulls so
                // they run with the fresh identity.
                let mut registered_rx = manager.subscribe_registered();
                let config_controller = Arc::clone(&self.config_controller);
                tokio::spawn(async move {
                    while registered_rx.recv().await.is_ok() {
                        info!("registration completed, restarting configuration controller");
                        config_controller.restart().await;
                    }
                });
            }
        }

        Ok(())
    }

    async fn register_config_modules(
        &self,
        registrar: &Arc<dyn RegistrarApi>,
        controls: FeatureControls,
    ) {
        self.config_controller
            .register_module(Arc::new(ComplianceConfigModule::new(
                Arc::clone(registrar),
                Arc::clone(&self.platform),
                self.compliance.registry(),
                self.layout.config_state_dir.join("compliance.json"),
            )))
            .await;

        self.config_controller
            .register_module(Arc::new(StsTokenConfigModule::new(
                Arc::clone(registrar),
                Arc::clone(&self.platform),
                Arc::clone(&self.credentials),
                self.layout.config_state_dir.join("sts_token.json"),
            )))
            .await;

        self.config_controller
            .register_module(Arc::new(ConfigFileModule::new(
                Arc::clone(registrar),
                Arc::clone(&self.platform),
                Arc::clone(&self.registration_state),
                self.layout.routes_dir.clone(),
                self.layout.module_staging_dir.clone(),
                self.layout.config_state_dir.join("configfile.json"),
            )))
            .await;

        if controls.usher_enabled {
            if let Some(usher) = &self.usher_module {
                self.config_controller
                    .register_module(Arc::clone(usher) as Arc<dyn crate::services::ConfigModule>)
                    .await;
            }
        }
    }

    /// Reload manifests and re-apply feature toggles.
    ///
    /// Order: pause configuration ticks, drain in-flight compliance
    /// responses, swap settings, resume.
    pub async fn reload(self: &Arc<Self>) -> AgentResult<()> {
        info!("reloading agent");

        self.config_controller.stop().await;
        self.compliance.process_execution_responses().await;

        let controls =
            FeatureControls::load(&self.config.feature_controls_path()).unwrap_or_default();
        let previous = {
            let mut guard = self.controls.write().await;
            let previous = *guard;
            *guard = controls;
            previous
        };

        if let Ok(map) = RouteMap::load_from_file(&self.layout.routes_path()) {
            self.router.set_route_map(map).await;
        }
        self.router.set_enabled(controls.karl_registrar_enabled);
        self.compliance.reload().await;

        if controls.compliance_enabled && !self.compliance.is_running() {
            let definitions = self.definitions.lock().await.clone();
            self.compliance.load_modules(definitions, true).await;
            self.compliance.start().await;
        } else if !controls.compliance_enabled && self.compliance.is_running() {
            self.compliance.stop().await;
        }

        if controls.usher_enabled != previous.usher_enabled {
            if let Some(usher) = &self.usher_module {
                if controls.usher_enabled {
                    self.config_controller
                        .register_module(
                            Arc::clone(usher) as Arc<dyn crate::services::ConfigModule>
                        )
                        .await;
                } else {
                    self.config_controller.deregister_module("usher").await;
                }
            }
        }

        if self.registrar.is_some() {
            self.config_controller.start().await;
        }
        Ok(())
    }

    /// Stop every subsystem and flush what can be flushed.
    pub async fn stop(&self) {
        info!("shutting down agent daemon");
        self.config_controller.stop().await;
        if let Some(manager) = &self.registration_manager {
            manager.stop().await;
        }
        if self.compliance.is_running() {
            self.compliance.stop().await;
        }
        self.router.flush_buffer().await;
        info!("agent daemon stopped");
    }

    /// Ask the run loop to exit.
    pub fn request_shutdown(&self) {
        self.shutdown.notify_one();
    }

    /// Run until a termination signal or a shutdown command arrives.
    /// SIGHUP triggers a reload.
    pub async fn run(self: &Arc<Self>) -> AgentResult<()> {
        self.start().await?;

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = signal(SignalKind::terminate())
                .map_err(|err| AgentError::SubsystemUnset(err.to_string()))?;
            let mut sigint = signal(SignalKind::interrupt())
                .map_err(|err| AgentError::SubsystemUnset(err.to_string()))?;
            let mut sighup = signal(SignalKind::hangup())
                .map_err(|err| AgentError::SubsystemUnset(err.to_string()))?;

            loop {
                tokio::select! {
                    _ = sigterm.recv() => break,
                    _ = sigint.recv() => break,
                    _ = sighup.recv() => {
                        if let Err(err) = self.reload().await {
                            error!(error = %err, "reload failed");
                        }
                    }
                    () = self.shutdown.notified() => break,
                }
            }
        }
        #[cfg(not(unix))]
        {
            self.shutdown.notified().await;
        }

        self.stop().await;
        Ok(())
    }

    // MARK: Command surface

    pub async fn feature_controls(&self) -> FeatureControls {
        *self.controls.read().await
    }

    pub async fn device_status(&self) -> ComplianceStatus {
        self.compliance.device_status().await
    }

    /// Kick off a manual compliance sweep; progress is observable through
    /// the matching status poll.
    pub async fn trigger_compliance(
        self: &Arc<Self>,
        action: ExecutionAction,
        identifier: Option<String>,
    ) -> AgentResult<()> {
        if !self.compliance.is_running() {
            return Err(AgentError::SubsystemUnset(
                "compliance controller".to_string(),
            ));
        }

        let state = match action {
            ExecutionAction::Evaluation => Arc::clone(&self.evaluation_state),
            ExecutionAction::Remediation => Arc::clone(&self.remediation_state),
        };
        {
            let mut guard = state.lock().await;
            if *guard == ProcessState::Running {
                return Ok(());
            }
            *guard = ProcessState::Running;
        }

        let agent = Arc::clone(self);
        tokio::spawn(async move {
            match identifier {
                Some(identifier) => {
                    let registry = agent.compliance.registry();
                    let mut registry = registry.lock().await;
                    if let (Some(behavior), Some(module)) = (
                        registry.behavior(&identifier),
                        registry.get_mut(&identifier),
                    ) {
                        agent
                            .compliance
                            .try_queue_request(
                                module,
                                behavior,
                                Some(ExecutionTrigger::MANUAL),
                                action,
                                None,
                            )
                            .await;
                    } else {
                        warn!(module = %identifier, "manual trigger for unknown module");
                    }
                }
                None => {
                    let data = json!({"action": action.as_str()});
                    agent
                        .compliance
                        .execute_trigger(ExecutionTrigger::MANUAL, Some(data))
                        .await;
                }
            }

            // Hold the running state until the sweep settles or times out.
            let deadline = Utc::now() + chrono::Duration::minutes(10);
            loop {
                tokio::time::sleep(Duration::from_secs(1)).await;
                if agent.compliance.status().await == 0 || Utc::now() > deadline {
                    break;
                }
            }
            *state.lock().await = ProcessState::Finished;
        });
        Ok(())
    }

    pub async fn evaluation_state(&self) -> ProcessState {
        *self.evaluation_state.lock().await
    }

    pub async fn remediation_state(&self) -> ProcessState {
        *self.remediation_state.lock().await
    }

    pub async fn compliance_snapshot(&self, include_history: bool) -> Value {
        json!({
            "device_status": self.compliance.device_status().await.bits(),
            "compliance_deadline": self.compliance.compliance_deadline().await,
            "isolation_deadline": self.compliance.isolation_deadline().await,
            "modules": self.compliance.module_snapshots(include_history).await,
        })
    }

    pub async fn module_status(&self, identifier: &str) -> AgentResult<Value> {
        let registry = self.compliance.registry();
        let registry = registry.lock().await;
        let module = registry
            .get(identifier)
            .ok_or_else(|| AgentError::ModuleNotFound(identifier.to_string()))?;
        Ok(serde_json::to_value(module)?)
    }

    pub async fn reload_modules(&self) -> usize {
        let definitions = self.definitions.lock().await.clone();
        let count = definitions.len();
        self.compliance.load_modules(definitions, true).await;
        count
    }

    pub async fn system_id(&self) -> Option<String> {
        match &self.registration_manager {
            Some(manager) => manager.system_id().await,
            None => self.platform.system_identifier(),
        }
    }

    pub fn current_user(&self) -> Option<String> {
        self.platform.current_user()
    }

    pub async fn is_registered(&self) -> bool {
        match &self.registration_manager {
            Some(manager) => manager.is_registered().await,
            None => false,
        }
    }

    pub fn network_state_bits(&self) -> u32 {
        self.network.current_state().bits()
    }

    pub async fn posture_token(&self, duration: chrono::Duration) -> AgentResult<String> {
        let identity = self.identity.lock().await;
        if !identity.is_signed() {
            return Err(AgentError::IdentityError(
                "identity is not signed; register first".to_string(),
            ));
        }
        identity.sign_posture_token(duration)
    }

    pub async fn register_with_token(&self, token: String, force: bool) -> RegistrationStatus {
        match &self.registration_manager {
            Some(manager) => manager.register_with_token(token, force).await,
            None => RegistrationStatus::Failed("registrar is not configured".to_string()),
        }
    }

    pub async fn registration_status(&self) -> Option<RegistrationStatus> {
        match &self.registration_manager {
            Some(manager) => Some(manager.cli_registration_status().await),
            None => None,
        }
    }

    /// Enqueue a caller-supplied event; `proxied` marks events forwarded
    /// from the user-session agent.
    pub async fn commit_event(&self, event_data: Value, proxied: bool) -> AgentResult<()> {
        let event_type = event_data
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::ValidationFailed("event has no type".to_string()))?;
        let subject_area = event_data
            .get("subject_area")
            .and_then(Value::as_str)
            .unwrap_or("default");

        let mut event = AgentEvent::new(event_type, subject_area);
        if let Some(Value::Object(payload)) = event_data.get("payload") {
            event.payload = payload.clone();
        }
        if proxied {
            event
                .payload
                .insert("proxied".to_string(), Value::Bool(true));
        }
        self.router.dispatch(event).await;
        Ok(())
    }

    pub fn group_cache(&self) -> AgentResult<Value> {
        match crate::infrastructure::persistence::read_json::<Value>(
            &self.layout.group_cache_path(),
        )? {
            Some(value) => Ok(value),
            None => Err(AgentError::SubsystemUnset("group cache".to_string())),
        }
    }

    pub async fn karl_status(&self) -> Value {
        json!({
            "enabled": self.router.is_enabled(),
            "buffered_events": self.router.buffered_count().await,
        })
    }

    pub async fn health_info(&self) -> Value {
        json!({
            "version": Self::version(),
            "started_at": self.started_at,
            "uptime_secs": (Utc::now() - self.started_at).num_seconds(),
            "compliance_running": self.compliance.is_running(),
            "configuration_running": self.config_controller.is_running(),
            "registered": self.is_registered().await,
            "feature_controls": serde_json::to_value(self.feature_controls().await).unwrap_or(Value::Null),
        })
    }

    pub async fn daemon_status(&self) -> Value {
        json!({
            "status": self.compliance.status().await,
            "device_status": self.compliance.device_status().await.bits(),
            "uptime_secs": (Utc::now() - self.started_at).num_seconds(),
        })
    }
}
