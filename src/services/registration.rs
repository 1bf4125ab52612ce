//! Registration and renewal against the central registrar.
//!
//! Registration negotiates a device UUID, submits a CSR over fresh key
//! material, and stores the signed certificate plus renewal metadata.
//! A recurring check (hourly, skewed) renews before expiry; failures ride
//! the timer's exponential backoff.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, error, info, warn};

use crate::domain::errors::{AgentError, AgentResult};
use crate::domain::models::{AgentEvent, RegistrationConfig};
use crate::domain::ports::{Identity, PlatformProbe, RegistrarApi, RegistrarError};
use crate::services::event_router::EventRouter;
use crate::services::timer::{RecurringTimer, TimerConfig, TimerError};

/// Registrar-issued registration state, persisted to
/// `manifests/registration_data.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistrationData {
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub renewal_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub certificate: Option<String>,
    /// PEM certificate that signs configuration payloads and installers.
    #[serde(default)]
    pub config_signing_authority: Option<String>,
}

/// Shared, read-mostly view of the current registration.
pub type SharedRegistration = Arc<RwLock<Option<RegistrationData>>>;

/// Progress of an asynchronous CLI-initiated registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistrationStatus {
    Idle,
    Running,
    Succeeded,
    Failed(String),
    AlreadyRegistered,
}

/// Maintains the signed device identity with the registrar.
pub struct RegistrationManager {
    registrar: Arc<dyn RegistrarApi>,
    platform: Arc<dyn PlatformProbe>,
    identity: Arc<Mutex<Box<dyn Identity>>>,
    registration: SharedRegistration,
    router: Arc<EventRouter>,
    config: RegistrationConfig,
    manifest_dir: PathBuf,
    timer: Mutex<Option<RecurringTimer>>,
    cli_status: Arc<Mutex<RegistrationStatus>>,
    /// Fires after every successful registration or renewal.
    registered_tx: broadcast::Sender<()>,
}

impl RegistrationManager {
    pub fn new(
        registrar: Arc<dyn RegistrarApi>,
        platform: Arc<dyn PlatformProbe>,
        identity: Arc<Mutex<Box<dyn Identity>>>,
        registration: SharedRegistration,
        router: Arc<EventRouter>,
        config: RegistrationConfig,
        manifest_dir: PathBuf,
    ) -> Self {
        let (registered_tx, _) = broadcast::channel(4);
        Self {
            registrar,
            platform,
            identity,
            registration,
            router,
            config,
            manifest_dir,
            timer: Mutex::new(None),
            cli_status: Arc::new(Mutex::new(RegistrationStatus::Idle)),
            registered_tx,
        }
    }

    /// Subscribe to successful-registration notifications.
    pub fn subscribe_registered(&self) -> broadcast::Receiver<()> {
        self.registered_tx.subscribe()
    }

    fn registration_data_path(&self) -> PathBuf {
        self.manifest_dir.join("registration_data.json")
    }

    /// Restore persisted registration data, if present.
    pub async fn load_registration_data(&self) -> AgentResult<()> {
        let path = self.registration_data_path();
        if !path.exists() {
            return Ok(());
        }
        let raw = std::fs::read_to_string(&path)?;
        let data: RegistrationData = serde_json::from_str(&raw)?;
        *self.registration.write().await = Some(data);
        debug!("loaded registration data");
        Ok(())
    }

    async fn persist_registration_data(&self, data: &RegistrationData) -> AgentResult<()> {
        let path = self.registration_data_path();
        let doc = serde_json::to_string_pretty(data)?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, doc)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    /// Whether the system needs registration and/or renewal.
    ///
    /// Registration is needed when there is no registration data or the
    /// loaded identity is absent or unsigned; renewal when the renewal date
    /// has passed.
    pub async fn check_registration(&self) -> (bool, bool) {
        let registration = self.registration.read().await;
        let Some(data) = registration.as_ref() else {
            return (true, false);
        };
        if data.uuid.is_none() || data.certificate.is_none() {
            return (true, false);
        }

        let identity = self.identity.lock().await;
        if !identity.is_signed() {
            return (true, false);
        }
        drop(identity);

        let needs_renewal = data
            .renewal_date
            .is_some_and(|renewal| Utc::now() > renewal);
        (false, needs_renewal)
    }

    pub async fn is_registered(&self) -> bool {
        let (needs_registration, _) = self.check_registration().await;
        !needs_registration
    }

    pub async fn system_id(&self) -> Option<String> {
        self.registration
            .read()
            .await
            .as_ref()
            .and_then(|data| data.uuid.clone())
    }

    fn platform_params(&self) -> Value {
        json!({
            "platform": self.platform.platform(),
            "platform_version": self.platform.platform_version(),
        })
    }

    /// Register the system: negotiate a UUID, generate fresh key material,
    /// submit a CSR, and store the signed certificate and renewal metadata.
    pub async fn register_system(&self, token: Option<&str>) -> AgentResult<()> {
        let mut is_new_uuid = false;
        let current_uuid = match self.platform.system_identifier() {
            Some(uuid) => uuid,
            None => {
                is_new_uuid = true;
                uuid::Uuid::new_v4().to_string()
            }
        };

        info!(uuid = %current_uuid, "registering system with registrar");

        // Negotiate; the server may reset our UUID, which we adopt.
        let mut params = self.platform_params();
        params["uuid"] = Value::from(current_uuid.clone());
        if let Some(token) = token {
            params["token"] = Value::from(token);
        }
        let response = self
            .registrar
            .call("register/negotiate", &params)
            .await
            .map_err(registrar_error)?;
        if !response.is_success() {
            return Err(AgentError::RegistrationFailed(
                response
                    .message
                    .unwrap_or_else(|| "negotiation rejected".to_string()),
            ));
        }

        let negotiated_uuid = response
            .data
            .as_ref()
            .and_then(|d| d.get("uuid"))
            .and_then(Value::as_str)
            .map(ToString::to_string)
            .unwrap_or_else(|| current_uuid.clone());
        if negotiated_uuid != current_uuid {
            info!(uuid = %negotiated_uuid, "registrar reset system UUID");
            is_new_uuid = true;
        }

        // Registration always creates fresh key material.
        let csr = {
            let mut identity = self.identity.lock().await;
            identity.generate(&negotiated_uuid)?;
            identity.save()?;
            identity.csr_pem()?
        };

        let mut params = self.platform_params();
        params["uuid"] = Value::from(negotiated_uuid.clone());
        params["csr"] = Value::from(csr);
        let response = self
            .registrar
            .call("register/register", &params)
            .await
            .map_err(registrar_error)?;
        if !response.is_success() {
            return Err(AgentError::RegistrationFailed(
                response
                    .message
                    .unwrap_or_else(|| "registration rejected".to_string()),
            ));
        }

        let data = response.data.unwrap_or(Value::Null);
        let mut reg_data: RegistrationData =
            serde_json::from_value(data.clone()).unwrap_or_default();
        reg_data.uuid = Some(negotiated_uuid.clone());

        let Some(certificate) = reg_data.certificate.clone() else {
            return Err(AgentError::RegistrationFailed(
                "registrar response carried no certificate".to_string(),
            ));
        };

        {
            let mut identity = self.identity.lock().await;
            identity.install_certificate(&certificate)?;
            identity.save()?;
        }

        self.persist_registration_data(&reg_data).await?;
        *self.registration.write().await = Some(reg_data);

        if is_new_uuid {
            debug!(uuid = %negotiated_uuid, "saving new system identifier");
            self.platform.set_system_identifier(&negotiated_uuid)?;
        }

        info!(uuid = %negotiated_uuid, "system successfully registered");
        self.after_registration(&negotiated_uuid).await;
        Ok(())
    }

    /// Renew the registration with a CSR over the current identity.
    pub async fn renew(&self) -> AgentResult<()> {
        info!("renewing system registration");

        let uuid = self
            .system_id()
            .await
            .ok_or_else(|| AgentError::RegistrationFailed("no registered UUID".to_string()))?;

        let csr = {
            let identity = self.identity.lock().await;
            identity.csr_pem()?
        };

        let mut params = self.platform_params();
        params["uuid"] = Value::from(uuid.clone());
        params["csr"] = Value::from(csr);
        let response = self
            .registrar
            .call("register/renew", &params)
            .await
            .map_err(registrar_error)?;
        if !response.is_success() {
            return Err(AgentError::RegistrationFailed(
                response
                    .message
                    .unwrap_or_else(|| "renewal rejected".to_string()),
            ));
        }

        let data = response.data.unwrap_or(Value::Null);
        let mut reg_data: RegistrationData =
            serde_json::from_value(data.clone()).unwrap_or_default();
        reg_data.uuid = Some(uuid.clone());

        if let Some(certificate) = reg_data.certificate.clone() {
            let mut identity = self.identity.lock().await;
            identity.install_certificate(&certificate)?;
            identity.save()?;
        }

        self.persist_registration_data(&reg_data).await?;
        *self.registration.write().await = Some(reg_data);

        info!("system renewal complete");
        self.after_registration(&uuid).await;
        Ok(())
    }

    async fn after_registration(&self, uuid: &str) {
        let event = AgentEvent::new("SystemRegInfo", "Registration")
            .with_entry("system_id", uuid)
            .with_entry("platform", self.platform.platform())
            .with_entry("platform_version", self.platform.platform_version())
            .with_entry("registration_date", Utc::now().timestamp().to_string());
        self.router.dispatch(event).await;

        // Wake anyone waiting on fresh identity material (configuration
        // controller restart, sink credential refresh).
        let _ = self.registered_tx.send(());
    }

    /// CLI-initiated registration with an externally supplied token; runs in
    /// the background and reports through the status poll.
    pub async fn register_with_token(
        self: &Arc<Self>,
        token: String,
        force: bool,
    ) -> RegistrationStatus {
        if !force && self.is_registered().await {
            return RegistrationStatus::AlreadyRegistered;
        }
        {
            let mut status = self.cli_status.lock().await;
            if *status == RegistrationStatus::Running {
                return RegistrationStatus::Running;
            }
            *status = RegistrationStatus::Running;
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let outcome = manager.register_system(Some(&token)).await;
            let mut status = manager.cli_status.lock().await;
            *status = match outcome {
                Ok(()) => RegistrationStatus::Succeeded,
                Err(err) => {
                    error!(error = %err, "token registration failed");
                    RegistrationStatus::Failed(err.to_string())
                }
            };
        });
        RegistrationStatus::Running
    }

    pub async fn cli_registration_status(&self) -> RegistrationStatus {
        self.cli_status.lock().await.clone()
    }

    /// Start the recurring registration check.
    pub async fn start(self: &Arc<Self>) {
        let manager = Arc::clone(self);
        let timer = RecurringTimer::spawn(
            "registration",
            TimerConfig::new(StdDuration::from_secs(self.config.check_frequency_secs))
                .with_skew(StdDuration::from_secs(self.config.check_skew_secs))
                .with_retry(
                    StdDuration::from_secs(self.config.retry_frequency_secs),
                    StdDuration::from_secs(self.config.max_retry_frequency_secs),
                ),
            move || {
                let manager = Arc::clone(&manager);
                async move { manager.registration_tick().await }
            },
        );
        // First check runs promptly after startup.
        timer.reset(StdDuration::from_secs(1)).await;
        *self.timer.lock().await = Some(timer);
    }

    pub async fn stop(&self) {
        if let Some(timer) = self.timer.lock().await.take() {
            timer.cancel();
        }
    }

    async fn registration_tick(&self) -> Result<(), TimerError> {
        let (needs_registration, needs_renewal) = self.check_registration().await;

        if needs_registration {
            warn!("system is not registered, attempting registration");
            self.register_system(None)
                .await
                .map_err(|err| TimerError::Failed(anyhow::anyhow!(err)))?;
        } else if needs_renewal {
            info!("certificate approaching expiry, renewing");
            self.renew()
                .await
                .map_err(|err| TimerError::Failed(anyhow::anyhow!(err)))?;
        } else {
            debug!("registration healthy");
        }
        Ok(())
    }
}

fn registrar_error(err: RegistrarError) -> AgentError {
    AgentError::RegistrationFailed(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::domain::models::{InstallerEntry, RouteMap};
    use crate::domain::ports::{ApiResponse, EventSink};

    struct NullSink;

    #[async_trait]
    impl EventSink for NullSink {
        async fn submit(&self, _event: &AgentEvent, _stream: &str) -> AgentResult<()> {
            Ok(())
        }
    }

    struct FakeRegistrar {
        negotiated_uuid: Option<String>,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl RegistrarApi for FakeRegistrar {
        async fn call(
            &self,
            url_path: &str,
            params: &Value,
        ) -> Result<ApiResponse, RegistrarError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match url_path {
                "register/negotiate" => Ok(ApiResponse {
                    status: 0,
                    data: Some(json!({
                        "uuid": self.negotiated_uuid.clone()
                            .unwrap_or_else(|| params["uuid"].as_str().unwrap().to_string()),
                    })),
                    message: None,
                }),
                "register/register" | "register/renew" => Ok(ApiResponse {
                    status: 0,
                    data: Some(json!({
                        "certificate": "-----BEGIN CERTIFICATE-----\nstub\n-----END CERTIFICATE-----",
                        "renewal_date": Utc::now() + chrono::Duration::days(90),
                        "config_signing_authority": "-----BEGIN CERTIFICATE-----\nauthority\n-----END CERTIFICATE-----",
                    })),
                    message: None,
                }),
                _ => Ok(ApiResponse {
                    status: 1,
                    data: None,
                    message: Some(format!("unknown path {url_path}")),
                }),
            }
        }

        async fn download(&self, _url: &str, _dest: &Path) -> Result<(), RegistrarError> {
            Ok(())
        }
    }

    struct FakeIdentity {
        common_name: Option<String>,
        certificate: Option<String>,
    }

    impl Identity for FakeIdentity {
        fn common_name(&self) -> Option<String> {
            self.common_name.clone()
        }

        fn generate(&mut self, common_name: &str) -> AgentResult<()> {
            self.common_name = Some(common_name.to_string());
            self.certificate = None;
            Ok(())
        }

        fn csr_pem(&self) -> AgentResult<String> {
            Ok("-----BEGIN CERTIFICATE REQUEST-----\nstub\n-----END CERTIFICATE REQUEST-----"
                .to_string())
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
            Ok("jwt".to_string())
        }

        fn save(&self) -> AgentResult<()> {
            Ok(())
        }

        fn load(&mut self) -> AgentResult<()> {
            Ok(())
        }
    }

    struct FakePlatform {
        identifier: Mutex<Option<String>>,
    }

    #[async_trait]
    impl PlatformProbe for FakePlatform {
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
            self.identifier.try_lock().ok().and_then(|g| g.clone())
        }

        fn set_system_identifier(&self, identifier: &str) -> AgentResult<()> {
            if let Ok(mut guard) = self.identifier.try_lock() {
                *guard = Some(identifier.to_string());
            }
            Ok(())
        }

        fn installed_version(&self, _identifier: &str) -> Option<String> {
            None
        }

        fn bad_versions(&self, _identifier: &str) -> Vec<String> {
            Vec::new()
        }

        async fn is_watcher_running(&self) -> bool {
            true
        }

        async fn verify_codesign(&self, _package_path: &Path) -> AgentResult<bool> {
            Ok(true)
        }

        async fn install_package(
            &self,
            _entry: &InstallerEntry,
            _package_path: &Path,
        ) -> AgentResult<()> {
            Ok(())
        }
    }

    fn manager(registrar: FakeRegistrar, dir: &Path) -> Arc<RegistrationManager> {
        let router = Arc::new(EventRouter::new(
            Arc::new(NullSink),
            RouteMap::default(),
            dir.join("karl_queue.data"),
        ));
        Arc::new(RegistrationManager::new(
            Arc::new(registrar),
            Arc::new(FakePlatform {
                identifier: Mutex::new(None),
            }),
            Arc::new(Mutex::new(Box::new(FakeIdentity {
                common_name: None,
                certificate: None,
            }))),
            Arc::new(RwLock::new(None)),
            router,
            RegistrationConfig::default(),
            dir.to_path_buf(),
        ))
    }

    #[tokio::test]
    async fn test_unregistered_system_reports_needs_registration() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(
            FakeRegistrar {
                negotiated_uuid: None,
                calls: AtomicUsize::new(0),
            },
            dir.path(),
        );
        let (needs_registration, needs_renewal) = manager.check_registration().await;
        assert!(needs_registration);
        assert!(!needs_renewal);
    }

    #[tokio::test]
    async fn test_registration_persists_data_and_identity() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(
            FakeRegistrar {
                negotiated_uuid: None,
                calls: AtomicUsize::new(0),
            },
            dir.path(),
        );

        manager.register_system(None).await.unwrap();

        assert!(manager.is_registered().await);
        assert!(dir.path().join("registration_data.json").exists());
        assert!(manager.system_id().await.is_some());

        let (_, needs_renewal) = manager.check_registration().await;
        assert!(!needs_renewal);
    }

    #[tokio::test]
    async fn test_uuid_reset_adopts_server_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(
            FakeRegistrar {
                negotiated_uuid: Some("server-assigned".to_string()),
                calls: AtomicUsize::new(0),
            },
            dir.path(),
        );

        manager.register_system(None).await.unwrap();
        assert_eq!(manager.system_id().await, Some("server-assigned".to_string()));
    }

    #[tokio::test]
    async fn test_expired_renewal_date_requires_renewal() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(
            FakeRegistrar {
                negotiated_uuid: None,
                calls: AtomicUsize::new(0),
            },
            dir.path(),
        );
        manager.register_system(None).await.unwrap();

        {
            let mut registration = manager.registration.write().await;
            registration.as_mut().unwrap().renewal_date =
                Some(Utc::now() - chrono::Duration::days(1));
        }

        let (needs_registration, needs_renewal) = manager.check_registration().await;
        assert!(!needs_registration);
        assert!(needs_renewal);

        manager.renew().await.unwrap();
        let (_, needs_renewal) = manager.check_registration().await;
        assert!(!needs_renewal);
    }

    #[tokio::test]
    async fn test_register_with_token_when_already_registered() {
        let dir = tempfile::tempdir().unwrap();
        let manager = manager(
            FakeRegistrar {
                negotiated_uuid: None,
                calls: AtomicUsize::new(0),
            },
            dir.path(),
        );
        manager.register_system(None).await.unwrap();

        let status = manager
            .register_with_token("token".to_string(), false)
            .await;
        assert_eq!(status, RegistrationStatus::AlreadyRegistered);
    }
}
