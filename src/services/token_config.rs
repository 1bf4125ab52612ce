//! Sink credential (STS token) configuration module.
//!
//! Fetches short-lived sink credentials from the registrar and publishes
//! them into a shared cell the event sink reads. The refresh cadence tracks
//! the token expiry rather than a fixed interval.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

use crate::domain::models::ConfigurationEntry;
use crate::domain::ports::{PlatformProbe, RegistrarApi, RegistrarError};
use crate::services::config_controller::{ConfigModule, ConfigModuleError, MIN_INTERVAL};

const URL_PATH: &str = "register/get_sts_token";

/// Credentials the event sink authenticates with.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SinkCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    #[serde(default)]
    pub expiration: Option<DateTime<Utc>>,
}

/// Shared cell the sink reads its credentials from.
pub type CredentialCell = Arc<RwLock<Option<SinkCredentials>>>;

/// Fetches sink credentials on an expiry-driven cadence.
pub struct StsTokenConfigModule {
    registrar: Arc<dyn RegistrarApi>,
    platform: Arc<dyn PlatformProbe>,
    credentials: CredentialCell,
    entry: Mutex<ConfigurationEntry>,
    state_path: PathBuf,
}

impl StsTokenConfigModule {
    pub fn new(
        registrar: Arc<dyn RegistrarApi>,
        platform: Arc<dyn PlatformProbe>,
        credentials: CredentialCell,
        state_path: PathBuf,
    ) -> Self {
        let mut entry = ConfigurationEntry::new("sts_token");
        entry.update_frequency = chrono::Duration::minutes(50);

        let module = Self {
            registrar,
            platform,
            credentials,
            entry: Mutex::new(entry),
            state_path,
        };
        module.restore();
        module
    }

    fn restore(&self) {
        if !self.state_path.exists() {
            return;
        }
        match std::fs::read_to_string(&self.state_path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| serde_json::from_str::<SinkCredentials>(&raw).map_err(Into::into))
        {
            Ok(credentials) => {
                // Expired tokens are not worth restoring.
                let usable = credentials
                    .expiration
                    .is_none_or(|expiration| expiration > Utc::now());
                if usable {
                    if let Ok(mut cell) = self.credentials.try_write() {
                        *cell = Some(credentials);
                    }
                }
            }
            Err(err) => warn!(error = %err, "failed to restore sink credentials"),
        }
    }

    fn persist(&self, credentials: &SinkCredentials) {
        match serde_json::to_string(credentials) {
            Ok(doc) => {
                if let Err(err) = std::fs::write(&self.state_path, doc) {
                    error!(error = %err, "failed to persist sink credentials");
                    return;
                }
                #[cfg(unix)]
                {
                    use std::os::unix::fs::PermissionsExt;
                    let _ = std::fs::set_permissions(
                        &self.state_path,
                        std::fs::Permissions::from_mode(0o600),
                    );
                }
            }
            Err(err) => error!(error = %err, "failed to serialize sink credentials"),
        }
    }
}

#[async_trait]
impl ConfigModule for StsTokenConfigModule {
    fn identifier(&self) -> &str {
        "ststoken"
    }

    async fn should_run_immediately(&self) -> bool {
        let expired = {
            let cell = self.credentials.read().await;
            match cell.as_ref() {
                None => true,
                Some(credentials) => credentials
                    .expiration
                    .is_some_and(|expiration| expiration <= Utc::now()),
            }
        };
        expired || self.entry.lock().await.needs_update()
    }

    async fn current_interval(&self) -> Duration {
        // Refresh at 90% of the token lifetime when an expiry is known.
        let from_expiry = {
            let cell = self.credentials.read().await;
            cell.as_ref().and_then(|credentials| {
                credentials.expiration.and_then(|expiration| {
                    let remaining = (expiration - Utc::now()).to_std().ok()?;
                    Some(remaining.mul_f64(0.9))
                })
            })
        };
        match from_expiry {
            Some(interval) => interval.max(MIN_INTERVAL),
            None => {
                let entry = self.entry.lock().await;
                (entry.next_update() - Utc::now())
                    .to_std()
                    .unwrap_or(MIN_INTERVAL)
                    .max(MIN_INTERVAL)
            }
        }
    }

    async fn run(&self) -> Result<(), ConfigModuleError> {
        self.entry.lock().await.last_update_attempt = Some(Utc::now());

        let params = serde_json::json!({
            "platform": self.platform.platform(),
            "platform_version": self.platform.platform_version(),
        });

        let response = match self.registrar.call(URL_PATH, &params).await {
            Ok(response) => response,
            Err(RegistrarError::Throttled { until }) => {
                return Err(ConfigModuleError::Throttled { until });
            }
            Err(err) => return Err(ConfigModuleError::Fetch(err.to_string())),
        };
        if !response.is_success() {
            return Err(ConfigModuleError::Fetch(
                response
                    .message
                    .unwrap_or_else(|| "registrar reported failure".to_string()),
            ));
        }

        let credentials: SinkCredentials =
            serde_json::from_value(response.data.unwrap_or(Value::Null))
                .map_err(|err| ConfigModuleError::Apply(err.to_string()))?;

        self.persist(&credentials);
        *self.credentials.write().await = Some(credentials);

        let mut entry = self.entry.lock().await;
        entry.last_update = Some(Utc::now());
        entry.last_change = Some(Utc::now());

        info!("sink credentials refreshed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::errors::AgentResult;
    use crate::domain::models::InstallerEntry;
    use crate::domain::ports::ApiResponse;
    use serde_json::json;
    use std::path::Path;

    struct TokenRegistrar;

    #[async_trait]
    impl RegistrarApi for TokenRegistrar {
        async fn call(
            &self,
            _url_path: &str,
            _params: &Value,
        ) -> Result<ApiResponse, RegistrarError> {
            Ok(ApiResponse {
                status: 0,
                data: Some(json!({
                    "access_key_id": "AKIA_TEST",
                    "secret_access_key": "secret",
                    "session_token": "session",
                    "expiration": Utc::now() + chrono::Duration::hours(1),
                })),
                message: None,
            })
        }

        async fn download(&self, _url: &str, _dest: &Path) -> Result<(), RegistrarError> {
            Ok(())
        }
    }

    struct StubPlatform;

    #[async_trait]
    impl PlatformProbe for StubPlatform {
        fn platform(&self) -> String {
            "macOS".to_string()
        }
        fn platform_version(&self) -> String {
            "14.2".to_string()
        }
        fn current_user(&self) -> Option<String> {
            None
        }
        fn system_identifier(&self) -> Option<String> {
            None
        }
        fn set_system_identifier(&self, _identifier: &str) -> AgentResult<()> {
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

    #[tokio::test]
    async fn test_token_fetch_populates_cell_and_disk() {
        let dir = tempfile::tempdir().unwrap();
        let cell: CredentialCell = Arc::new(RwLock::new(None));
        let module = StsTokenConfigModule::new(
            Arc::new(TokenRegistrar),
            Arc::new(StubPlatform),
            Arc::clone(&cell),
            dir.path().join("sts_token.json"),
        );

        assert!(module.should_run_immediately().await);
        module.run().await.unwrap();

        let credentials = cell.read().await;
        assert_eq!(credentials.as_ref().unwrap().access_key_id, "AKIA_TEST");
        drop(credentials);

        assert!(dir.path().join("sts_token.json").exists());
        assert!(!module.should_run_immediately().await);

        // Interval tracks expiry, not the fallback frequency.
        let interval = module.current_interval().await;
        assert!(interval > Duration::from_secs(40 * 60));
        assert!(interval < Duration::from_secs(60 * 60));
    }
}
