//! Compliance settings configuration module.
//!
//! Pulls compliance-module settings bundles from the registrar and applies
//! them to the live registry under its lock. One tracking entry governs the
//! fetch cadence.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::domain::models::{ConfigurationEntry, ModuleSettings};
use crate::domain::ports::{PlatformProbe, RegistrarApi, RegistrarError};
use crate::services::config_controller::{ConfigModule, ConfigModuleError, MIN_INTERVAL};
use crate::services::registry::ModuleRegistry;

const URL_PATH: &str = "register/get_compliance_settings";

/// Fetches and applies compliance module settings.
pub struct ComplianceConfigModule {
    registrar: Arc<dyn RegistrarApi>,
    platform: Arc<dyn PlatformProbe>,
    registry: Arc<Mutex<ModuleRegistry>>,
    entry: Mutex<ConfigurationEntry>,
    state_path: PathBuf,
}

impl ComplianceConfigModule {
    pub fn new(
        registrar: Arc<dyn RegistrarApi>,
        platform: Arc<dyn PlatformProbe>,
        registry: Arc<Mutex<ModuleRegistry>>,
        state_path: PathBuf,
    ) -> Self {
        let mut entry = ConfigurationEntry::new("compliance_settings");
        entry.update_frequency = chrono::Duration::hours(4);

        let module = Self {
            registrar,
            platform,
            registry,
            entry: Mutex::new(entry),
            state_path,
        };
        module.restore_state();
        module
    }

    fn restore_state(&self) {
        if !self.state_path.exists() {
            return;
        }
        match std::fs::read_to_string(&self.state_path)
            .map_err(anyhow::Error::from)
            .and_then(|raw| serde_json::from_str::<ConfigurationEntry>(&raw).map_err(Into::into))
        {
            Ok(entry) => {
                if let Ok(mut guard) = self.entry.try_lock() {
                    *guard = entry;
                }
            }
            Err(err) => warn!(error = %err, "failed to restore compliance config state"),
        }
    }

    async fn persist_state(&self) {
        let entry = self.entry.lock().await;
        match serde_json::to_string_pretty(&*entry) {
            Ok(doc) => {
                if let Err(err) = std::fs::write(&self.state_path, doc) {
                    error!(error = %err, "failed to persist compliance config state");
                }
            }
            Err(err) => error!(error = %err, "failed to serialize compliance config state"),
        }
    }

    /// Apply each settings document in the payload to its loaded module.
    /// Unknown modules are skipped with a warning; one bad document does not
    /// abort the batch.
    async fn apply_payload(&self, payload: &Value) -> usize {
        let Some(documents) = payload.get("ComplianceModules").and_then(Value::as_array) else {
            warn!("no compliance module settings in configuration payload");
            return 0;
        };

        let mut applied = 0;
        let mut registry = self.registry.lock().await;

        for document in documents {
            let settings: ModuleSettings = match serde_json::from_value(document.clone()) {
                Ok(settings) => settings,
                Err(err) => {
                    error!(error = %err, "failed to parse compliance settings document");
                    continue;
                }
            };
            let identifier = settings.identifier.clone();
            match registry.apply_settings(settings) {
                Ok(()) => {
                    debug!(module = %identifier, "applied settings");
                    applied += 1;
                }
                Err(err) => {
                    warn!(module = %identifier, error = %err, "could not apply settings");
                }
            }
        }
        applied
    }
}

#[async_trait]
impl ConfigModule for ComplianceConfigModule {
    fn identifier(&self) -> &str {
        "compliance"
    }

    async fn should_run_immediately(&self) -> bool {
        self.entry.lock().await.needs_update()
    }

    async fn current_interval(&self) -> Duration {
        let entry = self.entry.lock().await;
        let until_due = entry.next_update() - Utc::now();
        until_due.to_std().unwrap_or(MIN_INTERVAL).max(MIN_INTERVAL)
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
                warn!("compliance configuration fetch throttled");
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

        let applied = match response.data {
            Some(payload) => self.apply_payload(&payload).await,
            None => 0,
        };

        {
            let mut entry = self.entry.lock().await;
            entry.last_update = Some(Utc::now());
            if applied > 0 {
                entry.last_change = Some(Utc::now());
            }
        }
        self.persist_state().await;

        info!(applied, "compliance configuration updated");
        Ok(())
    }

    fn execution_skew(&self) -> Duration {
        Duration::from_secs(300)
    }
}
