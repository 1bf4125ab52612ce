//! Daemon configuration and feature controls.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::errors::AgentResult;

/// Top-level daemon configuration.
///
/// Loaded by the configuration loader (defaults, then `config.json` under the
/// base directory, then `ACME_`-prefixed environment variables).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Root of the persisted state tree.
    pub base_dir: PathBuf,
    pub compliance: ComplianceConfig,
    pub registrar: RegistrarConfig,
    pub registration: RegistrationConfig,
    pub usher: UsherConfig,
    pub events: EventsConfig,
    pub logging: LoggingConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            base_dir: PathBuf::from("/usr/local/amazon/var/acme"),
            compliance: ComplianceConfig::default(),
            registrar: RegistrarConfig::default(),
            registration: RegistrationConfig::default(),
            usher: UsherConfig::default(),
            events: EventsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AgentConfig {
    pub fn manifest_dir(&self) -> PathBuf {
        self.base_dir.join("manifests")
    }

    pub fn state_dir(&self) -> PathBuf {
        self.base_dir.join("state")
    }

    pub fn routes_dir(&self) -> PathBuf {
        self.base_dir.join("routes")
    }

    pub fn installers_dir(&self) -> PathBuf {
        self.base_dir.join("installers")
    }

    pub fn identity_dir(&self) -> PathBuf {
        self.base_dir.join("identity")
    }

    pub fn feature_controls_path(&self) -> PathBuf {
        self.manifest_dir().join("acme.json")
    }
}

/// Compliance controller and executor pool tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComplianceConfig {
    /// Maximum number of concurrent executors.
    pub max_executors: usize,
    /// Controller tick period, seconds.
    pub routine_interval_secs: u64,
    /// Window during which a queued (module, trigger) pair will not requeue.
    pub requeue_threshold_secs: u64,
    /// Idle period after which an executor self-terminates.
    pub executor_idle_ttl_secs: u64,
    /// Grace period before shutdown polls executor liveness.
    pub executor_shutdown_wait_secs: u64,
    /// Queue poll timeout, milliseconds.
    pub queue_fetch_timeout_ms: u64,
    /// Optional hard cap on a single evaluate/remediate pass. Unset means
    /// evaluators run to completion and hold their executor slot.
    pub evaluation_timeout_secs: Option<u64>,
}

impl Default for ComplianceConfig {
    fn default() -> Self {
        Self {
            max_executors: 5,
            routine_interval_secs: 5,
            requeue_threshold_secs: 600,
            executor_idle_ttl_secs: 60,
            executor_shutdown_wait_secs: 1,
            queue_fetch_timeout_ms: 500,
            evaluation_timeout_secs: None,
        }
    }
}

impl ComplianceConfig {
    pub fn routine_interval(&self) -> Duration {
        Duration::from_secs(self.routine_interval_secs)
    }

    pub fn requeue_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.requeue_threshold_secs as i64)
    }

    pub fn executor_idle_ttl(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.executor_idle_ttl_secs as i64)
    }

    pub fn executor_shutdown_wait(&self) -> Duration {
        Duration::from_secs(self.executor_shutdown_wait_secs)
    }

    pub fn queue_fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_fetch_timeout_ms)
    }

    pub fn evaluation_timeout(&self) -> Option<Duration> {
        self.evaluation_timeout_secs.map(Duration::from_secs)
    }
}

/// Registrar endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrarConfig {
    pub address: String,
    pub timeout_secs: u64,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            address: String::new(),
            timeout_secs: 30,
        }
    }
}

impl RegistrarConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Registration renewal cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrationConfig {
    pub check_frequency_secs: u64,
    pub check_skew_secs: u64,
    pub retry_frequency_secs: u64,
    pub max_retry_frequency_secs: u64,
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            check_frequency_secs: 3600,
            check_skew_secs: 900,
            retry_frequency_secs: 30,
            max_retry_frequency_secs: 3600,
        }
    }
}

/// Installer pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsherConfig {
    /// Whether extracted packages must pass platform code-sign verification.
    pub verify_codesign: bool,
    /// How many times to re-check watcher liveness before skipping a
    /// primary-agent self-update.
    pub watcher_check_attempts: u32,
}

impl Default for UsherConfig {
    fn default() -> Self {
        Self {
            verify_codesign: false,
            watcher_check_attempts: 3,
        }
    }
}

/// Event sink settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Base URL events post to, one path segment per stream. Empty means
    /// the sink is unreachable and events buffer to disk.
    pub endpoint: String,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// One of: trace, debug, info, warn, error.
    pub level: String,
    /// One of: json, pretty.
    pub format: String,
    /// Optional log file directory; stderr only when unset.
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            directory: None,
        }
    }
}

/// Feature switches delivered via `manifests/acme.json`.
///
/// The usher switches default off; compliance and the event registrar default
/// on. Toggling takes effect on reload.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct FeatureControls {
    pub usher_enabled: bool,
    pub usher_watcher_enabled: bool,
    pub karl_registrar_enabled: bool,
    pub compliance_enabled: bool,
}

impl Default for FeatureControls {
    fn default() -> Self {
        Self {
            usher_enabled: false,
            usher_watcher_enabled: false,
            karl_registrar_enabled: true,
            compliance_enabled: true,
        }
    }
}

impl FeatureControls {
    /// Load the controls manifest; defaults apply when the file is absent.
    pub fn load(path: &Path) -> AgentResult<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.compliance.max_executors, 5);
        assert_eq!(config.compliance.routine_interval(), Duration::from_secs(5));
        assert_eq!(
            config.compliance.requeue_threshold(),
            chrono::Duration::minutes(10)
        );
        assert!(config.compliance.evaluation_timeout().is_none());

        let controls = FeatureControls::default();
        assert!(!controls.usher_enabled);
        assert!(!controls.usher_watcher_enabled);
        assert!(controls.karl_registrar_enabled);
        assert!(controls.compliance_enabled);
    }

    #[test]
    fn test_feature_controls_missing_file_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let controls = FeatureControls::load(&dir.path().join("acme.json")).unwrap();
        assert_eq!(controls, FeatureControls::default());
    }

    #[test]
    fn test_feature_controls_partial_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("acme.json");
        std::fs::write(&path, r#"{"usher_enabled": true}"#).unwrap();
        let controls = FeatureControls::load(&path).unwrap();
        assert!(controls.usher_enabled);
        assert!(controls.compliance_enabled);
    }
}
