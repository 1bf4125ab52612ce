//! Signed configuration file module.
//!
//! Mirrors registrar-managed files (stream route maps, auxiliary manifests)
//! onto disk. Each file downloads to staging, verifies its content hash and
//! detached signature against the signing authority, and is swapped into
//! place atomically. Per-file entries drive the fetch cadence.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::domain::models::ConfigurationEntry;
use crate::domain::ports::{PlatformProbe, RegistrarApi, RegistrarError};
use crate::infrastructure::{crypto, persistence};
use crate::services::config_controller::{ConfigModule, ConfigModuleError, MIN_INTERVAL};
use crate::services::registration::SharedRegistration;

const URL_PATH: &str = "register/get_config_files";

/// Fetches signed configuration files into a destination directory.
pub struct ConfigFileModule {
    registrar: Arc<dyn RegistrarApi>,
    platform: Arc<dyn PlatformProbe>,
    registration: SharedRegistration,
    /// Where verified files land, one per entry identifier.
    destination_dir: PathBuf,
    staging_dir: PathBuf,
    state_path: PathBuf,
    files: Mutex<HashMap<String, ConfigurationEntry>>,
}

impl ConfigFileModule {
    pub fn new(
        registrar: Arc<dyn RegistrarApi>,
        platform: Arc<dyn PlatformProbe>,
        registration: SharedRegistration,
        destination_dir: PathBuf,
        staging_dir: PathBuf,
        state_path: PathBuf,
    ) -> Self {
        let module = Self {
            registrar,
            platform,
            registration,
            destination_dir,
            staging_dir,
            state_path,
            files: Mutex::new(HashMap::new()),
        };
        module.restore_state();
        module
    }

    fn restore_state(&self) {
        match persistence::read_json::<Vec<ConfigurationEntry>>(&self.state_path) {
            Ok(Some(entries)) => {
                if let Ok(mut files) = self.files.try_lock() {
                    for entry in entries {
                        files.insert(entry.identifier.clone(), entry);
                    }
                }
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "failed to restore config file state"),
        }
    }

    async fn persist_state(&self) {
        let files = self.files.lock().await;
        let entries: Vec<&ConfigurationEntry> = files.values().collect();
        if let Err(err) = persistence::write_json_atomic(&self.state_path, &entries) {
            error!(error = %err, "failed to persist config file state");
        }
    }

    /// File identifiers must stay inside the destination directory.
    fn destination_for(&self, identifier: &str) -> Option<PathBuf> {
        if identifier.is_empty()
            || identifier.contains('/')
            || identifier.contains("..")
            || identifier.starts_with('.')
        {
            return None;
        }
        Some(self.destination_dir.join(identifier))
    }

    async fn apply_entry(&self, entry: &ConfigurationEntry) -> Result<bool, ConfigModuleError> {
        let Some(destination) = self.destination_for(&entry.identifier) else {
            warn!(file = %entry.identifier, "refusing config file with unsafe identifier");
            return Ok(false);
        };
        let Some(download_url) = entry.download_url.as_deref() else {
            warn!(file = %entry.identifier, "config file entry has no download url");
            return Ok(false);
        };

        // Skip when the on-disk copy already matches the advertised hash.
        if let (Some(remote_hash), true) = (&entry.remote_hash, destination.exists()) {
            if crypto::file_sha256(&destination).ok().as_ref() == Some(remote_hash) {
                debug!(file = %entry.identifier, "config file already current");
                return Ok(false);
            }
        }

        persistence::create_dir_0755(&self.staging_dir)
            .map_err(|err| ConfigModuleError::Apply(err.to_string()))?;
        let staged = self.staging_dir.join(&entry.identifier);
        let staged_sig = self.staging_dir.join(format!("{}.sig", entry.identifier));

        self.registrar
            .download(download_url, &staged)
            .await
            .map_err(|err| ConfigModuleError::Fetch(err.to_string()))?;

        if let Some(remote_hash) = &entry.remote_hash {
            let actual = crypto::file_sha256(&staged)
                .map_err(|err| ConfigModuleError::Apply(err.to_string()))?;
            if &actual != remote_hash {
                return Err(ConfigModuleError::Apply(format!(
                    "config file '{}' hash mismatch (expected {remote_hash}, got {actual})",
                    entry.identifier
                )));
            }
        }

        if let Some(signature_url) = entry.signature_url.as_deref() {
            let authority = {
                let registration = self.registration.read().await;
                registration
                    .as_ref()
                    .and_then(|data| data.config_signing_authority.clone())
            };
            let Some(authority) = authority else {
                return Err(ConfigModuleError::Apply(format!(
                    "config file '{}' requires signature but no signing authority is available",
                    entry.identifier
                )));
            };

            self.registrar
                .download(signature_url, &staged_sig)
                .await
                .map_err(|err| ConfigModuleError::Fetch(err.to_string()))?;

            let content =
                std::fs::read(&staged).map_err(|err| ConfigModuleError::Apply(err.to_string()))?;
            let signature = std::fs::read(&staged_sig)
                .map_err(|err| ConfigModuleError::Apply(err.to_string()))?;
            let verified = crypto::verify_detached_signature(&authority, &signature, &content)
                .unwrap_or(false);
            if !verified {
                return Err(ConfigModuleError::Apply(format!(
                    "config file '{}' failed signature verification",
                    entry.identifier
                )));
            }
        }

        std::fs::rename(&staged, &destination)
            .map_err(|err| ConfigModuleError::Apply(err.to_string()))?;
        let _ = std::fs::remove_file(&staged_sig);

        info!(file = %entry.identifier, "configuration file updated");
        Ok(true)
    }
}

#[async_trait]
impl ConfigModule for ConfigFileModule {
    fn identifier(&self) -> &str {
        "configfile"
    }

    async fn should_run_immediately(&self) -> bool {
        let files = self.files.lock().await;
        files.is_empty() || files.values().any(ConfigurationEntry::needs_update)
    }

    async fn current_interval(&self) -> Duration {
        let next = {
            let files = self.files.lock().await;
            files.values().map(ConfigurationEntry::next_update).min()
        };
        match next {
            Some(next) => (next - Utc::now())
                .to_std()
                .unwrap_or(MIN_INTERVAL)
                .max(MIN_INTERVAL),
            None => Duration::from_secs(30 * 60),
        }
    }

    async fn run(&self) -> Result<(), ConfigModuleError> {
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

        let entries: Vec<ConfigurationEntry> = response
            .data
            .as_ref()
            .and_then(|data| data.get("ConfigFiles"))
            .and_then(Value::as_array)
            .map(|raw| {
                raw.iter()
                    .filter_map(|item| serde_json::from_value(item.clone()).ok())
                    .collect()
            })
            .unwrap_or_default();

        let mut failure: Option<ConfigModuleError> = None;
        for mut entry in entries {
            entry.last_update_attempt = Some(Utc::now());
            match self.apply_entry(&entry).await {
                Ok(changed) => {
                    entry.last_update = Some(Utc::now());
                    if changed {
                        entry.last_change = Some(Utc::now());
                    }
                }
                Err(err) => {
                    error!(file = %entry.identifier, error = %err, "failed to apply config file");
                    if failure.is_none() {
                        failure = Some(err);
                    }
                }
            }
            let mut files = self.files.lock().await;
            files.insert(entry.identifier.clone(), entry);
        }

        self.persist_state().await;
        match failure {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::pkcs8::{EncodePublicKey, LineEnding};
    use serde_json::json;
    use std::path::Path;
    use tokio::sync::RwLock;

    use crate::domain::errors::AgentResult;
    use crate::domain::models::InstallerEntry;
    use crate::domain::ports::ApiResponse;
    use crate::services::registration::RegistrationData;

    struct FileRegistrar {
        targets: Value,
        files: HashMap<String, Vec<u8>>,
    }

    #[async_trait]
    impl RegistrarApi for FileRegistrar {
        async fn call(
            &self,
            _url_path: &str,
            _params: &Value,
        ) -> Result<ApiResponse, RegistrarError> {
            Ok(ApiResponse {
                status: 0,
                data: Some(self.targets.clone()),
                message: None,
            })
        }

        async fn download(&self, url: &str, dest: &Path) -> Result<(), RegistrarError> {
            let bytes = self
                .files
                .get(url)
                .ok_or_else(|| RegistrarError::Transport(format!("no such artifact: {url}")))?;
            std::fs::write(dest, bytes)
                .map_err(|err| RegistrarError::Transport(err.to_string()))?;
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
    async fn test_signed_file_lands_in_destination() {
        let dir = tempfile::tempdir().unwrap();
        let content = br#"{"default": "firehose"}"#.to_vec();
        let key = rsa::RsaPrivateKey::new(&mut rand::thread_rng(), 1024).unwrap();
        let authority = key
            .to_public_key()
            .to_public_key_pem(LineEnding::LF)
            .unwrap();
        let signature = crypto::sign_detached(&key, &content);
        let hash = hex::encode(<sha2::Sha256 as sha2::Digest>::digest(&content));

        let mut files = HashMap::new();
        files.insert("https://cdn/routes.json".to_string(), content.clone());
        files.insert("https://cdn/routes.json.sig".to_string(), signature);

        let registration: SharedRegistration = Arc::new(RwLock::new(Some(RegistrationData {
            uuid: Some("device".to_string()),
            renewal_date: None,
            certificate: None,
            config_signing_authority: Some(authority),
        })));

        let module = ConfigFileModule::new(
            Arc::new(FileRegistrar {
                targets: json!({"ConfigFiles": [{
                    "identifier": "routes.json",
                    "download_url": "https://cdn/routes.json",
                    "signature_url": "https://cdn/routes.json.sig",
                    "remote_hash": hash,
                    "update_frequency": 3600,
                }]}),
                files,
            }),
            Arc::new(StubPlatform),
            registration,
            dir.path().join("dest"),
            dir.path().join("staging"),
            dir.path().join("configfile.json"),
        );
        std::fs::create_dir_all(dir.path().join("dest")).unwrap();

        module.run().await.unwrap();

        let written = std::fs::read(dir.path().join("dest/routes.json")).unwrap();
        assert_eq!(written, content);
        assert!(!module.should_run_immediately().await);
    }

    #[tokio::test]
    async fn test_traversal_identifier_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let registration: SharedRegistration = Arc::new(RwLock::new(None));
        let module = ConfigFileModule::new(
            Arc::new(FileRegistrar {
                targets: json!({"ConfigFiles": [{
                    "identifier": "../escape.json",
                    "download_url": "https://cdn/escape.json",
                }]}),
                files: HashMap::new(),
            }),
            Arc::new(StubPlatform),
            registration,
            dir.path().join("dest"),
            dir.path().join("staging"),
            dir.path().join("configfile.json"),
        );

        // Unsafe identifier is skipped without fetching.
        module.run().await.unwrap();
        assert!(!dir.path().join("escape.json").exists());
    }
}
