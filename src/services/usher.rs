//! Usher installer configuration module.
//!
//! Pulls installer targets from the registrar and drives the atomic
//! download / verify / extract / swap / install pipeline per target. Nothing
//! is ever copied into a load directory before both the content hash and the
//! detached signature have verified. Bad-version gating and the
//! watcher-alive precondition protect the agent from installing known-bad or
//! unrecoverable builds of itself.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::domain::errors::{AgentError, AgentResult};
use crate::domain::models::{AgentEvent, InstallErrorCode, InstallerEntry};
use crate::domain::ports::{PlatformProbe, RegistrarApi, RegistrarError};
use crate::infrastructure::archive;
use crate::infrastructure::crypto;
use crate::infrastructure::persistence;
use crate::services::config_controller::{ConfigModule, ConfigModuleError, MIN_INTERVAL};
use crate::services::event_router::EventRouter;
use crate::services::registration::SharedRegistration;

const URL_PATH: &str = "register/get_installer_targets";

/// Identifier of the primary agent; self-replacement requires the watcher.
pub const PRIMARY_IDENTIFIER: &str = "ACME";
/// Identifier of the sibling recovery process.
pub const WATCHER_IDENTIFIER: &str = "ACMEGuardian";

/// Fetches installer targets and installs out-of-date components.
pub struct UsherConfigModule {
    registrar: Arc<dyn RegistrarApi>,
    platform: Arc<dyn PlatformProbe>,
    router: Arc<EventRouter>,
    registration: SharedRegistration,
    /// Root for installed package content, one directory per identifier.
    load_path: PathBuf,
    /// Root for in-flight downloads, one directory per identifier.
    staging_path: PathBuf,
    state_path: PathBuf,
    verify_codesign_enabled: bool,
    watcher_check_attempts: u32,
    installers: Mutex<std::collections::HashMap<String, InstallerEntry>>,
}

impl UsherConfigModule {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registrar: Arc<dyn RegistrarApi>,
        platform: Arc<dyn PlatformProbe>,
        router: Arc<EventRouter>,
        registration: SharedRegistration,
        load_path: PathBuf,
        staging_path: PathBuf,
        state_path: PathBuf,
        verify_codesign_enabled: bool,
        watcher_check_attempts: u32,
    ) -> Self {
        let module = Self {
            registrar,
            platform,
            router,
            registration,
            load_path,
            staging_path,
            state_path,
            verify_codesign_enabled,
            watcher_check_attempts,
            installers: Mutex::new(std::collections::HashMap::new()),
        };
        module.restore_state();
        module
    }

    fn restore_state(&self) {
        match persistence::read_json::<Vec<InstallerEntry>>(&self.state_path) {
            Ok(Some(entries)) => {
                if let Ok(mut installers) = self.installers.try_lock() {
                    for entry in entries {
                        installers.insert(entry.identifier.clone(), entry);
                    }
                }
            }
            Ok(None) => {}
            Err(err) => warn!(error = %err, "failed to restore installer state"),
        }
    }

    async fn persist_state(&self) {
        let installers = self.installers.lock().await;
        let entries: Vec<&InstallerEntry> = installers.values().collect();
        if let Err(err) = persistence::write_json_atomic(&self.state_path, &entries) {
            error!(error = %err, "failed to persist installer state");
        }
    }

    /// Fetch the current installer targets from the registrar.
    async fn fetch_targets(&self) -> Result<Vec<InstallerEntry>, ConfigModuleError> {
        let params = serde_json::json!({
            "platform": self.platform.platform(),
            "platform_version": self.platform.platform_version(),
        });

        let response = match self.registrar.call(URL_PATH, &params).await {
            Ok(response) => response,
            Err(RegistrarError::Throttled { until }) => {
                warn!("installer configuration fetch throttled");
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

        let targets = response
            .data
            .as_ref()
            .and_then(|data| data.get("UsherInstallers"))
            .and_then(Value::as_array)
            .map(|raw| {
                raw.iter()
                    .filter_map(|item| match serde_json::from_value(item.clone()) {
                        Ok(entry) => Some(entry),
                        Err(err) => {
                            error!(error = %err, "failed to parse installer target");
                            None
                        }
                    })
                    .collect::<Vec<InstallerEntry>>()
            })
            .unwrap_or_default();

        if targets.is_empty() {
            warn!("no installer targets in configuration, leaving as is");
        }
        Ok(targets)
    }

    /// Compare targets against installed versions and install what differs,
    /// lowest priority value first.
    async fn process_targets(&self, targets: Vec<InstallerEntry>) -> Result<(), ConfigModuleError> {
        let mut targets = targets;
        targets.sort_by_key(|target| target.priority);

        let mut to_install: Vec<InstallerEntry> = Vec::new();
        {
            let mut installers = self.installers.lock().await;
            for mut target in targets {
                target.last_update = Some(Utc::now());
                target.last_update_attempt = Some(Utc::now());
                target.old_version = self.platform.installed_version(&target.identifier);

                let mut bad_versions = self.platform.bad_versions(&target.identifier);
                for version in &target.bad_versions {
                    if !bad_versions.contains(version) {
                        bad_versions.push(version.clone());
                    }
                }
                target.bad_versions = bad_versions;

                if target.targets_bad_version() {
                    info!(
                        installer = %target.identifier,
                        version = ?target.version,
                        bad_versions = ?target.bad_versions,
                        "target version is deny-listed, skipping"
                    );
                    installers.insert(target.identifier.clone(), target);
                    continue;
                }

                if target.old_version != target.version {
                    info!(
                        installer = %target.identifier,
                        installed = ?target.old_version,
                        required = ?target.version,
                        "installed version does not match target, will update"
                    );
                    to_install.push(target.clone());
                } else {
                    info!(
                        installer = %target.identifier,
                        version = ?target.version,
                        "installed version matches target"
                    );
                }
                installers.insert(target.identifier.clone(), target);
            }
        }

        for entry in to_install {
            if entry.identifier == PRIMARY_IDENTIFIER && !self.watcher_is_running().await {
                error!(
                    "skipping primary agent update: watcher is not running and must recover first"
                );
                continue;
            }

            let mut code = InstallErrorCode::SUCCESS;
            match self.update_and_install(&entry, &mut code).await {
                Ok(()) => {
                    let mut installers = self.installers.lock().await;
                    if let Some(stored) = installers.get_mut(&entry.identifier) {
                        stored.last_change = Some(Utc::now());
                    }
                }
                Err(err) => {
                    let message = format!(
                        "An error occurred installing installer:'{}'; {} (code: {})",
                        entry.identifier,
                        err,
                        code.bits()
                    );
                    error!("{message}");
                    self.send_install_event(&entry, &message).await;
                    return Err(ConfigModuleError::Apply(message));
                }
            }
        }
        Ok(())
    }

    async fn watcher_is_running(&self) -> bool {
        for attempt in 0..self.watcher_check_attempts.max(1) {
            if self.platform.is_watcher_running().await {
                return true;
            }
            debug!(attempt, "watcher liveness check failed, retrying");
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        false
    }

    fn staging_dir(&self, entry: &InstallerEntry) -> PathBuf {
        self.staging_path.join(&entry.identifier)
    }

    fn load_dir(&self, entry: &InstallerEntry) -> PathBuf {
        self.load_path.join(&entry.identifier)
    }

    /// Run the full pipeline for one target. Every failure tags `code` with
    /// the step that failed before surfacing the error.
    async fn update_and_install(
        &self,
        entry: &InstallerEntry,
        code: &mut InstallErrorCode,
    ) -> AgentResult<()> {
        let staging_dir = self.staging_dir(entry);
        let load_dir = self.load_dir(entry);
        persistence::create_dir_0755(&staging_dir)?;
        persistence::create_dir_0755(&load_dir)?;

        let archive_path = staging_dir.join(format!("{}.zip", entry.identifier));
        let signature_path = staging_dir.join(format!("{}.sig", entry.identifier));

        archive::scrub_foreign_files(
            &staging_dir,
            &[archive_path.as_path(), signature_path.as_path()],
        )?;

        self.fetch_package(entry, &archive_path, &signature_path, code)
            .await?;
        self.verify_signature_hash(entry, &archive_path, &signature_path, code)
            .await?;
        self.install_software(entry, &archive_path, &staging_dir, &load_dir, code)
            .await
    }

    /// Download the archive and its detached signature into staging. A
    /// staged archive whose hash already matches is reused.
    async fn fetch_package(
        &self,
        entry: &InstallerEntry,
        archive_path: &Path,
        signature_path: &Path,
        code: &mut InstallErrorCode,
    ) -> AgentResult<()> {
        let Some(download_url) = entry.download_url.as_deref() else {
            *code |= InstallErrorCode::FETCH_CONFIGURATION_FAILED;
            return Err(AgentError::InstallerFailed(format!(
                "installer '{}' has no download url",
                entry.identifier
            )));
        };
        let Some(signature_url) = entry.signature_url.as_deref() else {
            *code |= InstallErrorCode::FETCH_CONFIGURATION_FAILED;
            return Err(AgentError::InstallerFailed(format!(
                "installer '{}' has no signature url",
                entry.identifier
            )));
        };

        let already_staged = archive_path.exists()
            && entry.file_hash.is_some()
            && crypto::file_sha256(archive_path).ok() == entry.file_hash;

        if already_staged {
            debug!(
                installer = %entry.identifier,
                "staged archive already matches expected hash, skipping download"
            );
        } else {
            info!(
                installer = %entry.identifier,
                version = ?entry.version,
                "fetching installer from registrar"
            );
            if let Err(err) = self.registrar.download(download_url, archive_path).await {
                *code |= InstallErrorCode::DOWNLOAD_FAILED;
                return Err(AgentError::InstallerFailed(format!(
                    "failed to download installer '{}': {err}",
                    entry.identifier
                )));
            }
        }

        if let Err(err) = self.registrar.download(signature_url, signature_path).await {
            *code |= InstallErrorCode::DOWNLOAD_FAILED;
            return Err(AgentError::InstallerFailed(format!(
                "failed to download installer signature '{}': {err}",
                entry.identifier
            )));
        }
        Ok(())
    }

    /// Verify the expected sha256 and the authority signature over the raw
    /// archive bytes. Either mismatch aborts before anything is extracted.
    async fn verify_signature_hash(
        &self,
        entry: &InstallerEntry,
        archive_path: &Path,
        signature_path: &Path,
        code: &mut InstallErrorCode,
    ) -> AgentResult<()> {
        let authority = {
            let registration = self.registration.read().await;
            registration
                .as_ref()
                .and_then(|data| data.config_signing_authority.clone())
        };
        let Some(authority) = authority else {
            *code |= InstallErrorCode::SIGN_HASH_VERIFY_FAILED;
            return Err(AgentError::InstallerFailed(
                "could not verify installer signature; no signing authority is available"
                    .to_string(),
            ));
        };

        let actual_hash = crypto::file_sha256(archive_path).map_err(|err| {
            *code |= InstallErrorCode::SIGN_HASH_VERIFY_FAILED;
            AgentError::InstallerFailed(format!("could not hash installer: {err}"))
        })?;
        if entry.file_hash.as_deref() != Some(actual_hash.as_str()) {
            *code |= InstallErrorCode::SIGN_HASH_VERIFY_FAILED;
            return Err(AgentError::InstallerFailed(format!(
                "hash of the installer '{}' does not match (expected {:?}, got {})",
                entry.identifier, entry.file_hash, actual_hash
            )));
        }

        let content = std::fs::read(archive_path)?;
        let signature = std::fs::read(signature_path)?;
        let verified = crypto::verify_detached_signature(&authority, &signature, &content)
            .unwrap_or(false);
        if !verified {
            *code |= InstallErrorCode::SIGN_HASH_VERIFY_FAILED;
            return Err(AgentError::InstallerFailed(format!(
                "could not verify installer signature for '{}'",
                entry.identifier
            )));
        }
        Ok(())
    }

    /// Extract, optionally codesign-verify, swap into the load directory,
    /// and invoke the platform installer.
    async fn install_software(
        &self,
        entry: &InstallerEntry,
        archive_path: &Path,
        staging_dir: &Path,
        load_dir: &Path,
        code: &mut InstallErrorCode,
    ) -> AgentResult<()> {
        if let Some(version) = &entry.version {
            info!(installer = %entry.identifier, version = %version, "installing");
        } else {
            info!(installer = %entry.identifier, "installing");
        }

        if let Err(err) = archive::extract_zip(archive_path, staging_dir) {
            *code |= InstallErrorCode::ZIP_EXTRACTION_FAILED;
            return Err(err);
        }

        let extension = self.platform.installer_extension();
        let package_path = archive::find_package(staging_dir, extension)?;

        if self.verify_codesign_enabled {
            let verified = self
                .platform
                .verify_codesign(&package_path)
                .await
                .unwrap_or(false);
            if !verified {
                *code |= InstallErrorCode::CODE_SIGN_VERIFY_FAILED;
                return Err(AgentError::InstallerFailed(format!(
                    "failed to verify the code signature of installer '{}'",
                    entry.identifier
                )));
            }
        }

        if let Err(err) = archive::clean_directory(load_dir) {
            *code |= InstallErrorCode::FAILED_TO_CLEAN;
            return Err(err);
        }

        if let Err(err) = archive::copy_dir_contents(staging_dir, load_dir) {
            *code |= InstallErrorCode::INSTALL_FAILED;
            return Err(err);
        }
        let load_package = archive::find_package(load_dir, extension)?;

        if let Err(err) = self.platform.install_package(entry, &load_package).await {
            *code |= InstallErrorCode::INSTALL_FAILED;
            return Err(err);
        }

        info!(installer = %entry.identifier, "install complete");
        Ok(())
    }

    async fn send_install_event(&self, entry: &InstallerEntry, error_message: &str) {
        let event_type = match entry.identifier.to_lowercase().as_str() {
            "acme" => "UsherAcmeUpdate",
            "acmeguardian" => "UsherWatcherUpdate",
            _ => "UsherInstallerUpdate",
        };
        let identifier = entry.identifier.to_lowercase();
        let event = AgentEvent::new(event_type, "Usher")
            .with_entry(
                format!("current_{identifier}_version"),
                entry.old_version.clone().unwrap_or_default(),
            )
            .with_entry(
                format!("attempted_{identifier}_version"),
                entry.version.clone().unwrap_or_default(),
            )
            .with_entry("is_baseline", false)
            .with_entry("status", 0)
            .with_entry("error_message", error_message);
        self.router.dispatch(event).await;
    }
}

#[async_trait]
impl ConfigModule for UsherConfigModule {
    fn identifier(&self) -> &str {
        "usher"
    }

    async fn should_run_immediately(&self) -> bool {
        let installers = self.installers.lock().await;
        installers.values().any(InstallerEntry::needs_update)
    }

    async fn current_interval(&self) -> Duration {
        let next = {
            let installers = self.installers.lock().await;
            installers
                .values()
                .map(InstallerEntry::next_update)
                .min()
        };
        match next {
            Some(next) => (next - Utc::now())
                .to_std()
                .unwrap_or(MIN_INTERVAL)
                .max(MIN_INTERVAL),
            None => Duration::from_secs(15 * 60),
        }
    }

    async fn run(&self) -> Result<(), ConfigModuleError> {
        {
            let mut installers = self.installers.lock().await;
            for entry in installers.values_mut() {
                entry.last_update_attempt = Some(Utc::now());
            }
        }

        let targets = self.fetch_targets().await?;
        let outcome = self.process_targets(targets).await;
        self.persist_state().await;
        outcome
    }

    fn execution_skew(&self) -> Duration {
        Duration::from_secs(300)
    }
}
