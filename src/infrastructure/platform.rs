//! Platform adapters: command-backed probe and file-backed network state.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::domain::errors::{AgentError, AgentResult};
use crate::domain::models::{ExecutionPrerequisites, InstallerEntry};
use crate::domain::ports::{NetworkStateProvider, PlatformProbe};

/// Process name of the sibling recovery agent.
const WATCHER_PROCESS: &str = "acmeguardian";

/// Command-backed [`PlatformProbe`] for the supported platforms.
///
/// Versions of managed components are tracked in per-identifier version
/// files under the installers tree; install and code-sign operations shell
/// out to the native tooling.
pub struct SystemPlatformProbe {
    installers_dir: PathBuf,
    system_id_path: PathBuf,
}

impl SystemPlatformProbe {
    pub fn new(installers_dir: PathBuf, system_id_path: PathBuf) -> Self {
        Self {
            installers_dir,
            system_id_path,
        }
    }

    fn version_path(&self, identifier: &str) -> PathBuf {
        self.installers_dir.join(identifier).join(".version")
    }

    fn bad_versions_path(&self, identifier: &str) -> PathBuf {
        self.installers_dir.join(identifier).join(".bad_versions")
    }

    fn platform_name() -> &'static str {
        match std::env::consts::OS {
            "macos" => "macOS",
            "linux" => "Ubuntu",
            other => other,
        }
    }
}

#[async_trait]
impl PlatformProbe for SystemPlatformProbe {
    fn platform(&self) -> String {
        Self::platform_name().to_string()
    }

    fn platform_version(&self) -> String {
        #[cfg(target_os = "linux")]
        {
            if let Ok(contents) = std::fs::read_to_string("/etc/os-release") {
                for line in contents.lines() {
                    if let Some(version) = line.strip_prefix("VERSION_ID=") {
                        return version.trim_matches('"').to_string();
                    }
                }
            }
        }
        std::env::var("ACME_PLATFORM_VERSION").unwrap_or_else(|_| "unknown".to_string())
    }

    fn current_user(&self) -> Option<String> {
        std::env::var("SUDO_USER")
            .or_else(|_| std::env::var("USER"))
            .ok()
    }

    fn system_identifier(&self) -> Option<String> {
        std::fs::read_to_string(&self.system_id_path)
            .ok()
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    }

    fn set_system_identifier(&self, identifier: &str) -> AgentResult<()> {
        if let Some(parent) = self.system_id_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.system_id_path, identifier)?;
        Ok(())
    }

    fn installed_version(&self, identifier: &str) -> Option<String> {
        std::fs::read_to_string(self.version_path(identifier))
            .ok()
            .map(|raw| raw.trim().to_string())
            .filter(|raw| !raw.is_empty())
    }

    fn bad_versions(&self, identifier: &str) -> Vec<String> {
        std::fs::read_to_string(self.bad_versions_path(identifier))
            .map(|raw| {
                raw.lines()
                    .map(str::trim)
                    .filter(|line| !line.is_empty())
                    .map(ToString::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn is_watcher_running(&self) -> bool {
        match Command::new("pgrep")
            .arg("-x")
            .arg(WATCHER_PROCESS)
            .output()
            .await
        {
            Ok(output) => output.status.success(),
            Err(err) => {
                warn!(error = %err, "failed to probe watcher process");
                false
            }
        }
    }

    async fn verify_codesign(&self, package_path: &Path) -> AgentResult<bool> {
        let output = match std::env::consts::OS {
            "macos" => {
                Command::new("pkgutil")
                    .arg("--check-signature")
                    .arg(package_path)
                    .output()
                    .await
            }
            "linux" => {
                Command::new("dpkg-sig")
                    .arg("--verify")
                    .arg(package_path)
                    .output()
                    .await
            }
            other => {
                return Err(AgentError::InstallerFailed(format!(
                    "no code-sign verification available on {other}"
                )))
            }
        }
        .map_err(|err| AgentError::InstallerFailed(format!("code-sign probe failed: {err}")))?;

        Ok(output.status.success())
    }

    async fn install_package(
        &self,
        entry: &InstallerEntry,
        package_path: &Path,
    ) -> AgentResult<()> {
        let status = match std::env::consts::OS {
            "macos" => {
                Command::new("installer")
                    .arg("-pkg")
                    .arg(package_path)
                    .arg("-target")
                    .arg("/")
                    .status()
                    .await
            }
            "linux" => {
                Command::new("dpkg")
                    .arg("-i")
                    .arg(package_path)
                    .status()
                    .await
            }
            other => {
                return Err(AgentError::InstallerFailed(format!(
                    "no installer command available on {other}"
                )))
            }
        }
        .map_err(|err| AgentError::InstallerFailed(format!("install command failed: {err}")))?;

        if !status.success() {
            return Err(AgentError::InstallerFailed(format!(
                "install command for '{}' exited with {status}",
                entry.identifier
            )));
        }

        // Record the installed version for the next reconcile pass.
        if let Some(version) = &entry.version {
            let path = self.version_path(&entry.identifier);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, version)?;
        }
        debug!(installer = %entry.identifier, "recorded installed version");
        Ok(())
    }

    fn installer_extension(&self) -> &'static str {
        match std::env::consts::OS {
            "macos" => "pkg",
            "linux" => "deb",
            _ => "zip",
        }
    }
}

/// Persisted network state document (`state/network.data`), written by the
/// external network detector.
#[derive(Debug, Default, Serialize, Deserialize)]
struct NetworkStateDocument {
    #[serde(default)]
    state: u32,
}

/// Reads the detector's state file on every query; a missing or unreadable
/// file reports offline.
pub struct FileNetworkState {
    path: PathBuf,
}

impl FileNetworkState {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }
}

impl NetworkStateProvider for FileNetworkState {
    fn current_state(&self) -> ExecutionPrerequisites {
        match std::fs::read_to_string(&self.path) {
            Ok(raw) => match serde_json::from_str::<NetworkStateDocument>(&raw) {
                Ok(doc) => ExecutionPrerequisites::from_bits_truncate(doc.state),
                Err(_) => ExecutionPrerequisites::OFFLINE,
            },
            Err(_) => ExecutionPrerequisites::OFFLINE,
        }
    }
}
