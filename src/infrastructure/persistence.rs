//! Persisted state layout and JSON document helpers.

use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::domain::errors::AgentResult;
use crate::domain::models::AgentConfig;

/// Resolved filesystem layout under the agent base directory.
///
/// Missing directories are created with mode 0755 at startup; a directory
/// that cannot be created degrades the owning subsystem rather than failing
/// the daemon.
#[derive(Debug, Clone)]
pub struct StateLayout {
    pub base_dir: PathBuf,
    pub manifest_dir: PathBuf,
    pub state_dir: PathBuf,
    pub config_state_dir: PathBuf,
    pub module_staging_dir: PathBuf,
    pub installer_staging_dir: PathBuf,
    pub routes_dir: PathBuf,
    pub installers_dir: PathBuf,
    pub identity_dir: PathBuf,
}

impl StateLayout {
    pub fn new(config: &AgentConfig) -> Self {
        let base_dir = config.base_dir.clone();
        Self {
            manifest_dir: config.manifest_dir(),
            state_dir: config.state_dir(),
            config_state_dir: config.state_dir().join("config"),
            module_staging_dir: config.state_dir().join("compliance_modules/staging"),
            installer_staging_dir: config.state_dir().join("installers/staging"),
            routes_dir: config.routes_dir(),
            installers_dir: config.installers_dir(),
            identity_dir: config.identity_dir(),
            base_dir,
        }
    }

    /// Create every directory in the layout. Returns the directories that
    /// could not be provisioned; their subsystems start degraded.
    pub fn ensure(&self) -> Vec<PathBuf> {
        let mut failed = Vec::new();
        for dir in [
            &self.base_dir,
            &self.manifest_dir,
            &self.state_dir,
            &self.config_state_dir,
            &self.module_staging_dir,
            &self.installer_staging_dir,
            &self.routes_dir,
            &self.installers_dir,
            &self.identity_dir,
        ] {
            if dir.exists() {
                continue;
            }
            info!(dir = %dir.display(), "creating support directory");
            if let Err(err) = create_dir_0755(dir) {
                warn!(dir = %dir.display(), error = %err, "failed to create support directory");
                failed.push(dir.clone());
            }
        }
        failed
    }

    pub fn event_buffer_path(&self) -> PathBuf {
        self.state_dir.join("karl_queue.data")
    }

    pub fn routes_path(&self) -> PathBuf {
        self.routes_dir.join("routes.json")
    }

    pub fn network_state_path(&self) -> PathBuf {
        self.state_dir.join("network.data")
    }

    pub fn group_cache_path(&self) -> PathBuf {
        self.state_dir.join("group_cache.data")
    }
}

pub fn create_dir_0755(path: &Path) -> AgentResult<()> {
    std::fs::create_dir_all(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))?;
    }
    Ok(())
}

/// Read a JSON document, returning `None` when the file does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> AgentResult<Option<T>> {
    if !path.exists() {
        return Ok(None);
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(Some(serde_json::from_str(&raw)?))
}

/// Write a JSON document atomically (temp sibling + rename).
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> AgentResult<()> {
    let doc = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, doc)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Doc {
        value: u32,
    }

    #[test]
    fn test_layout_provisioning() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig {
            base_dir: dir.path().join("acme"),
            ..AgentConfig::default()
        };
        let layout = StateLayout::new(&config);
        let failed = layout.ensure();
        assert!(failed.is_empty());
        assert!(layout.installer_staging_dir.is_dir());
        assert!(layout.identity_dir.is_dir());
    }

    #[test]
    fn test_json_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.json");

        assert_eq!(read_json::<Doc>(&path).unwrap(), None);
        write_json_atomic(&path, &Doc { value: 7 }).unwrap();
        assert_eq!(read_json::<Doc>(&path).unwrap(), Some(Doc { value: 7 }));
        assert!(!dir.path().join("doc.tmp").exists());
    }
}
