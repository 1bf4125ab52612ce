//! Platform probe seam: OS-specific operations the core delegates.

use std::path::Path;

use async_trait::async_trait;

use crate::domain::errors::AgentResult;
use crate::domain::models::InstallerEntry;

/// OS-specific capabilities the agent core needs but does not implement.
#[async_trait]
pub trait PlatformProbe: Send + Sync {
    /// Platform name as reported to the registrar (e.g. `"macOS"`,
    /// `"Ubuntu"`).
    fn platform(&self) -> String;

    fn platform_version(&self) -> String;

    fn current_user(&self) -> Option<String>;

    /// Persisted device identifier, if one has been assigned.
    fn system_identifier(&self) -> Option<String>;

    fn set_system_identifier(&self, identifier: &str) -> AgentResult<()>;

    /// Installed version of a managed component, `None` when absent.
    fn installed_version(&self, identifier: &str) -> Option<String>;

    /// Versions of a managed component known to be bad on this device.
    fn bad_versions(&self, identifier: &str) -> Vec<String>;

    /// Whether the sibling recovery process (watcher) is currently running.
    async fn is_watcher_running(&self) -> bool;

    /// Verify the platform code signature of an installer package.
    async fn verify_codesign(&self, package_path: &Path) -> AgentResult<bool>;

    /// Invoke the platform install command for the resolved package.
    async fn install_package(&self, entry: &InstallerEntry, package_path: &Path)
        -> AgentResult<()>;

    /// Package extension to look for inside extracted archives
    /// (`pkg` on macOS, `deb` on Ubuntu, else `zip`).
    fn installer_extension(&self) -> &'static str {
        "zip"
    }
}
