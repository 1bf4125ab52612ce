//! Configuration-pull bookkeeping records.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::duration_secs;

fn default_update_frequency() -> Duration {
    Duration::hours(24)
}

/// Per-resource record tracked by a configuration sub-module.
///
/// One entry per configured remote resource (settings bundle, signed file);
/// the owning module derives its timer interval from the earliest
/// `next_update` over its entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigurationEntry {
    pub identifier: String,
    #[serde(default = "default_update_frequency", with = "duration_secs")]
    pub update_frequency: Duration,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_update_attempt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_change: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub remote_hash: Option<String>,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub signature_url: Option<String>,
}

impl ConfigurationEntry {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            update_frequency: default_update_frequency(),
            last_update: None,
            last_update_attempt: None,
            last_change: None,
            version: None,
            remote_hash: None,
            download_url: None,
            signature_url: None,
        }
    }

    /// When this entry is next due. An entry that has never updated is due
    /// immediately.
    pub fn next_update(&self) -> DateTime<Utc> {
        match self.last_update {
            Some(last) => last + self.update_frequency,
            None => Utc::now(),
        }
    }

    pub fn needs_update(&self) -> bool {
        self.next_update() <= Utc::now()
    }
}

/// An installer target delivered by the registrar to the usher pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallerEntry {
    pub identifier: String,
    #[serde(default)]
    pub version: Option<String>,
    /// Version installed before this target was applied.
    #[serde(default)]
    pub old_version: Option<String>,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub download_url: Option<String>,
    #[serde(default)]
    pub signature_url: Option<String>,
    #[serde(default)]
    pub file_hash: Option<String>,
    #[serde(default)]
    pub bad_versions: Vec<String>,
    #[serde(default)]
    pub is_installable_by_acme: bool,
    #[serde(default = "default_update_frequency", with = "duration_secs")]
    pub update_frequency: Duration,
    #[serde(default)]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_update_attempt: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_change: Option<DateTime<Utc>>,
}

impl InstallerEntry {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            version: None,
            old_version: None,
            priority: 0,
            download_url: None,
            signature_url: None,
            file_hash: None,
            bad_versions: Vec::new(),
            is_installable_by_acme: false,
            update_frequency: default_update_frequency(),
            last_update: None,
            last_update_attempt: None,
            last_change: None,
        }
    }

    pub fn next_update(&self) -> DateTime<Utc> {
        match self.last_update {
            Some(last) => last + self.update_frequency,
            None => Utc::now(),
        }
    }

    pub fn needs_update(&self) -> bool {
        self.next_update() <= Utc::now()
    }

    /// Whether this target's version is on the deny list.
    pub fn targets_bad_version(&self) -> bool {
        self.version
            .as_ref()
            .is_some_and(|v| self.bad_versions.contains(v))
    }
}
