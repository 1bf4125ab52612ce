//! Evaluation and remediation outcome records.

use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::status::{ComplianceStatus, ExecutionStatus};
use crate::domain::errors::{AgentError, AgentResult};

/// A file relevant to a module's evaluation, tracked by content hash.
///
/// The hash is recomputed from the filesystem on demand so results always
/// carry the content that was actually on disk at evaluation time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SupportFile {
    pub name: String,
    pub path: PathBuf,
    #[serde(default = "SupportFile::default_hash_algo")]
    pub hash_algo: String,
    #[serde(default)]
    pub hash: Option<String>,
}

impl SupportFile {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            hash_algo: Self::default_hash_algo(),
            hash: None,
        }
    }

    fn default_hash_algo() -> String {
        "sha256".to_string()
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Recompute and store the content hash from disk.
    pub fn update_hash(&mut self) -> AgentResult<()> {
        self.hash = Some(file_sha256(&self.path)?);
        Ok(())
    }
}

/// Streaming sha256 of a file's contents, hex-encoded.
pub fn file_sha256(path: &Path) -> AgentResult<String> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| AgentError::PersistenceError(format!("{}: {e}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Immutable outcome of one evaluation pass.
///
/// Constructed by the module's evaluator; the scheduling wrapper only attaches
/// version and support-file metadata afterwards.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EvaluationResult {
    pub compliance_status: ComplianceStatus,
    pub execution_status: ExecutionStatus,
    #[serde(default)]
    pub status_codes: Vec<i64>,
    #[serde(default)]
    pub support_files: HashMap<String, SupportFile>,
    #[serde(default)]
    pub first_failure_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub compliance_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub isolation_deadline: Option<DateTime<Utc>>,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub version: Option<String>,
}

impl EvaluationResult {
    pub fn new(compliance_status: ComplianceStatus, execution_status: ExecutionStatus) -> Self {
        Self {
            compliance_status,
            execution_status,
            start_date: Some(Utc::now()),
            end_date: Some(Utc::now()),
            ..Self::default()
        }
    }

    /// Result synthesized when the evaluator itself fails.
    pub fn fatal(start_date: DateTime<Utc>) -> Self {
        Self {
            compliance_status: ComplianceStatus::ERROR,
            execution_status: ExecutionStatus::FATAL,
            start_date: Some(start_date),
            end_date: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn with_status_code(mut self, code: i64) -> Self {
        self.status_codes.push(code);
        self
    }
}

/// Outcome of one remediation pass.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RemediationResult {
    pub execution_status: ExecutionStatus,
    #[serde(default)]
    pub status_codes: Vec<i64>,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
}

impl RemediationResult {
    pub fn new(execution_status: ExecutionStatus) -> Self {
        Self {
            execution_status,
            start_date: Some(Utc::now()),
            end_date: Some(Utc::now()),
            ..Self::default()
        }
    }

    pub fn fatal(start_date: DateTime<Utc>) -> Self {
        Self {
            execution_status: ExecutionStatus::FATAL,
            start_date: Some(start_date),
            end_date: Some(Utc::now()),
            ..Self::default()
        }
    }
}
