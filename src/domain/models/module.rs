//! Compliance module record: settings, runtime state, and scheduling logic.
//!
//! A `ComplianceModule` is the serializable record for one compliance
//! dimension. Behavior (the actual probe and fix) lives behind
//! [`crate::domain::ports::ModuleBehavior`]; executors operate on a cloned
//! snapshot of this record and report back through the response queue, so the
//! registry's copy is only ever mutated by the controller.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, error, info};

use super::results::{EvaluationResult, RemediationResult, SupportFile};
use super::status::{
    ComplianceStatus, ExecutionPrerequisites, ExecutionStatus, ExecutionTrigger, ModuleStatus,
};
use super::{duration_secs, opt_duration_secs};
use crate::domain::ports::ModuleBehavior;

/// How many archived results we retain per module by default.
pub const DEFAULT_HISTORY_MAX_RECORDS: usize = 10;

fn default_history_max() -> usize {
    DEFAULT_HISTORY_MAX_RECORDS
}

fn default_gracetime() -> Duration {
    Duration::days(4)
}

fn default_isolation_gracetime() -> Duration {
    Duration::days(2)
}

fn default_true() -> bool {
    true
}

/// Serializable record of one compliance module.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceModule {
    // Identity
    pub identifier: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub priority: i32,

    // Policy
    #[serde(default)]
    pub triggers: ExecutionTrigger,
    #[serde(default)]
    pub prerequisites: ExecutionPrerequisites,
    #[serde(default = "default_true")]
    pub enforce_isolation: bool,
    #[serde(default)]
    pub can_remediate: bool,
    #[serde(default)]
    pub auto_remediate: bool,
    #[serde(default)]
    pub exempt_flag: bool,
    #[serde(default)]
    pub exempt_until: Option<DateTime<Utc>>,

    // Cadence
    #[serde(default, with = "opt_duration_secs")]
    pub evaluation_interval: Option<Duration>,
    #[serde(default, with = "opt_duration_secs")]
    pub retry_evaluation_interval: Option<Duration>,
    #[serde(default, with = "opt_duration_secs")]
    pub evaluation_skew: Option<Duration>,
    #[serde(default, with = "opt_duration_secs")]
    pub min_evaluation_interval: Option<Duration>,
    #[serde(default, with = "opt_duration_secs")]
    pub remediation_interval: Option<Duration>,
    #[serde(default, with = "opt_duration_secs")]
    pub retry_remediation_interval: Option<Duration>,
    #[serde(default, with = "opt_duration_secs")]
    pub remediation_skew: Option<Duration>,
    #[serde(default = "default_gracetime", with = "duration_secs")]
    pub gracetime: Duration,
    #[serde(default = "default_isolation_gracetime", with = "duration_secs")]
    pub isolation_gracetime: Duration,

    // Runtime state
    #[serde(default)]
    pub status: ModuleStatus,
    #[serde(default)]
    pub last_evaluation_result: Option<EvaluationResult>,
    #[serde(default)]
    pub evaluation_history: Vec<EvaluationResult>,
    #[serde(default = "default_history_max")]
    pub evaluation_history_max_records: usize,
    #[serde(default)]
    pub last_remediation_result: Option<RemediationResult>,
    #[serde(default)]
    pub remediation_history: Vec<RemediationResult>,
    #[serde(default = "default_history_max")]
    pub remediation_history_max_records: usize,
    #[serde(default)]
    pub first_failure_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_known_compliant: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_known_noncompliant: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_compliance_status: Option<ComplianceStatus>,
    #[serde(default)]
    pub last_execution: Option<DateTime<Utc>>,
    #[serde(default)]
    pub support_files: HashMap<String, SupportFile>,

    // Storage layout
    #[serde(default)]
    pub needs_state_dir: bool,
    #[serde(default)]
    pub needs_manifest_dir: bool,
    #[serde(default)]
    pub state_path: Option<PathBuf>,
    #[serde(default)]
    pub manifest_path: Option<PathBuf>,

    // Current skew rolls; re-rolled per schedule, never persisted.
    #[serde(skip)]
    current_evaluation_skew: Option<Duration>,
    #[serde(skip)]
    current_remediation_skew: Option<Duration>,

    /// Optional per-module execution lock, shared across snapshots so
    /// evaluate and remediate serialize across executors.
    #[serde(skip)]
    pub execution_lock: Option<Arc<tokio::sync::Mutex<()>>>,
}

impl ComplianceModule {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            name: None,
            version: None,
            priority: 0,
            triggers: ExecutionTrigger::empty(),
            prerequisites: ExecutionPrerequisites::NONE,
            enforce_isolation: true,
            can_remediate: false,
            auto_remediate: false,
            exempt_flag: false,
            exempt_until: None,
            evaluation_interval: None,
            retry_evaluation_interval: None,
            evaluation_skew: None,
            min_evaluation_interval: None,
            remediation_interval: None,
            retry_remediation_interval: None,
            remediation_skew: None,
            gracetime: default_gracetime(),
            isolation_gracetime: default_isolation_gracetime(),
            status: ModuleStatus::Idle,
            last_evaluation_result: None,
            evaluation_history: Vec::new(),
            evaluation_history_max_records: DEFAULT_HISTORY_MAX_RECORDS,
            last_remediation_result: None,
            remediation_history: Vec::new(),
            remediation_history_max_records: DEFAULT_HISTORY_MAX_RECORDS,
            first_failure_date: None,
            last_known_compliant: None,
            last_known_noncompliant: None,
            last_compliance_status: None,
            last_execution: None,
            support_files: HashMap::new(),
            needs_state_dir: false,
            needs_manifest_dir: false,
            state_path: None,
            manifest_path: None,
            current_evaluation_skew: None,
            current_remediation_skew: None,
            execution_lock: None,
        }
    }

    /// Display name; falls back to the identifier.
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.identifier)
    }

    /// Path of the state document, honoring the dedicated-directory layout.
    pub fn state_filepath(&self) -> Option<PathBuf> {
        let base = self.state_path.as_ref()?;
        if self.needs_state_dir {
            Some(base.join(format!("{}.json", self.identifier)))
        } else {
            Some(base.clone())
        }
    }

    /// Path of the settings document under the manifest tree.
    pub fn settings_filepath(&self) -> Option<PathBuf> {
        let base = self.manifest_path.as_ref()?;
        if self.needs_manifest_dir {
            Some(base.join(format!("{}.json", self.identifier)))
        } else {
            Some(base.clone())
        }
    }

    // MARK: Persistence

    /// Restore settings and state from disk. A missing file is not an error:
    /// the module keeps its compiled-in defaults.
    pub fn load(&mut self) -> crate::domain::AgentResult<()> {
        self.load_settings()?;
        self.load_state()
    }

    pub fn load_settings(&mut self) -> crate::domain::AgentResult<()> {
        let Some(path) = self.settings_filepath() else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let raw = std::fs::read_to_string(&path)?;
        let settings: ModuleSettings = serde_json::from_str(&raw)?;
        self.apply_settings(settings);
        debug!(
            module = %self.identifier,
            path = %path.display(),
            "loaded module settings"
        );
        Ok(())
    }

    pub fn load_state(&mut self) -> crate::domain::AgentResult<()> {
        let Some(path) = self.state_filepath() else {
            return Ok(());
        };
        if !path.exists() {
            return Ok(());
        }
        let raw = std::fs::read_to_string(&path)?;
        let state: ModuleState = serde_json::from_str(&raw)?;
        self.apply_state(state);
        debug!(module = %self.identifier, path = %path.display(), "loaded module state");
        Ok(())
    }

    /// Persist the state view, atomically (write + rename).
    pub fn save(&self) -> crate::domain::AgentResult<()> {
        let Some(path) = self.state_filepath() else {
            return Ok(());
        };
        let doc = serde_json::to_string_pretty(&self.state())?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, doc)?;
        std::fs::rename(&tmp, &path)?;
        Ok(())
    }

    // MARK: Serde views

    pub fn settings(&self) -> ModuleSettings {
        ModuleSettings {
            name: self.name.clone(),
            identifier: self.identifier.clone(),
            priority: self.priority,
            triggers: self.triggers,
            prerequisites: self.prerequisites,
            enforce_isolation: self.enforce_isolation,
            can_remediate: self.can_remediate,
            auto_remediate: self.auto_remediate,
            exempt_flag: self.exempt_flag,
            exempt_until: self.exempt_until,
            evaluation_interval: self.evaluation_interval,
            retry_evaluation_interval: self.retry_evaluation_interval,
            evaluation_skew: self.evaluation_skew,
            min_evaluation_interval: self.min_evaluation_interval,
            remediation_interval: self.remediation_interval,
            retry_remediation_interval: self.retry_remediation_interval,
            remediation_skew: self.remediation_skew,
            gracetime: self.gracetime,
            isolation_gracetime: self.isolation_gracetime,
            needs_state_dir: self.needs_state_dir,
            needs_manifest_dir: self.needs_manifest_dir,
        }
    }

    pub fn apply_settings(&mut self, settings: ModuleSettings) {
        if settings.name.is_some() {
            self.name = settings.name;
        }
        self.priority = settings.priority;
        self.triggers = settings.triggers;
        self.prerequisites = settings.prerequisites;
        self.enforce_isolation = settings.enforce_isolation;
        self.can_remediate = settings.can_remediate;
        self.auto_remediate = settings.auto_remediate;
        self.exempt_flag = settings.exempt_flag;
        self.exempt_until = settings.exempt_until;
        self.evaluation_interval = settings.evaluation_interval;
        self.retry_evaluation_interval = settings.retry_evaluation_interval;
        self.evaluation_skew = settings.evaluation_skew;
        self.min_evaluation_interval = settings.min_evaluation_interval;
        self.remediation_interval = settings.remediation_interval;
        self.retry_remediation_interval = settings.retry_remediation_interval;
        self.remediation_skew = settings.remediation_skew;
        self.gracetime = settings.gracetime;
        self.isolation_gracetime = settings.isolation_gracetime;
        self.needs_state_dir = settings.needs_state_dir;
        self.needs_manifest_dir = settings.needs_manifest_dir;
    }

    pub fn state(&self) -> ModuleState {
        ModuleState {
            identifier: self.identifier.clone(),
            first_failure_date: self.first_failure_date,
            last_evaluation_result: self.last_evaluation_result.clone(),
            last_remediation_result: self.last_remediation_result.clone(),
            last_compliance_status: self.last_compliance_status,
            last_known_compliant: self.last_known_compliant,
            last_known_noncompliant: self.last_known_noncompliant,
            last_execution: self.last_execution,
            evaluation_history: self.evaluation_history.clone(),
            remediation_history: self.remediation_history.clone(),
            support_files: self.support_files.clone(),
        }
    }

    pub fn apply_state(&mut self, state: ModuleState) {
        self.first_failure_date = state.first_failure_date;
        self.last_evaluation_result = state.last_evaluation_result;
        self.last_remediation_result = state.last_remediation_result;
        self.last_compliance_status = state.last_compliance_status;
        self.last_known_compliant = state.last_known_compliant;
        self.last_known_noncompliant = state.last_known_noncompliant;
        self.last_execution = state.last_execution;
        self.evaluation_history = state.evaluation_history;
        self.remediation_history = state.remediation_history;
        self.support_files = state.support_files;
    }

    // MARK: Evaluation

    /// Run one evaluation through the module's behavior and fold the outcome
    /// into the record: counters, history, and aggregate status.
    ///
    /// Any behavior failure is absorbed into a FATAL result with ERROR
    /// compliance; this method never propagates module faults.
    pub async fn evaluate(
        &mut self,
        behavior: &dyn ModuleBehavior,
        trigger: Option<ExecutionTrigger>,
        data: Option<&Value>,
    ) -> EvaluationResult {
        info!(module = %self.identifier, "beginning evaluation");

        let start_date = Utc::now();
        self.status = ModuleStatus::Evaluating;

        let mut result = match behavior.evaluate(self, trigger, data).await {
            Ok(result) => result,
            Err(err) => {
                error!(module = %self.identifier, error = %err, "evaluation failed");
                EvaluationResult::fatal(start_date)
            }
        };
        if result.start_date.is_none() {
            result.start_date = Some(start_date);
        }
        if result.end_date.is_none() {
            result.end_date = Some(Utc::now());
        }

        self.status = ModuleStatus::Idle;
        result.version.clone_from(&self.version);

        // Carry current support-file content hashes with the result.
        for (key, file) in &self.support_files {
            let mut file = file.clone();
            if file.hash.is_none() && file.exists() {
                if let Err(err) = file.update_hash() {
                    error!(module = %self.identifier, file = %key, error = %err,
                        "failed to hash evaluation support file");
                    continue;
                }
            }
            result.support_files.insert(key.clone(), file);
        }

        let status = result.compliance_status;
        if status.contains(ComplianceStatus::COMPLIANT) {
            self.last_known_compliant = Some(Utc::now());
            self.first_failure_date = None;
        } else if status == ComplianceStatus::UNKNOWN
            || status.intersects(ComplianceStatus::NONCOMPLIANT | ComplianceStatus::ERROR)
        {
            self.last_known_noncompliant = result.end_date;
            if self.first_failure_date.is_none() {
                self.first_failure_date = result.end_date;
            }
        }

        self.last_evaluation_result = Some(result.clone());
        self.archive_evaluation_result(result.clone());

        info!(
            module = %self.identifier,
            compliance = ?result.compliance_status,
            "finished evaluation"
        );

        self.refresh_compliance_status();

        result
    }

    /// Current evaluation interval, accounting for retry and the skew roll.
    pub fn current_evaluation_interval(&mut self) -> Option<Duration> {
        let errored = self
            .last_evaluation_result
            .as_ref()
            .is_some_and(|r| r.execution_status.intersects(ExecutionStatus::ERROR));

        let mut interval = if errored {
            self.retry_evaluation_interval.or(self.evaluation_interval)
        } else {
            self.evaluation_interval
        }?;

        if let Some(skew) = self.evaluation_skew {
            if self.current_evaluation_skew.is_none() {
                self.current_evaluation_skew = Some(roll_skew(skew));
            }
            if let Some(roll) = self.current_evaluation_skew {
                interval = interval + roll;
            }
        }
        Some(interval)
    }

    /// Whether a scheduled evaluation is due now.
    pub fn is_evaluation_time(&mut self) -> bool {
        if !self.triggers.contains(ExecutionTrigger::SCHEDULED) {
            return false;
        }
        if self.status != ModuleStatus::Idle {
            return false;
        }

        let (prior_status, prior_version, prior_end) = match &self.last_evaluation_result {
            Some(result) => (
                result.execution_status,
                result.version.clone(),
                result.end_date,
            ),
            None => return true,
        };
        if prior_status == ExecutionStatus::NONE {
            return true;
        }
        // Module upgrades re-evaluate immediately.
        if prior_version != self.version {
            return true;
        }

        let interval = self
            .current_evaluation_interval()
            .unwrap_or_else(Duration::zero);
        match prior_end {
            Some(end) => end + interval <= Utc::now(),
            None => true,
        }
    }

    fn archive_evaluation_result(&mut self, result: EvaluationResult) {
        self.evaluation_history.push(result);
        let max = self.evaluation_history_max_records.max(1);
        if self.evaluation_history.len() > max {
            let excess = self.evaluation_history.len() - max;
            self.evaluation_history.drain(..excess);
        }
    }

    /// Re-roll the evaluation skew; next interval computation picks it up.
    pub fn reset_evaluation_skew(&mut self) {
        self.current_evaluation_skew = self.evaluation_skew.map(roll_skew);
    }

    // MARK: Remediation

    /// Run one remediation through the module's behavior; mirrors
    /// [`Self::evaluate`].
    pub async fn remediate(
        &mut self,
        behavior: &dyn ModuleBehavior,
        trigger: Option<ExecutionTrigger>,
        data: Option<&Value>,
    ) -> RemediationResult {
        info!(module = %self.identifier, "beginning remediation");

        let start_date = Utc::now();
        self.status = ModuleStatus::Remediating;

        let mut result = match behavior.remediate(self, trigger, data).await {
            Ok(result) => result,
            Err(err) => {
                error!(module = %self.identifier, error = %err, "remediation failed");
                RemediationResult::fatal(start_date)
            }
        };
        if result.start_date.is_none() {
            result.start_date = Some(start_date);
        }
        if result.end_date.is_none() {
            result.end_date = Some(Utc::now());
        }

        self.status = ModuleStatus::Idle;
        self.last_remediation_result = Some(result.clone());
        self.archive_remediation_result(result.clone());

        info!(
            module = %self.identifier,
            execution = ?result.execution_status,
            "finished remediation"
        );

        result
    }

    pub fn current_remediation_interval(&mut self) -> Option<Duration> {
        let errored = self
            .last_remediation_result
            .as_ref()
            .is_some_and(|r| r.execution_status.intersects(ExecutionStatus::ERROR));

        let mut interval = if errored {
            self.retry_remediation_interval.or(self.remediation_interval)
        } else {
            self.remediation_interval
        }?;

        if let Some(skew) = self.remediation_skew {
            if self.current_remediation_skew.is_none() {
                self.current_remediation_skew = Some(roll_skew(skew));
            }
            if let Some(roll) = self.current_remediation_skew {
                interval = interval + roll;
            }
        }
        Some(interval)
    }

    /// Whether a scheduled remediation is due now.
    pub fn is_remediation_time(&mut self) -> bool {
        if !self.triggers.contains(ExecutionTrigger::SCHEDULED) {
            return false;
        }
        if self.status != ModuleStatus::Idle {
            return false;
        }
        if !(self.can_remediate && self.auto_remediate) {
            return false;
        }
        if !self
            .compliance_status()
            .intersects(ComplianceStatus::NONCOMPLIANT)
        {
            return false;
        }

        let prior = match &self.last_remediation_result {
            Some(result) if result.execution_status != ExecutionStatus::NONE => result,
            _ => return true,
        };

        let prior_end = prior.end_date;
        let interval = self
            .current_remediation_interval()
            .unwrap_or_else(Duration::zero);
        match prior_end {
            Some(end) => end + interval <= Utc::now(),
            None => true,
        }
    }

    fn archive_remediation_result(&mut self, result: RemediationResult) {
        self.remediation_history.push(result);
        let max = self.remediation_history_max_records.max(1);
        if self.remediation_history.len() > max {
            let excess = self.remediation_history.len() - max;
            self.remediation_history.drain(..excess);
        }
    }

    pub fn reset_remediation_skew(&mut self) {
        self.current_remediation_skew = self.remediation_skew.map(roll_skew);
    }

    // MARK: Aggregate compliance

    /// Whether the device counts as compliant for enforcement purposes
    /// (fully compliant, in grace time, or exempt).
    pub fn is_compliant(&self) -> bool {
        self.compliance_status().intersects(
            ComplianceStatus::COMPLIANT | ComplianceStatus::EXEMPT | ComplianceStatus::INGRACETIME,
        )
    }

    /// Whether the last evaluation failed, regardless of grace or exemption.
    pub fn has_compliance_issue(&self) -> bool {
        let status = self.compliance_status();
        status.intersects(ComplianceStatus::NONCOMPLIANT | ComplianceStatus::ERROR)
            || status == ComplianceStatus::UNKNOWN
    }

    /// Whether an exemption is currently active.
    pub fn is_exempt(&self) -> bool {
        match self.exempt_until {
            Some(until) => until >= Utc::now(),
            None => self.exempt_flag,
        }
    }

    /// Candidacy begins as soon as the compliance deadline passes; the
    /// isolation deadline itself only governs when enforcement isolates.
    pub fn is_isolation_candidate(&self) -> bool {
        if !self.enforce_isolation {
            return false;
        }
        self.compliance_deadline()
            .is_some_and(|deadline| deadline <= Utc::now())
    }

    /// Aggregate compliance status. Pure: same record state yields the same
    /// result.
    pub fn compliance_status(&self) -> ComplianceStatus {
        let eval_status = self
            .last_evaluation_result
            .as_ref()
            .map_or(ComplianceStatus::UNKNOWN, |r| r.compliance_status);

        let mut result = ComplianceStatus::UNKNOWN;

        if eval_status.contains(ComplianceStatus::COMPLIANT) {
            result |= ComplianceStatus::COMPLIANT;
        } else if eval_status.contains(ComplianceStatus::ERROR) {
            result |= ComplianceStatus::NONCOMPLIANT | ComplianceStatus::ERROR;
        } else if eval_status == ComplianceStatus::UNKNOWN {
            result |= ComplianceStatus::NONCOMPLIANT;
        } else if eval_status.contains(ComplianceStatus::NONCOMPLIANT) {
            result |= ComplianceStatus::NONCOMPLIANT;
        }

        if result.contains(ComplianceStatus::NONCOMPLIANT) {
            let now = Utc::now();
            match self.compliance_deadline() {
                Some(deadline) if now < deadline => result |= ComplianceStatus::INGRACETIME,
                _ => {
                    if self.is_isolation_candidate() {
                        result |= ComplianceStatus::ISOLATIONCANDIDATE;
                    }
                }
            }
        }

        if self.is_exempt() {
            result |= ComplianceStatus::EXEMPT;
        }

        result
    }

    /// Recompute the aggregate status and record it; returns the
    /// `(new, old)` pair when it changed so the caller can notify.
    pub fn refresh_compliance_status(
        &mut self,
    ) -> Option<(ComplianceStatus, Option<ComplianceStatus>)> {
        let status = self.compliance_status();
        let previous = self.last_compliance_status;
        if previous != Some(status) {
            debug!(
                module = %self.identifier,
                new = ?status,
                old = ?previous,
                "compliance status changed"
            );
            self.last_compliance_status = Some(status);
            Some((status, previous))
        } else {
            None
        }
    }

    /// Deadline by which the device must return to compliance, or `None`
    /// when no deadline applies.
    pub fn compliance_deadline(&self) -> Option<DateTime<Utc>> {
        let result = self.last_evaluation_result.as_ref();
        let last_status = result.map_or(ComplianceStatus::UNKNOWN, |r| r.compliance_status);

        let is_non_compliant = last_status
            .intersects(ComplianceStatus::NONCOMPLIANT | ComplianceStatus::ERROR)
            || last_status == ComplianceStatus::UNKNOWN;
        if !is_non_compliant {
            return None;
        }

        let mut deadline = result
            .and_then(|r| r.compliance_deadline)
            .or_else(|| {
                result
                    .and_then(|r| r.first_failure_date)
                    .map(|date| date + self.gracetime)
            })
            .or_else(|| self.first_failure_date.map(|date| date + self.gracetime))?;

        if self.is_exempt() && self.exempt_until.is_none() {
            // Open-ended exemption masks the deadline entirely.
            return None;
        }
        if let Some(until) = self.exempt_until {
            if until > deadline {
                deadline = until;
            }
        }
        Some(deadline)
    }

    /// Deadline after which the device becomes an isolation candidate.
    pub fn isolation_deadline(&self) -> Option<DateTime<Utc>> {
        if !self.enforce_isolation {
            return None;
        }
        let result = self.last_evaluation_result.as_ref();
        let last_status = result.map_or(ComplianceStatus::UNKNOWN, |r| r.compliance_status);

        let is_non_compliant = last_status.contains(ComplianceStatus::NONCOMPLIANT)
            || last_status == ComplianceStatus::UNKNOWN;
        if !is_non_compliant {
            return None;
        }

        result.and_then(|r| r.isolation_deadline).or_else(|| {
            self.compliance_deadline()
                .map(|deadline| deadline + self.isolation_gracetime)
        })
    }
}

/// Uniform draw in `[-skew/2, +skew/2]`, in whole seconds.
fn roll_skew(skew: Duration) -> Duration {
    let half = skew.num_seconds() / 2;
    if half == 0 {
        return Duration::zero();
    }
    let roll = rand::thread_rng().gen_range(-half..=half);
    Duration::seconds(roll)
}

/// Settings view of a module: the manifest-delivered policy and cadence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleSettings {
    #[serde(default)]
    pub name: Option<String>,
    pub identifier: String,
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub triggers: ExecutionTrigger,
    #[serde(default)]
    pub prerequisites: ExecutionPrerequisites,
    #[serde(default = "default_true")]
    pub enforce_isolation: bool,
    #[serde(default)]
    pub can_remediate: bool,
    #[serde(default)]
    pub auto_remediate: bool,
    #[serde(default)]
    pub exempt_flag: bool,
    #[serde(default)]
    pub exempt_until: Option<DateTime<Utc>>,
    #[serde(default, with = "opt_duration_secs")]
    pub evaluation_interval: Option<Duration>,
    #[serde(default, with = "opt_duration_secs")]
    pub retry_evaluation_interval: Option<Duration>,
    #[serde(default, with = "opt_duration_secs")]
    pub evaluation_skew: Option<Duration>,
    #[serde(default, with = "opt_duration_secs")]
    pub min_evaluation_interval: Option<Duration>,
    #[serde(default, with = "opt_duration_secs")]
    pub remediation_interval: Option<Duration>,
    #[serde(default, with = "opt_duration_secs")]
    pub retry_remediation_interval: Option<Duration>,
    #[serde(default, with = "opt_duration_secs")]
    pub remediation_skew: Option<Duration>,
    #[serde(default = "default_gracetime", with = "duration_secs")]
    pub gracetime: Duration,
    #[serde(default = "default_isolation_gracetime", with = "duration_secs")]
    pub isolation_gracetime: Duration,
    #[serde(default)]
    pub needs_state_dir: bool,
    #[serde(default)]
    pub needs_manifest_dir: bool,
}

/// State view of a module: everything a hot replace must preserve and the
/// state document persists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleState {
    pub identifier: String,
    #[serde(default)]
    pub first_failure_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_evaluation_result: Option<EvaluationResult>,
    #[serde(default)]
    pub last_remediation_result: Option<RemediationResult>,
    #[serde(default)]
    pub last_compliance_status: Option<ComplianceStatus>,
    #[serde(default)]
    pub last_known_compliant: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_known_noncompliant: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_execution: Option<DateTime<Utc>>,
    #[serde(default)]
    pub evaluation_history: Vec<EvaluationResult>,
    #[serde(default)]
    pub remediation_history: Vec<RemediationResult>,
    #[serde(default)]
    pub support_files: HashMap<String, SupportFile>,
}
