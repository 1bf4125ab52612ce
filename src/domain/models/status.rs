//! Status and policy bitsets.
//!
//! Every mask in this file serializes as its raw integer value; the numeric
//! representation is part of the on-disk and wire format and must not change.

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Implements integer-valued serde for a bitflags type, dropping any
/// unrecognized bits carried by older state files.
macro_rules! impl_bits_serde {
    ($type:ty) => {
        impl Serialize for $type {
            fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
                serializer.serialize_u32(self.bits())
            }
        }

        impl<'de> Deserialize<'de> for $type {
            fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
                let bits = u32::deserialize(deserializer)?;
                Ok(<$type>::from_bits_truncate(bits))
            }
        }
    };
}

bitflags! {
    /// Aggregated compliance state of a module or device.
    ///
    /// `UNKNOWN` is the empty set. Device status is the numeric maximum over
    /// module statuses, so severity increases with bit position.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ComplianceStatus: u32 {
        const EXEMPT = 1 << 1;
        const COMPLIANT = 1 << 2;
        const ERROR = 1 << 3;
        const INGRACETIME = 1 << 4;
        const NONCOMPLIANT = 1 << 5;
        const ISOLATIONCANDIDATE = 1 << 6;
        const ISOLATED = 1 << 7;
    }
}
impl_bits_serde!(ComplianceStatus);

impl ComplianceStatus {
    pub const UNKNOWN: ComplianceStatus = ComplianceStatus::empty();
}

impl Default for ComplianceStatus {
    fn default() -> Self {
        Self::UNKNOWN
    }
}

bitflags! {
    /// Network-state prerequisites a module requires before it may execute.
    ///
    /// States come in exclusive pairs (online/offline, on/off domain,
    /// on/off VPN); a module qualifies when every required bit is present in
    /// the current state mask.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExecutionPrerequisites: u32 {
        const ONLINE = 1 << 1;
        const OFFLINE = 1 << 2;
        const ONDOMAIN = 1 << 3;
        const OFFDOMAIN = 1 << 4;
        const ONVPN = 1 << 5;
        const OFFVPN = 1 << 6;
    }
}
impl_bits_serde!(ExecutionPrerequisites);

impl ExecutionPrerequisites {
    pub const NONE: ExecutionPrerequisites = ExecutionPrerequisites::empty();
}

impl Default for ExecutionPrerequisites {
    fn default() -> Self {
        Self::NONE
    }
}

bitflags! {
    /// Outcome classification of a single evaluate/remediate invocation.
    ///
    /// `FATAL` implies `ERROR`: fatal failures are framework-level faults
    /// (the module body never produced a result).
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExecutionStatus: u32 {
        const SUCCESS = 1 << 0;
        const ERROR = 1 << 1;
        const FATAL = (1 << 1) | (1 << 2);
    }
}
impl_bits_serde!(ExecutionStatus);

impl ExecutionStatus {
    pub const NONE: ExecutionStatus = ExecutionStatus::empty();
}

impl Default for ExecutionStatus {
    fn default() -> Self {
        Self::NONE
    }
}

bitflags! {
    /// Triggers which may initiate module execution.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExecutionTrigger: u32 {
        const SCHEDULED = 1 << 0;
        const MANUAL = 1 << 1;
    }
}
impl_bits_serde!(ExecutionTrigger);

impl Default for ExecutionTrigger {
    fn default() -> Self {
        Self::empty()
    }
}

impl ExecutionTrigger {
    /// Dotted-suffix name used in execution queue keys.
    pub fn queue_suffix(self) -> Option<&'static str> {
        if self.contains(ExecutionTrigger::SCHEDULED) {
            Some("SCHEDULED")
        } else if self.contains(ExecutionTrigger::MANUAL) {
            Some("MANUAL")
        } else {
            None
        }
    }
}

bitflags! {
    /// Reasons a module failed qualification; the empty set means qualified.
    ///
    /// Site, probability, frequency, and execution-limit checks are extension
    /// hooks; no default policy sets them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct QualificationResult: u32 {
        const TRIGGER_NOT_QUALIFIED = 1 << 0;
        const SITE_NOT_QUALIFIED = 1 << 1;
        const PREREQUISITES_NOT_MET = 1 << 2;
        const PROBABILITY_FAILED = 1 << 3;
        const MAX_FREQUENCY_HIT = 1 << 4;
        const EXECUTION_LIMITS_REACHED = 1 << 5;
    }
}
impl_bits_serde!(QualificationResult);

impl QualificationResult {
    pub const QUALIFIED: QualificationResult = QualificationResult::empty();

    pub fn is_qualified(self) -> bool {
        self.is_empty()
    }
}

impl Default for QualificationResult {
    fn default() -> Self {
        Self::QUALIFIED
    }
}

bitflags! {
    /// Runtime state of a single executor worker.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ExecutorStatus: u32 {
        const RUNNING = 1 << 0;
        const EXECUTING = 1 << 1;
        const STOPPING = 1 << 2;
    }
}
impl_bits_serde!(ExecutorStatus);

impl Default for ExecutorStatus {
    fn default() -> Self {
        Self::empty()
    }
}

bitflags! {
    /// Bitset error code reported by installer pipeline events.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct InstallErrorCode: u32 {
        const FETCH_CONFIGURATION_FAILED = 1 << 0;
        const DOWNLOAD_FAILED = 1 << 1;
        const CODE_SIGN_VERIFY_FAILED = 1 << 2;
        const ZIP_EXTRACTION_FAILED = 1 << 3;
        const FAILED_TO_CLEAN = 1 << 4;
        const SIGN_HASH_VERIFY_FAILED = 1 << 5;
        const INSTALL_FAILED = 1 << 6;
    }
}
impl_bits_serde!(InstallErrorCode);

impl InstallErrorCode {
    pub const SUCCESS: InstallErrorCode = InstallErrorCode::empty();
}

impl Default for InstallErrorCode {
    fn default() -> Self {
        Self::SUCCESS
    }
}

/// Operational state of a compliance module.
///
/// Transitions are QUEUED -> (EVALUATING | REMEDIATING) -> IDLE only. The
/// numeric values share an EXECUTING bit (1 << 1) between both executing
/// states and are part of the on-disk format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ModuleStatus {
    #[default]
    Idle,
    Queued,
    Evaluating,
    Remediating,
}

impl ModuleStatus {
    const EXECUTING_BIT: u32 = 1 << 1;

    pub fn as_u32(self) -> u32 {
        match self {
            ModuleStatus::Idle => 0,
            ModuleStatus::Queued => 1,
            ModuleStatus::Evaluating => Self::EXECUTING_BIT | (1 << 2),
            ModuleStatus::Remediating => Self::EXECUTING_BIT | (1 << 3),
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        match value {
            0 => Some(ModuleStatus::Idle),
            1 => Some(ModuleStatus::Queued),
            6 => Some(ModuleStatus::Evaluating),
            10 => Some(ModuleStatus::Remediating),
            _ => None,
        }
    }

    pub fn is_executing(self) -> bool {
        self.as_u32() & Self::EXECUTING_BIT != 0
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ModuleStatus::Idle => "idle",
            ModuleStatus::Queued => "queued",
            ModuleStatus::Evaluating => "evaluating",
            ModuleStatus::Remediating => "remediating",
        }
    }
}

impl std::fmt::Display for ModuleStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl Serialize for ModuleStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.as_u32())
    }
}

impl<'de> Deserialize<'de> for ModuleStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = u32::deserialize(deserializer)?;
        // Stale state written mid-execution settles back to idle.
        Ok(ModuleStatus::from_u32(value).unwrap_or(ModuleStatus::Idle))
    }
}
