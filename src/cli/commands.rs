//! Command and response types for the local IPC surface.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Requests accepted by the daemon, JSON-tagged by action name.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "action", content = "args")]
pub enum Command {
    Shutdown,
    Reload,
    ComplianceEvaluate {
        #[serde(default)]
        identifier: Option<String>,
    },
    ComplianceRemediate {
        #[serde(default)]
        identifier: Option<String>,
    },
    GetComplianceEvaluationStatus,
    GetComplianceRemediationStatus,
    GetComplianceStatus {
        #[serde(default)]
        no_history: bool,
    },
    GetVersion,
    GetStatus,
    GetSystemID,
    GetCurrentUser,
    GetIsRegistered,
    GetNetworkStatus,
    GetGroupCache,
    GetAgentStatus,
    GetKARLStatus,
    GetACMEHealthInfo,
    GetJWT {
        #[serde(default)]
        duration_secs: Option<i64>,
    },
    RegisterWithToken {
        token: String,
        #[serde(default)]
        force: bool,
    },
    GetRegistrationStatus,
    CommitKARLEvent {
        event_data: Value,
    },
    ModuleStatus {
        identifier: String,
    },
    ReloadModules,
    ProxyEvent {
        event_data: Value,
    },
}

/// Response status codes; the numeric values are part of the IPC contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseStatus {
    Success,
    Error,
    SubsystemUnset,
    StatusProcessRunning,
    StatusRegisteredAlready,
}

impl ResponseStatus {
    pub fn code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::Error => 1,
            Self::SubsystemUnset => 2,
            Self::StatusProcessRunning => 3,
            Self::StatusRegisteredAlready => 4,
        }
    }
}

/// Response envelope returned for every command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    pub status: ResponseStatus,
    pub status_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CommandResponse {
    pub fn success(data: Option<Value>) -> Self {
        Self {
            status: ResponseStatus::Success,
            status_code: ResponseStatus::Success.code(),
            data,
            message: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::Error,
            status_code: ResponseStatus::Error.code(),
            data: None,
            message: Some(message.into()),
        }
    }

    pub fn subsystem_unset(subsystem: impl Into<String>) -> Self {
        Self {
            status: ResponseStatus::SubsystemUnset,
            status_code: ResponseStatus::SubsystemUnset.code(),
            data: None,
            message: Some(format!("{} is not available", subsystem.into())),
        }
    }

    pub fn process_running() -> Self {
        Self {
            status: ResponseStatus::StatusProcessRunning,
            status_code: ResponseStatus::StatusProcessRunning.code(),
            data: None,
            message: None,
        }
    }

    pub fn registered_already() -> Self {
        Self {
            status: ResponseStatus::StatusRegisteredAlready,
            status_code: ResponseStatus::StatusRegisteredAlready.code(),
            data: None,
            message: Some("system is already registered".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_wire_format() {
        let command: Command =
            serde_json::from_str(r#"{"action": "GetComplianceStatus", "args": {"no_history": true}}"#)
                .unwrap();
        assert_eq!(command, Command::GetComplianceStatus { no_history: true });

        let command: Command = serde_json::from_str(r#"{"action": "Shutdown"}"#).unwrap();
        assert_eq!(command, Command::Shutdown);
    }

    #[test]
    fn test_response_codes_are_stable() {
        assert_eq!(ResponseStatus::Success.code(), 0);
        assert_eq!(ResponseStatus::Error.code(), 1);
        assert_eq!(ResponseStatus::SubsystemUnset.code(), 2);
        assert_eq!(ResponseStatus::StatusProcessRunning.code(), 3);
        assert_eq!(ResponseStatus::StatusRegisteredAlready.code(), 4);
    }

    #[test]
    fn test_response_serialization() {
        let response = CommandResponse::success(Some(serde_json::json!({"version": "1.5.3"})));
        let raw = serde_json::to_string(&response).unwrap();
        assert!(raw.contains("SUCCESS"));
        assert!(!raw.contains("message"));
    }
}
