//! Maps IPC commands onto the daemon.

use std::sync::Arc;

use serde_json::json;
use tracing::debug;

use crate::cli::commands::{Command, CommandResponse};
use crate::daemon::{Agent, ProcessState};
use crate::domain::models::ExecutionAction;
use crate::services::registration::RegistrationStatus;

/// Runs commands against a live agent and produces response envelopes.
pub struct CommandDispatcher {
    agent: Arc<Agent>,
}

impl CommandDispatcher {
    pub fn new(agent: Arc<Agent>) -> Self {
        Self { agent }
    }

    /// Execute one command. Never panics; every failure folds into an error
    /// response.
    pub async fn dispatch(&self, command: Command) -> CommandResponse {
        debug!(?command, "dispatching command");
        match command {
            Command::Shutdown => {
                self.agent.request_shutdown();
                CommandResponse::success(None)
            }
            Command::Reload => match self.agent.reload().await {
                Ok(()) => CommandResponse::success(None),
                Err(err) => CommandResponse::error(err.to_string()),
            },

            Command::ComplianceEvaluate { identifier } => {
                self.trigger(ExecutionAction::Evaluation, identifier).await
            }
            Command::ComplianceRemediate { identifier } => {
                self.trigger(ExecutionAction::Remediation, identifier).await
            }
            Command::GetComplianceEvaluationStatus => {
                Self::process_state_response(self.agent.evaluation_state().await)
            }
            Command::GetComplianceRemediationStatus => {
                Self::process_state_response(self.agent.remediation_state().await)
            }
            Command::GetComplianceStatus { no_history } => {
                let snapshot = self.agent.compliance_snapshot(!no_history).await;
                CommandResponse::success(Some(snapshot))
            }

            Command::GetVersion => {
                CommandResponse::success(Some(json!({"version": Agent::version()})))
            }
            Command::GetStatus => CommandResponse::success(Some(self.agent.daemon_status().await)),
            Command::GetSystemID => match self.agent.system_id().await {
                Some(system_id) => {
                    CommandResponse::success(Some(json!({"system_id": system_id})))
                }
                None => CommandResponse::error("no system identifier assigned"),
            },
            Command::GetCurrentUser => match self.agent.current_user() {
                Some(user) => CommandResponse::success(Some(json!({"user": user}))),
                None => CommandResponse::error("no user session found"),
            },
            Command::GetIsRegistered => CommandResponse::success(Some(json!({
                "registered": self.agent.is_registered().await
            }))),
            Command::GetNetworkStatus => CommandResponse::success(Some(json!({
                "state": self.agent.network_state_bits()
            }))),
            Command::GetGroupCache => match self.agent.group_cache() {
                Ok(cache) => CommandResponse::success(Some(cache)),
                Err(_) => CommandResponse::subsystem_unset("group cache"),
            },
            Command::GetAgentStatus => CommandResponse::subsystem_unset("user session agent"),
            Command::GetKARLStatus => {
                CommandResponse::success(Some(self.agent.karl_status().await))
            }
            Command::GetACMEHealthInfo => {
                CommandResponse::success(Some(self.agent.health_info().await))
            }

            Command::GetJWT { duration_secs } => {
                let duration = chrono::Duration::seconds(duration_secs.unwrap_or(300));
                match self.agent.posture_token(duration).await {
                    Ok(token) => CommandResponse::success(Some(json!({"jwt": token}))),
                    Err(err) => CommandResponse::error(err.to_string()),
                }
            }
            Command::RegisterWithToken { token, force } => {
                match self.agent.register_with_token(token, force).await {
                    RegistrationStatus::AlreadyRegistered => CommandResponse::registered_already(),
                    RegistrationStatus::Running => CommandResponse::process_running(),
                    RegistrationStatus::Failed(message) => CommandResponse::error(message),
                    _ => CommandResponse::process_running(),
                }
            }
            Command::GetRegistrationStatus => match self.agent.registration_status().await {
                None => CommandResponse::subsystem_unset("registration"),
                Some(RegistrationStatus::Running) => CommandResponse::process_running(),
                Some(RegistrationStatus::Succeeded) => CommandResponse::success(None),
                Some(RegistrationStatus::AlreadyRegistered) => {
                    CommandResponse::registered_already()
                }
                Some(RegistrationStatus::Failed(message)) => CommandResponse::error(message),
                Some(RegistrationStatus::Idle) => {
                    CommandResponse::success(Some(json!({"state": "idle"})))
                }
            },

            Command::CommitKARLEvent { event_data } => {
                match self.agent.commit_event(event_data, false).await {
                    Ok(()) => CommandResponse::success(None),
                    Err(err) => CommandResponse::error(err.to_string()),
                }
            }
            Command::ProxyEvent { event_data } => {
                match self.agent.commit_event(event_data, true).await {
                    Ok(()) => CommandResponse::success(None),
                    Err(err) => CommandResponse::error(err.to_string()),
                }
            }

            Command::ModuleStatus { identifier } => {
                match self.agent.module_status(&identifier).await {
                    Ok(module) => CommandResponse::success(Some(module)),
                    Err(err) => CommandResponse::error(err.to_string()),
                }
            }
            Command::ReloadModules => {
                let count = self.agent.reload_modules().await;
                CommandResponse::success(Some(json!({"num_modules": count})))
            }
        }
    }

    async fn trigger(
        &self,
        action: ExecutionAction,
        identifier: Option<String>,
    ) -> CommandResponse {
        match self.agent.trigger_compliance(action, identifier).await {
            Ok(()) => CommandResponse::process_running(),
            Err(err) => CommandResponse::subsystem_unset(err.to_string()),
        }
    }

    fn process_state_response(state: ProcessState) -> CommandResponse {
        match state {
            ProcessState::Running => CommandResponse::process_running(),
            ProcessState::Idle => CommandResponse::success(Some(json!({"state": "idle"}))),
            ProcessState::Finished => {
                CommandResponse::success(Some(json!({"state": "finished"})))
            }
        }
    }
}
