//! Compliance controller.
//!
//! Owns the executor pool, the scheduled-trigger loop, and the response
//! drain. Executors communicate exclusively through the execution and
//! response queues; the controller is the only writer of the live module
//! registry. Every tick phase catches and logs its own failures so one bad
//! module cannot stall the loop.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::models::{
    AgentEvent, ComplianceConfig, ComplianceModule, ComplianceStatus, ExecutionAction,
    ExecutionRequest, ExecutionResponse, ExecutionTrigger, ExecutorStatus, ModuleStatus,
    QualificationResult,
};
use crate::domain::ports::{ModuleBehavior, ModuleDefinition};
use crate::services::event_router::EventRouter;
use crate::services::executor::{Executor, ExecutorConfig, ExecutorHandle};
use crate::services::qualifier::Qualifier;
use crate::services::registry::ModuleRegistry;

/// How long a request may sit queued before the pool scales up for it.
pub fn execution_sla() -> Duration {
    Duration::seconds(15)
}

const MAX_RESPONSES_PER_PASS: usize = 25;
const MAX_EVENTS_PER_PASS: usize = 25;
const MAX_LOG_RECORDS_PER_PASS: usize = 25;

/// A log record forwarded from a worker that cannot log directly (retained
/// for the process-isolated executor mode).
#[derive(Debug, Clone)]
pub struct ForwardedLogRecord {
    pub target: String,
    pub level: tracing::Level,
    pub message: String,
}

/// Bookkeeping for one queued request, keyed by queue id.
#[derive(Debug, Clone)]
struct QueuedRequest {
    uuid: Uuid,
    module_identifier: String,
    date: DateTime<Utc>,
}

/// Compliance module scheduler and executor-pool owner.
pub struct ComplianceController {
    config: ComplianceConfig,
    /// Live modules; doubles as the load lock for tick phases.
    registry: Arc<Mutex<ModuleRegistry>>,
    qualifier: Arc<Qualifier>,
    router: Arc<EventRouter>,

    execution_tx: async_channel::Sender<ExecutionRequest>,
    execution_rx: async_channel::Receiver<ExecutionRequest>,
    response_tx: async_channel::Sender<ExecutionResponse>,
    response_rx: async_channel::Receiver<ExecutionResponse>,
    /// Event proxy queue for workers without direct sink access.
    event_proxy_tx: async_channel::Sender<AgentEvent>,
    event_proxy_rx: async_channel::Receiver<AgentEvent>,
    /// Log forwarding queue for workers without direct logging.
    log_forward_tx: async_channel::Sender<ForwardedLogRecord>,
    log_forward_rx: async_channel::Receiver<ForwardedLogRecord>,

    /// Queued requests by queue id, guarded separately from the registry.
    module_queue_data: Mutex<HashMap<String, QueuedRequest>>,
    executors: Mutex<Vec<ExecutorHandle>>,
    should_run: Arc<AtomicBool>,
    last_device_status: Mutex<Option<ComplianceStatus>>,
    tick_task: Mutex<Option<JoinHandle<()>>>,
}

impl ComplianceController {
    pub fn new(
        config: ComplianceConfig,
        registry: Arc<Mutex<ModuleRegistry>>,
        qualifier: Arc<Qualifier>,
        router: Arc<EventRouter>,
    ) -> Self {
        let (execution_tx, execution_rx) = async_channel::unbounded();
        let (response_tx, response_rx) = async_channel::unbounded();
        let (event_proxy_tx, event_proxy_rx) = async_channel::unbounded();
        let (log_forward_tx, log_forward_rx) = async_channel::unbounded();

        Self {
            config,
            registry,
            qualifier,
            router,
            execution_tx,
            execution_rx,
            response_tx,
            response_rx,
            event_proxy_tx,
            event_proxy_rx,
            log_forward_tx,
            log_forward_rx,
            module_queue_data: Mutex::new(HashMap::new()),
            executors: Mutex::new(Vec::new()),
            should_run: Arc::new(AtomicBool::new(false)),
            last_device_status: Mutex::new(None),
            tick_task: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> Arc<Mutex<ModuleRegistry>> {
        Arc::clone(&self.registry)
    }

    /// Sender workers use to proxy events back through the controller.
    pub fn event_proxy(&self) -> async_channel::Sender<AgentEvent> {
        self.event_proxy_tx.clone()
    }

    /// Sender workers use to forward log records.
    pub fn log_forwarder(&self) -> async_channel::Sender<ForwardedLogRecord> {
        self.log_forward_tx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.should_run.load(Ordering::SeqCst)
    }

    // MARK: Lifecycle

    /// Start the routine tick loop.
    pub async fn start(self: &Arc<Self>) {
        if self.should_run.swap(true, Ordering::SeqCst) {
            warn!("compliance controller already running");
            return;
        }
        info!("starting compliance controller");

        let controller = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let interval = controller.config.routine_interval();
            while controller.should_run.load(Ordering::SeqCst) {
                controller.tick().await;
                tokio::time::sleep(interval).await;
            }
            debug!("compliance controller loop finished");
        });
        *self.tick_task.lock().await = Some(handle);
    }

    /// Graceful shutdown: stop dequeuing, let in-flight work finish, then
    /// wait for executors to report dead.
    pub async fn stop(&self) {
        info!("stopping compliance controller");
        self.should_run.store(false, Ordering::SeqCst);

        if let Some(handle) = self.tick_task.lock().await.take() {
            handle.abort();
        }

        let wait = self.config.executor_shutdown_wait();
        let executors = self.executors.lock().await;
        for executor in executors.iter() {
            executor.stop();
        }
        tokio::time::sleep(wait).await;
        while executors.iter().any(ExecutorHandle::is_alive) {
            info!("waiting for module executors to quit");
            tokio::time::sleep(wait).await;
        }
        info!("compliance controller stopped");
    }

    /// One routine pass. Public so manual drains (tests, reload) can pump
    /// the loop deterministically.
    pub async fn tick(&self) {
        self.manage_execution_threads().await;
        self.trigger_scheduled_modules().await;
        self.process_logging_queue().await;
        self.process_execution_responses().await;
        self.check_device_status_change().await;
        self.proxy_events().await;
    }

    // MARK: Module loading

    /// Load a batch of module definitions, emitting a load event.
    pub async fn load_modules(&self, definitions: Vec<ModuleDefinition>, send_events: bool) {
        let report = {
            let mut registry = self.registry.lock().await;
            registry.load_definitions(definitions)
        };

        if send_events {
            let event = AgentEvent::new("ComplianceModuleLoadEvent", "Compliance")
                .with_entry("load_uuid", Uuid::new_v4().to_string())
                .with_entry("load_time", report.load_time_ms)
                .with_entry("load_date", Utc::now().timestamp().to_string())
                .with_entry("modules", report.loaded.join(", "))
                .with_entry("num_modules", report.loaded.len())
                .with_entry("error", report.num_failures > 0)
                .with_entry("num_failures", report.num_failures);
            self.router.dispatch(event).await;
        }
    }

    /// Unload one module, emitting an unload event.
    pub async fn unload_module(&self, identifier: &str, send_events: bool) -> bool {
        let removed = {
            let mut registry = self.registry.lock().await;
            registry.unload(identifier).is_some()
        };

        if removed && send_events {
            let event = AgentEvent::new("ComplianceModuleUnLoadEvent", "Compliance")
                .with_entry("unload_uuid", Uuid::new_v4().to_string())
                .with_entry("unload_date", Utc::now().timestamp().to_string())
                .with_entry("identifier", identifier);
            self.router.dispatch(event).await;
        }
        removed
    }

    /// Re-read settings manifests for every loaded module.
    pub async fn reload(&self) {
        debug!("reloading compliance controller settings");
        let mut registry = self.registry.lock().await;
        registry.reload_settings();
    }

    // MARK: Status surfaces

    /// Bitwise OR of all module operational statuses.
    pub async fn status(&self) -> u32 {
        let registry = self.registry.lock().await;
        registry
            .modules()
            .fold(0, |acc, module| acc | module.status.as_u32())
    }

    /// Device status: numeric maximum over module compliance statuses.
    pub async fn device_status(&self) -> ComplianceStatus {
        let registry = self.registry.lock().await;
        registry
            .modules()
            .map(ComplianceModule::compliance_status)
            .max_by_key(ComplianceStatus::bits)
            .unwrap_or(ComplianceStatus::UNKNOWN)
    }

    /// Earliest compliance deadline across modules.
    pub async fn compliance_deadline(&self) -> Option<DateTime<Utc>> {
        let registry = self.registry.lock().await;
        registry
            .modules()
            .filter_map(ComplianceModule::compliance_deadline)
            .min()
    }

    /// Earliest isolation deadline across modules.
    pub async fn isolation_deadline(&self) -> Option<DateTime<Utc>> {
        let registry = self.registry.lock().await;
        registry
            .modules()
            .filter_map(ComplianceModule::isolation_deadline)
            .min()
    }

    /// Serialized snapshot of every module, optionally without histories.
    pub async fn module_snapshots(&self, include_history: bool) -> Vec<Value> {
        let registry = self.registry.lock().await;
        registry
            .modules()
            .map(|module| {
                let mut value = serde_json::to_value(module).unwrap_or(Value::Null);
                if !include_history {
                    if let Value::Object(map) = &mut value {
                        map.remove("evaluation_history");
                        map.remove("remediation_history");
                    }
                }
                value
            })
            .collect()
    }

    // MARK: Executor pool

    pub async fn executor_count(&self) -> usize {
        self.executors.lock().await.len()
    }

    /// Number of queued requests past the execution SLA.
    ///
    /// Lock order is registry before queue data, everywhere.
    async fn num_overqueued(&self) -> usize {
        let registry = self.registry.lock().await;
        let queue_data = self.module_queue_data.lock().await;
        let now = Utc::now();
        let sla = execution_sla();

        queue_data
            .values()
            .filter(|meta| {
                registry
                    .get(&meta.module_identifier)
                    .is_some_and(|m| m.status == ModuleStatus::Queued)
                    && meta.date + sla <= now
            })
            .count()
    }

    /// Ideal executor count for the current queue depth, scaling past the
    /// one-per-three baseline while queued requests breach the SLA.
    async fn ideal_executor_count(&self) -> usize {
        if !self.should_run.load(Ordering::SeqCst) {
            return 0;
        }

        let num_queued = self.module_queue_data.lock().await.len();
        let max = self.config.max_executors;

        let mut ideal = if num_queued == 0 {
            0
        } else if num_queued < max {
            num_queued.div_ceil(3)
        } else {
            num_queued
        };

        if ideal < max {
            let overqueued = self.num_overqueued().await;
            if overqueued > 0 {
                let current = self.executor_count().await;
                if current == ideal {
                    ideal = current + overqueued;
                } else if current > ideal {
                    ideal = current;
                }
            }
        }

        ideal.min(num_queued).min(max)
    }

    /// Prune dead workers and scale the pool toward the ideal count.
    pub async fn manage_execution_threads(&self) {
        if !self.should_run.load(Ordering::SeqCst) {
            let executors = self.executors.lock().await;
            for executor in executors.iter() {
                executor.stop();
            }
            return;
        }

        let ideal = self.ideal_executor_count().await;
        let mut executors = self.executors.lock().await;

        executors.retain(|executor| {
            if executor.is_alive() {
                true
            } else {
                debug!(executor = %executor.name, "pruning dead executor");
                false
            }
        });

        let count = executors.len();
        debug!(count, ideal, "managing execution threads");

        if count < ideal {
            for _ in 0..(ideal - count) {
                let name = next_executor_name(&executors);
                debug!(executor = %name, "spinning up executor");
                let handle = Executor::spawn(
                    name,
                    self.execution_rx.clone(),
                    self.response_tx.clone(),
                    ExecutorConfig {
                        idle_ttl: self.config.executor_idle_ttl(),
                        fetch_timeout: self.config.queue_fetch_timeout(),
                        loop_wait: self.config.queue_fetch_timeout(),
                        execution_timeout: self.config.evaluation_timeout(),
                    },
                );
                executors.push(handle);
            }
        } else if count > ideal {
            // When scaling to zero, leave one worker to expire via its TTL.
            let target = if ideal == 0 { 1 } else { ideal };
            for _ in 0..count.saturating_sub(target) {
                stop_one_executor(&executors);
            }
        }
    }

    // MARK: Triggering

    /// Queue every module due for scheduled evaluation or remediation.
    pub async fn trigger_scheduled_modules(&self) {
        let mut registry = self.registry.lock().await;
        let identifiers = registry.identifiers();
        let current_state = self.qualifier.current_state();

        for identifier in identifiers {
            let Some(behavior) = registry.behavior(&identifier) else {
                continue;
            };
            let Some(module) = registry.get_mut(&identifier) else {
                continue;
            };

            if module.status != ModuleStatus::Idle {
                continue;
            }
            if !self
                .qualifier
                .qualifies_for_trigger(module, ExecutionTrigger::SCHEDULED)
            {
                continue;
            }
            let qualification =
                self.qualifier
                    .run_qualifications_with_state(module, None, current_state);
            if !qualification.is_qualified() {
                continue;
            }

            let action = if module.is_evaluation_time() {
                Some(ExecutionAction::Evaluation)
            } else if module.is_remediation_time() {
                Some(ExecutionAction::Remediation)
            } else {
                None
            };

            if let Some(action) = action {
                self.try_queue_request(
                    module,
                    behavior,
                    Some(ExecutionTrigger::SCHEDULED),
                    action,
                    None,
                )
                .await;
            }
        }
    }

    /// Run qualification for every module against the given trigger,
    /// queueing the qualified ones. The action defaults to evaluation and
    /// may be overridden by an `action` key in `data`.
    pub async fn execute_trigger(&self, trigger: ExecutionTrigger, data: Option<Value>) {
        info!(?trigger, "executing trigger");
        let current_state = self.qualifier.current_state();

        let action = data
            .as_ref()
            .and_then(|d| d.get("action"))
            .and_then(Value::as_str)
            .and_then(ExecutionAction::from_str)
            .unwrap_or(ExecutionAction::Evaluation);

        let mut registry = self.registry.lock().await;
        let identifiers = registry.identifiers();

        for identifier in identifiers {
            let Some(behavior) = registry.behavior(&identifier) else {
                continue;
            };
            let Some(module) = registry.get_mut(&identifier) else {
                continue;
            };

            let results =
                self.qualifier
                    .run_qualifications_with_state(module, Some(trigger), current_state);

            if results.contains(QualificationResult::TRIGGER_NOT_QUALIFIED) {
                continue;
            }
            if results.contains(QualificationResult::EXECUTION_LIMITS_REACHED) {
                debug!(module = %identifier, "execution limits reached, will not trigger");
                continue;
            }
            if results.contains(QualificationResult::SITE_NOT_QUALIFIED) {
                debug!(module = %identifier, "failed network site restrictions, will not trigger");
                continue;
            }
            if results.contains(QualificationResult::PREREQUISITES_NOT_MET) {
                debug!(
                    module = %identifier,
                    current = ?current_state,
                    required = ?module.prerequisites,
                    "prerequisites not met, will not trigger"
                );
                continue;
            }
            if results.contains(QualificationResult::PROBABILITY_FAILED) {
                debug!(module = %identifier, "probability roll failed, will not trigger");
                continue;
            }

            self.try_queue_request(module, behavior, Some(trigger), action, data.clone())
                .await;
        }
    }

    /// Attempt to queue a request for the given live module. Returns `None`
    /// on a no-op (already queued inside the requeue threshold), `Some(true)`
    /// when queued, `Some(false)` on failure.
    pub async fn try_queue_request(
        &self,
        module: &mut ComplianceModule,
        behavior: Arc<dyn ModuleBehavior>,
        trigger: Option<ExecutionTrigger>,
        action: ExecutionAction,
        data: Option<Value>,
    ) -> Option<bool> {
        let request = ExecutionRequest::new(module.clone(), behavior, trigger, action, data);
        let queue_id = request.queue_id();

        let mut queue_data = self.module_queue_data.lock().await;

        if let Some(existing) = queue_data.get(&queue_id) {
            let requeue_time = existing.date + self.config.requeue_threshold();
            if Utc::now() < requeue_time {
                debug!(module = %module.identifier, queue_id = %queue_id,
                    "already queued, will not execute");
                return None;
            }
            warn!(queue_id = %queue_id, "queued request hit requeue threshold, re-queueing");
        }

        match self.execution_tx.send(request.clone()).await {
            Ok(()) => {
                queue_data.insert(
                    queue_id.clone(),
                    QueuedRequest {
                        uuid: request.uuid,
                        module_identifier: module.identifier.clone(),
                        date: request.date,
                    },
                );
                module.status = ModuleStatus::Queued;
                debug!(module = %module.identifier, action = %action, "queued for execution");
                Some(true)
            }
            Err(err) => {
                module.status = ModuleStatus::Idle;
                error!(module = %module.identifier, error = %err, "failed to queue request");
                Some(false)
            }
        }
    }

    /// Depth of the queued-request map (one entry per live queue key).
    pub async fn queued_request_count(&self) -> usize {
        self.module_queue_data.lock().await.len()
    }

    // MARK: Response drain

    /// Drain up to 25 execution responses, merging each returning snapshot's
    /// state into the live module under the load lock.
    pub async fn process_execution_responses(&self) {
        for pass in 0..MAX_RESPONSES_PER_PASS {
            let response = match tokio::time::timeout(
                self.config.queue_fetch_timeout(),
                self.response_rx.recv(),
            )
            .await
            {
                Ok(Ok(response)) => response,
                Ok(Err(_)) | Err(_) => break,
            };

            self.apply_execution_response(response).await;

            if pass + 1 == MAX_RESPONSES_PER_PASS {
                warn!(
                    "processed maximum execution responses this pass ({MAX_RESPONSES_PER_PASS}), deferring"
                );
            }
        }
    }

    async fn apply_execution_response(&self, response: ExecutionResponse) {
        let qid = response.request_queue_id.clone();
        debug!(queue_id = %qid, "received execution response");

        let mut registry = self.registry.lock().await;
        let mut queue_data = self.module_queue_data.lock().await;

        let identifier = match queue_data.get(&qid) {
            Some(meta) => meta.module_identifier.clone(),
            None => {
                warn!(queue_id = %qid, "execution response from unqueued request");
                response.module.identifier.clone()
            }
        };

        let Some(live) = registry.get_mut(&identifier) else {
            error!(
                module = %response.module.identifier,
                status = ?response.module.status,
                "execution response from unknown module (unloaded?), ignoring"
            );
            return;
        };

        let previous_status = live.last_compliance_status;
        live.apply_state(response.module.state());
        live.status = response.module.status;

        if live.status == ModuleStatus::Idle {
            if let Some(meta) = queue_data.remove(&qid) {
                debug!(
                    queue_id = %qid,
                    request = %meta.uuid,
                    "request finished executing, removed from queue"
                );
            }
        } else {
            debug!(queue_id = %qid, status = %live.status, "request reported status change");
        }

        // Module-level compliance transition fires a status event carrying
        // the serialized module.
        let new_status = live.last_compliance_status;
        if new_status != previous_status {
            if let Some(new_status) = new_status {
                let mut payload = serde_json::to_value(&*live)
                    .ok()
                    .and_then(|v| match v {
                        Value::Object(map) => Some(map),
                        _ => None,
                    })
                    .unwrap_or_default();
                payload.insert("new_status".to_string(), Value::from(new_status.bits()));
                payload.insert(
                    "old_status".to_string(),
                    previous_status.map_or(Value::Null, |s| Value::from(s.bits())),
                );
                let event = AgentEvent::new("ComplianceModuleStatusEvent", "Compliance")
                    .with_payload(payload);
                drop(registry);
                drop(queue_data);
                self.router.dispatch(event).await;
            }
        }
    }

    /// Emit a device-status event when the max-over-modules status moved.
    pub async fn check_device_status_change(&self) {
        let new_status = self.device_status().await;
        let mut last = self.last_device_status.lock().await;
        let old_status = *last;
        *last = Some(new_status);
        drop(last);

        if old_status != Some(new_status) {
            let event = AgentEvent::new("ComplianceDeviceStatusEvent", "Compliance")
                .with_entry("new_status", new_status.bits())
                .with_entry(
                    "old_status",
                    old_status.map_or(Value::Null, |s| Value::from(s.bits())),
                )
                .with_entry("change_date", Utc::now().timestamp().to_string());
            self.router.dispatch(event).await;
        }
    }

    // MARK: Forwarded queues

    /// Drain log records forwarded by isolated workers.
    pub async fn process_logging_queue(&self) {
        for _ in 0..MAX_LOG_RECORDS_PER_PASS {
            let record = match tokio::time::timeout(
                self.config.queue_fetch_timeout(),
                self.log_forward_rx.recv(),
            )
            .await
            {
                Ok(Ok(record)) => record,
                Ok(Err(_)) | Err(_) => break,
            };
            match record.level {
                tracing::Level::ERROR => error!(target: "forwarded", source = %record.target, "{}", record.message),
                tracing::Level::WARN => warn!(target: "forwarded", source = %record.target, "{}", record.message),
                _ => info!(target: "forwarded", source = %record.target, "{}", record.message),
            }
        }
    }

    /// Drain proxied telemetry events into the router.
    pub async fn proxy_events(&self) {
        for pass in 0..MAX_EVENTS_PER_PASS {
            let event = match tokio::time::timeout(
                self.config.queue_fetch_timeout(),
                self.event_proxy_rx.recv(),
            )
            .await
            {
                Ok(Ok(event)) => event,
                Ok(Err(_)) | Err(_) => break,
            };
            debug!(event_type = %event.event_type, "received proxied event");
            self.router.dispatch(event).await;

            if pass + 1 == MAX_EVENTS_PER_PASS {
                warn!("processed maximum proxied events this pass ({MAX_EVENTS_PER_PASS}), deferring");
            }
        }
    }
}

/// Next free `Executor_N` name, one past the highest live index.
fn next_executor_name(executors: &[ExecutorHandle]) -> String {
    let highest = executors
        .iter()
        .filter_map(|e| e.name.strip_prefix("Executor_"))
        .filter_map(|n| n.parse::<u64>().ok())
        .max()
        .unwrap_or(0);
    format!("Executor_{}", highest + 1)
}

/// Flag one executor for shutdown, preferring idle workers, then any
/// worker not already stopping.
fn stop_one_executor(executors: &[ExecutorHandle]) {
    let pick = executors
        .iter()
        .find(|e| {
            let status = e.status();
            status.contains(ExecutorStatus::RUNNING)
                && !status.contains(ExecutorStatus::STOPPING)
                && !status.contains(ExecutorStatus::EXECUTING)
        })
        .or_else(|| {
            executors.iter().find(|e| {
                let status = e.status();
                status.contains(ExecutorStatus::RUNNING) && !status.contains(ExecutorStatus::STOPPING)
            })
        });

    match pick {
        Some(executor) => {
            debug!(executor = %executor.name, "stopping module executor");
            executor.stop();
        }
        None => debug!("cannot stop executors: none eligible"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::domain::errors::AgentResult;
    use crate::domain::models::{
        EvaluationResult, ExecutionStatus, ExecutionPrerequisites, RemediationResult, RouteMap,
    };
    use crate::domain::ports::network::StaticNetworkState;
    use crate::domain::ports::EventSink;

    struct NullSink;

    #[async_trait]
    impl EventSink for NullSink {
        async fn submit(&self, _event: &AgentEvent, _stream: &str) -> AgentResult<()> {
            Ok(())
        }
    }

    struct CompliantBehavior {
        identifier: String,
    }

    #[async_trait]
    impl crate::domain::ports::ModuleBehavior for CompliantBehavior {
        fn identifier(&self) -> &str {
            &self.identifier
        }

        async fn evaluate(
            &self,
            _module: &ComplianceModule,
            _trigger: Option<ExecutionTrigger>,
            _data: Option<&Value>,
        ) -> AgentResult<EvaluationResult> {
            Ok(EvaluationResult::new(
                ComplianceStatus::COMPLIANT,
                ExecutionStatus::SUCCESS,
            ))
        }

        async fn remediate(
            &self,
            _module: &ComplianceModule,
            _trigger: Option<ExecutionTrigger>,
            _data: Option<&Value>,
        ) -> AgentResult<RemediationResult> {
            Ok(RemediationResult::new(ExecutionStatus::SUCCESS))
        }
    }

    fn controller() -> Arc<ComplianceController> {
        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(Mutex::new(ModuleRegistry::new(None, None)));
        let qualifier = Arc::new(Qualifier::new(Arc::new(StaticNetworkState(
            ExecutionPrerequisites::ONLINE,
        ))));
        let router = Arc::new(EventRouter::new(
            Arc::new(NullSink),
            RouteMap::default(),
            dir.path().join("karl_queue.data"),
        ));
        Arc::new(ComplianceController::new(
            ComplianceConfig {
                queue_fetch_timeout_ms: 20,
                ..ComplianceConfig::default()
            },
            registry,
            qualifier,
            router,
        ))
    }

    fn definition(identifier: &str) -> ModuleDefinition {
        let mut module = ComplianceModule::new(identifier);
        module.triggers = ExecutionTrigger::SCHEDULED | ExecutionTrigger::MANUAL;
        module.evaluation_interval = Some(Duration::hours(4));
        ModuleDefinition::new(
            module,
            Arc::new(CompliantBehavior {
                identifier: identifier.to_string(),
            }),
        )
    }

    async fn queue_module(controller: &Arc<ComplianceController>, identifier: &str) -> Option<bool> {
        let registry = controller.registry();
        let mut registry = registry.lock().await;
        let behavior = registry.behavior(identifier).unwrap();
        let module = registry.get_mut(identifier).unwrap();
        controller
            .try_queue_request(
                module,
                behavior,
                Some(ExecutionTrigger::SCHEDULED),
                ExecutionAction::Evaluation,
                None,
            )
            .await
    }

    #[tokio::test]
    async fn test_requeue_threshold_makes_second_queue_noop() {
        let controller = controller();
        controller
            .load_modules(vec![definition("screen_lock")], false)
            .await;

        assert_eq!(queue_module(&controller, "screen_lock").await, Some(true));
        assert_eq!(controller.queued_request_count().await, 1);

        // Second attempt inside the threshold is a no-op.
        assert_eq!(queue_module(&controller, "screen_lock").await, None);
        assert_eq!(controller.queued_request_count().await, 1);
    }

    #[tokio::test]
    async fn test_ideal_count_scales_with_queue_depth() {
        let controller = controller();
        controller.should_run.store(true, Ordering::SeqCst);
        let names = ["a", "b", "c", "d"];
        controller
            .load_modules(names.iter().map(|n| definition(n)).collect(), false)
            .await;

        assert_eq!(controller.ideal_executor_count().await, 0);

        for name in names {
            queue_module(&controller, name).await;
        }
        // ceil(4/3) == 2 below the executor cap.
        assert_eq!(controller.ideal_executor_count().await, 2);
    }

    #[tokio::test]
    async fn test_ideal_count_zero_when_not_running() {
        let controller = controller();
        controller
            .load_modules(vec![definition("screen_lock")], false)
            .await;
        queue_module(&controller, "screen_lock").await;
        assert_eq!(controller.ideal_executor_count().await, 0);
    }

    #[tokio::test]
    async fn test_response_drain_merges_state_and_clears_queue() {
        let controller = controller();
        controller.should_run.store(true, Ordering::SeqCst);
        controller
            .load_modules(vec![definition("screen_lock")], false)
            .await;

        queue_module(&controller, "screen_lock").await;
        controller.manage_execution_threads().await;
        assert!(controller.executor_count().await >= 1);

        // Let the executor pick up the request and respond.
        let deadline = Utc::now() + Duration::seconds(10);
        loop {
            controller.process_execution_responses().await;
            let registry = controller.registry();
            let registry = registry.lock().await;
            let module = registry.get("screen_lock").unwrap();
            if module.status == ModuleStatus::Idle && module.last_evaluation_result.is_some() {
                break;
            }
            drop(registry);
            assert!(Utc::now() < deadline, "executor never responded");
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        assert_eq!(controller.queued_request_count().await, 0);
        assert_eq!(
            controller.device_status().await,
            ComplianceStatus::COMPLIANT
        );

        controller.stop().await;
    }

    #[tokio::test]
    async fn test_device_status_is_max_over_modules() {
        let controller = controller();
        controller
            .load_modules(vec![definition("good"), definition("bad")], false)
            .await;

        {
            let registry = controller.registry();
            let mut registry = registry.lock().await;
            let good = registry.get_mut("good").unwrap();
            good.last_evaluation_result = Some(EvaluationResult::new(
                ComplianceStatus::COMPLIANT,
                ExecutionStatus::SUCCESS,
            ));
            let bad = registry.get_mut("bad").unwrap();
            let t0 = Utc::now();
            bad.last_evaluation_result = Some(EvaluationResult {
                compliance_status: ComplianceStatus::NONCOMPLIANT,
                execution_status: ExecutionStatus::SUCCESS,
                end_date: Some(t0),
                ..EvaluationResult::default()
            });
            bad.first_failure_date = Some(t0);
        }

        let status = controller.device_status().await;
        assert!(status.contains(ComplianceStatus::NONCOMPLIANT));
        assert!(status.contains(ComplianceStatus::INGRACETIME));
    }
}
