//! Executor workers.
//!
//! Each executor is a spawned task that polls the execution queue with a
//! short timeout, runs evaluate or remediate on the request's module
//! snapshot, and posts progress and terminal responses to the response
//! queue. Idle executors self-terminate after a TTL; module faults never
//! take an executor down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::models::{
    ExecutionAction, ExecutionRequest, ExecutionResponse, ExecutionStatus, ExecutorStatus,
    ModuleStatus,
};

/// Tuning for one executor worker.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Idle period after which the worker exits.
    pub idle_ttl: chrono::Duration,
    /// Queue poll timeout.
    pub fetch_timeout: Duration,
    /// Pause after an empty poll.
    pub loop_wait: Duration,
    /// Optional hard cap on a single evaluate/remediate pass.
    pub execution_timeout: Option<Duration>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            idle_ttl: chrono::Duration::minutes(1),
            fetch_timeout: Duration::from_millis(500),
            loop_wait: Duration::from_millis(500),
            execution_timeout: None,
        }
    }
}

/// Controller-side handle to a spawned executor.
pub struct ExecutorHandle {
    pub name: String,
    should_run: Arc<AtomicBool>,
    is_executing: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

impl ExecutorHandle {
    pub fn is_alive(&self) -> bool {
        !self.handle.is_finished()
    }

    pub fn is_executing(&self) -> bool {
        self.is_executing.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> ExecutorStatus {
        let mut status = ExecutorStatus::empty();
        if self.is_alive() {
            status |= ExecutorStatus::RUNNING;
            if !self.should_run.load(Ordering::SeqCst) {
                status |= ExecutorStatus::STOPPING;
            }
        }
        if self.is_executing() {
            status |= ExecutorStatus::EXECUTING;
        }
        status
    }

    /// Ask the worker to stop after its current iteration.
    pub fn stop(&self) {
        self.should_run.store(false, Ordering::SeqCst);
    }
}

/// Executor worker: owns one polling loop over the shared execution queue.
pub struct Executor;

impl Executor {
    /// Spawn a named worker against the shared queues.
    pub fn spawn(
        name: impl Into<String>,
        execution_queue: async_channel::Receiver<ExecutionRequest>,
        response_queue: async_channel::Sender<ExecutionResponse>,
        config: ExecutorConfig,
    ) -> ExecutorHandle {
        let name = name.into();
        let should_run = Arc::new(AtomicBool::new(true));
        let is_executing = Arc::new(AtomicBool::new(false));

        let task_name = name.clone();
        let task_should_run = Arc::clone(&should_run);
        let task_is_executing = Arc::clone(&is_executing);

        let handle = tokio::spawn(async move {
            run_loop(
                &task_name,
                &execution_queue,
                &response_queue,
                &config,
                &task_should_run,
                &task_is_executing,
            )
            .await;
        });

        ExecutorHandle {
            name,
            should_run,
            is_executing,
            handle,
        }
    }
}

async fn run_loop(
    name: &str,
    execution_queue: &async_channel::Receiver<ExecutionRequest>,
    response_queue: &async_channel::Sender<ExecutionResponse>,
    config: &ExecutorConfig,
    should_run: &AtomicBool,
    is_executing: &AtomicBool,
) {
    debug!(executor = name, "executor running");
    let mut last_activity = Utc::now();

    while should_run.load(Ordering::SeqCst) {
        if Utc::now() > last_activity + config.idle_ttl {
            debug!(executor = name, "executor idle TTL expired, terminating");
            break;
        }

        let request = match tokio::time::timeout(config.fetch_timeout, execution_queue.recv()).await
        {
            Ok(Ok(request)) => request,
            Ok(Err(_closed)) => {
                debug!(executor = name, "execution queue closed, terminating");
                break;
            }
            Err(_elapsed) => {
                tokio::time::sleep(config.loop_wait).await;
                continue;
            }
        };

        last_activity = Utc::now();
        is_executing.store(true, Ordering::SeqCst);

        execute_request(name, request, response_queue, config.execution_timeout).await;

        is_executing.store(false, Ordering::SeqCst);
        last_activity = Utc::now();
    }

    debug!(executor = name, "executor finished");
}

async fn execute_request(
    name: &str,
    request: ExecutionRequest,
    response_queue: &async_channel::Sender<ExecutionResponse>,
    execution_timeout: Option<Duration>,
) {
    let ExecutionRequest {
        module: mut snapshot,
        behavior,
        trigger,
        action,
        data,
        ..
    } = request.clone();

    info!(
        executor = name,
        module = %snapshot.identifier,
        action = %action,
        "executing compliance request"
    );

    snapshot.status = match action {
        ExecutionAction::Evaluation => ModuleStatus::Evaluating,
        ExecutionAction::Remediation => ModuleStatus::Remediating,
    };

    // First response: progress report. Best-effort; the controller treats it
    // as a transient status update.
    let progress = ExecutionResponse::new(&request, ExecutionStatus::NONE, snapshot.clone());
    if let Err(err) = response_queue.send(progress).await {
        error!(executor = name, error = %err, "failed to submit progress response");
    }

    // Serialize per-module when the module carries an execution lock.
    let lock = snapshot.execution_lock.clone();
    let _guard = match &lock {
        Some(lock) => Some(lock.lock().await),
        None => None,
    };

    let data_ref = data.as_ref();
    let execution_status = match action {
        ExecutionAction::Evaluation => {
            let fut = snapshot.evaluate(behavior.as_ref(), trigger, data_ref);
            match with_optional_timeout(execution_timeout, fut).await {
                Some(result) => result.execution_status,
                None => {
                    warn!(
                        executor = name,
                        module = %snapshot.identifier,
                        "evaluation exceeded execution timeout"
                    );
                    ExecutionStatus::FATAL
                }
            }
        }
        ExecutionAction::Remediation => {
            let fut = snapshot.remediate(behavior.as_ref(), trigger, data_ref);
            match with_optional_timeout(execution_timeout, fut).await {
                Some(result) => result.execution_status,
                None => {
                    warn!(
                        executor = name,
                        module = %snapshot.identifier,
                        "remediation exceeded execution timeout"
                    );
                    ExecutionStatus::FATAL
                }
            }
        }
    };
    drop(_guard);

    snapshot.status = ModuleStatus::Idle;
    snapshot.last_execution = Some(Utc::now());
    if let Err(err) = snapshot.save() {
        error!(
            executor = name,
            module = %snapshot.identifier,
            error = %err,
            "failed post-execution state save"
        );
    }

    info!(
        executor = name,
        module = %snapshot.identifier,
        status = ?execution_status,
        "finished executing"
    );

    let terminal = ExecutionResponse::new(&request, execution_status, snapshot);
    if let Err(err) = response_queue.send(terminal).await {
        error!(executor = name, error = %err, "failed to submit terminal response");
    }
}

async fn with_optional_timeout<F, T>(timeout: Option<Duration>, fut: F) -> Option<T>
where
    F: std::future::Future<Output = T>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, fut).await.ok(),
        None => Some(fut.await),
    }
}
