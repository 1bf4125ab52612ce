//! Configuration pull host.
//!
//! Owns one recurring timer per registered configuration module. Each module
//! fetches its typed payload from the registrar and applies it; throttling
//! defers the next tick without counting as a failure, and failures ride the
//! timer's exponential backoff.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::services::timer::{RecurringTimer, TimerConfig, TimerError};

/// Floor for computed intervals; a past-due entry runs this soon, not
/// immediately in a tight loop.
pub const MIN_INTERVAL: Duration = Duration::from_secs(60);

const DEFAULT_RETRY: Duration = Duration::from_secs(60);
const DEFAULT_MAX_RETRY: Duration = Duration::from_secs(3600);

/// Failures surfaced by a configuration module run.
#[derive(Debug, Error)]
pub enum ConfigModuleError {
    /// Registrar asked us to back off.
    #[error("configuration fetch throttled (until {until:?})")]
    Throttled { until: Option<DateTime<Utc>> },

    #[error("configuration fetch failed: {0}")]
    Fetch(String),

    #[error("configuration apply failed: {0}")]
    Apply(String),
}

/// One recurring configuration concern (compliance settings, installer
/// targets, signed files, sink tokens).
#[async_trait]
pub trait ConfigModule: Send + Sync {
    fn identifier(&self) -> &str;

    /// Whether any entry is already past due at registration time.
    async fn should_run_immediately(&self) -> bool;

    /// Time until the earliest entry is due, clamped to [`MIN_INTERVAL`].
    async fn current_interval(&self) -> Duration;

    /// Fetch and apply configuration once.
    async fn run(&self) -> Result<(), ConfigModuleError>;

    /// Skew band applied to this module's timer.
    fn execution_skew(&self) -> Duration {
        Duration::from_secs(0)
    }
}

/// Hosts configuration modules and their timers.
pub struct ConfigurationController {
    modules: Mutex<HashMap<String, Arc<dyn ConfigModule>>>,
    timers: Mutex<HashMap<String, Arc<RecurringTimer>>>,
    running: AtomicBool,
}

impl Default for ConfigurationController {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigurationController {
    pub fn new() -> Self {
        Self {
            modules: Mutex::new(HashMap::new()),
            timers: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        }
    }

    pub async fn register_module(&self, module: Arc<dyn ConfigModule>) {
        let identifier = module.identifier().to_string();
        debug!(module = %identifier, "registering configuration module");
        let replaced = self
            .modules
            .lock()
            .await
            .insert(identifier.clone(), module)
            .is_some();
        if replaced {
            warn!(module = %identifier, "replaced existing configuration module");
        }
        if self.running.load(Ordering::SeqCst) {
            self.start_timer(&identifier).await;
        }
    }

    pub async fn deregister_module(&self, identifier: &str) {
        self.modules.lock().await.remove(identifier);
        if let Some(timer) = self.timers.lock().await.remove(identifier) {
            timer.cancel();
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start a timer per registered module. Modules with past-due entries
    /// fire right away.
    pub async fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("starting configuration controller");
        let identifiers: Vec<String> = self.modules.lock().await.keys().cloned().collect();
        for identifier in identifiers {
            self.start_timer(&identifier).await;
        }
    }

    /// Cancel every timer. Modules stay registered for a later restart.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("stopping configuration controller");
        let mut timers = self.timers.lock().await;
        for (_, timer) in timers.drain() {
            timer.cancel();
        }
    }

    /// Stop and start; used when registration completes and fresh identity
    /// material should be picked up.
    pub async fn restart(&self) {
        self.stop().await;
        self.start().await;
    }

    /// Force one module to run on its next tick boundary.
    pub async fn run_module_now(&self, identifier: &str) {
        if let Some(timer) = self.timers.lock().await.get(identifier) {
            timer.reset(Duration::ZERO).await;
        }
    }

    async fn start_timer(&self, identifier: &str) {
        let Some(module) = self.modules.lock().await.get(identifier).cloned() else {
            return;
        };

        let frequency = module.current_interval().await;
        let run_now = module.should_run_immediately().await;

        // The handler adjusts its own timer's frequency after each success;
        // the slot breaks the construction cycle.
        let timer_slot: Arc<OnceLock<Arc<RecurringTimer>>> = Arc::new(OnceLock::new());
        let handler_module = Arc::clone(&module);
        let handler_slot = Arc::clone(&timer_slot);

        let timer = Arc::new(RecurringTimer::spawn(
            format!("config:{identifier}"),
            TimerConfig::new(frequency)
                .with_skew(module.execution_skew())
                .with_retry(DEFAULT_RETRY, DEFAULT_MAX_RETRY),
            move || {
                let module = Arc::clone(&handler_module);
                let slot = Arc::clone(&handler_slot);
                async move {
                    let outcome = module.run().await;
                    match outcome {
                        Ok(()) => {
                            if let Some(timer) = slot.get() {
                                timer.set_frequency(module.current_interval().await).await;
                            }
                            Ok(())
                        }
                        Err(ConfigModuleError::Throttled { until }) => {
                            // An already-elapsed throttle window retries now.
                            let delay = until
                                .map(|u| (u - Utc::now()).to_std().unwrap_or(Duration::ZERO))
                                .unwrap_or(MIN_INTERVAL);
                            Err(TimerError::Deferred(delay))
                        }
                        Err(err) => Err(TimerError::Failed(anyhow::anyhow!(err))),
                    }
                }
            },
        ));
        let _ = timer_slot.set(Arc::clone(&timer));

        if run_now {
            timer.reset(Duration::ZERO).await;
        }

        if let Some(previous) = self
            .timers
            .lock()
            .await
            .insert(identifier.to_string(), timer)
        {
            previous.cancel();
        }
    }
}
