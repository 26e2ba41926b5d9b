//! Write-Ahead Intent Log
//!
//! Every risky external action is recorded before it is attempted:
//!
//! ```text
//! log_intent -> pending
//! mark_executing -> executing      (external call goes out after this)
//! mark_completed | mark_failed     (terminal, with a result payload)
//! ```
//!
//! An intent still `executing` at startup has an unknown outcome. It is
//! reported, never retried, and only leaves `executing` through an explicit
//! `mark_intent_reconciled`.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::domain::{IntentStatus, IntentType, NewIntent, ReconcileAttempt, TradeIntent};
use crate::error::{require_reason, FailsafeError, Result};
use crate::persistence::store::IntentStore;

/// Configuration for the intent log
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IntentLogConfig {
    /// Terminal intents older than this are pruned (default: 30 days)
    pub retention_days: u32,
    /// Prune ticker period; 0 disables the ticker (default: 1h)
    pub prune_interval_ms: u64,
    /// Trip the breaker when startup finds executing intents
    pub trip_on_incomplete: bool,
}

impl Default for IntentLogConfig {
    fn default() -> Self {
        Self {
            retention_days: 30,
            prune_interval_ms: 3_600_000,
            trip_on_incomplete: false,
        }
    }
}

impl IntentLogConfig {
    pub fn validate(&self) -> Result<()> {
        if self.retention_days == 0 {
            return Err(FailsafeError::InvalidConfig(
                "intent_log.retention_days must be > 0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn retention(&self) -> ChronoDuration {
        ChronoDuration::days(self.retention_days as i64)
    }
}

/// Result of the startup scan for `executing` intents
#[derive(Debug, Clone, Serialize)]
pub struct StartupCheck {
    pub clean: bool,
    pub incomplete_count: usize,
    pub incomplete_intents: Vec<TradeIntent>,
    pub timestamp: DateTime<Utc>,
    pub duration_ms: u64,
}

/// Counters exposed through `get_state()`
#[derive(Debug, Clone, Default, Serialize)]
pub struct IntentLogStats {
    pub logged: u64,
    pub completed: u64,
    pub failed: u64,
    pub reconciled: u64,
    pub pruned: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct IntentLogSnapshot {
    pub initialized: bool,
    pub retention_days: u32,
    pub pruner_running: bool,
    pub stats: IntentLogStats,
}

pub struct IntentLog {
    config: IntentLogConfig,
    store: Arc<dyn IntentStore>,
    clock: Arc<dyn Clock>,
    initialized: AtomicBool,
    logged: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    reconciled: AtomicU64,
    pruned: AtomicU64,
    prune_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl IntentLog {
    pub fn new(config: IntentLogConfig, store: Arc<dyn IntentStore>) -> Self {
        Self {
            config,
            store,
            clock: Arc::new(SystemClock),
            initialized: AtomicBool::new(false),
            logged: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            reconciled: AtomicU64::new(0),
            pruned: AtomicU64::new(0),
            prune_task: std::sync::Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &IntentLogConfig {
        &self.config
    }

    pub fn init(&self) -> Result<()> {
        self.config.validate()?;
        self.initialized.store(true, Ordering::SeqCst);
        info!(retention_days = self.config.retention_days, "Intent log initialized");
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(FailsafeError::NotInitialized {
                component: "intent_log",
            })
        }
    }

    /// Record an intent before the action is attempted. Returns its id.
    pub async fn log_intent(
        &self,
        intent_type: IntentType,
        window_id: &str,
        payload: serde_json::Value,
    ) -> Result<i64> {
        self.ensure_initialized()?;
        let intent = NewIntent {
            intent_type,
            window_id: window_id.to_string(),
            payload,
            created_at: self.clock.now(),
        };
        let id = self.store.insert_intent(&intent).await?;
        self.logged.fetch_add(1, Ordering::Relaxed);
        debug!(id, %intent_type, window_id, "Intent logged");
        Ok(id)
    }

    pub async fn mark_executing(&self, id: i64) -> Result<()> {
        self.transition(id, IntentStatus::Pending, IntentStatus::Executing, None)
            .await
    }

    pub async fn mark_completed(&self, id: i64, result: serde_json::Value) -> Result<()> {
        self.transition(id, IntentStatus::Executing, IntentStatus::Completed, Some(result))
            .await?;
        self.completed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    pub async fn mark_failed(&self, id: i64, result: serde_json::Value) -> Result<()> {
        self.transition(id, IntentStatus::Executing, IntentStatus::Failed, Some(result))
            .await?;
        self.failed.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn transition(
        &self,
        id: i64,
        from: IntentStatus,
        to: IntentStatus,
        result: Option<serde_json::Value>,
    ) -> Result<()> {
        self.ensure_initialized()?;
        let completed_at = to.is_terminal().then(|| self.clock.now());
        let affected = self
            .store
            .transition_intent(id, from, to, completed_at, result.as_ref())
            .await?;
        if affected > 0 {
            debug!(id, %from, %to, "Intent transitioned");
            return Ok(());
        }

        match self.store.get_intent(id).await? {
            None => Err(FailsafeError::IntentNotFound { id }),
            Some(intent) => Err(FailsafeError::InvalidIntentStatus {
                id,
                expected: from.to_string(),
                actual: intent.status.to_string(),
            }),
        }
    }

    /// Run `action` under the write-ahead protocol. The intent ends
    /// `completed` with the action's output or `failed` with its error.
    pub async fn execute<F, T>(
        &self,
        intent_type: IntentType,
        window_id: &str,
        payload: serde_json::Value,
        action: F,
    ) -> Result<T>
    where
        F: Future<Output = Result<T>>,
        T: Serialize,
    {
        let id = self.log_intent(intent_type, window_id, payload).await?;
        self.mark_executing(id).await?;

        match action.await {
            Ok(value) => {
                let result = serde_json::to_value(&value)?;
                self.mark_completed(id, result).await?;
                Ok(value)
            }
            Err(e) => {
                let result = serde_json::json!({ "error": e.to_string() });
                if let Err(mark_err) = self.mark_failed(id, result).await {
                    error!(id, "Could not mark intent failed: {}", mark_err);
                }
                Err(e)
            }
        }
    }

    /// Find intents left `executing` by a previous run. Never retries them.
    pub async fn check_startup_state(&self) -> Result<StartupCheck> {
        self.ensure_initialized()?;
        let started = Instant::now();
        let incomplete = self.store.intents_with_status(IntentStatus::Executing).await?;

        for intent in &incomplete {
            warn!(
                id = intent.id,
                intent_type = %intent.intent_type,
                window_id = %intent.window_id,
                created_at = %intent.created_at,
                payload = %intent.payload,
                "Incomplete intent from previous run: outcome unknown, manual reconciliation required"
            );
        }

        let check = StartupCheck {
            clean: incomplete.is_empty(),
            incomplete_count: incomplete.len(),
            incomplete_intents: incomplete,
            timestamp: self.clock.now(),
            duration_ms: started.elapsed().as_millis() as u64,
        };
        if check.clean {
            info!("Intent log startup check: clean");
        } else {
            error!(
                incomplete = check.incomplete_count,
                "Intent log startup check found incomplete intents"
            );
        }
        Ok(check)
    }

    /// Close out an `executing` intent after manual verification.
    pub async fn mark_intent_reconciled(&self, id: i64, resolution: &str) -> Result<()> {
        self.ensure_initialized()?;
        require_reason("resolution", resolution)?;

        let now = self.clock.now();
        let result = serde_json::json!({
            "resolution": resolution,
            "reconciled": true,
            "reconciled_at": now,
        });
        match self.store.reconcile_intent(id, &result, now).await? {
            ReconcileAttempt::Reconciled => {
                self.reconciled.fetch_add(1, Ordering::Relaxed);
                info!(id, resolution, "Intent reconciled");
                Ok(())
            }
            ReconcileAttempt::NotFound => Err(FailsafeError::IntentNotFound { id }),
            ReconcileAttempt::WrongStatus(actual) => Err(FailsafeError::InvalidIntentStatus {
                id,
                expected: IntentStatus::Executing.to_string(),
                actual: actual.to_string(),
            }),
        }
    }

    /// Delete terminal intents older than `retention`.
    pub async fn prune(&self, retention: ChronoDuration) -> Result<u64> {
        self.ensure_initialized()?;
        let cutoff = self.clock.now() - retention;
        let deleted = self.store.prune_intents(cutoff).await?;
        self.pruned.fetch_add(deleted, Ordering::Relaxed);
        if deleted > 0 {
            info!(deleted, %cutoff, "Pruned old intents");
        }
        Ok(deleted)
    }

    pub fn start_pruner(self: &Arc<Self>) {
        if self.config.prune_interval_ms == 0 {
            return;
        }
        let mut slot = self.prune_task.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.prune_interval_ms);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(log) = weak.upgrade() else { break };
                if let Err(e) = log.prune(log.config.retention()).await {
                    warn!("Intent prune failed: {}", e);
                }
            }
        }));
    }

    pub fn get_state(&self) -> IntentLogSnapshot {
        let pruner_running = self
            .prune_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|h| !h.is_finished())
            .unwrap_or(false);
        IntentLogSnapshot {
            initialized: self.initialized.load(Ordering::SeqCst),
            retention_days: self.config.retention_days,
            pruner_running,
            stats: IntentLogStats {
                logged: self.logged.load(Ordering::Relaxed),
                completed: self.completed.load(Ordering::Relaxed),
                failed: self.failed.load(Ordering::Relaxed),
                reconciled: self.reconciled.load(Ordering::Relaxed),
                pruned: self.pruned.load(Ordering::Relaxed),
            },
        }
    }

    pub async fn shutdown(&self) {
        let handle = self
            .prune_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}
