//! Persistent Circuit Breaker
//!
//! Global trip state lives in a single store row so every process sees the
//! same halt. The breaker only ever errs towards OPEN:
//! - `is_open()` treats a failed, slow or empty read as open
//! - `trip()` flips an in-memory fallback flag when the store write fails
//! - `reset()` refuses while orders are still pending/open
//!
//! While open, an escalation ticker walks through
//! `monitoring -> alert -> cancel_orders -> shutdown` based purely on the
//! time since the trip, so a restarted process resumes at the right stage.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::coordination::shutdown::Orchestrator;
use crate::domain::{
    AuditAction, AuditEntry, BreakerRecord, CircuitState, EscalationStage, EscalationThresholds,
    TripReason,
};
use crate::error::{require_reason, FailsafeError, Result};
use crate::exchange::OrderManager;
use crate::persistence::store::BreakerStore;

/// Configuration for the persistent circuit breaker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Escalation ticker period while OPEN (default: 30s)
    pub escalation_interval_ms: u64,
    /// Upper bound on the `is_open()` store read (default: 5s)
    pub query_timeout_ms: u64,
    /// Time open before the alert stage (default: 5 min)
    pub alert_after_ms: u64,
    /// Time open before cancelling all orders (default: 15 min)
    pub cancel_orders_after_ms: u64,
    /// Time open before requesting process shutdown (default: 30 min)
    pub shutdown_after_ms: u64,
    /// Keep running past the shutdown stage
    pub allow_extended_halt: bool,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            escalation_interval_ms: 30_000,
            query_timeout_ms: 5_000,
            alert_after_ms: 5 * 60_000,
            cancel_orders_after_ms: 15 * 60_000,
            shutdown_after_ms: 30 * 60_000,
            allow_extended_halt: false,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn validate(&self) -> Result<()> {
        if self.escalation_interval_ms == 0 {
            return Err(FailsafeError::InvalidConfig(
                "circuit_breaker.escalation_interval_ms must be > 0".to_string(),
            ));
        }
        if self.query_timeout_ms == 0 {
            return Err(FailsafeError::InvalidConfig(
                "circuit_breaker.query_timeout_ms must be > 0".to_string(),
            ));
        }
        if !(self.alert_after_ms < self.cancel_orders_after_ms
            && self.cancel_orders_after_ms < self.shutdown_after_ms)
        {
            return Err(FailsafeError::InvalidConfig(format!(
                "escalation thresholds must increase: alert {}ms < cancel {}ms < shutdown {}ms",
                self.alert_after_ms, self.cancel_orders_after_ms, self.shutdown_after_ms
            )));
        }
        Ok(())
    }

    pub fn thresholds(&self) -> EscalationThresholds {
        EscalationThresholds {
            alert_after: ChronoDuration::milliseconds(self.alert_after_ms as i64),
            cancel_orders_after: ChronoDuration::milliseconds(self.cancel_orders_after_ms as i64),
            shutdown_after: ChronoDuration::milliseconds(self.shutdown_after_ms as i64),
        }
    }
}

/// Result of a `trip()` call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TripOutcome {
    /// This call performed the CLOSED -> OPEN transition
    Tripped,
    /// The breaker was already open
    AlreadyOpen,
    /// The store could not be written; open in memory only
    FallbackOpen,
}

/// Point-in-time view for operators and health endpoints
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub trip_reason: Option<TripReason>,
    pub trip_context: Option<serde_json::Value>,
    pub tripped_at: Option<DateTime<Utc>>,
    pub escalation_stage: Option<EscalationStage>,
    pub fallback_open: bool,
    pub total_trips: u64,
}

#[derive(Debug, Default)]
struct BreakerCache {
    state: Option<CircuitState>,
    trip_reason: Option<TripReason>,
    trip_context: Option<serde_json::Value>,
    tripped_at: Option<DateTime<Utc>>,
    last_stage: Option<EscalationStage>,
    orders_cancelled: bool,
    shutdown_handled: bool,
}

impl BreakerCache {
    fn is_open(&self) -> bool {
        self.state == Some(CircuitState::Open)
    }

    fn mark_open(&mut self, reason: TripReason, context: serde_json::Value, at: DateTime<Utc>) {
        self.state = Some(CircuitState::Open);
        self.trip_reason = Some(reason);
        self.trip_context = Some(context);
        self.tripped_at = Some(at);
        self.clear_escalation();
    }

    fn mark_closed(&mut self) {
        self.state = Some(CircuitState::Closed);
        self.trip_reason = None;
        self.trip_context = None;
        self.tripped_at = None;
        self.clear_escalation();
    }

    fn clear_escalation(&mut self) {
        self.last_stage = None;
        self.orders_cancelled = false;
        self.shutdown_handled = false;
    }
}

/// Store-backed circuit breaker
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    store: Arc<dyn BreakerStore>,
    clock: Arc<dyn Clock>,
    order_manager: Option<Arc<dyn OrderManager>>,
    orchestrator: Option<Arc<dyn Orchestrator>>,
    initialized: AtomicBool,
    fallback_open: AtomicBool,
    cache: RwLock<BreakerCache>,
    escalation_task: std::sync::Mutex<Option<JoinHandle<()>>>,
    total_trips: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, store: Arc<dyn BreakerStore>) -> Self {
        Self {
            config,
            store,
            clock: Arc::new(SystemClock),
            order_manager: None,
            orchestrator: None,
            initialized: AtomicBool::new(false),
            fallback_open: AtomicBool::new(false),
            cache: RwLock::new(BreakerCache::default()),
            escalation_task: std::sync::Mutex::new(None),
            total_trips: AtomicU64::new(0),
        }
    }

    /// Invoked at the `cancel_orders` stage
    pub fn with_order_manager(mut self, order_manager: Arc<dyn OrderManager>) -> Self {
        self.order_manager = Some(order_manager);
        self
    }

    /// Invoked at the `shutdown` stage
    pub fn with_orchestrator(mut self, orchestrator: Arc<dyn Orchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Load persisted state. A failed read is logged and treated as CLOSED;
    /// later `is_open()` calls are what fail closed.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        self.config.validate()?;

        match self.store.load_breaker().await {
            Ok(Some(record)) => {
                self.apply_record(&record).await;
                if record.state == CircuitState::Open {
                    error!(
                        reason = ?record.trip_reason,
                        tripped_at = ?record.tripped_at,
                        context = ?record.trip_context,
                        "Circuit breaker is OPEN from a previous session"
                    );
                } else {
                    info!("Circuit breaker initialized: CLOSED");
                }
            }
            Ok(None) => {
                warn!("Circuit breaker row missing; assuming CLOSED (unverified)");
                self.cache.write().await.state = Some(CircuitState::Closed);
            }
            Err(e) => {
                warn!(
                    "Could not read circuit breaker state ({}); assuming CLOSED (unverified)",
                    e
                );
                self.cache.write().await.state = Some(CircuitState::Closed);
            }
        }

        self.initialized.store(true, Ordering::SeqCst);
        if self.cache.read().await.is_open() {
            self.ensure_escalation();
        }
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(FailsafeError::NotInitialized {
                component: "circuit_breaker",
            })
        }
    }

    /// Whether trading must stop. Any failure to confirm CLOSED reads as open.
    pub async fn is_open(self: &Arc<Self>) -> bool {
        if !self.initialized.load(Ordering::SeqCst) {
            warn!("is_open() called before init(); reporting OPEN");
            return true;
        }
        if self.fallback_open.load(Ordering::SeqCst) {
            return true;
        }

        let timeout = Duration::from_millis(self.config.query_timeout_ms);
        match tokio::time::timeout(timeout, self.store.load_breaker()).await {
            Ok(Ok(Some(record))) => {
                self.apply_record(&record).await;
                let open = record.state == CircuitState::Open;
                if open {
                    self.ensure_escalation();
                }
                open
            }
            Ok(Ok(None)) => {
                error!("Circuit breaker row missing; failing closed");
                true
            }
            Ok(Err(e)) => {
                error!("Circuit breaker read failed ({}); failing closed", e);
                true
            }
            Err(_) => {
                error!(
                    "Circuit breaker read exceeded {}ms; failing closed",
                    self.config.query_timeout_ms
                );
                true
            }
        }
    }

    /// Halt trading. At most one caller across all processes observes
    /// `Tripped` for a given CLOSED -> OPEN transition.
    pub async fn trip(
        self: &Arc<Self>,
        reason: TripReason,
        context: serde_json::Value,
    ) -> Result<TripOutcome> {
        if let Err(e) = self.ensure_initialized() {
            self.fallback_open.store(true, Ordering::SeqCst);
            error!(%reason, ?context, "trip() before init(); breaker held OPEN in memory");
            return Err(e);
        }

        if self.fallback_open.load(Ordering::SeqCst) {
            warn!(%reason, "Circuit breaker already OPEN (fallback); trip ignored");
            return Ok(TripOutcome::AlreadyOpen);
        }
        // The cached state may predate a reset by another process; only the
        // conditional update decides.
        let now = self.clock.now();
        match self.store.try_trip(reason, &context, now).await {
            Ok(affected) if affected > 0 => {
                self.cache.write().await.mark_open(reason, context.clone(), now);
                self.total_trips.fetch_add(1, Ordering::SeqCst);
                error!(%reason, ?context, "CIRCUIT BREAKER TRIPPED");

                let entry = AuditEntry {
                    id: None,
                    action: AuditAction::Trip,
                    reason: reason.to_string(),
                    context: Some(context),
                    operator_id: None,
                    created_at: now,
                };
                if let Err(e) = self.store.append_audit(&entry).await {
                    error!("Failed to append TRIP audit entry: {}", e);
                }

                self.ensure_escalation();
                Ok(TripOutcome::Tripped)
            }
            Ok(_) => {
                // Lost the race, or the row is gone. Confirm it is really open.
                match self.store.load_breaker().await {
                    Ok(Some(record)) if record.state == CircuitState::Open => {
                        self.apply_record(&record).await;
                        warn!(
                            %reason,
                            existing = ?record.trip_reason,
                            "Circuit breaker already OPEN in store; trip ignored"
                        );
                        self.ensure_escalation();
                        Ok(TripOutcome::AlreadyOpen)
                    }
                    other => {
                        if let Err(e) = other {
                            error!("Could not confirm breaker state after trip: {}", e);
                        }
                        self.enter_fallback(reason, context, now).await;
                        Ok(TripOutcome::FallbackOpen)
                    }
                }
            }
            Err(e) => {
                error!("Circuit breaker store write failed: {}", e);
                self.enter_fallback(reason, context, now).await;
                Ok(TripOutcome::FallbackOpen)
            }
        }
    }

    async fn enter_fallback(
        self: &Arc<Self>,
        reason: TripReason,
        context: serde_json::Value,
        at: DateTime<Utc>,
    ) {
        self.fallback_open.store(true, Ordering::SeqCst);
        self.cache.write().await.mark_open(reason, context.clone(), at);
        self.total_trips.fetch_add(1, Ordering::SeqCst);
        error!(
            %reason,
            ?context,
            "CIRCUIT BREAKER OPEN (in-memory fallback, not persisted)"
        );
        self.ensure_escalation();
    }

    /// Operator reset. Refused while any order is still pending/open.
    pub async fn reset(self: &Arc<Self>, operator_id: &str, reason: &str) -> Result<()> {
        self.ensure_initialized()?;
        require_reason("operator_id", operator_id)?;

        match self.store.count_active_orders().await {
            Ok(active) if active > 0 => {
                warn!(
                    operator = operator_id,
                    active_orders = active,
                    "Circuit breaker reset refused: active orders exist"
                );
                return Err(FailsafeError::ResetBlocked {
                    active_orders: active,
                });
            }
            Ok(_) => {}
            Err(e) => {
                warn!(
                    "Active-order check failed ({}); proceeding with reset",
                    e
                );
            }
        }

        let previous = {
            let cache = self.cache.read().await;
            serde_json::json!({
                "previous_reason": cache.trip_reason,
                "previous_tripped_at": cache.tripped_at,
                "fallback_open": self.fallback_open.load(Ordering::SeqCst),
            })
        };

        let now = self.clock.now();
        self.store.reset_breaker(now).await?;

        let entry = AuditEntry {
            id: None,
            action: AuditAction::Reset,
            reason: reason.to_string(),
            context: Some(previous),
            operator_id: Some(operator_id.to_string()),
            created_at: now,
        };
        if let Err(e) = self.store.append_audit(&entry).await {
            error!("Failed to append RESET audit entry: {}", e);
        }

        self.fallback_open.store(false, Ordering::SeqCst);
        self.cache.write().await.mark_closed();
        self.stop_escalation().await;

        info!(operator = operator_id, reason, "Circuit breaker RESET - trading may resume");
        Ok(())
    }

    /// Stage at `now`, or `None` while CLOSED or when the trip time is unknown.
    pub async fn escalation_stage_at(&self, now: DateTime<Utc>) -> Option<EscalationStage> {
        let cache = self.cache.read().await;
        if !cache.is_open() && !self.fallback_open.load(Ordering::SeqCst) {
            return None;
        }
        cache
            .tripped_at
            .map(|t| EscalationStage::for_elapsed(now - t, &self.config.thresholds()))
    }

    pub async fn escalation_stage(&self) -> Option<EscalationStage> {
        self.escalation_stage_at(self.clock.now()).await
    }

    pub async fn get_state(&self) -> BreakerSnapshot {
        let stage = self.escalation_stage().await;
        let cache = self.cache.read().await;
        let fallback_open = self.fallback_open.load(Ordering::SeqCst);
        BreakerSnapshot {
            state: if fallback_open {
                CircuitState::Open
            } else {
                cache.state.unwrap_or(CircuitState::Closed)
            },
            trip_reason: cache.trip_reason,
            trip_context: cache.trip_context.clone(),
            tripped_at: cache.tripped_at,
            escalation_stage: stage,
            fallback_open,
            total_trips: self.total_trips.load(Ordering::SeqCst),
        }
    }

    pub fn is_fallback_open(&self) -> bool {
        self.fallback_open.load(Ordering::SeqCst)
    }

    /// Most recent audit entries, newest first
    pub async fn audit_log(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        self.store.recent_audit(limit).await
    }

    /// Cancel the escalation ticker.
    pub async fn shutdown(&self) {
        self.stop_escalation().await;
        debug!("Circuit breaker shut down");
    }

    async fn apply_record(&self, record: &BreakerRecord) {
        let mut cache = self.cache.write().await;
        match record.state {
            CircuitState::Open => {
                let was_open = cache.is_open();
                cache.state = Some(CircuitState::Open);
                cache.trip_reason = record.trip_reason;
                cache.trip_context = record.trip_context.clone();
                if cache.tripped_at.is_none() || !was_open {
                    cache.tripped_at = record.tripped_at;
                }
            }
            CircuitState::Closed => {
                if self.fallback_open.load(Ordering::SeqCst) {
                    // Process-local trip outlives a store that never saw it.
                    return;
                }
                if cache.is_open() {
                    info!("Circuit breaker observed CLOSED in store");
                    cache.mark_closed();
                } else {
                    cache.state = Some(CircuitState::Closed);
                }
            }
        }
    }

    fn ensure_escalation(self: &Arc<Self>) {
        let mut slot = self
            .escalation_task
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.escalation_interval_ms);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(breaker) = weak.upgrade() else { break };
                if !breaker.escalation_tick().await {
                    break;
                }
            }
            debug!("Escalation ticker stopped");
        }));
        info!(
            "Escalation ticker started (every {}ms)",
            self.config.escalation_interval_ms
        );
    }

    async fn stop_escalation(&self) {
        let handle = self
            .escalation_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// One escalation step. Returns false once the breaker is closed.
    pub async fn escalation_tick(&self) -> bool {
        let fallback = self.fallback_open.load(Ordering::SeqCst);
        if !fallback {
            // Another process may have reset the breaker.
            match self.store.load_breaker().await {
                Ok(Some(record)) => self.apply_record(&record).await,
                Ok(None) => warn!("Circuit breaker row missing during escalation"),
                Err(e) => warn!("Escalation refresh failed ({}); using cached state", e),
            }
        }

        let now = self.clock.now();
        let (stage, reason, tripped_at, orders_cancelled, shutdown_handled) = {
            let mut cache = self.cache.write().await;
            if !cache.is_open() && !fallback {
                return false;
            }
            let Some(tripped_at) = cache.tripped_at else {
                warn!("Circuit breaker OPEN with unknown trip time; holding at monitoring");
                return true;
            };
            let stage = EscalationStage::for_elapsed(now - tripped_at, &self.config.thresholds());
            if cache.last_stage != Some(stage) {
                warn!(
                    from = ?cache.last_stage,
                    to = %stage,
                    "Circuit breaker escalation stage changed"
                );
                cache.last_stage = Some(stage);
            }
            (
                stage,
                cache.trip_reason,
                tripped_at,
                cache.orders_cancelled,
                cache.shutdown_handled,
            )
        };

        let open_minutes = (now - tripped_at).num_minutes();
        match stage {
            EscalationStage::Monitoring => {
                debug!(?reason, open_minutes, "Circuit breaker open: monitoring");
            }
            EscalationStage::Alert => {
                error!(?reason, open_minutes, "Circuit breaker still OPEN: operator attention required");
            }
            EscalationStage::CancelOrders | EscalationStage::Shutdown => {
                error!(?reason, open_minutes, stage = %stage, "Circuit breaker still OPEN");
            }
        }

        if stage >= EscalationStage::CancelOrders && !orders_cancelled {
            let done = match &self.order_manager {
                Some(om) => match om.cancel_all().await {
                    Ok(()) => {
                        warn!("Escalation: all open orders cancelled");
                        true
                    }
                    Err(e) => {
                        error!("Escalation: cancel_all failed ({}); will retry", e);
                        false
                    }
                },
                None => {
                    warn!("Escalation: no order manager configured; cannot cancel orders");
                    true
                }
            };
            if done {
                self.cache.write().await.orders_cancelled = true;
            }
        }

        if stage == EscalationStage::Shutdown && !shutdown_handled {
            if self.config.allow_extended_halt {
                warn!("Escalation: shutdown stage reached but extended halt is allowed; staying up");
            } else if let Some(orchestrator) = &self.orchestrator {
                error!("Escalation: requesting graceful shutdown");
                let orchestrator = orchestrator.clone();
                tokio::spawn(async move {
                    if let Err(e) = orchestrator.shutdown().await {
                        error!("Escalation: orchestrator shutdown failed: {}", e);
                    }
                });
            } else {
                warn!("Escalation: no orchestrator configured; cannot shut down");
            }
            self.cache.write().await.shutdown_handled = true;
        }

        true
    }
}
