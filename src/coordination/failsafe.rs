//! Failsafe facade
//!
//! Owns the breaker, instance lock, intent log and quality gate, answers the
//! two questions the strategy layer asks (`can_trade`, `can_emit_signal`) and
//! stops everything in a fixed order.

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::{AppConfig, TradingMode};
use crate::coordination::circuit_breaker::{BreakerSnapshot, CircuitBreaker};
use crate::coordination::instance_lock::{InstanceLock, LockSnapshot};
use crate::coordination::shutdown::Orchestrator;
use crate::error::Result;
use crate::exchange::{OrderManager, TickFeed};
use crate::persistence::intent_log::{IntentLog, IntentLogSnapshot};
use crate::persistence::reconciler::{Reconciler, ReconcilerStats};
use crate::persistence::store::{BreakerStore, IntentStore, LockStore, SignalStore};
use crate::safety::quality_gate::{GateSnapshot, QualityGate};

/// Combined status of every failsafe component
#[derive(Debug, Clone, Serialize)]
pub struct FailsafeStatus {
    pub mode: String,
    pub can_trade: bool,
    pub breaker: BreakerSnapshot,
    pub lock: LockSnapshot,
    pub intent_log: IntentLogSnapshot,
    pub quality_gate: GateSnapshot,
    pub reconciler: ReconcilerStats,
}

/// Builder for `Failsafe`
pub struct FailsafeBuilder {
    config: AppConfig,
    clock: Arc<dyn Clock>,
    order_manager: Option<Arc<dyn OrderManager>>,
    orchestrator: Option<Arc<dyn Orchestrator>>,
    instance_id: Option<String>,
}

impl FailsafeBuilder {
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
            order_manager: None,
            orchestrator: None,
            instance_id: None,
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn order_manager(mut self, order_manager: Arc<dyn OrderManager>) -> Self {
        self.order_manager = Some(order_manager);
        self
    }

    pub fn orchestrator(mut self, orchestrator: Arc<dyn Orchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    pub fn instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = Some(instance_id.into());
        self
    }

    /// Wire every component to one store implementing all store traits.
    pub fn build<S>(self, store: Arc<S>) -> Failsafe
    where
        S: BreakerStore + LockStore + IntentStore + SignalStore + 'static,
    {
        let mut breaker = CircuitBreaker::new(self.config.circuit_breaker.clone(), store.clone())
            .with_clock(self.clock.clone());
        if let Some(om) = self.order_manager {
            breaker = breaker.with_order_manager(om);
        }
        if let Some(orch) = self.orchestrator {
            breaker = breaker.with_orchestrator(orch);
        }

        let mut lock = InstanceLock::new(self.config.instance_lock.clone(), store.clone())
            .with_clock(self.clock.clone())
            .with_mode(self.config.trading.mode.as_str());
        if let Some(id) = self.instance_id {
            lock = lock.with_instance_id(id);
        }

        let intents = IntentLog::new(self.config.intent_log.clone(), store.clone())
            .with_clock(self.clock.clone());
        let gate =
            QualityGate::new(self.config.quality_gate.clone(), store).with_clock(self.clock);

        Failsafe {
            mode: self.config.trading.mode,
            breaker: Arc::new(breaker),
            lock: Arc::new(lock),
            intents: Arc::new(intents),
            gate: Arc::new(gate),
            reconciler: Reconciler::new(),
        }
    }
}

pub struct Failsafe {
    mode: TradingMode,
    breaker: Arc<CircuitBreaker>,
    lock: Arc<InstanceLock>,
    intents: Arc<IntentLog>,
    gate: Arc<QualityGate>,
    reconciler: Reconciler,
}

impl Failsafe {
    pub fn builder(config: AppConfig) -> FailsafeBuilder {
        FailsafeBuilder::new(config)
    }

    pub fn mode(&self) -> TradingMode {
        self.mode
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.breaker
    }

    pub fn lock(&self) -> &Arc<InstanceLock> {
        &self.lock
    }

    pub fn intents(&self) -> &Arc<IntentLog> {
        &self.intents
    }

    pub fn gate(&self) -> &Arc<QualityGate> {
        &self.gate
    }

    pub fn reconciler(&self) -> &Reconciler {
        &self.reconciler
    }

    /// Initialize breaker, intent log and gate. The lock is acquired by
    /// `startup::run_startup`.
    pub async fn init(&self, feed: Option<&dyn TickFeed>) -> Result<()> {
        self.breaker.init().await?;
        self.intents.init()?;
        self.gate.init(feed)?;
        Ok(())
    }

    /// Start the intent pruner and the gate's evaluation ticker.
    pub fn start_background(&self) {
        self.intents.start_pruner();
        self.gate.start_evaluation();
    }

    /// Active trader and breaker confirmed CLOSED.
    pub async fn can_trade(&self) -> bool {
        if self.lock.is_observer_only() {
            return false;
        }
        !self.breaker.is_open().await
    }

    /// `can_trade` and the quality gate allows new signals.
    pub async fn can_emit_signal(&self) -> bool {
        self.gate.should_allow_signal() && self.can_trade().await
    }

    pub async fn get_state(&self) -> FailsafeStatus {
        FailsafeStatus {
            mode: self.mode.to_string(),
            can_trade: self.can_trade().await,
            breaker: self.breaker.get_state().await,
            lock: self.lock.get_state().await,
            intent_log: self.intents.get_state(),
            quality_gate: self.gate.get_state().await,
            reconciler: self.reconciler.get_state(),
        }
    }

    /// Stop the gate, the intent pruner, the breaker's escalation, then
    /// release the lock.
    pub async fn shutdown(&self) {
        info!("Stopping failsafe components");
        self.gate.shutdown().await;
        self.intents.shutdown().await;
        self.breaker.shutdown().await;
        self.lock.shutdown().await;
        if self.breaker.is_fallback_open() {
            warn!("Exiting with an unpersisted in-memory breaker trip");
        }
        info!("Failsafe components stopped");
    }
}
