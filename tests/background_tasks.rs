//! Timer-driven behavior, run on tokio's paused clock.

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use ploy_failsafe::adapters::MemoryStore;
use ploy_failsafe::coordination::{
    CircuitBreaker, CircuitBreakerConfig, GracefulShutdown, InstanceLock, InstanceLockConfig,
    ShutdownSignal,
};
use ploy_failsafe::domain::{EscalationStage, TripReason};
use ploy_failsafe::exchange::{BroadcastTickFeed, OrderManager};
use ploy_failsafe::safety::{QualityGate, QualityGateConfig};
use ploy_failsafe::{FailsafeError, ManualClock, Result};
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct CountingOrderManager {
    calls: AtomicUsize,
    fail_first: AtomicBool,
}

#[async_trait]
impl OrderManager for CountingOrderManager {
    async fn cancel_all(&self) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_first.swap(false, Ordering::SeqCst) {
            return Err(FailsafeError::StoreUnavailable("exchange timeout".into()));
        }
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn escalation_ticker_cancels_orders_then_requests_shutdown() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let orders = Arc::new(CountingOrderManager::default());
    orders.fail_first.store(true, Ordering::SeqCst);
    let shutdown = Arc::new(GracefulShutdown::with_defaults());
    let mut signals = shutdown.subscribe();

    let cb = Arc::new(
        CircuitBreaker::new(CircuitBreakerConfig::default(), store)
            .with_clock(clock.clone())
            .with_order_manager(orders.clone())
            .with_orchestrator(shutdown.clone()),
    );
    cb.init().await.unwrap();
    cb.trip(TripReason::ExecutionFailure, json!({"order": "0x1"}))
        .await
        .unwrap();

    // Still monitoring: nothing happens.
    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(orders.calls.load(Ordering::SeqCst), 0);

    // Past the cancel threshold; the first cancel fails and is retried.
    clock.advance(ChronoDuration::minutes(16));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(orders.calls.load(Ordering::SeqCst), 1);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(orders.calls.load(Ordering::SeqCst), 2);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(orders.calls.load(Ordering::SeqCst), 2);

    clock.advance(ChronoDuration::minutes(15));
    assert_eq!(cb.escalation_stage().await, Some(EscalationStage::Shutdown));
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(signals.recv().await.unwrap(), ShutdownSignal::Urgent);
    assert!(shutdown.is_shutdown_requested());

    cb.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn heartbeat_ticker_detects_stolen_lock() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let lock = Arc::new(
        InstanceLock::new(InstanceLockConfig::default(), store.clone())
            .with_clock(clock.clone())
            .with_instance_id("trader-a"),
    );
    lock.init().await.unwrap();
    assert!(!lock.is_observer_only());

    clock.advance(ChronoDuration::seconds(30));
    tokio::time::sleep(Duration::from_secs(31)).await;
    let row = store.lock_record("active_trader").await.unwrap();
    assert_eq!(row.heartbeat_at, lock.get_state().await.last_heartbeat_at.unwrap());

    let mut stolen = row;
    stolen.instance_id = "trader-b".into();
    store.put_lock(stolen).await;

    tokio::time::sleep(Duration::from_secs(30)).await;
    assert!(lock.is_observer_only());
    lock.shutdown().await;
    assert_eq!(
        store.lock_record("active_trader").await.unwrap().instance_id,
        "trader-b"
    );
}

#[tokio::test(start_paused = true)]
async fn is_open_times_out_against_slow_store() {
    let store = Arc::new(MemoryStore::new());
    let cb = Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default(), store.clone()));
    cb.init().await.unwrap();

    store.set_latency(Some(Duration::from_secs(10)));
    let started = tokio::time::Instant::now();
    assert!(cb.is_open().await);
    assert!(started.elapsed() < Duration::from_secs(6));

    store.set_latency(Some(Duration::from_secs(1)));
    assert!(!cb.is_open().await);
}

#[tokio::test(start_paused = true)]
async fn evaluation_ticker_disables_on_feed_silence() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let feed = BroadcastTickFeed::new();
    let gate = Arc::new(
        QualityGate::new(QualityGateConfig::default(), store).with_clock(clock.clone()),
    );
    gate.init(Some(&feed)).unwrap();
    gate.start_evaluation();

    tokio::time::sleep(Duration::from_secs(61)).await;
    assert!(gate.should_allow_signal());
    assert_eq!(gate.evaluation_count(), 1);

    clock.advance(ChronoDuration::seconds(120));
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert!(gate.is_disabled());

    // Further ticks short-circuit.
    tokio::time::sleep(Duration::from_secs(120)).await;
    assert_eq!(gate.evaluation_count(), 2);
    gate.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn evaluation_ticker_without_tick_source_stays_enabled() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let gate = Arc::new(
        QualityGate::new(QualityGateConfig::default(), store).with_clock(clock.clone()),
    );
    gate.init(None).unwrap();
    gate.start_evaluation();

    tokio::time::sleep(Duration::from_secs(1)).await;
    for _ in 0..5 {
        clock.advance(ChronoDuration::seconds(120));
        tokio::time::sleep(Duration::from_secs(60)).await;
    }
    assert_eq!(gate.evaluation_count(), 5);
    assert!(gate.should_allow_signal());
    gate.shutdown().await;
}
