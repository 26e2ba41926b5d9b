use ploy_failsafe::adapters::MemoryStore;
use ploy_failsafe::domain::{
    InstanceLockRecord, InstanceRole, IntentType, PositionSnapshot, TripReason,
};
use ploy_failsafe::{
    run_startup, AppConfig, Clock, Failsafe, ManualClock, PositionSource, ReconcileOutcome,
    TradingMode, TripOutcome,
};
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;

async fn failsafe(
    config: AppConfig,
    store: &Arc<MemoryStore>,
    clock: &Arc<ManualClock>,
) -> Failsafe {
    let fs = Failsafe::builder(config)
        .clock(clock.clone())
        .instance_id("trader-a")
        .build(store.clone());
    fs.init(None).await.unwrap();
    fs
}

fn live() -> AppConfig {
    AppConfig::default_config("memory://", TradingMode::Live)
}

#[tokio::test]
async fn live_divergence_trips_position_tracking_failed() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    store
        .set_positions(vec![PositionSnapshot::new("tok-1", dec!(50), "open")])
        .await;
    let exchange = MemoryStore::new();
    exchange
        .set_positions(vec![
            PositionSnapshot::new("tok-1", dec!(75), "open"),
            PositionSnapshot::new("tok-2", dec!(10), "open"),
        ])
        .await;

    let fs = failsafe(live(), &store, &clock).await;
    let report = run_startup(&fs, store.as_ref(), Some(&exchange as &dyn PositionSource))
        .await
        .unwrap();

    assert_eq!(report.role, InstanceRole::ActiveTrader);
    assert_eq!(
        report.trips,
        vec![(TripReason::PositionTrackingFailed, TripOutcome::Tripped)]
    );
    match report.reconciliation {
        Some(ReconcileOutcome::Diverged { ref divergences }) => assert_eq!(divergences.len(), 2),
        ref other => panic!("expected divergence, got {:?}", other),
    }
    assert!(!report.is_clean());

    let record = store.breaker_record().await.unwrap();
    assert_eq!(record.trip_reason, Some(TripReason::PositionTrackingFailed));
    let context = record.trip_context.unwrap();
    assert_eq!(context["divergences"].as_array().unwrap().len(), 2);
    assert!(!fs.can_trade().await);
    fs.shutdown().await;
}

#[tokio::test]
async fn unreachable_exchange_does_not_trip() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let exchange = MemoryStore::new();
    exchange.set_unavailable(true);

    let fs = failsafe(live(), &store, &clock).await;
    let report = run_startup(&fs, store.as_ref(), Some(&exchange as &dyn PositionSource))
        .await
        .unwrap();

    assert!(report.trips.is_empty());
    assert!(matches!(
        report.reconciliation,
        Some(ReconcileOutcome::SourceUnavailable { .. })
    ));
    assert!(fs.can_trade().await);
    fs.shutdown().await;
}

#[tokio::test]
async fn paper_mode_skips_reconciliation() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let exchange = MemoryStore::new();
    exchange
        .set_positions(vec![PositionSnapshot::new("tok-9", dec!(1), "open")])
        .await;

    let config = AppConfig::default_config("memory://", TradingMode::Paper);
    let fs = failsafe(config, &store, &clock).await;
    let report = run_startup(&fs, store.as_ref(), Some(&exchange as &dyn PositionSource))
        .await
        .unwrap();

    assert!(report.reconciliation.is_none());
    assert!(report.is_clean());
    fs.shutdown().await;
}

#[tokio::test]
async fn observer_skips_checks() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let now = clock.now();
    store
        .put_lock(InstanceLockRecord {
            lock_name: "active_trader".into(),
            instance_id: "trader-b".into(),
            acquired_at: now,
            heartbeat_at: now,
            metadata: json!({}),
        })
        .await;
    let exchange = MemoryStore::new();
    exchange
        .set_positions(vec![PositionSnapshot::new("tok-1", dec!(5), "open")])
        .await;

    let fs = failsafe(live(), &store, &clock).await;
    let report = run_startup(&fs, store.as_ref(), Some(&exchange as &dyn PositionSource))
        .await
        .unwrap();

    assert_eq!(report.role, InstanceRole::Observer);
    assert!(report.intent_check.is_none());
    assert!(report.reconciliation.is_none());
    assert!(!fs.can_trade().await);
    fs.shutdown().await;
}

#[tokio::test]
async fn leftover_intents_trip_only_when_configured() {
    for trip_on_incomplete in [false, true] {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let mut config = AppConfig::default_config("memory://", TradingMode::Paper);
        config.intent_log.trip_on_incomplete = trip_on_incomplete;

        let fs = failsafe(config, &store, &clock).await;
        let id = fs
            .intents()
            .log_intent(IntentType::PlaceOrder, "btc-15m-7", json!({"size": 10}))
            .await
            .unwrap();
        fs.intents().mark_executing(id).await.unwrap();

        let report = run_startup(&fs, store.as_ref(), None).await.unwrap();
        let check = report.intent_check.clone().unwrap();
        assert_eq!(check.incomplete_count, 1);
        assert!(!report.is_clean());

        if trip_on_incomplete {
            assert_eq!(
                report.trips,
                vec![(TripReason::UnreconciledIntents, TripOutcome::Tripped)]
            );
            assert!(fs.breaker().is_open().await);
        } else {
            assert!(report.trips.is_empty());
            assert!(!fs.breaker().is_open().await);
        }
        fs.shutdown().await;
    }
}

#[tokio::test]
async fn live_without_exchange_source_trips() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());

    let fs = failsafe(live(), &store, &clock).await;
    let report = run_startup(&fs, store.as_ref(), None).await.unwrap();

    assert_eq!(report.role, InstanceRole::ActiveTrader);
    assert!(report.reconciliation.is_none());
    assert_eq!(
        report.trips,
        vec![(TripReason::PositionTrackingFailed, TripOutcome::Tripped)]
    );
    assert!(!report.is_clean());

    let record = store.breaker_record().await.unwrap();
    assert_eq!(
        record.trip_context.unwrap()["reason"],
        json!("no exchange source")
    );
    assert!(!fs.can_trade().await);
    fs.shutdown().await;
}

#[tokio::test]
async fn malformed_exchange_position_trips() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    store
        .set_positions(vec![PositionSnapshot::new("tok-1", dec!(-5), "open")])
        .await;
    let exchange = MemoryStore::new();
    exchange
        .set_positions(vec![PositionSnapshot::new("tok-1", dec!(-5), "open")])
        .await;

    let fs = failsafe(live(), &store, &clock).await;
    let report = run_startup(&fs, store.as_ref(), Some(&exchange as &dyn PositionSource))
        .await
        .unwrap();

    assert!(matches!(
        report.reconciliation,
        Some(ReconcileOutcome::Malformed { .. })
    ));
    assert_eq!(
        report.trips,
        vec![(TripReason::PositionTrackingFailed, TripOutcome::Tripped)]
    );
    assert!(!report.is_clean());
    let context = store.breaker_record().await.unwrap().trip_context.unwrap();
    assert_eq!(context["malformed"].as_array().unwrap().len(), 1);
    fs.shutdown().await;
}
