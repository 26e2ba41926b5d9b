use chrono::Duration;
use futures::future::join_all;
use ploy_failsafe::adapters::MemoryStore;
use ploy_failsafe::coordination::{
    CircuitBreaker, CircuitBreakerConfig, InstanceLock, InstanceLockConfig, TripOutcome,
};
use ploy_failsafe::domain::{
    AuditAction, DivergenceKind, EscalationStage, InstanceLockRecord, InstanceRole,
    IntentStatus, IntentType, PositionSnapshot, SettledSignal, Side, TripReason,
};
use ploy_failsafe::persistence::{detect_divergence, IntentLog, IntentLogConfig, IntentStore};
use ploy_failsafe::safety::{DisableReason, Evaluation, QualityGate, QualityGateConfig};
use ploy_failsafe::{Clock, FailsafeError, ManualClock};
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::Arc;

fn breaker(store: &Arc<MemoryStore>, clock: &Arc<ManualClock>) -> Arc<CircuitBreaker> {
    Arc::new(CircuitBreaker::new(CircuitBreakerConfig::default(), store.clone()).with_clock(clock.clone()))
}

/// Concurrent trips, from one process and from several, yield exactly one
/// transition and one TRIP audit row.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_trips_have_single_winner() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());

    // Five "processes", each tripping twice concurrently.
    let mut breakers = Vec::new();
    for _ in 0..5 {
        let cb = breaker(&store, &clock);
        cb.init().await.unwrap();
        breakers.push(cb);
    }

    let attempts = breakers.iter().flat_map(|cb| {
        (0..2).map(move |i| {
            let cb = cb.clone();
            tokio::spawn(async move {
                cb.trip(TripReason::ExecutionFailure, json!({ "attempt": i }))
                    .await
                    .unwrap()
            })
        })
    });
    let outcomes: Vec<TripOutcome> = join_all(attempts)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let winners = outcomes.iter().filter(|o| **o == TripOutcome::Tripped).count();
    let losers = outcomes.iter().filter(|o| **o == TripOutcome::AlreadyOpen).count();
    assert_eq!(winners, 1, "outcomes: {:?}", outcomes);
    assert_eq!(losers, outcomes.len() - 1);

    let trips = store
        .audit_entries()
        .await
        .into_iter()
        .filter(|e| e.action == AuditAction::Trip)
        .count();
    assert_eq!(trips, 1);

    for cb in &breakers {
        assert!(cb.is_open().await);
        cb.shutdown().await;
    }
}

/// An unreachable store reads as OPEN and as observer-only, every time.
#[tokio::test]
async fn unreachable_store_fails_closed() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let cb = breaker(&store, &clock);
    cb.init().await.unwrap();
    store.set_unavailable(true);

    for _ in 0..100 {
        assert!(cb.is_open().await);
    }

    for i in 0..100 {
        let lock = Arc::new(
            InstanceLock::new(InstanceLockConfig::default(), store.clone())
                .with_clock(clock.clone())
                .with_instance_id(format!("standby-{}", i)),
        );
        assert_eq!(lock.init().await.unwrap(), InstanceRole::Observer);
        assert!(lock.is_observer_only());
    }
}

/// Startup checks report `executing` intents but never move them.
#[tokio::test]
async fn executing_intents_only_leave_via_reconcile() {
    let store = Arc::new(MemoryStore::new());
    let log = IntentLog::new(IntentLogConfig::default(), store.clone());
    log.init().unwrap();

    let id = log
        .log_intent(IntentType::PlaceOrder, "btc-15m-42", json!({"side": "UP", "size": 25}))
        .await
        .unwrap();
    log.mark_executing(id).await.unwrap();

    for _ in 0..3 {
        let check = log.check_startup_state().await.unwrap();
        assert!(!check.clean);
        assert_eq!(check.incomplete_count, 1);
        assert_eq!(check.incomplete_intents[0].id, id);
        assert_eq!(
            store.get_intent(id).await.unwrap().unwrap().status,
            IntentStatus::Executing
        );
    }

    log.mark_intent_reconciled(id, "order not found on exchange")
        .await
        .unwrap();
    let intent = store.get_intent(id).await.unwrap().unwrap();
    assert_eq!(intent.status, IntentStatus::Failed);
    assert_eq!(intent.result.unwrap()["reconciled"], json!(true));
    assert!(log.check_startup_state().await.unwrap().clean);
}

#[test]
fn divergence_detection_is_complete() {
    let memory = vec![
        PositionSnapshot::new("1", dec!(100), "open"),
        PositionSnapshot::new("2", dec!(200), "open"),
    ];
    let db = vec![
        PositionSnapshot::new("1", dec!(150), "open"),
        PositionSnapshot::new("3", dec!(300), "open"),
    ];

    let found = detect_divergence(&memory, &db);
    assert_eq!(found.len(), 3);

    assert_eq!(found[0].kind, DivergenceKind::StateMismatch);
    assert_eq!(found[0].position_id, "1");
    assert_eq!(found[0].field.as_deref(), Some("size"));
    assert_eq!(found[0].memory_value.as_deref(), Some("100"));
    assert_eq!(found[0].db_value.as_deref(), Some("150"));

    assert_eq!(found[1].kind, DivergenceKind::MemoryOnly);
    assert_eq!(found[1].position_id, "2");

    assert_eq!(found[2].kind, DivergenceKind::DbOnly);
    assert_eq!(found[2].position_id, "3");
}

async fn acquire_against_heartbeat_age(age_secs: i64) -> InstanceRole {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let now = clock.now();
    store
        .put_lock(InstanceLockRecord {
            lock_name: "active_trader".into(),
            instance_id: "old-holder".into(),
            acquired_at: now - Duration::hours(2),
            heartbeat_at: now - Duration::seconds(age_secs),
            metadata: json!({}),
        })
        .await;

    let lock = Arc::new(
        InstanceLock::new(InstanceLockConfig::default(), store.clone())
            .with_clock(clock)
            .with_instance_id("newcomer"),
    );
    let role = lock.init().await.unwrap();
    if role == InstanceRole::ActiveTrader {
        assert_eq!(
            store.lock_record("active_trader").await.unwrap().instance_id,
            "newcomer"
        );
    } else {
        assert_eq!(
            store.lock_record("active_trader").await.unwrap().instance_id,
            "old-holder"
        );
    }
    lock.shutdown().await;
    role
}

#[tokio::test]
async fn stale_lock_is_taken_over_fresh_lock_is_not() {
    assert_eq!(acquire_against_heartbeat_age(121).await, InstanceRole::ActiveTrader);
    assert_eq!(acquire_against_heartbeat_age(30).await, InstanceRole::Observer);
}

#[tokio::test]
async fn escalation_stage_follows_elapsed_time() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let cb = breaker(&store, &clock);
    cb.init().await.unwrap();
    assert_eq!(cb.escalation_stage().await, None);

    cb.trip(TripReason::DataVerificationFailed, json!({})).await.unwrap();

    let expected = [
        (1, EscalationStage::Monitoring),
        (5, EscalationStage::Alert),
        (10, EscalationStage::CancelOrders),
        (15, EscalationStage::Shutdown),
    ];
    // t0+1, t0+6, t0+16, t0+31 minutes
    for (advance_min, stage) in expected {
        clock.advance(Duration::minutes(advance_min));
        assert_eq!(cb.escalation_stage().await, Some(stage));
    }
    cb.shutdown().await;
}

async fn gate_over(total: usize, correct: usize) -> Evaluation {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let base = clock.now();
    for i in 0..total {
        store
            .add_signal(SettledSignal {
                id: i as i64,
                window_id: format!("btc-15m-{}", i),
                predicted: Side::Down,
                outcome: if i < correct { Side::Down } else { Side::Up },
                settled_at: base - Duration::minutes(15 * i as i64),
            })
            .await;
    }
    let gate = Arc::new(
        QualityGate::new(
            QualityGateConfig {
                min_signals_for_evaluation: 10,
                min_accuracy_threshold: 0.40,
                ..Default::default()
            },
            store,
        )
        .with_clock(clock),
    );
    gate.init(None).unwrap();
    gate.evaluate().await.unwrap()
}

#[tokio::test]
async fn quality_gate_accuracy_threshold() {
    match gate_over(20, 6).await {
        Evaluation::Disabled { reason, context } => {
            assert_eq!(reason, DisableReason::AccuracyBelowThreshold);
            assert_eq!(context["sample_size"], json!(20));
            assert_eq!(context["threshold"], json!(0.40));
        }
        other => panic!("30% accuracy should disable, got {:?}", other),
    }
    assert!(matches!(gate_over(20, 12).await, Evaluation::Passed { .. }));
    assert!(matches!(gate_over(5, 0).await, Evaluation::Passed { .. }));
}

#[tokio::test]
async fn reset_is_gated_on_active_orders_and_operator() {
    let store = Arc::new(MemoryStore::new());
    let clock = Arc::new(ManualClock::default());
    let cb = breaker(&store, &clock);
    cb.init().await.unwrap();
    cb.trip(TripReason::PositionTrackingFailed, json!({"divergences": []}))
        .await
        .unwrap();

    store.add_order("open").await;
    match cb.reset("alice", "positions verified").await {
        Err(FailsafeError::ResetBlocked { active_orders }) => assert_eq!(active_orders, 1),
        other => panic!("expected ResetBlocked, got {:?}", other),
    }
    assert!(cb.is_open().await);

    assert!(matches!(
        cb.reset("", "positions verified").await,
        Err(FailsafeError::InvalidReason(_))
    ));

    let store2 = Arc::new(MemoryStore::new());
    let cb2 = breaker(&store2, &clock);
    cb2.init().await.unwrap();
    cb2.trip(TripReason::Manual, json!({})).await.unwrap();
    store2.add_order("filled").await;
    store2.add_order("cancelled").await;
    cb2.reset("alice", "positions verified").await.unwrap();

    let record = store2.breaker_record().await.unwrap();
    assert!(record.trip_reason.is_none());
    assert!(record.trip_context.is_none());
    assert!(record.tripped_at.is_none());
    assert!(!cb2.is_open().await);

    cb.shutdown().await;
    cb2.shutdown().await;
}
