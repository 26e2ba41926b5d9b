//! In-process store with the same conditional-update semantics as Postgres.
//!
//! Backs paper mode and the test suite. Failure injection (`set_unavailable`,
//! `set_latency`) lets callers exercise the fail-closed paths.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

use crate::domain::{
    AuditEntry, BreakerRecord, CircuitState, InstanceLockRecord, IntentStatus, NewIntent,
    PositionSnapshot, ReconcileAttempt, SettledSignal, TradeIntent, TripReason, UpdateStats,
};
use crate::error::{FailsafeError, Result};
use crate::persistence::store::{BreakerStore, IntentStore, LockStore, PositionSource, SignalStore};

#[derive(Debug)]
struct MemoryState {
    breaker: Option<BreakerRecord>,
    audit: Vec<AuditEntry>,
    order_statuses: Vec<String>,
    orders_table_present: bool,
    locks: HashMap<String, InstanceLockRecord>,
    intents: BTreeMap<i64, TradeIntent>,
    next_intent_id: i64,
    signals: Vec<SettledSignal>,
    oracle_updates: Vec<DateTime<Utc>>,
    positions: Vec<PositionSnapshot>,
}

/// In-memory implementation of every store trait
#[derive(Debug)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    unavailable: AtomicBool,
    latency: std::sync::Mutex<Option<Duration>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                breaker: Some(BreakerRecord::closed(Utc::now())),
                audit: Vec::new(),
                order_statuses: Vec::new(),
                orders_table_present: true,
                locks: HashMap::new(),
                intents: BTreeMap::new(),
                next_intent_id: 1,
                signals: Vec::new(),
                oracle_updates: Vec::new(),
                positions: Vec::new(),
            }),
            unavailable: AtomicBool::new(false),
            latency: std::sync::Mutex::new(None),
        }
    }

    /// Make every subsequent call fail with `StoreUnavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delay every subsequent call by `latency`.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    async fn guard(&self) -> Result<()> {
        let latency = *self.latency.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FailsafeError::StoreUnavailable(
                "memory store marked unavailable".to_string(),
            ));
        }
        Ok(())
    }

    // ==================== Seeding helpers ====================

    pub async fn remove_breaker_row(&self) {
        self.state.lock().await.breaker = None;
    }

    pub async fn set_breaker(&self, record: BreakerRecord) {
        self.state.lock().await.breaker = Some(record);
    }

    pub async fn add_order(&self, status: &str) {
        self.state.lock().await.order_statuses.push(status.to_string());
    }

    pub async fn set_orders_table_present(&self, present: bool) {
        self.state.lock().await.orders_table_present = present;
    }

    pub async fn put_lock(&self, record: InstanceLockRecord) {
        self.state
            .lock()
            .await
            .locks
            .insert(record.lock_name.clone(), record);
    }

    pub async fn add_signal(&self, signal: SettledSignal) {
        self.state.lock().await.signals.push(signal);
    }

    pub async fn add_oracle_updates(&self, timestamps: impl IntoIterator<Item = DateTime<Utc>>) {
        self.state.lock().await.oracle_updates.extend(timestamps);
    }

    pub async fn set_positions(&self, positions: Vec<PositionSnapshot>) {
        self.state.lock().await.positions = positions;
    }

    /// Force an intent into a status, bypassing the state machine.
    pub async fn force_intent_status(&self, id: i64, status: IntentStatus) {
        if let Some(intent) = self.state.lock().await.intents.get_mut(&id) {
            intent.status = status;
        }
    }

    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.state.lock().await.audit.clone()
    }

    pub async fn breaker_record(&self) -> Option<BreakerRecord> {
        self.state.lock().await.breaker.clone()
    }

    pub async fn lock_record(&self, lock_name: &str) -> Option<InstanceLockRecord> {
        self.state.lock().await.locks.get(lock_name).cloned()
    }
}

#[async_trait]
impl BreakerStore for MemoryStore {
    async fn load_breaker(&self) -> Result<Option<BreakerRecord>> {
        self.guard().await?;
        Ok(self.state.lock().await.breaker.clone())
    }

    async fn try_trip(
        &self,
        reason: TripReason,
        context: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        self.guard().await?;
        let mut state = self.state.lock().await;
        match state.breaker.as_mut() {
            Some(record) if record.state == CircuitState::Closed => {
                record.state = CircuitState::Open;
                record.trip_reason = Some(reason);
                record.trip_context = Some(context.clone());
                record.tripped_at = Some(at);
                record.updated_at = at;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn reset_breaker(&self, at: DateTime<Utc>) -> Result<u64> {
        self.guard().await?;
        let mut state = self.state.lock().await;
        match state.breaker.as_mut() {
            Some(record) => {
                *record = BreakerRecord::closed(at);
                Ok(1)
            }
            None => Ok(0),
        }
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        self.guard().await?;
        let mut state = self.state.lock().await;
        let mut entry = entry.clone();
        entry.id = Some(state.audit.len() as i64 + 1);
        state.audit.push(entry);
        Ok(())
    }

    async fn recent_audit(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        self.guard().await?;
        let state = self.state.lock().await;
        Ok(state
            .audit
            .iter()
            .rev()
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn count_active_orders(&self) -> Result<i64> {
        self.guard().await?;
        let state = self.state.lock().await;
        if !state.orders_table_present {
            return Err(FailsafeError::StoreUnavailable(
                "relation \"orders\" does not exist".to_string(),
            ));
        }
        Ok(state
            .order_statuses
            .iter()
            .filter(|s| matches!(s.to_lowercase().as_str(), "pending" | "open"))
            .count() as i64)
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn read_lock(&self, lock_name: &str) -> Result<Option<InstanceLockRecord>> {
        self.guard().await?;
        Ok(self.state.lock().await.locks.get(lock_name).cloned())
    }

    async fn insert_lock(&self, record: &InstanceLockRecord) -> Result<bool> {
        self.guard().await?;
        let mut state = self.state.lock().await;
        if state.locks.contains_key(&record.lock_name) {
            return Ok(false);
        }
        state.locks.insert(record.lock_name.clone(), record.clone());
        Ok(true)
    }

    async fn take_over_lock(
        &self,
        record: &InstanceLockRecord,
        stale_before: DateTime<Utc>,
    ) -> Result<u64> {
        self.guard().await?;
        let mut state = self.state.lock().await;
        match state.locks.get_mut(&record.lock_name) {
            Some(existing) if existing.heartbeat_at < stale_before => {
                *existing = record.clone();
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn heartbeat_lock(
        &self,
        lock_name: &str,
        instance_id: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        self.guard().await?;
        let mut state = self.state.lock().await;
        match state.locks.get_mut(lock_name) {
            Some(existing) if existing.instance_id == instance_id => {
                existing.heartbeat_at = at;
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn release_lock(&self, lock_name: &str, instance_id: &str) -> Result<u64> {
        self.guard().await?;
        let mut state = self.state.lock().await;
        let owned = state
            .locks
            .get(lock_name)
            .map(|l| l.instance_id == instance_id)
            .unwrap_or(false);
        if owned {
            state.locks.remove(lock_name);
            Ok(1)
        } else {
            Ok(0)
        }
    }
}

#[async_trait]
impl IntentStore for MemoryStore {
    async fn insert_intent(&self, intent: &NewIntent) -> Result<i64> {
        self.guard().await?;
        let mut state = self.state.lock().await;
        let id = state.next_intent_id;
        state.next_intent_id += 1;
        state.intents.insert(
            id,
            TradeIntent {
                id,
                intent_type: intent.intent_type,
                window_id: intent.window_id.clone(),
                payload: intent.payload.clone(),
                status: IntentStatus::Pending,
                created_at: intent.created_at,
                completed_at: None,
                result: None,
            },
        );
        Ok(id)
    }

    async fn transition_intent(
        &self,
        id: i64,
        from: IntentStatus,
        to: IntentStatus,
        completed_at: Option<DateTime<Utc>>,
        result: Option<&serde_json::Value>,
    ) -> Result<u64> {
        self.guard().await?;
        let mut state = self.state.lock().await;
        match state.intents.get_mut(&id) {
            Some(intent) if intent.status == from => {
                intent.status = to;
                if completed_at.is_some() {
                    intent.completed_at = completed_at;
                }
                if let Some(result) = result {
                    intent.result = Some(result.clone());
                }
                Ok(1)
            }
            _ => Ok(0),
        }
    }

    async fn get_intent(&self, id: i64) -> Result<Option<TradeIntent>> {
        self.guard().await?;
        Ok(self.state.lock().await.intents.get(&id).cloned())
    }

    async fn intents_with_status(&self, status: IntentStatus) -> Result<Vec<TradeIntent>> {
        self.guard().await?;
        let state = self.state.lock().await;
        Ok(state
            .intents
            .values()
            .filter(|i| i.status == status)
            .cloned()
            .collect())
    }

    async fn reconcile_intent(
        &self,
        id: i64,
        result: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<ReconcileAttempt> {
        self.guard().await?;
        let mut state = self.state.lock().await;
        match state.intents.get_mut(&id) {
            None => Ok(ReconcileAttempt::NotFound),
            Some(intent) if intent.status != IntentStatus::Executing => {
                Ok(ReconcileAttempt::WrongStatus(intent.status))
            }
            Some(intent) => {
                intent.status = IntentStatus::Failed;
                intent.completed_at = Some(at);
                intent.result = Some(result.clone());
                Ok(ReconcileAttempt::Reconciled)
            }
        }
    }

    async fn prune_intents(&self, older_than: DateTime<Utc>) -> Result<u64> {
        self.guard().await?;
        let mut state = self.state.lock().await;
        let before = state.intents.len();
        state.intents.retain(|_, i| {
            !(i.status.is_terminal() && i.completed_at.map(|t| t < older_than).unwrap_or(false))
        });
        Ok((before - state.intents.len()) as u64)
    }
}

#[async_trait]
impl SignalStore for MemoryStore {
    async fn recent_settled_signals(&self, limit: usize) -> Result<Vec<SettledSignal>> {
        self.guard().await?;
        let state = self.state.lock().await;
        let mut signals = state.signals.clone();
        signals.sort_by(|a, b| b.settled_at.cmp(&a.settled_at).then(b.id.cmp(&a.id)));
        signals.truncate(limit);
        Ok(signals)
    }

    async fn oracle_update_stats(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<UpdateStats> {
        self.guard().await?;
        let state = self.state.lock().await;
        let in_range: Vec<DateTime<Utc>> = state
            .oracle_updates
            .iter()
            .copied()
            .filter(|t| *t >= since && *t < until)
            .collect();
        Ok(UpdateStats::from_timestamps(&in_range))
    }
}

#[async_trait]
impl PositionSource for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    async fn fetch_positions(&self) -> Result<Vec<PositionSnapshot>> {
        self.guard().await?;
        Ok(self.state.lock().await.positions.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::IntentType;

    #[tokio::test]
    async fn test_conditional_trip_only_once() {
        let store = MemoryStore::new();
        let ctx = serde_json::json!({});
        let now = Utc::now();
        assert_eq!(store.try_trip(TripReason::Manual, &ctx, now).await.unwrap(), 1);
        assert_eq!(store.try_trip(TripReason::Manual, &ctx, now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unavailable_store_errors() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let err = store.load_breaker().await.unwrap_err();
        assert!(err.is_store_error());
    }

    #[tokio::test]
    async fn test_transition_requires_expected_status() {
        let store = MemoryStore::new();
        let id = store
            .insert_intent(&NewIntent {
                intent_type: IntentType::PlaceOrder,
                window_id: "w1".into(),
                payload: serde_json::json!({}),
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        let skipped = store
            .transition_intent(id, IntentStatus::Executing, IntentStatus::Completed, None, None)
            .await
            .unwrap();
        assert_eq!(skipped, 0);
        let moved = store
            .transition_intent(id, IntentStatus::Pending, IntentStatus::Executing, None, None)
            .await
            .unwrap();
        assert_eq!(moved, 1);
    }
}
