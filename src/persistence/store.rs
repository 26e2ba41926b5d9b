//! Store seams consumed by the failsafe components.
//!
//! Every mutation that guards an invariant is a single conditional statement
//! whose affected-row count is returned to the caller. Implementations must
//! surface that count faithfully: the breaker's at-most-one trip, the lock's
//! ownership checks and the intent state machine all depend on it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{
    AuditEntry, BreakerRecord, InstanceLockRecord, IntentStatus, NewIntent, PositionSnapshot,
    ReconcileAttempt, SettledSignal, TradeIntent, TripReason, UpdateStats,
};
use crate::error::Result;

#[async_trait]
pub trait BreakerStore: Send + Sync {
    /// Read the single breaker row.
    async fn load_breaker(&self) -> Result<Option<BreakerRecord>>;

    /// CLOSED -> OPEN, conditional on the row still being CLOSED.
    async fn try_trip(
        &self,
        reason: TripReason,
        context: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<u64>;

    /// Unconditional OPEN -> CLOSED, clearing all trip fields.
    async fn reset_breaker(&self, at: DateTime<Utc>) -> Result<u64>;

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()>;

    async fn recent_audit(&self, limit: i64) -> Result<Vec<AuditEntry>>;

    /// Orders still in `pending` or `open` status.
    async fn count_active_orders(&self) -> Result<i64>;
}

#[async_trait]
pub trait LockStore: Send + Sync {
    async fn read_lock(&self, lock_name: &str) -> Result<Option<InstanceLockRecord>>;

    /// Insert if no row exists for the lock name. Returns false on conflict.
    async fn insert_lock(&self, record: &InstanceLockRecord) -> Result<bool>;

    /// Overwrite the row only if its heartbeat is older than `stale_before`.
    async fn take_over_lock(
        &self,
        record: &InstanceLockRecord,
        stale_before: DateTime<Utc>,
    ) -> Result<u64>;

    /// Refresh the heartbeat iff `(lock_name, instance_id)` still matches.
    async fn heartbeat_lock(
        &self,
        lock_name: &str,
        instance_id: &str,
        at: DateTime<Utc>,
    ) -> Result<u64>;

    /// Delete the row iff still owned by `instance_id`.
    async fn release_lock(&self, lock_name: &str, instance_id: &str) -> Result<u64>;
}

#[async_trait]
pub trait IntentStore: Send + Sync {
    async fn insert_intent(&self, intent: &NewIntent) -> Result<i64>;

    /// Move `id` from `from` to `to`, conditional on the current status.
    async fn transition_intent(
        &self,
        id: i64,
        from: IntentStatus,
        to: IntentStatus,
        completed_at: Option<DateTime<Utc>>,
        result: Option<&serde_json::Value>,
    ) -> Result<u64>;

    async fn get_intent(&self, id: i64) -> Result<Option<TradeIntent>>;

    async fn intents_with_status(&self, status: IntentStatus) -> Result<Vec<TradeIntent>>;

    /// Atomically check `executing` and fail the intent with `result`.
    async fn reconcile_intent(
        &self,
        id: i64,
        result: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<ReconcileAttempt>;

    /// Delete terminal intents completed before `older_than`.
    async fn prune_intents(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait SignalStore: Send + Sync {
    /// Most recent settled signals, newest first.
    async fn recent_settled_signals(&self, limit: usize) -> Result<Vec<SettledSignal>>;

    /// Oracle update statistics for `[since, until)`.
    async fn oracle_update_stats(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<UpdateStats>;
}

/// Anything that can report a position view: the DB, the in-memory tracker,
/// or the exchange.
#[async_trait]
pub trait PositionSource: Send + Sync {
    fn name(&self) -> &str;

    async fn fetch_positions(&self) -> Result<Vec<PositionSnapshot>>;
}
