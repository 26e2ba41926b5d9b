use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use tracing::{debug, info, instrument, warn};

use crate::domain::{
    AuditAction, AuditEntry, BreakerRecord, CircuitState, InstanceLockRecord, IntentStatus,
    IntentType, NewIntent, PositionSnapshot, ReconcileAttempt, SettledSignal, Side, TradeIntent,
    TripReason, UpdateStats,
};
use crate::error::{FailsafeError, Result};
use crate::persistence::store::{BreakerStore, IntentStore, LockStore, PositionSource, SignalStore};

/// Fixed primary key of the single circuit breaker row
const BREAKER_ROW_ID: i32 = 1;

/// PostgreSQL storage adapter
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await?;

        info!("Connected to PostgreSQL");
        Ok(Self { pool })
    }

    /// Create a PostgreSQL store from an existing connection pool
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Run migrations
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        info!("Database migrations completed");
        Ok(())
    }

    /// Get the connection pool
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn decode_err(msg: String) -> FailsafeError {
    FailsafeError::Database(sqlx::Error::Decode(msg.into()))
}

fn breaker_from_row(row: &PgRow) -> Result<BreakerRecord> {
    let state: String = row.get("state");
    let reason: Option<String> = row.get("trip_reason");
    Ok(BreakerRecord {
        state: CircuitState::try_from(state.as_str()).map_err(decode_err)?,
        trip_reason: reason
            .map(|r| TripReason::try_from(r.as_str()))
            .transpose()
            .map_err(decode_err)?,
        trip_context: row.get("trip_context"),
        tripped_at: row.get("tripped_at"),
        updated_at: row.get("updated_at"),
    })
}

fn audit_from_row(row: &PgRow) -> Result<AuditEntry> {
    let action: String = row.get("action");
    Ok(AuditEntry {
        id: Some(row.get("id")),
        action: AuditAction::try_from(action.as_str()).map_err(decode_err)?,
        reason: row.get("reason"),
        context: row.get("context"),
        operator_id: row.get("operator_id"),
        created_at: row.get("created_at"),
    })
}

fn lock_from_row(row: &PgRow) -> InstanceLockRecord {
    InstanceLockRecord {
        lock_name: row.get("lock_name"),
        instance_id: row.get("instance_id"),
        acquired_at: row.get("acquired_at"),
        heartbeat_at: row.get("heartbeat_at"),
        metadata: row.get("metadata"),
    }
}

fn intent_from_row(row: &PgRow) -> Result<TradeIntent> {
    let intent_type: String = row.get("intent_type");
    let status: String = row.get("status");
    Ok(TradeIntent {
        id: row.get("id"),
        intent_type: IntentType::try_from(intent_type.as_str()).map_err(decode_err)?,
        window_id: row.get("window_id"),
        payload: row.get("payload"),
        status: IntentStatus::try_from(status.as_str()).map_err(decode_err)?,
        created_at: row.get("created_at"),
        completed_at: row.get("completed_at"),
        result: row.get("result"),
    })
}

// ==================== Circuit breaker ====================

#[async_trait]
impl BreakerStore for PostgresStore {
    async fn load_breaker(&self) -> Result<Option<BreakerRecord>> {
        let row = sqlx::query(
            r#"
            SELECT state, trip_reason, trip_context, tripped_at, updated_at
            FROM circuit_breaker WHERE id = $1
            "#,
        )
        .bind(BREAKER_ROW_ID)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(breaker_from_row).transpose()
    }

    #[instrument(skip(self, context))]
    async fn try_trip(
        &self,
        reason: TripReason,
        context: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE circuit_breaker SET
                state = 'OPEN',
                trip_reason = $2,
                trip_context = $3,
                tripped_at = $4,
                updated_at = $4
            WHERE id = $1 AND state = 'CLOSED'
            "#,
        )
        .bind(BREAKER_ROW_ID)
        .bind(reason.as_str())
        .bind(context)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    #[instrument(skip(self))]
    async fn reset_breaker(&self, at: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE circuit_breaker SET
                state = 'CLOSED',
                trip_reason = NULL,
                trip_context = NULL,
                tripped_at = NULL,
                updated_at = $2
            WHERE id = $1
            "#,
        )
        .bind(BREAKER_ROW_ID)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn append_audit(&self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO circuit_breaker_audit (action, reason, context, operator_id, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(entry.action.as_str())
        .bind(&entry.reason)
        .bind(&entry.context)
        .bind(&entry.operator_id)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn recent_audit(&self, limit: i64) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            r#"
            SELECT id, action, reason, context, operator_id, created_at
            FROM circuit_breaker_audit
            ORDER BY created_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(audit_from_row).collect()
    }

    async fn count_active_orders(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM orders
            WHERE LOWER(status) IN ('pending', 'open')
            "#,
        )
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }
}

// ==================== Instance lock ====================

#[async_trait]
impl LockStore for PostgresStore {
    async fn read_lock(&self, lock_name: &str) -> Result<Option<InstanceLockRecord>> {
        let row = sqlx::query(
            r#"
            SELECT lock_name, instance_id, acquired_at, heartbeat_at, metadata
            FROM instance_locks WHERE lock_name = $1
            "#,
        )
        .bind(lock_name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.as_ref().map(lock_from_row))
    }

    #[instrument(skip(self, record), fields(lock = %record.lock_name, instance = %record.instance_id))]
    async fn insert_lock(&self, record: &InstanceLockRecord) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO instance_locks (lock_name, instance_id, acquired_at, heartbeat_at, metadata)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (lock_name) DO NOTHING
            "#,
        )
        .bind(&record.lock_name)
        .bind(&record.instance_id)
        .bind(record.acquired_at)
        .bind(record.heartbeat_at)
        .bind(&record.metadata)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, record), fields(lock = %record.lock_name, instance = %record.instance_id))]
    async fn take_over_lock(
        &self,
        record: &InstanceLockRecord,
        stale_before: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE instance_locks SET
                instance_id = $2,
                acquired_at = $3,
                heartbeat_at = $4,
                metadata = $5
            WHERE lock_name = $1 AND heartbeat_at < $6
            "#,
        )
        .bind(&record.lock_name)
        .bind(&record.instance_id)
        .bind(record.acquired_at)
        .bind(record.heartbeat_at)
        .bind(&record.metadata)
        .bind(stale_before)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn heartbeat_lock(
        &self,
        lock_name: &str,
        instance_id: &str,
        at: DateTime<Utc>,
    ) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE instance_locks SET heartbeat_at = $3
            WHERE lock_name = $1 AND instance_id = $2
            "#,
        )
        .bind(lock_name)
        .bind(instance_id)
        .bind(at)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn release_lock(&self, lock_name: &str, instance_id: &str) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM instance_locks
            WHERE lock_name = $1 AND instance_id = $2
            "#,
        )
        .bind(lock_name)
        .bind(instance_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// ==================== Trade intents ====================

#[async_trait]
impl IntentStore for PostgresStore {
    #[instrument(skip(self, intent), fields(intent_type = %intent.intent_type, window = %intent.window_id))]
    async fn insert_intent(&self, intent: &NewIntent) -> Result<i64> {
        let row = sqlx::query(
            r#"
            INSERT INTO trade_intents (intent_type, window_id, payload, status, created_at)
            VALUES ($1, $2, $3, 'pending', $4)
            RETURNING id
            "#,
        )
        .bind(intent.intent_type.as_str())
        .bind(&intent.window_id)
        .bind(&intent.payload)
        .bind(intent.created_at)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    async fn transition_intent(
        &self,
        id: i64,
        from: IntentStatus,
        to: IntentStatus,
        completed_at: Option<DateTime<Utc>>,
        result: Option<&serde_json::Value>,
    ) -> Result<u64> {
        let done = sqlx::query(
            r#"
            UPDATE trade_intents SET
                status = $3,
                completed_at = COALESCE($4, completed_at),
                result = COALESCE($5, result)
            WHERE id = $1 AND status = $2
            "#,
        )
        .bind(id)
        .bind(from.as_str())
        .bind(to.as_str())
        .bind(completed_at)
        .bind(result)
        .execute(&self.pool)
        .await?;

        debug!("Intent {} {} -> {}: {} row(s)", id, from, to, done.rows_affected());
        Ok(done.rows_affected())
    }

    async fn get_intent(&self, id: i64) -> Result<Option<TradeIntent>> {
        let row = sqlx::query(
            r#"
            SELECT id, intent_type, window_id, payload, status, created_at, completed_at, result
            FROM trade_intents WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(intent_from_row).transpose()
    }

    async fn intents_with_status(&self, status: IntentStatus) -> Result<Vec<TradeIntent>> {
        let rows = sqlx::query(
            r#"
            SELECT id, intent_type, window_id, payload, status, created_at, completed_at, result
            FROM trade_intents
            WHERE status = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(status.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(intent_from_row).collect()
    }

    #[instrument(skip(self, result))]
    async fn reconcile_intent(
        &self,
        id: i64,
        result: &serde_json::Value,
        at: DateTime<Utc>,
    ) -> Result<ReconcileAttempt> {
        let mut tx = self.pool.begin().await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT status FROM trade_intents WHERE id = $1 FOR UPDATE")
                .bind(id)
                .fetch_optional(&mut *tx)
                .await?;

        let status = match current {
            None => return Ok(ReconcileAttempt::NotFound),
            Some(s) => IntentStatus::try_from(s.as_str()).map_err(decode_err)?,
        };
        if status != IntentStatus::Executing {
            return Ok(ReconcileAttempt::WrongStatus(status));
        }

        sqlx::query(
            r#"
            UPDATE trade_intents SET
                status = 'failed',
                completed_at = $2,
                result = $3
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(at)
        .bind(result)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ReconcileAttempt::Reconciled)
    }

    async fn prune_intents(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM trade_intents
            WHERE status IN ('completed', 'failed')
              AND completed_at IS NOT NULL
              AND completed_at < $1
            "#,
        )
        .bind(older_than)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }
}

// ==================== Quality gate inputs ====================

#[async_trait]
impl SignalStore for PostgresStore {
    async fn recent_settled_signals(&self, limit: usize) -> Result<Vec<SettledSignal>> {
        let rows = sqlx::query(
            r#"
            SELECT id, window_id, predicted_side, outcome_side, settled_at
            FROM signals
            WHERE outcome_side IS NOT NULL AND settled_at IS NOT NULL
            ORDER BY settled_at DESC, id DESC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut signals = Vec::with_capacity(rows.len());
        for row in &rows {
            let predicted: String = row.get("predicted_side");
            let outcome: String = row.get("outcome_side");
            match (Side::try_from(predicted.as_str()), Side::try_from(outcome.as_str())) {
                (Ok(predicted), Ok(outcome)) => signals.push(SettledSignal {
                    id: row.get("id"),
                    window_id: row.get("window_id"),
                    predicted,
                    outcome,
                    settled_at: row.get("settled_at"),
                }),
                _ => warn!(
                    "Skipping signal {} with unparseable sides ({} / {})",
                    row.get::<i64, _>("id"),
                    predicted,
                    outcome
                ),
            }
        }
        Ok(signals)
    }

    async fn oracle_update_stats(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> Result<UpdateStats> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*)::BIGINT AS count,
                AVG(interval_ms)::DOUBLE PRECISION AS mean_interval_ms,
                STDDEV_SAMP(interval_ms)::DOUBLE PRECISION AS stddev_interval_ms
            FROM (
                SELECT EXTRACT(EPOCH FROM (observed_at - LAG(observed_at) OVER (ORDER BY observed_at))) * 1000
                    AS interval_ms
                FROM oracle_updates
                WHERE observed_at >= $1 AND observed_at < $2
            ) t
            "#,
        )
        .bind(since)
        .bind(until)
        .fetch_one(&self.pool)
        .await?;

        Ok(UpdateStats {
            count: row.get("count"),
            mean_interval_ms: row.get("mean_interval_ms"),
            stddev_interval_ms: row.get("stddev_interval_ms"),
        })
    }
}

#[async_trait]
impl PositionSource for PostgresStore {
    fn name(&self) -> &str {
        "database"
    }

    async fn fetch_positions(&self) -> Result<Vec<PositionSnapshot>> {
        let rows = sqlx::query(
            r#"
            SELECT id::TEXT AS id, size, status
            FROM positions
            WHERE LOWER(status) <> 'closed'
            ORDER BY id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .iter()
            .map(|row| PositionSnapshot {
                id: row.get("id"),
                size: row.get::<Decimal, _>("size"),
                status: row.get("status"),
            })
            .collect())
    }
}
