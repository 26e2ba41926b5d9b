//! Distributed Instance Lock
//!
//! Elects a single active trader among processes sharing one store. The lock
//! is a row keyed by lock name; liveness is its heartbeat timestamp, not an
//! explicit release. A holder whose heartbeat is older than the stale
//! threshold can be taken over, so two traders may overlap for at most that
//! window.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::domain::{InstanceLockRecord, InstanceRole};
use crate::error::{FailsafeError, Result};
use crate::persistence::store::LockStore;

/// Configuration for the instance lock
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InstanceLockConfig {
    pub lock_name: String,
    /// Heartbeat period while active (default: 30s)
    pub heartbeat_interval_ms: u64,
    /// Heartbeat age at which a holder counts as dead (default: 120s)
    pub stale_threshold_ms: u64,
}

impl Default for InstanceLockConfig {
    fn default() -> Self {
        Self {
            lock_name: "active_trader".to_string(),
            heartbeat_interval_ms: 30_000,
            stale_threshold_ms: 120_000,
        }
    }
}

impl InstanceLockConfig {
    pub fn validate(&self) -> Result<()> {
        if self.lock_name.trim().is_empty() {
            return Err(FailsafeError::InvalidConfig(
                "instance_lock.lock_name must not be empty".to_string(),
            ));
        }
        if self.heartbeat_interval_ms == 0 {
            return Err(FailsafeError::InvalidConfig(
                "instance_lock.heartbeat_interval_ms must be > 0".to_string(),
            ));
        }
        if self.heartbeat_interval_ms >= self.stale_threshold_ms {
            return Err(FailsafeError::InvalidConfig(format!(
                "instance_lock.heartbeat_interval_ms ({}) must be below stale_threshold_ms ({})",
                self.heartbeat_interval_ms, self.stale_threshold_ms
            )));
        }
        Ok(())
    }

    fn stale_after(&self) -> ChronoDuration {
        ChronoDuration::milliseconds(self.stale_threshold_ms as i64)
    }
}

/// Operator-facing view of the lock
#[derive(Debug, Clone, Serialize)]
pub struct LockSnapshot {
    pub lock_name: String,
    pub instance_id: String,
    pub role: InstanceRole,
    pub initialized: bool,
    pub acquired_at: Option<DateTime<Utc>>,
    pub last_heartbeat_at: Option<DateTime<Utc>>,
    /// Current holder when this instance is an observer
    pub holder_instance_id: Option<String>,
    pub holder_heartbeat_age_ms: Option<i64>,
}

#[derive(Debug, Default)]
struct LockInner {
    acquired_at: Option<DateTime<Utc>>,
    last_heartbeat_ok: Option<DateTime<Utc>>,
    holder_instance_id: Option<String>,
    holder_heartbeat_age_ms: Option<i64>,
}

/// Process-wide trader election backed by a `LockStore`
pub struct InstanceLock {
    config: InstanceLockConfig,
    store: Arc<dyn LockStore>,
    clock: Arc<dyn Clock>,
    instance_id: String,
    mode: String,
    initialized: AtomicBool,
    active: AtomicBool,
    inner: RwLock<LockInner>,
    heartbeat_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

/// `<pid>-<random hex>`, unique enough across restarts and hosts.
pub fn generate_instance_id() -> String {
    format!("{}-{:08x}", std::process::id(), rand::random::<u32>())
}

impl InstanceLock {
    pub fn new(config: InstanceLockConfig, store: Arc<dyn LockStore>) -> Self {
        Self {
            config,
            store,
            clock: Arc::new(SystemClock),
            instance_id: generate_instance_id(),
            mode: "live".to_string(),
            initialized: AtomicBool::new(false),
            active: AtomicBool::new(false),
            inner: RwLock::new(LockInner::default()),
            heartbeat_task: std::sync::Mutex::new(None),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_instance_id(mut self, instance_id: impl Into<String>) -> Self {
        self.instance_id = instance_id.into();
        self
    }

    /// Trading mode recorded in the lock metadata
    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = mode.into();
        self
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Acquire (or not) and start heartbeating if this instance won.
    pub async fn init(self: &Arc<Self>) -> Result<InstanceRole> {
        self.config.validate()?;
        let role = self.acquire().await;
        self.initialized.store(true, Ordering::SeqCst);
        if role == InstanceRole::ActiveTrader {
            self.start_heartbeat();
        }
        Ok(role)
    }

    /// One acquisition attempt. Any store failure yields `Observer`.
    pub async fn acquire(&self) -> InstanceRole {
        match self.try_acquire().await {
            Ok(role) => role,
            Err(e) => {
                error!(
                    lock = %self.config.lock_name,
                    "Lock acquisition failed ({}); running as observer-only",
                    e
                );
                self.active.store(false, Ordering::SeqCst);
                InstanceRole::Observer
            }
        }
    }

    async fn try_acquire(&self) -> Result<InstanceRole> {
        let now = self.clock.now();
        let record = self.build_record(now);

        match self.store.read_lock(&self.config.lock_name).await? {
            None => {
                if self.store.insert_lock(&record).await? {
                    self.become_active(now).await;
                    return Ok(InstanceRole::ActiveTrader);
                }
                // Lost the insert race.
                let holder = self.store.read_lock(&self.config.lock_name).await?;
                self.become_observer(holder.as_ref(), now).await;
                Ok(InstanceRole::Observer)
            }
            Some(existing) if existing.instance_id == self.instance_id => {
                // Our own row survived (e.g. re-init); refresh it.
                let refreshed = self
                    .store
                    .heartbeat_lock(&self.config.lock_name, &self.instance_id, now)
                    .await?;
                if refreshed == 0 {
                    // Taken over between the read and the refresh.
                    let holder = self.store.read_lock(&self.config.lock_name).await?;
                    self.become_observer(holder.as_ref(), now).await;
                    return Ok(InstanceRole::Observer);
                }
                self.become_active(now).await;
                Ok(InstanceRole::ActiveTrader)
            }
            Some(existing) if !existing.is_stale(now, self.config.stale_after()) => {
                self.become_observer(Some(&existing), now).await;
                Ok(InstanceRole::Observer)
            }
            Some(existing) => {
                let stale_before = now - self.config.stale_after() + ChronoDuration::milliseconds(1);
                let taken = self.store.take_over_lock(&record, stale_before).await?;
                if taken == 0 {
                    // Holder heartbeated in between.
                    let holder = self.store.read_lock(&self.config.lock_name).await?;
                    self.become_observer(holder.as_ref(), now).await;
                    return Ok(InstanceRole::Observer);
                }
                warn!(
                    lock = %self.config.lock_name,
                    previous_holder = %existing.instance_id,
                    heartbeat_age_ms = (now - existing.heartbeat_at).num_milliseconds(),
                    "Took over stale instance lock"
                );
                self.become_active(now).await;
                Ok(InstanceRole::ActiveTrader)
            }
        }
    }

    fn build_record(&self, now: DateTime<Utc>) -> InstanceLockRecord {
        InstanceLockRecord {
            lock_name: self.config.lock_name.clone(),
            instance_id: self.instance_id.clone(),
            acquired_at: now,
            heartbeat_at: now,
            metadata: serde_json::json!({
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "mode": self.mode,
            }),
        }
    }

    async fn become_active(&self, now: DateTime<Utc>) {
        self.active.store(true, Ordering::SeqCst);
        let mut inner = self.inner.write().await;
        inner.acquired_at = Some(now);
        inner.last_heartbeat_ok = Some(now);
        inner.holder_instance_id = None;
        inner.holder_heartbeat_age_ms = None;
        info!(
            lock = %self.config.lock_name,
            instance = %self.instance_id,
            "Acquired instance lock: ACTIVE TRADER"
        );
    }

    async fn become_observer(&self, holder: Option<&InstanceLockRecord>, now: DateTime<Utc>) {
        self.active.store(false, Ordering::SeqCst);
        let mut inner = self.inner.write().await;
        inner.holder_instance_id = holder.map(|h| h.instance_id.clone());
        inner.holder_heartbeat_age_ms = holder.map(|h| (now - h.heartbeat_at).num_milliseconds());
        warn!(
            lock = %self.config.lock_name,
            instance = %self.instance_id,
            holder = ?inner.holder_instance_id,
            holder_heartbeat_age_ms = ?inner.holder_heartbeat_age_ms,
            "Instance lock held elsewhere: OBSERVER-ONLY"
        );
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let mut slot = self
            .heartbeat_task
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            return;
        }

        let weak: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.heartbeat_interval_ms);
        *slot = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(lock) = weak.upgrade() else { break };
                if !lock.heartbeat().await {
                    break;
                }
            }
            debug!("Heartbeat ticker stopped");
        }));
    }

    /// Refresh the heartbeat. Returns false once this instance is no longer
    /// the active trader.
    pub async fn heartbeat(&self) -> bool {
        if !self.active.load(Ordering::SeqCst) {
            return false;
        }
        let now = self.clock.now();
        match self
            .store
            .heartbeat_lock(&self.config.lock_name, &self.instance_id, now)
            .await
        {
            Ok(affected) if affected > 0 => {
                self.inner.write().await.last_heartbeat_ok = Some(now);
                debug!(lock = %self.config.lock_name, "Heartbeat ok");
                true
            }
            Ok(_) => {
                error!(
                    lock = %self.config.lock_name,
                    instance = %self.instance_id,
                    "INSTANCE LOCK LOST: row stolen or deleted; demoting to observer-only"
                );
                self.active.store(false, Ordering::SeqCst);
                false
            }
            Err(e) => {
                let last_ok = self.inner.read().await.last_heartbeat_ok;
                let silent_for = last_ok.map(|t| now - t).unwrap_or_else(ChronoDuration::zero);
                error!(
                    lock = %self.config.lock_name,
                    silent_for_ms = silent_for.num_milliseconds(),
                    "Heartbeat write failed: {}",
                    e
                );
                if silent_for >= self.config.stale_after() {
                    error!(
                        lock = %self.config.lock_name,
                        "No successful heartbeat within stale threshold; demoting to observer-only"
                    );
                    self.active.store(false, Ordering::SeqCst);
                    return false;
                }
                true
            }
        }
    }

    /// True before init, while observing, and after losing the lock.
    pub fn is_observer_only(&self) -> bool {
        !self.initialized.load(Ordering::SeqCst) || !self.active.load(Ordering::SeqCst)
    }

    pub fn role(&self) -> InstanceRole {
        if self.is_observer_only() {
            InstanceRole::Observer
        } else {
            InstanceRole::ActiveTrader
        }
    }

    pub async fn get_state(&self) -> LockSnapshot {
        let inner = self.inner.read().await;
        LockSnapshot {
            lock_name: self.config.lock_name.clone(),
            instance_id: self.instance_id.clone(),
            role: self.role(),
            initialized: self.initialized.load(Ordering::SeqCst),
            acquired_at: inner.acquired_at,
            last_heartbeat_at: inner.last_heartbeat_ok,
            holder_instance_id: inner.holder_instance_id.clone(),
            holder_heartbeat_age_ms: inner.holder_heartbeat_age_ms,
        }
    }

    /// Stop heartbeating and delete the row if this instance still owns it.
    /// Returns whether a row was deleted.
    pub async fn release(&self) -> Result<bool> {
        self.stop_heartbeat().await;
        if !self.active.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        let deleted = self
            .store
            .release_lock(&self.config.lock_name, &self.instance_id)
            .await?;
        if deleted > 0 {
            info!(lock = %self.config.lock_name, "Released instance lock");
        } else {
            warn!(lock = %self.config.lock_name, "Lock was no longer ours at release");
        }
        Ok(deleted > 0)
    }

    pub async fn shutdown(&self) {
        if let Err(e) = self.release().await {
            // The row will go stale and be taken over.
            error!(lock = %self.config.lock_name, "Lock release failed: {}", e);
        }
    }

    async fn stop_heartbeat(&self) {
        let handle = self
            .heartbeat_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            handle.abort();
            let _ = handle.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::MemoryStore;
    use crate::clock::ManualClock;

    fn lock_for(store: Arc<MemoryStore>, clock: Arc<ManualClock>, id: &str) -> Arc<InstanceLock> {
        Arc::new(
            InstanceLock::new(InstanceLockConfig::default(), store)
                .with_clock(clock)
                .with_instance_id(id),
        )
    }

    /// Serves one outdated read of the lock row, then the real one.
    struct OutdatedFirstRead {
        inner: Arc<MemoryStore>,
        outdated: InstanceLockRecord,
        served: std::sync::atomic::AtomicBool,
    }

    #[async_trait::async_trait]
    impl LockStore for OutdatedFirstRead {
        async fn read_lock(&self, lock_name: &str) -> Result<Option<InstanceLockRecord>> {
            if !self.served.swap(true, Ordering::SeqCst) {
                return Ok(Some(self.outdated.clone()));
            }
            self.inner.read_lock(lock_name).await
        }

        async fn insert_lock(&self, record: &InstanceLockRecord) -> Result<bool> {
            self.inner.insert_lock(record).await
        }

        async fn take_over_lock(
            &self,
            record: &InstanceLockRecord,
            stale_before: DateTime<Utc>,
        ) -> Result<u64> {
            self.inner.take_over_lock(record, stale_before).await
        }

        async fn heartbeat_lock(
            &self,
            lock_name: &str,
            instance_id: &str,
            at: DateTime<Utc>,
        ) -> Result<u64> {
            self.inner.heartbeat_lock(lock_name, instance_id, at).await
        }

        async fn release_lock(&self, lock_name: &str, instance_id: &str) -> Result<u64> {
            self.inner.release_lock(lock_name, instance_id).await
        }
    }

    #[tokio::test]
    async fn test_own_row_taken_over_before_refresh_yields_observer() {
        let inner = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let now = clock.now();
        let own = InstanceLockRecord {
            lock_name: "active_trader".into(),
            instance_id: "trader-a".into(),
            acquired_at: now - ChronoDuration::minutes(10),
            heartbeat_at: now - ChronoDuration::seconds(20),
            metadata: serde_json::json!({}),
        };
        inner
            .put_lock(InstanceLockRecord {
                instance_id: "trader-b".into(),
                heartbeat_at: now,
                ..own.clone()
            })
            .await;

        let store = Arc::new(OutdatedFirstRead {
            inner: inner.clone(),
            outdated: own,
            served: std::sync::atomic::AtomicBool::new(false),
        });
        let lock = Arc::new(
            InstanceLock::new(InstanceLockConfig::default(), store)
                .with_clock(clock)
                .with_instance_id("trader-a"),
        );

        assert_eq!(lock.init().await.unwrap(), InstanceRole::Observer);
        assert!(lock.is_observer_only());
        let state = lock.get_state().await;
        assert_eq!(state.holder_instance_id.as_deref(), Some("trader-b"));
        assert_eq!(
            inner.lock_record("active_trader").await.unwrap().instance_id,
            "trader-b"
        );
        lock.shutdown().await;
    }

    #[test]
    fn test_generated_ids_are_distinct() {
        let a = generate_instance_id();
        let b = generate_instance_id();
        assert!(a.starts_with(&format!("{}-", std::process::id())));
        assert_ne!(a, b);
    }

    #[test]
    fn test_config_rejects_heartbeat_above_stale() {
        let config = InstanceLockConfig {
            heartbeat_interval_ms: 200_000,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[tokio::test]
    async fn test_observer_before_init() {
        let store = Arc::new(MemoryStore::new());
        let lock = lock_for(store, Arc::new(ManualClock::default()), "a");
        assert!(lock.is_observer_only());
    }

    #[tokio::test]
    async fn test_first_instance_wins_second_observes() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let a = lock_for(store.clone(), clock.clone(), "a");
        let b = lock_for(store.clone(), clock.clone(), "b");

        assert_eq!(a.init().await.unwrap(), InstanceRole::ActiveTrader);
        assert_eq!(b.init().await.unwrap(), InstanceRole::Observer);
        assert!(!a.is_observer_only());
        assert!(b.is_observer_only());

        let state = b.get_state().await;
        assert_eq!(state.holder_instance_id.as_deref(), Some("a"));
        assert_eq!(state.holder_heartbeat_age_ms, Some(0));

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_heartbeat_loss_demotes() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let a = lock_for(store.clone(), clock.clone(), "a");
        a.init().await.unwrap();

        // Another instance stole the row.
        let mut stolen = store.lock_record("active_trader").await.unwrap();
        stolen.instance_id = "thief".into();
        store.put_lock(stolen).await;

        assert!(!a.heartbeat().await);
        assert!(a.is_observer_only());
        // Releasing must not delete the thief's row.
        assert!(!a.release().await.unwrap());
        assert!(store.lock_record("active_trader").await.is_some());
    }

    #[tokio::test]
    async fn test_heartbeat_store_errors_demote_after_stale_threshold() {
        let store = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::default());
        let a = lock_for(store.clone(), clock.clone(), "a");
        a.init().await.unwrap();

        store.set_unavailable(true);
        clock.advance(ChronoDuration::seconds(60));
        assert!(a.heartbeat().await);
        assert!(!a.is_observer_only());

        clock.advance(ChronoDuration::seconds(60));
        assert!(!a.heartbeat().await);
        assert!(a.is_observer_only());
    }

    #[tokio::test]
    async fn test_release_deletes_owned_row() {
        let store = Arc::new(MemoryStore::new());
        let a = lock_for(store.clone(), Arc::new(ManualClock::default()), "a");
        a.init().await.unwrap();
        assert!(a.release().await.unwrap());
        assert!(store.lock_record("active_trader").await.is_none());
        assert!(a.is_observer_only());
    }
}
