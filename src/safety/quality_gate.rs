//! Signal Quality Gate
//!
//! Stops new trading signals when live performance or data quality degrades.
//! `ENABLED -> DISABLED` happens from `evaluate()` (first matching check
//! wins) or `disable()`; the way back is only an explicit `enable()` with a
//! human-written reason.
//!
//! Checks, in order:
//! 1. rolling accuracy of the last N settled signals, once enough exist
//! 2. oracle feed silence, from the process-local last-tick timestamp (only
//!    once a feed is subscribed or a tick has been recorded)
//! 3. every Kth evaluation, oracle update pattern vs the trailing 24h baseline

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::domain::{rolling_accuracy, OracleTick, UpdateStats};
use crate::error::{require_reason, FailsafeError, Result};
use crate::exchange::TickFeed;
use crate::persistence::store::SignalStore;

const BASELINE_WINDOW_HOURS: i64 = 24;

/// Quality gate configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityGateConfig {
    /// Settled signals in the accuracy window (default: 20)
    pub rolling_window_size: usize,
    /// Disable below this accuracy (default: 0.40)
    pub min_accuracy_threshold: f64,
    /// Accuracy is not judged on fewer signals (default: 10)
    pub min_signals_for_evaluation: usize,
    /// Feed silence that disables the gate (default: 60s)
    pub feed_unavailable_threshold_ms: u64,
    /// Run the pattern check every Kth evaluation (default: 10)
    pub pattern_check_frequency: u64,
    /// Allowed relative change in update frequency (default: 0.5)
    pub pattern_change_threshold: f64,
    /// Allowed shift of mean update interval, in baseline std devs (default: 2.0)
    pub spread_behavior_std_dev: f64,
    /// Recent window compared against the baseline (default: 1h)
    pub pattern_recent_window_ms: u64,
    /// Baseline updates required before pattern checks run (default: 30)
    pub pattern_min_baseline_updates: i64,
    /// Evaluation ticker period (default: 60s)
    pub evaluation_interval_ms: u64,
    /// Tick feed topic used for liveness
    pub oracle_topic: String,
}

impl Default for QualityGateConfig {
    fn default() -> Self {
        Self {
            rolling_window_size: 20,
            min_accuracy_threshold: 0.40,
            min_signals_for_evaluation: 10,
            feed_unavailable_threshold_ms: 60_000,
            pattern_check_frequency: 10,
            pattern_change_threshold: 0.5,
            spread_behavior_std_dev: 2.0,
            pattern_recent_window_ms: 3_600_000,
            pattern_min_baseline_updates: 30,
            evaluation_interval_ms: 60_000,
            oracle_topic: "crypto_prices_chainlink".to_string(),
        }
    }
}

impl QualityGateConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(FailsafeError::InvalidConfig(msg));

        if self.rolling_window_size == 0 {
            return invalid("quality_gate.rolling_window_size must be > 0".into());
        }
        if self.min_signals_for_evaluation == 0
            || self.min_signals_for_evaluation > self.rolling_window_size
        {
            return invalid(format!(
                "quality_gate.min_signals_for_evaluation must be in 1..={}",
                self.rolling_window_size
            ));
        }
        if !(0.0..=1.0).contains(&self.min_accuracy_threshold) {
            return invalid(format!(
                "quality_gate.min_accuracy_threshold {} outside [0, 1]",
                self.min_accuracy_threshold
            ));
        }
        if self.feed_unavailable_threshold_ms == 0 || self.evaluation_interval_ms == 0 {
            return invalid("quality_gate intervals must be > 0".into());
        }
        if self.pattern_check_frequency == 0 {
            return invalid("quality_gate.pattern_check_frequency must be > 0".into());
        }
        if self.pattern_change_threshold <= 0.0 || self.spread_behavior_std_dev <= 0.0 {
            return invalid("quality_gate pattern thresholds must be > 0".into());
        }
        if self.pattern_recent_window_ms == 0
            || self.pattern_recent_window_ms >= (BASELINE_WINDOW_HOURS as u64) * 3_600_000
        {
            return invalid("quality_gate.pattern_recent_window_ms must be within (0, 24h)".into());
        }
        Ok(())
    }
}

/// Why the gate is disabled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DisableReason {
    AccuracyBelowThreshold,
    FeedUnavailable,
    PatternChangeDetected,
    Manual,
}

impl DisableReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisableReason::AccuracyBelowThreshold => "ACCURACY_BELOW_THRESHOLD",
            DisableReason::FeedUnavailable => "FEED_UNAVAILABLE",
            DisableReason::PatternChangeDetected => "PATTERN_CHANGE_DETECTED",
            DisableReason::Manual => "MANUAL",
        }
    }
}

impl std::fmt::Display for DisableReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result of one `evaluate()` call
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Evaluation {
    Skipped {
        reason: String,
    },
    Passed {
        accuracy: Option<f64>,
        sample_size: usize,
        pattern_checked: bool,
    },
    Disabled {
        reason: DisableReason,
        context: serde_json::Value,
    },
}

impl Evaluation {
    pub fn is_skipped(&self) -> bool {
        matches!(self, Evaluation::Skipped { .. })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DisableEvent {
    pub reason: DisableReason,
    pub context: serde_json::Value,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnableEvent {
    pub user_reason: String,
    pub previous_reason: Option<DisableReason>,
    pub at: DateTime<Utc>,
}

pub type DisableCallback = Arc<dyn Fn(&DisableEvent) -> anyhow::Result<()> + Send + Sync>;
pub type EnableCallback = Arc<dyn Fn(&EnableEvent) -> anyhow::Result<()> + Send + Sync>;

#[derive(Debug, Clone, Serialize)]
pub struct GateSnapshot {
    pub disabled: bool,
    pub disable_reason: Option<DisableReason>,
    pub disable_context: Option<serde_json::Value>,
    pub disabled_at: Option<DateTime<Utc>>,
    pub enabled_at: Option<DateTime<Utc>>,
    pub evaluation_count: u64,
    pub last_accuracy: Option<f64>,
    pub last_sample_size: usize,
    pub last_tick_at: Option<DateTime<Utc>>,
    /// False until a feed is subscribed or a tick is recorded
    pub feed_monitored: bool,
}

#[derive(Debug, Default)]
struct GateInner {
    disable_reason: Option<DisableReason>,
    disable_context: Option<serde_json::Value>,
    disabled_at: Option<DateTime<Utc>>,
    enabled_at: Option<DateTime<Utc>>,
    last_accuracy: Option<f64>,
    last_sample_size: usize,
}

pub struct QualityGate {
    config: QualityGateConfig,
    store: Arc<dyn SignalStore>,
    clock: Arc<dyn Clock>,
    initialized: AtomicBool,
    disabled: AtomicBool,
    evaluation_count: AtomicU64,
    /// Millis of the last observed tick; 0 when none yet
    last_tick_ms: AtomicI64,
    initialized_at_ms: AtomicI64,
    feed_monitored: AtomicBool,
    inner: RwLock<GateInner>,
    on_disable: std::sync::Mutex<Vec<DisableCallback>>,
    on_enable: std::sync::Mutex<Vec<EnableCallback>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl QualityGate {
    pub fn new(config: QualityGateConfig, store: Arc<dyn SignalStore>) -> Self {
        Self {
            config,
            store,
            clock: Arc::new(SystemClock),
            initialized: AtomicBool::new(false),
            disabled: AtomicBool::new(false),
            evaluation_count: AtomicU64::new(0),
            last_tick_ms: AtomicI64::new(0),
            initialized_at_ms: AtomicI64::new(0),
            feed_monitored: AtomicBool::new(false),
            inner: RwLock::new(GateInner::default()),
            on_disable: std::sync::Mutex::new(Vec::new()),
            on_enable: std::sync::Mutex::new(Vec::new()),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(&self) -> &QualityGateConfig {
        &self.config
    }

    /// Validate config and start tracking feed liveness from `feed`, if given.
    /// The evaluation ticker is started separately with `start_evaluation`.
    pub fn init(self: &Arc<Self>, feed: Option<&dyn TickFeed>) -> Result<()> {
        self.config.validate()?;
        self.initialized_at_ms
            .store(self.clock.now_ts_millis(), Ordering::SeqCst);
        self.initialized.store(true, Ordering::SeqCst);

        if let Some(feed) = feed {
            self.feed_monitored.store(true, Ordering::SeqCst);
            let rx = feed.subscribe(&self.config.oracle_topic);
            self.spawn_tick_listener(rx);
        }
        info!(
            window = self.config.rolling_window_size,
            threshold = self.config.min_accuracy_threshold,
            topic = %self.config.oracle_topic,
            "Quality gate initialized: ENABLED"
        );
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(FailsafeError::NotInitialized {
                component: "quality_gate",
            })
        }
    }

    fn spawn_tick_listener(self: &Arc<Self>, mut rx: tokio::sync::broadcast::Receiver<OracleTick>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            loop {
                let received = rx.recv().await;
                let Some(gate) = weak.upgrade() else { break };
                match received {
                    Ok(tick) => {
                        if let Err(e) = gate.record_oracle_tick(&tick) {
                            warn!("Ignoring oracle tick: {}", e);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        // Ticks were flowing; we just fell behind.
                        gate.mark_feed_alive();
                        debug!(skipped, "Tick listener lagged");
                    }
                    Err(RecvError::Closed) => {
                        warn!("Oracle tick feed closed; liveness will go stale");
                        break;
                    }
                }
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Note a live oracle tick.
    pub fn record_oracle_tick(&self, tick: &OracleTick) -> Result<()> {
        tick.validate()?;
        self.mark_feed_alive();
        Ok(())
    }

    fn mark_feed_alive(&self) {
        self.last_tick_ms
            .store(self.clock.now_ts_millis(), Ordering::SeqCst);
        self.feed_monitored.store(true, Ordering::SeqCst);
    }

    pub fn start_evaluation(self: &Arc<Self>) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = Duration::from_millis(self.config.evaluation_interval_ms);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(gate) = weak.upgrade() else { break };
                if let Err(e) = gate.evaluate().await {
                    error!("Quality gate evaluation failed: {}", e);
                }
            }
        });
        self.tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(handle);
    }

    /// Run the checks once.
    pub async fn evaluate(&self) -> Result<Evaluation> {
        self.ensure_initialized()?;
        if self.disabled.load(Ordering::SeqCst) {
            return Ok(Evaluation::Skipped {
                reason: "already_disabled".to_string(),
            });
        }

        let count = self.evaluation_count.fetch_add(1, Ordering::SeqCst) + 1;
        let now = self.clock.now();

        // 1. Rolling accuracy
        let (accuracy, sample_size) = match self
            .store
            .recent_settled_signals(self.config.rolling_window_size)
            .await
        {
            Ok(signals) => (rolling_accuracy(&signals), signals.len()),
            Err(e) => {
                warn!("Accuracy query failed ({}); skipping accuracy check", e);
                (None, 0)
            }
        };
        {
            let mut inner = self.inner.write().await;
            inner.last_accuracy = accuracy;
            inner.last_sample_size = sample_size;
        }
        if let Some(acc) = accuracy {
            if sample_size >= self.config.min_signals_for_evaluation
                && acc < self.config.min_accuracy_threshold
            {
                let context = serde_json::json!({
                    "accuracy": acc,
                    "threshold": self.config.min_accuracy_threshold,
                    "sample_size": sample_size,
                });
                return self
                    .disable_from_evaluation(DisableReason::AccuracyBelowThreshold, context)
                    .await;
            }
        }

        // 2. Feed liveness, once there is a tick source to watch
        let feed_monitored = self.feed_monitored.load(Ordering::SeqCst);
        let last_seen_ms = match self.last_tick_ms.load(Ordering::SeqCst) {
            0 => self.initialized_at_ms.load(Ordering::SeqCst),
            ms => ms,
        };
        let silent_ms = now.timestamp_millis() - last_seen_ms;
        if feed_monitored && silent_ms > self.config.feed_unavailable_threshold_ms as i64 {
            let context = serde_json::json!({
                "silent_ms": silent_ms,
                "threshold_ms": self.config.feed_unavailable_threshold_ms,
                "ever_received": self.last_tick_ms.load(Ordering::SeqCst) != 0,
                "accuracy": accuracy,
                "sample_size": sample_size,
            });
            return self
                .disable_from_evaluation(DisableReason::FeedUnavailable, context)
                .await;
        }

        // 3. Update pattern, every Kth evaluation
        let pattern_checked = count % self.config.pattern_check_frequency == 0;
        if pattern_checked {
            if let Some(context) = self.check_pattern(now).await {
                return self
                    .disable_from_evaluation(DisableReason::PatternChangeDetected, context)
                    .await;
            }
        }

        debug!(
            evaluation = count,
            accuracy = ?accuracy,
            sample_size,
            pattern_checked,
            "Quality gate evaluation passed"
        );
        Ok(Evaluation::Passed {
            accuracy,
            sample_size,
            pattern_checked,
        })
    }

    /// Returns a disable context if the recent oracle update pattern departs
    /// from the baseline. Insufficient data or a failed query passes.
    async fn check_pattern(&self, now: DateTime<Utc>) -> Option<serde_json::Value> {
        let recent_window = ChronoDuration::milliseconds(self.config.pattern_recent_window_ms as i64);
        let recent_start = now - recent_window;
        let baseline_start = now - ChronoDuration::hours(BASELINE_WINDOW_HOURS);

        let stats = async {
            let baseline = self.store.oracle_update_stats(baseline_start, recent_start).await?;
            let recent = self.store.oracle_update_stats(recent_start, now).await?;
            Ok::<(UpdateStats, UpdateStats), FailsafeError>((baseline, recent))
        };
        let (baseline, recent) = match stats.await {
            Ok(s) => s,
            Err(e) => {
                warn!("Pattern query failed ({}); skipping pattern check", e);
                return None;
            }
        };

        if baseline.count < self.config.pattern_min_baseline_updates {
            debug!(
                baseline_updates = baseline.count,
                required = self.config.pattern_min_baseline_updates,
                "Insufficient baseline; skipping pattern check"
            );
            return None;
        }

        let baseline_span_ms = (recent_start - baseline_start).num_milliseconds() as f64;
        let recent_span_ms = recent_window.num_milliseconds() as f64;
        let baseline_rate = baseline.count as f64 / baseline_span_ms;
        let recent_rate = recent.count as f64 / recent_span_ms;
        let frequency_ratio = recent_rate / baseline_rate;

        if (frequency_ratio - 1.0).abs() > self.config.pattern_change_threshold {
            return Some(serde_json::json!({
                "check": "update_frequency",
                "frequency_ratio": frequency_ratio,
                "threshold": self.config.pattern_change_threshold,
                "baseline_updates": baseline.count,
                "recent_updates": recent.count,
            }));
        }

        if let (Some(base_mean), Some(base_std), Some(recent_mean)) = (
            baseline.mean_interval_ms,
            baseline.stddev_interval_ms,
            recent.mean_interval_ms,
        ) {
            if base_std > 0.0 {
                let z = (recent_mean - base_mean).abs() / base_std;
                if z > self.config.spread_behavior_std_dev {
                    return Some(serde_json::json!({
                        "check": "update_interval",
                        "z_score": z,
                        "threshold": self.config.spread_behavior_std_dev,
                        "baseline_mean_interval_ms": base_mean,
                        "recent_mean_interval_ms": recent_mean,
                    }));
                }
            }
        }

        None
    }

    async fn disable_from_evaluation(
        &self,
        reason: DisableReason,
        context: serde_json::Value,
    ) -> Result<Evaluation> {
        match self.disable(reason, context.clone()).await {
            Ok(()) => Ok(Evaluation::Disabled { reason, context }),
            // Someone else disabled it meanwhile.
            Err(FailsafeError::AlreadyDisabled) => Ok(Evaluation::Skipped {
                reason: "already_disabled".to_string(),
            }),
            Err(e) => Err(e),
        }
    }

    /// Disable signal emission.
    pub async fn disable(&self, reason: DisableReason, context: serde_json::Value) -> Result<()> {
        if self.disabled.swap(true, Ordering::SeqCst) {
            return Err(FailsafeError::AlreadyDisabled);
        }

        let at = self.clock.now();
        let (accuracy, sample_size) = {
            let mut inner = self.inner.write().await;
            inner.disable_reason = Some(reason);
            inner.disable_context = Some(context.clone());
            inner.disabled_at = Some(at);
            (inner.last_accuracy, inner.last_sample_size)
        };

        warn!(
            %reason,
            accuracy = ?accuracy,
            threshold = self.config.min_accuracy_threshold,
            sample_size,
            %context,
            "QUALITY GATE DISABLED: signal emission stopped"
        );

        let event = DisableEvent {
            reason,
            context,
            at,
        };
        let callbacks = self
            .on_disable
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for cb in callbacks {
            invoke_listener("on_disable", || cb(&event));
        }
        Ok(())
    }

    /// Re-enable after an operator has looked at the cause.
    pub async fn enable(&self, user_reason: &str) -> Result<()> {
        require_reason("user_reason", user_reason)?;
        if !self.disabled.load(Ordering::SeqCst) {
            return Err(FailsafeError::NotDisabled);
        }

        let at = self.clock.now();
        let previous_reason = {
            let mut inner = self.inner.write().await;
            let previous = inner.disable_reason.take();
            inner.disable_context = None;
            inner.disabled_at = None;
            inner.enabled_at = Some(at);
            previous
        };
        self.evaluation_count.store(0, Ordering::SeqCst);
        self.disabled.store(false, Ordering::SeqCst);

        info!(
            user_reason,
            previous = ?previous_reason,
            "Quality gate ENABLED"
        );

        let event = EnableEvent {
            user_reason: user_reason.to_string(),
            previous_reason,
            at,
        };
        let callbacks = self
            .on_enable
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        for cb in callbacks {
            invoke_listener("on_enable", || cb(&event));
        }
        Ok(())
    }

    pub fn on_disable(&self, callback: DisableCallback) {
        self.on_disable
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }

    pub fn on_enable(&self, callback: EnableCallback) {
        self.on_enable
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(callback);
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn should_allow_signal(&self) -> bool {
        !self.is_disabled()
    }

    pub fn evaluation_count(&self) -> u64 {
        self.evaluation_count.load(Ordering::SeqCst)
    }

    pub async fn get_state(&self) -> GateSnapshot {
        let inner = self.inner.read().await;
        let last_tick_ms = self.last_tick_ms.load(Ordering::SeqCst);
        GateSnapshot {
            disabled: self.is_disabled(),
            disable_reason: inner.disable_reason,
            disable_context: inner.disable_context.clone(),
            disabled_at: inner.disabled_at,
            enabled_at: inner.enabled_at,
            evaluation_count: self.evaluation_count(),
            last_accuracy: inner.last_accuracy,
            last_sample_size: inner.last_sample_size,
            last_tick_at: (last_tick_ms != 0)
                .then(|| Utc.timestamp_millis_opt(last_tick_ms).single())
                .flatten(),
            feed_monitored: self.feed_monitored.load(Ordering::SeqCst),
        }
    }

    /// Stop the tick listener and evaluation ticker.
    pub async fn shutdown(&self) {
        let handles: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            handle.abort();
            let _ = handle.await;
        }
        debug!("Quality gate shut down");
    }
}

/// Run a listener, logging its error or panic.
fn invoke_listener<F>(name: &str, f: F)
where
    F: FnOnce() -> anyhow::Result<()>,
{
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(listener = name, "Quality gate listener failed: {:#}", e),
        Err(_) => error!(listener = name, "Quality gate listener panicked"),
    }
}
