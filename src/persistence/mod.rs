//! Persistence layer for crash safety
//!
//! - Store traits consumed by every failsafe component
//! - Write-ahead intent log for in-flight trade actions
//! - Position reconciler for startup divergence checks

pub mod intent_log;
pub mod reconciler;
pub mod store;

pub use intent_log::{IntentLog, IntentLogConfig, IntentLogSnapshot, IntentLogStats, StartupCheck};
pub use reconciler::{detect_divergence, ReconcileOutcome, Reconciler, ReconcilerStats};
pub use store::{BreakerStore, IntentStore, LockStore, PositionSource, SignalStore};
