pub mod adapters;
pub mod cli;
pub mod clock;
pub mod config;
pub mod coordination;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod persistence;
pub mod safety;

pub use adapters::{MemoryStore, PostgresStore};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{AppConfig, TradingMode};
pub use coordination::{
    run_startup, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, Failsafe,
    FailsafeBuilder, FailsafeStatus, GracefulShutdown, InstanceLock, InstanceLockConfig,
    LockSnapshot, Orchestrator, ShutdownSignal, StartupReport, TripOutcome,
};
pub use error::{FailsafeError, Result};
pub use exchange::{BroadcastTickFeed, OrderManager, TickFeed};
pub use persistence::{
    detect_divergence, BreakerStore, IntentLog, IntentLogConfig, IntentStore, LockStore,
    PositionSource, ReconcileOutcome, Reconciler, SignalStore, StartupCheck,
};
pub use safety::{DisableReason, Evaluation, QualityGate, QualityGateConfig};
