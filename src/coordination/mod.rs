//! Coordination layer for halting on uncertainty
//!
//! - Persistent circuit breaker with time-based escalation
//! - Distributed instance lock electing one active trader
//! - Startup sequence and the `Failsafe` facade tying them together
//! - Graceful shutdown handling

pub mod circuit_breaker;
pub mod failsafe;
pub mod instance_lock;
pub mod shutdown;
pub mod startup;

pub use circuit_breaker::{BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, TripOutcome};
pub use failsafe::{Failsafe, FailsafeBuilder, FailsafeStatus};
pub use instance_lock::{InstanceLock, InstanceLockConfig, LockSnapshot};
pub use shutdown::{GracefulShutdown, Orchestrator, ShutdownSignal};
pub use startup::{run_startup, StartupReport};
