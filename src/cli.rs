use clap::{Parser, Subcommand};
use serde_json::json;
use std::sync::Arc;

use crate::adapters::PostgresStore;
use crate::config::AppConfig;
use crate::coordination::CircuitBreaker;
use crate::domain::{IntentStatus, TripReason};
use crate::error::{FailsafeError, Result};
use crate::persistence::store::{IntentStore, LockStore};
use crate::persistence::IntentLog;

#[derive(Parser)]
#[command(name = "ploy-failsafe")]
#[command(version)]
#[command(about = "Halt-on-uncertainty failsafe for the ploy trading engine", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Config directory (default.toml + $FAILSAFE_ENV.toml)
    #[arg(short, long, default_value = "config")]
    pub config: String,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the failsafe supervisor until SIGTERM/SIGINT
    Run {
        /// Use the in-process store instead of PostgreSQL (paper testing)
        #[arg(long)]
        memory: bool,
    },
    /// Show breaker, lock and incomplete intents
    Status,
    /// Manually trip the circuit breaker
    Trip {
        /// Free-form note stored in the trip context
        #[arg(short, long)]
        note: String,
    },
    /// Reset the circuit breaker (refused while orders are active)
    Reset {
        /// Operator identity recorded in the audit log
        #[arg(short, long, env = "FAILSAFE_OPERATOR")]
        operator: String,
        /// Why trading may resume
        #[arg(short, long)]
        reason: String,
    },
    /// List intents in a given status
    Intents {
        #[arg(short, long, default_value = "executing")]
        status: String,
    },
    /// Close out an executing intent after manual verification
    ReconcileIntent {
        id: i64,
        #[arg(short, long)]
        resolution: String,
    },
    /// Delete terminal intents older than the retention period
    PruneIntents {
        /// Override intent_log.retention_days
        #[arg(long)]
        days: Option<u32>,
    },
}

pub async fn connect(config: &AppConfig) -> Result<Arc<PostgresStore>> {
    let store = PostgresStore::new(&config.database.url, config.database.max_connections).await?;
    store.migrate().await?;
    Ok(Arc::new(store))
}

async fn breaker(config: &AppConfig, store: Arc<PostgresStore>) -> Result<Arc<CircuitBreaker>> {
    let cb = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone(), store));
    cb.init().await?;
    Ok(cb)
}

fn intent_log(config: &AppConfig, store: Arc<PostgresStore>) -> Result<IntentLog> {
    let log = IntentLog::new(config.intent_log.clone(), store);
    log.init()?;
    Ok(log)
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub async fn show_status(config: &AppConfig) -> Result<()> {
    let store = connect(config).await?;
    let cb = breaker(config, store.clone()).await?;
    let open = cb.is_open().await;
    let state = cb.get_state().await;
    let lock = store.read_lock(&config.instance_lock.lock_name).await?;
    let executing = store.intents_with_status(IntentStatus::Executing).await?;
    let audit = cb.audit_log(5).await?;
    cb.shutdown().await;

    print_json(&json!({
        "circuit_breaker": {
            "open": open,
            "state": state,
        },
        "instance_lock": lock,
        "incomplete_intents": executing,
        "recent_audit": audit,
    }))
}

pub async fn trip(config: &AppConfig, note: &str) -> Result<()> {
    let store = connect(config).await?;
    let cb = breaker(config, store).await?;
    let outcome = cb
        .trip(TripReason::Manual, json!({ "note": note, "source": "cli" }))
        .await?;
    cb.shutdown().await;
    println!("trip: {:?}", outcome);
    Ok(())
}

pub async fn reset(config: &AppConfig, operator: &str, reason: &str) -> Result<()> {
    let store = connect(config).await?;
    let cb = breaker(config, store).await?;
    let result = cb.reset(operator, reason).await;
    cb.shutdown().await;
    result?;
    println!("circuit breaker reset by {}", operator);
    Ok(())
}

pub async fn list_intents(config: &AppConfig, status: &str) -> Result<()> {
    let status = IntentStatus::try_from(status).map_err(FailsafeError::InvalidReason)?;
    let store = connect(config).await?;
    let intents = store.intents_with_status(status).await?;
    print_json(&serde_json::to_value(&intents)?)
}

pub async fn reconcile_intent(config: &AppConfig, id: i64, resolution: &str) -> Result<()> {
    let store = connect(config).await?;
    let log = intent_log(config, store)?;
    log.mark_intent_reconciled(id, resolution).await?;
    println!("intent {} reconciled", id);
    Ok(())
}

pub async fn prune_intents(config: &AppConfig, days: Option<u32>) -> Result<()> {
    let store = connect(config).await?;
    let log = intent_log(config, store)?;
    let retention = match days {
        Some(d) => chrono::Duration::days(d as i64),
        None => log.config().retention(),
    };
    let deleted = log.prune(retention).await?;
    println!("pruned {} intent(s)", deleted);
    Ok(())
}
