//! Startup sequence
//!
//! 1. acquire the instance lock
//! 2. (active) scan the intent log for `executing` leftovers
//! 3. (active, LIVE) compare exchange positions with the DB
//!
//! A divergence or a malformed position trips the breaker with
//! `POSITION_TRACKING_FAILED`, and so does LIVE mode with no exchange source.
//! A failed fetch does not: the comparison never happened.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info};

use crate::coordination::circuit_breaker::TripOutcome;
use crate::coordination::failsafe::Failsafe;
use crate::domain::{InstanceRole, TripReason};
use crate::error::Result;
use crate::persistence::intent_log::StartupCheck;
use crate::persistence::reconciler::ReconcileOutcome;
use crate::persistence::store::PositionSource;

#[derive(Debug, Clone, Serialize)]
pub struct StartupReport {
    pub instance_id: String,
    pub role: InstanceRole,
    pub intent_check: Option<StartupCheck>,
    pub reconciliation: Option<ReconcileOutcome>,
    pub trips: Vec<(TripReason, TripOutcome)>,
    pub completed_at: DateTime<Utc>,
}

impl StartupReport {
    pub fn is_clean(&self) -> bool {
        self.trips.is_empty()
            && self.intent_check.as_ref().map(|c| c.clean).unwrap_or(true)
            && !matches!(
                self.reconciliation,
                Some(ReconcileOutcome::Diverged { .. } | ReconcileOutcome::Malformed { .. })
            )
    }
}

/// Run the startup sequence against an initialized `Failsafe`.
///
/// `db_positions` is the persisted view; `exchange` is the authoritative one
/// and is only consulted in LIVE mode.
pub async fn run_startup(
    failsafe: &Failsafe,
    db_positions: &dyn PositionSource,
    exchange: Option<&dyn PositionSource>,
) -> Result<StartupReport> {
    let role = failsafe.lock().init().await?;
    let mut report = StartupReport {
        instance_id: failsafe.lock().instance_id().to_string(),
        role,
        intent_check: None,
        reconciliation: None,
        trips: Vec::new(),
        completed_at: Utc::now(),
    };

    if role == InstanceRole::Observer {
        info!(instance = %report.instance_id, "Startup complete as observer-only");
        return Ok(report);
    }

    match failsafe.intents().check_startup_state().await {
        Ok(check) => {
            if !check.clean && failsafe.intents().config().trip_on_incomplete {
                let ids: Vec<i64> = check.incomplete_intents.iter().map(|i| i.id).collect();
                let outcome = failsafe
                    .breaker()
                    .trip(
                        TripReason::UnreconciledIntents,
                        serde_json::json!({
                            "incomplete_count": check.incomplete_count,
                            "intent_ids": ids,
                        }),
                    )
                    .await?;
                report.trips.push((TripReason::UnreconciledIntents, outcome));
            }
            report.intent_check = Some(check);
        }
        Err(e) => {
            error!("Intent startup check failed: {}", e);
        }
    }

    if failsafe.mode().is_live() {
        match exchange {
            Some(exchange) => {
                let outcome = failsafe
                    .reconciler()
                    .reconcile_positions(exchange, db_positions)
                    .await;
                let context = match &outcome {
                    ReconcileOutcome::Diverged { divergences } => {
                        error!(
                            count = divergences.len(),
                            "Startup position reconciliation found divergences"
                        );
                        Some(serde_json::json!({
                            "source": exchange.name(),
                            "divergences": divergences,
                        }))
                    }
                    ReconcileOutcome::Malformed { source, errors } => {
                        error!(%source, count = errors.len(), "Startup positions failed validation");
                        Some(serde_json::json!({
                            "source": source,
                            "malformed": errors,
                        }))
                    }
                    _ => None,
                };
                if let Some(context) = context {
                    let trip = failsafe
                        .breaker()
                        .trip(TripReason::PositionTrackingFailed, context)
                        .await?;
                    report.trips.push((TripReason::PositionTrackingFailed, trip));
                }
                report.reconciliation = Some(outcome);
            }
            None => {
                error!("LIVE mode without an exchange position source; positions unverified");
                let trip = failsafe
                    .breaker()
                    .trip(
                        TripReason::PositionTrackingFailed,
                        serde_json::json!({ "reason": "no exchange source" }),
                    )
                    .await?;
                report.trips.push((TripReason::PositionTrackingFailed, trip));
            }
        }
    }

    report.completed_at = Utc::now();
    info!(
        instance = %report.instance_id,
        role = %report.role,
        clean = report.is_clean(),
        "Startup sequence complete"
    );
    Ok(report)
}
