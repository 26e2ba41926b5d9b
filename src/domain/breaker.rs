use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Persisted circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CircuitState {
    /// Trading allowed
    Closed,
    /// Trading halted until an operator resets
    Open,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for CircuitState {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "CLOSED" => Ok(CircuitState::Closed),
            "OPEN" => Ok(CircuitState::Open),
            other => Err(format!("unknown circuit state: {}", other)),
        }
    }
}

/// Why the breaker was tripped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TripReason {
    /// In-memory, DB and exchange positions disagree
    PositionTrackingFailed,
    /// Intents were left executing by a previous process
    UnreconciledIntents,
    /// Market data or settlement could not be verified
    DataVerificationFailed,
    /// Order execution failed in a way that leaves state unknown
    ExecutionFailure,
    /// Operator halt
    Manual,
}

impl TripReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TripReason::PositionTrackingFailed => "POSITION_TRACKING_FAILED",
            TripReason::UnreconciledIntents => "UNRECONCILED_INTENTS",
            TripReason::DataVerificationFailed => "DATA_VERIFICATION_FAILED",
            TripReason::ExecutionFailure => "EXECUTION_FAILURE",
            TripReason::Manual => "MANUAL",
        }
    }
}

impl std::fmt::Display for TripReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for TripReason {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.trim().to_uppercase().replace('-', "_").as_str() {
            "POSITION_TRACKING_FAILED" => Ok(TripReason::PositionTrackingFailed),
            "UNRECONCILED_INTENTS" => Ok(TripReason::UnreconciledIntents),
            "DATA_VERIFICATION_FAILED" => Ok(TripReason::DataVerificationFailed),
            "EXECUTION_FAILURE" => Ok(TripReason::ExecutionFailure),
            "MANUAL" => Ok(TripReason::Manual),
            other => Err(format!("unknown trip reason: {}", other)),
        }
    }
}

/// Single-row breaker record as stored
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerRecord {
    pub state: CircuitState,
    pub trip_reason: Option<TripReason>,
    pub trip_context: Option<serde_json::Value>,
    pub tripped_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl BreakerRecord {
    pub fn closed(at: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Closed,
            trip_reason: None,
            trip_context: None,
            tripped_at: None,
            updated_at: at,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AuditAction {
    Trip,
    Reset,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::Trip => "TRIP",
            AuditAction::Reset => "RESET",
        }
    }
}

impl TryFrom<&str> for AuditAction {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s.to_uppercase().as_str() {
            "TRIP" => Ok(AuditAction::Trip),
            "RESET" => Ok(AuditAction::Reset),
            other => Err(format!("unknown audit action: {}", other)),
        }
    }
}

/// Append-only audit row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Option<i64>,
    pub action: AuditAction,
    pub reason: String,
    pub context: Option<serde_json::Value>,
    pub operator_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Severity tier reached while the breaker stays open
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationStage {
    Monitoring,
    Alert,
    CancelOrders,
    Shutdown,
}

/// Elapsed-time thresholds for each stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EscalationThresholds {
    pub alert_after: Duration,
    pub cancel_orders_after: Duration,
    pub shutdown_after: Duration,
}

impl Default for EscalationThresholds {
    fn default() -> Self {
        Self {
            alert_after: Duration::minutes(5),
            cancel_orders_after: Duration::minutes(15),
            shutdown_after: Duration::minutes(30),
        }
    }
}

impl EscalationStage {
    /// Stage for a breaker that has been open for `elapsed`.
    pub fn for_elapsed(elapsed: Duration, thresholds: &EscalationThresholds) -> Self {
        if elapsed >= thresholds.shutdown_after {
            EscalationStage::Shutdown
        } else if elapsed >= thresholds.cancel_orders_after {
            EscalationStage::CancelOrders
        } else if elapsed >= thresholds.alert_after {
            EscalationStage::Alert
        } else {
            EscalationStage::Monitoring
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EscalationStage::Monitoring => "monitoring",
            EscalationStage::Alert => "alert",
            EscalationStage::CancelOrders => "cancel_orders",
            EscalationStage::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for EscalationStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_boundaries() {
        let t = EscalationThresholds::default();
        assert_eq!(
            EscalationStage::for_elapsed(Duration::seconds(0), &t),
            EscalationStage::Monitoring
        );
        assert_eq!(
            EscalationStage::for_elapsed(Duration::seconds(299), &t),
            EscalationStage::Monitoring
        );
        assert_eq!(
            EscalationStage::for_elapsed(Duration::minutes(5), &t),
            EscalationStage::Alert
        );
        assert_eq!(
            EscalationStage::for_elapsed(Duration::minutes(15), &t),
            EscalationStage::CancelOrders
        );
        assert_eq!(
            EscalationStage::for_elapsed(Duration::minutes(30), &t),
            EscalationStage::Shutdown
        );
        assert_eq!(
            EscalationStage::for_elapsed(Duration::hours(6), &t),
            EscalationStage::Shutdown
        );
    }

    #[test]
    fn test_trip_reason_parse() {
        assert_eq!(
            TripReason::try_from("position_tracking_failed").unwrap(),
            TripReason::PositionTrackingFailed
        );
        assert_eq!(TripReason::try_from("manual").unwrap(), TripReason::Manual);
        assert!(TripReason::try_from("bogus").is_err());
    }

    #[test]
    fn test_trip_reason_serializes_screaming_snake() {
        let json = serde_json::to_string(&TripReason::PositionTrackingFailed).unwrap();
        assert_eq!(json, "\"POSITION_TRACKING_FAILED\"");
    }
}
