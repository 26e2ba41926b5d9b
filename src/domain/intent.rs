use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of risky action recorded ahead of time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    OpenPosition,
    ClosePosition,
    PlaceOrder,
    CancelOrder,
    Redeem,
}

impl IntentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentType::OpenPosition => "open_position",
            IntentType::ClosePosition => "close_position",
            IntentType::PlaceOrder => "place_order",
            IntentType::CancelOrder => "cancel_order",
            IntentType::Redeem => "redeem",
        }
    }
}

impl std::fmt::Display for IntentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for IntentType {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "open_position" => Ok(IntentType::OpenPosition),
            "close_position" => Ok(IntentType::ClosePosition),
            "place_order" => Ok(IntentType::PlaceOrder),
            "cancel_order" => Ok(IntentType::CancelOrder),
            "redeem" => Ok(IntentType::Redeem),
            other => Err(format!("unknown intent type: {}", other)),
        }
    }
}

/// Intent status: pending -> executing -> completed | failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentStatus {
    Pending,
    Executing,
    Completed,
    Failed,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Executing => "executing",
            IntentStatus::Completed => "completed",
            IntentStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, IntentStatus::Completed | IntentStatus::Failed)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: IntentStatus) -> bool {
        matches!(
            (self, next),
            (IntentStatus::Pending, IntentStatus::Executing)
                | (IntentStatus::Executing, IntentStatus::Completed)
                | (IntentStatus::Executing, IntentStatus::Failed)
        )
    }
}

impl std::fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl TryFrom<&str> for IntentStatus {
    type Error = String;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        match s {
            "pending" => Ok(IntentStatus::Pending),
            "executing" => Ok(IntentStatus::Executing),
            "completed" => Ok(IntentStatus::Completed),
            "failed" => Ok(IntentStatus::Failed),
            other => Err(format!("unknown intent status: {}", other)),
        }
    }
}

/// Write-ahead log entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeIntent {
    pub id: i64,
    pub intent_type: IntentType,
    pub window_id: String,
    pub payload: serde_json::Value,
    pub status: IntentStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub result: Option<serde_json::Value>,
}

/// Fields needed to insert a new intent
#[derive(Debug, Clone)]
pub struct NewIntent {
    pub intent_type: IntentType,
    pub window_id: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// Outcome of an atomic reconcile attempt at the store
#[derive(Debug, Clone, PartialEq)]
pub enum ReconcileAttempt {
    Reconciled,
    NotFound,
    WrongStatus(IntentStatus),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions_are_strict() {
        use IntentStatus::*;
        assert!(Pending.can_transition_to(Executing));
        assert!(Executing.can_transition_to(Completed));
        assert!(Executing.can_transition_to(Failed));
        assert!(!Pending.can_transition_to(Completed));
        assert!(!Pending.can_transition_to(Failed));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Executing));
        assert!(!Executing.can_transition_to(Pending));
    }

    #[test]
    fn test_intent_type_roundtrip_names() {
        for t in [
            IntentType::OpenPosition,
            IntentType::ClosePosition,
            IntentType::PlaceOrder,
            IntentType::CancelOrder,
            IntentType::Redeem,
        ] {
            assert_eq!(IntentType::try_from(t.as_str()).unwrap(), t);
        }
    }
}
