use thiserror::Error;

/// Main error type for the failsafe layer
#[derive(Error, Debug)]
pub enum FailsafeError {
    // Usage errors
    #[error("{component} used before init()")]
    NotInitialized { component: &'static str },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid reason: {0}")]
    InvalidReason(String),

    #[error("Invalid position: {0}")]
    InvalidPosition(String),

    #[error("Invalid price: {0}")]
    InvalidPrice(String),

    // Operator actions refused by current state
    #[error("Reset blocked: {active_orders} active order(s) must be closed or verified first")]
    ResetBlocked { active_orders: i64 },

    #[error("Quality gate is already disabled")]
    AlreadyDisabled,

    #[error("Quality gate is not disabled")]
    NotDisabled,

    // Intent log preconditions
    #[error("Intent {id} not found")]
    IntentNotFound { id: i64 },

    #[error("Intent {id} has status '{actual}', expected '{expected}'")]
    InvalidIntentStatus {
        id: i64,
        expected: String,
        actual: String,
    },

    // Store errors
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl FailsafeError {
    /// True for failures of the underlying store or transport, as opposed to
    /// usage errors raised by the caller.
    pub fn is_store_error(&self) -> bool {
        matches!(
            self,
            FailsafeError::StoreUnavailable(_) | FailsafeError::Database(_) | FailsafeError::Io(_)
        )
    }
}

/// Result type alias for FailsafeError
pub type Result<T> = std::result::Result<T, FailsafeError>;

/// Reject empty or whitespace-only operator input.
pub fn require_reason(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(FailsafeError::InvalidReason(format!(
            "{} must be a non-empty string",
            field
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_require_reason_rejects_blank() {
        assert!(require_reason("operator_id", "").is_err());
        assert!(require_reason("operator_id", "   \t").is_err());
        assert!(require_reason("operator_id", "alice").is_ok());
    }

    #[test]
    fn test_reset_blocked_reports_count() {
        let err = FailsafeError::ResetBlocked { active_orders: 3 };
        assert!(err.to_string().contains("3 active order(s)"));
    }

    #[test]
    fn test_store_error_classification() {
        assert!(FailsafeError::StoreUnavailable("down".into()).is_store_error());
        assert!(!FailsafeError::AlreadyDisabled.is_store_error());
        assert!(!FailsafeError::InvalidReason("x".into()).is_store_error());
    }
}
