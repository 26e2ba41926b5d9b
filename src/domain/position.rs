use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{FailsafeError, Result};

/// One side's view of a position, reduced to the fields that are compared
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionSnapshot {
    pub id: String,
    pub size: Decimal,
    pub status: String,
}

impl PositionSnapshot {
    pub fn new(id: impl Into<String>, size: Decimal, status: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            size,
            status: status.into(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(FailsafeError::InvalidPosition(
                "position id must not be empty".to_string(),
            ));
        }
        if self.size.is_sign_negative() {
            return Err(FailsafeError::InvalidPosition(format!(
                "position {} has negative size {}",
                self.id, self.size
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DivergenceKind {
    /// Present in memory, missing in the DB
    MemoryOnly,
    /// Present in the DB, missing in memory
    DbOnly,
    /// Present in both with a differing tracked field
    StateMismatch,
}

impl std::fmt::Display for DivergenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DivergenceKind::MemoryOnly => write!(f, "MEMORY_ONLY"),
            DivergenceKind::DbOnly => write!(f, "DB_ONLY"),
            DivergenceKind::StateMismatch => write!(f, "STATE_MISMATCH"),
        }
    }
}

/// A mismatch between two views of the same position
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Divergence {
    #[serde(rename = "type")]
    pub kind: DivergenceKind,
    pub position_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory_state: Option<PositionSnapshot>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub db_state: Option<PositionSnapshot>,
}

impl Divergence {
    pub fn memory_only(position: &PositionSnapshot) -> Self {
        Self {
            kind: DivergenceKind::MemoryOnly,
            position_id: position.id.clone(),
            field: None,
            memory_value: None,
            db_value: None,
            memory_state: Some(position.clone()),
            db_state: None,
        }
    }

    pub fn db_only(position: &PositionSnapshot) -> Self {
        Self {
            kind: DivergenceKind::DbOnly,
            position_id: position.id.clone(),
            field: None,
            memory_value: None,
            db_value: None,
            memory_state: None,
            db_state: Some(position.clone()),
        }
    }

    pub fn mismatch(position_id: &str, field: &str, memory: String, db: String) -> Self {
        Self {
            kind: DivergenceKind::StateMismatch,
            position_id: position_id.to_string(),
            field: Some(field.to_string()),
            memory_value: Some(memory),
            db_value: Some(db),
            memory_state: None,
            db_state: None,
        }
    }
}

impl std::fmt::Display for Divergence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.kind {
            DivergenceKind::StateMismatch => write!(
                f,
                "{} position {} field {}: memory={} db={}",
                self.kind,
                self.position_id,
                self.field.as_deref().unwrap_or("?"),
                self.memory_value.as_deref().unwrap_or("-"),
                self.db_value.as_deref().unwrap_or("-"),
            ),
            _ => write!(f, "{} position {}", self.kind, self.position_id),
        }
    }
}
