//! Position divergence detection
//!
//! Compares two independently maintained position views by id. Detection is
//! pure; `Reconciler` adds counters and the fetch-and-compare step used at
//! startup. Whether a divergence trips the breaker is the caller's decision.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, error, info, warn};

use crate::domain::{Divergence, PositionSnapshot};
use crate::error::Result;
use crate::persistence::store::PositionSource;

/// Compare memory and DB views of positions.
///
/// Emits, in order: for each memory position a `STATE_MISMATCH` per differing
/// field (`size`, then `status`) or a `MEMORY_ONLY`; then a `DB_ONLY` for each
/// DB position absent from memory.
pub fn detect_divergence(memory: &[PositionSnapshot], db: &[PositionSnapshot]) -> Vec<Divergence> {
    let db_by_id: HashMap<&str, &PositionSnapshot> =
        db.iter().map(|p| (p.id.as_str(), p)).collect();
    let mut divergences = Vec::new();

    for mem in memory {
        match db_by_id.get(mem.id.as_str()) {
            Some(stored) => {
                if mem.size != stored.size {
                    divergences.push(Divergence::mismatch(
                        &mem.id,
                        "size",
                        mem.size.to_string(),
                        stored.size.to_string(),
                    ));
                }
                if mem.status != stored.status {
                    divergences.push(Divergence::mismatch(
                        &mem.id,
                        "status",
                        mem.status.clone(),
                        stored.status.clone(),
                    ));
                }
            }
            None => divergences.push(Divergence::memory_only(mem)),
        }
    }

    let memory_ids: std::collections::HashSet<&str> =
        memory.iter().map(|p| p.id.as_str()).collect();
    divergences.extend(
        db.iter()
            .filter(|p| !memory_ids.contains(p.id.as_str()))
            .map(Divergence::db_only),
    );

    divergences
}

/// Outcome of a fetch-and-compare run
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReconcileOutcome {
    Consistent { positions: usize },
    Diverged { divergences: Vec<Divergence> },
    /// A source could not be read; nothing was compared.
    SourceUnavailable { source: String, error: String },
    /// A source returned positions that fail validation; nothing was compared.
    Malformed { source: String, errors: Vec<String> },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcilerStats {
    pub runs: u64,
    pub divergences_found: u64,
    pub source_errors: u64,
    pub malformed_positions: u64,
}

#[derive(Debug, Default)]
pub struct Reconciler {
    runs: AtomicU64,
    divergences_found: AtomicU64,
    source_errors: AtomicU64,
    malformed_positions: AtomicU64,
}

impl Reconciler {
    pub fn new() -> Self {
        Self::default()
    }

    /// `detect_divergence` plus counters.
    pub fn detect(&self, memory: &[PositionSnapshot], db: &[PositionSnapshot]) -> Vec<Divergence> {
        let divergences = detect_divergence(memory, db);
        self.runs.fetch_add(1, Ordering::Relaxed);
        self.divergences_found
            .fetch_add(divergences.len() as u64, Ordering::Relaxed);
        divergences
    }

    /// Fetch both views and compare them. A fetch failure is reported as
    /// `SourceUnavailable` and an invalid position as `Malformed`, never as
    /// a divergence.
    pub async fn reconcile_positions(
        &self,
        memory_source: &dyn PositionSource,
        db_source: &dyn PositionSource,
    ) -> ReconcileOutcome {
        let memory = match self.fetch(memory_source).await {
            Ok(p) => p,
            Err(outcome) => return outcome,
        };
        let db = match self.fetch(db_source).await {
            Ok(p) => p,
            Err(outcome) => return outcome,
        };

        let divergences = self.detect(&memory, &db);
        if divergences.is_empty() {
            info!(
                positions = memory.len(),
                left = memory_source.name(),
                right = db_source.name(),
                "Position reconciliation: consistent"
            );
            ReconcileOutcome::Consistent {
                positions: memory.len(),
            }
        } else {
            for d in &divergences {
                error!(left = memory_source.name(), right = db_source.name(), "Position divergence: {}", d);
            }
            ReconcileOutcome::Diverged { divergences }
        }
    }

    async fn fetch(
        &self,
        source: &dyn PositionSource,
    ) -> std::result::Result<Vec<PositionSnapshot>, ReconcileOutcome> {
        let fetched: Result<Vec<PositionSnapshot>> = source.fetch_positions().await;
        let positions = match fetched {
            Ok(p) => p,
            Err(e) => {
                self.source_errors.fetch_add(1, Ordering::Relaxed);
                warn!(source = source.name(), "Position fetch failed: {}", e);
                return Err(ReconcileOutcome::SourceUnavailable {
                    source: source.name().to_string(),
                    error: e.to_string(),
                });
            }
        };

        let errors: Vec<String> = positions
            .iter()
            .filter_map(|p| p.validate().err())
            .map(|e| e.to_string())
            .collect();
        if !errors.is_empty() {
            self.malformed_positions
                .fetch_add(errors.len() as u64, Ordering::Relaxed);
            for e in &errors {
                error!(source = source.name(), "Malformed position: {}", e);
            }
            return Err(ReconcileOutcome::Malformed {
                source: source.name().to_string(),
                errors,
            });
        }
        debug!(source = source.name(), count = positions.len(), "Fetched positions");
        Ok(positions)
    }

    pub fn get_state(&self) -> ReconcilerStats {
        ReconcilerStats {
            runs: self.runs.load(Ordering::Relaxed),
            divergences_found: self.divergences_found.load(Ordering::Relaxed),
            source_errors: self.source_errors.load(Ordering::Relaxed),
            malformed_positions: self.malformed_positions.load(Ordering::Relaxed),
        }
    }
}
