//! Signal-level safety checks

pub mod quality_gate;

pub use quality_gate::{
    DisableCallback, DisableEvent, DisableReason, EnableCallback, EnableEvent, Evaluation,
    GateSnapshot, QualityGate, QualityGateConfig,
};
