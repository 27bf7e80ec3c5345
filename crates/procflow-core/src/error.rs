//! Error taxonomy.
//!
//! Only [`DerivationError`] ever leaves an engine. Everything a collaborator
//! can do wrong is a [`CollaboratorError`], which the owning engine turns into
//! a recorded [`Degradation`] on the affected item.

use crate::config::ConfigError;
use crate::state::Stage;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Failure of an external collaborator call (search, select, unit lookup,
/// density estimation, text generation, validation, publication).
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CollaboratorError {
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout { operation: String, timeout_ms: u64 },
    #[error("transport error: {0}")]
    Transport(String),
    #[error("invalid response: {0}")]
    InvalidResponse(String),
    #[error("collaborator unavailable: {0}")]
    Unavailable(String),
}

impl CollaboratorError {
    /// Unavailable collaborators are not worth retrying.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, CollaboratorError::Unavailable(_))
    }
}

/// Recoverable conditions. Each one is recorded as a reason on the
/// exchange/process it affected and never propagates past its engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Degradation {
    #[serde(rename = "collaborator_unavailable")]
    CollaboratorUnavailable,
    #[serde(rename = "no_candidates")]
    NoCandidatesFound,
    #[serde(rename = "rejected_by_selector")]
    SelectionRejected,
    #[serde(rename = "unit_dimension_mismatch")]
    UnitDimensionMismatch,
    #[serde(rename = "unknown_unit_dimension")]
    UnknownUnitDimension,
    #[serde(rename = "missing_unit")]
    MissingUnit,
    #[serde(rename = "density_estimation_failed")]
    DensityEstimationFailed,
    #[serde(rename = "insufficient_balance_data")]
    InsufficientBalanceData,
}

impl Degradation {
    pub fn code(self) -> &'static str {
        match self {
            Degradation::CollaboratorUnavailable => "collaborator_unavailable",
            Degradation::NoCandidatesFound => "no_candidates",
            Degradation::SelectionRejected => "rejected_by_selector",
            Degradation::UnitDimensionMismatch => "unit_dimension_mismatch",
            Degradation::UnknownUnitDimension => "unknown_unit_dimension",
            Degradation::MissingUnit => "missing_unit",
            Degradation::DensityEstimationFailed => "density_estimation_failed",
            Degradation::InsufficientBalanceData => "insufficient_balance_data",
        }
    }
}

impl fmt::Display for Degradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

/// Fatal errors returned by [`crate::Pipeline::advance`].
#[derive(Debug, thiserror::Error)]
pub enum DerivationError {
    /// Adjacent processes of a route do not chain, or the terminal process
    /// does not produce/treat the reference flow.
    #[error(
        "schedule boundary violation in route {route_id}: {upstream} -> {downstream}: {detail}"
    )]
    ScheduleBoundaryViolation {
        route_id: String,
        upstream: String,
        downstream: String,
        detail: String,
    },
    #[error("stage {requested} requires stage {missing} to complete first")]
    StageOrder { requested: Stage, missing: Stage },
    #[error("evidence gathering already concluded after {iterations} iteration(s)")]
    EvidenceLoopConcluded { iterations: usize },
    #[error("no unit processes planned for route {0}")]
    EmptyRoute(String),
    #[error("invalid reference flow document: {0}")]
    InvalidReferenceFlow(String),
    #[error("stage observer failed after {stage}: {message}")]
    Checkpoint { stage: Stage, message: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
}
