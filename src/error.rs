//! Typed errors and recoverable warnings for the ranking engine.
//!
//! Fatal conditions are `EngineError`s and abort the triggering operation.
//! Recoverable conditions are `EngineWarning` values that travel with the
//! result into the model and audit artifacts.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::corpus::Split;

/// Fatal engine errors.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// A market-derived field (odds, popularity) reached the engine.
    #[error("forbidden input field `{field}` in {origin}")]
    ForbiddenInput { field: String, origin: String },

    /// A race id was assigned to more than one split.
    #[error("split leakage: race {race_id} is assigned to both {first} and {second}")]
    SplitLeakage {
        race_id: String,
        first: Split,
        second: Split,
    },

    #[error("invalid race {race_id}: {reason}")]
    InvalidRace { race_id: String, reason: String },

    #[error("invalid calibration data: {0}")]
    InvalidCalibration(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Which iterative procedure ran out of budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SkillEstimation,
    Inference,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::SkillEstimation => write!(f, "skill_estimation"),
            Stage::Inference => write!(f, "inference"),
        }
    }
}

/// Recoverable conditions recorded in the artifacts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineWarning {
    /// Iteration budget exhausted; the best-so-far result was returned.
    NonConvergence {
        stage: Stage,
        /// Race id for inference, "corpus" for skill estimation.
        scope: String,
        iterations: usize,
    },
    /// Fewer than two valid finishers; excluded from the likelihood.
    DegenerateRace {
        race_id: String,
        valid_finishers: usize,
    },
    /// Post-calibration error is implausibly low for held-out data.
    CalibrationSuspect {
        target: String,
        ece_after: f64,
        threshold: f64,
    },
}

impl fmt::Display for EngineWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineWarning::NonConvergence {
                stage,
                scope,
                iterations,
            } => write!(
                f,
                "{} did not converge for {} within {} iterations",
                stage, scope, iterations
            ),
            EngineWarning::DegenerateRace {
                race_id,
                valid_finishers,
            } => write!(
                f,
                "race {} has {} valid finisher(s), excluded from training",
                race_id, valid_finishers
            ),
            EngineWarning::CalibrationSuspect {
                target,
                ece_after,
                threshold,
            } => write!(
                f,
                "{} calibration ECE {:.5} is below {:.5}; re-verify race-level split",
                target, ece_after, threshold
            ),
        }
    }
}
