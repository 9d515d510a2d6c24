//! Request and response types for the ranking engine.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::EngineError;
use crate::forbidden::{ensure_allowed, ensure_allowed_json};
use crate::grading::Grade;

/// Persistent registration id of a competitor.
///
/// Never a race-scoped program number.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CompetitorId(String);

impl CompetitorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Empty and "0" ids are placeholders for an unknown registration.
    pub fn is_missing(&self) -> bool {
        let id = self.0.trim();
        id.is_empty() || id == "0"
    }
}

impl fmt::Display for CompetitorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Non-forbidden race metadata
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RaceMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub surface: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distance: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
}

/// Entrant in an inference request
#[derive(Debug, Clone, Deserialize)]
pub struct EntrantRequest {
    pub competitor_id: CompetitorId,
    /// Display and tie-break only
    pub program_number: u32,
    #[serde(default)]
    pub features: BTreeMap<String, f64>,
    /// Unrecognized fields are kept so they can be screened, never dropped
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Per-race inference request
#[derive(Debug, Clone, Deserialize)]
pub struct RaceRequest {
    pub race_id: String,
    #[serde(default)]
    pub surface: Option<String>,
    #[serde(default)]
    pub distance: Option<u32>,
    #[serde(default)]
    pub condition: Option<String>,
    pub entrants: Vec<EntrantRequest>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Captured unknown fields are screened down to their nested keys.
fn screen_extra(extra: &BTreeMap<String, serde_json::Value>, origin: &str) -> Result<(), EngineError> {
    for (key, value) in extra {
        ensure_allowed([key.as_str()], origin)?;
        ensure_allowed_json(value, origin)?;
    }
    Ok(())
}

impl RaceRequest {
    pub fn meta(&self) -> RaceMeta {
        RaceMeta {
            surface: self.surface.clone(),
            distance: self.distance,
            condition: self.condition.clone(),
        }
    }

    /// Reject market-derived fields and malformed entrant lists.
    pub fn validate(&self) -> Result<(), EngineError> {
        let origin = format!("request for race {}", self.race_id);
        screen_extra(&self.extra, &origin)?;
        for entrant in &self.entrants {
            ensure_allowed(entrant.features.keys().map(String::as_str), &origin)?;
            screen_extra(&entrant.extra, &origin)?;
        }

        if self.entrants.is_empty() {
            return Err(EngineError::InvalidRace {
                race_id: self.race_id.clone(),
                reason: "no entrants".to_string(),
            });
        }

        let mut numbers = BTreeSet::new();
        let mut competitors = BTreeSet::new();
        for entrant in &self.entrants {
            if !numbers.insert(entrant.program_number) {
                return Err(EngineError::InvalidRace {
                    race_id: self.race_id.clone(),
                    reason: format!("duplicate program number {}", entrant.program_number),
                });
            }
            if !entrant.competitor_id.is_missing() && !competitors.insert(&entrant.competitor_id) {
                return Err(EngineError::InvalidRace {
                    race_id: self.race_id.clone(),
                    reason: format!("competitor {} entered twice", entrant.competitor_id),
                });
            }
        }
        Ok(())
    }
}

/// Per-entrant inference result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntrantPrediction {
    pub competitor_id: CompetitorId,
    pub program_number: u32,
    pub skill: f64,
    pub win_raw: f64,
    pub place_raw: f64,
    pub win_cal: f64,
    pub place_cal: f64,
    pub predicted_rank: usize,
    pub grade: Grade,
}

/// Per-race inference result, entrants in program-number order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RacePrediction {
    pub race_id: String,
    #[serde(default)]
    pub meta: RaceMeta,
    pub entrants: Vec<EntrantPrediction>,
    pub inference_converged: bool,
    pub inference_iterations: usize,
    /// SHA-256 of the grade assignment
    pub grading_hash: String,
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Model info response
#[derive(Debug, Serialize)]
pub struct ModelInfoResponse {
    pub model_path: String,
    pub competitors: usize,
    pub alpha: f64,
    pub converged: bool,
    pub iterations: usize,
    pub calibrated: bool,
}

/// API error response
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}
