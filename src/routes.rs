//! API route handlers.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;

use crate::calibration::Calibrator;
use crate::config::AppConfig;
use crate::error::EngineError;
use crate::model::SharedModel;
use crate::pipeline::RacePredictor;
use crate::types::{ErrorResponse, HealthResponse, ModelInfoResponse, RacePrediction, RaceRequest};

/// Application state shared across handlers.
pub struct AppState {
    pub model: SharedModel,
    pub config: AppConfig,
    pub calibrator: Calibrator,
}

/// Error type for API handlers.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
        }
    }

    pub fn unprocessable(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: msg.into(),
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
        }
    }
}

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        match err {
            EngineError::ForbiddenInput { .. } => ApiError::unprocessable(err.to_string()),
            EngineError::InvalidRace { .. } => ApiError::bad_request(err.to_string()),
            _ => ApiError::internal(err.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorResponse {
            error: self.status.to_string(),
            message: self.message,
        });
        (self.status, body).into_response()
    }
}

/// Health check endpoint.
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Model info endpoint.
pub async fn model_info(State(state): State<Arc<AppState>>) -> Json<ModelInfoResponse> {
    Json(ModelInfoResponse {
        model_path: state.config.model.path.clone(),
        competitors: state.model.len(),
        alpha: state.model.alpha,
        converged: state.model.converged,
        iterations: state.model.iterations,
        calibrated: state.calibrator.is_enabled(),
    })
}

/// Prediction endpoint.
pub async fn predict(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RaceRequest>,
) -> Result<Json<RacePrediction>, ApiError> {
    let predictor = RacePredictor::new(&state.model, &state.calibrator, &state.config.engine);
    let prediction = predictor.predict_request(&req).map_err(|e| {
        tracing::warn!("Rejected race {}: {}", req.race_id, e);
        ApiError::from(e)
    })?;

    tracing::info!(
        "Predicted race {} ({} entrants)",
        prediction.race_id,
        prediction.entrants.len()
    );
    Ok(Json(prediction))
}
