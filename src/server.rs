//! HTTP transport: one multipart frame in, one prediction out.

use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error};

use crate::service::PredictionService;
use crate::types::{Frame, Mode, Prediction};

/// Label shown when there is nothing to report.
pub const PLACEHOLDER: &str = "...";

const MAX_UPLOAD_BYTES: usize = 16 * 1024 * 1024;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("image is required")]
    MissingImage,
    #[error("bad image")]
    BadImage,
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            ApiError::MissingImage | ApiError::BadImage | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(serde_json::json!({ "error": self.to_string() }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
pub struct DetectQuery {
    #[serde(default = "default_mode")]
    pub mode: String,
}

fn default_mode() -> String {
    Mode::Letters.as_str().to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectResponse {
    pub label: String,
    pub confidence: f32,
    pub mode: String,
}

impl DetectResponse {
    pub fn from_prediction(prediction: Prediction, mode: &str) -> Self {
        match prediction.label {
            Some(label) => Self {
                label,
                confidence: prediction.confidence,
                mode: mode.to_string(),
            },
            None => Self::placeholder(mode),
        }
    }

    pub fn placeholder(mode: &str) -> Self {
        Self {
            label: PLACEHOLDER.to_string(),
            confidence: 0.0,
            mode: mode.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub letters: bool,
    pub gestures: bool,
}

pub fn router(service: Arc<PredictionService>) -> Router {
    Router::new()
        .route("/detect", post(detect))
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
        .with_state(service)
}

async fn health(State(service): State<Arc<PredictionService>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        ok: true,
        letters: service.is_enabled(Mode::Letters),
        gestures: service.is_enabled(Mode::Gestures),
    })
}

async fn detect(
    State(service): State<Arc<PredictionService>>,
    Query(query): Query<DetectQuery>,
    mut multipart: Multipart,
) -> Result<Json<DetectResponse>, ApiError> {
    let mut image = None;
    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::BadRequest(e.body_text()))?
    {
        if field.name() == Some("image") {
            image = Some(
                field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::BadRequest(e.body_text()))?,
            );
            break;
        }
    }
    let bytes = image.ok_or(ApiError::MissingImage)?;
    let frame = decode_frame(&bytes)?;

    let mode = match query.mode.parse::<Mode>() {
        Ok(mode) if service.is_enabled(mode) => mode,
        _ => {
            debug!("mode '{}' unavailable, returning placeholder", query.mode);
            return Ok(Json(DetectResponse::placeholder(&query.mode)));
        }
    };

    let prediction = tokio::task::spawn_blocking(move || service.predict(mode, &frame))
        .await
        .map_err(|e| ApiError::Internal(format!("prediction task failed: {}", e)))?
        .map_err(|e| {
            error!("{} prediction failed: {:#}", mode, e);
            ApiError::Internal(format!("{:#}", e))
        })?;

    Ok(Json(DetectResponse::from_prediction(prediction, mode.as_str())))
}

fn decode_frame(bytes: &[u8]) -> Result<Frame, ApiError> {
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| {
            debug!("rejecting upload: {}", e);
            ApiError::BadImage
        })
}
