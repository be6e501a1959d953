use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use std::fmt::Display;

use crate::services::lifecycle::MapStatus;

/// Failures raised by the map pipeline.
///
/// Precondition variants leave the map untouched; only `ExternalToolFailure`
/// raised during a warp moves a map to `failed`.
#[derive(Debug, thiserror::Error)]
pub enum WarpError {
    #[error("map has {hard} hard control points; at least 3 are required to rectify")]
    InsufficientControlPoints { hard: usize },
    #[error("map is currently being rectified")]
    Busy,
    #[error("map is {status} and cannot be modified until it is unpublished")]
    Locked { status: MapStatus },
    #[error("no mask has been saved for this map")]
    MaskNotFound,
    #[error("unsupported alignment direction: {0}")]
    UnsupportedAlignment(String),
    #[error("{tool} failed: {diagnostic}")]
    ExternalToolFailure { tool: String, diagnostic: String },
    #[error("{0} not found")]
    NotFound(String),
    #[error("map raster is {status} and not ready yet")]
    Unavailable { status: MapStatus },
    #[error("cannot move map from {from} to {to}")]
    InvalidTransition { from: MapStatus, to: MapStatus },
    #[error("{0}")]
    InvalidInput(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl WarpError {
    pub fn tool(tool: impl Into<String>, diagnostic: impl Into<String>) -> Self {
        Self::ExternalToolFailure {
            tool: tool.into(),
            diagnostic: diagnostic.into(),
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            WarpError::InsufficientControlPoints { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            WarpError::Busy | WarpError::Locked { .. } => StatusCode::CONFLICT,
            WarpError::Unavailable { .. } | WarpError::InvalidTransition { .. } => {
                StatusCode::CONFLICT
            }
            WarpError::MaskNotFound | WarpError::UnsupportedAlignment(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            WarpError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            WarpError::NotFound(_) => StatusCode::NOT_FOUND,
            WarpError::ExternalToolFailure { .. } => StatusCode::BAD_GATEWAY,
            WarpError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl From<WarpError> for AppError {
    fn from(err: WarpError) -> Self {
        let status = err.status_code();
        match err {
            WarpError::Internal(inner) => internal_error(inner),
            WarpError::ExternalToolFailure { tool, diagnostic } => {
                tracing::warn!(tool = %tool, "external tool failure surfaced to caller");
                // Raw tool output is returned as-is for diagnosis.
                Self::new(status, diagnostic)
            }
            other => Self::new(status, other.to_string()),
        }
    }
}

#[derive(serde::Serialize)]
struct FailBody<'a> {
    stat: &'static str,
    message: &'a str,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = FailBody {
            stat: "fail",
            message: &self.message,
        };
        (self.status, Json(body)).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;

pub fn internal_error(err: impl Display) -> AppError {
    tracing::error!(error = %err, "internal error");
    AppError::internal("Internal server error")
}
