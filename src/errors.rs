//! Engine-wide error types and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// Domain and infrastructure errors surfaced by the trading engine.
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("invalid ticker: {0}")]
    InvalidTicker(String),

    #[error("unsupported contract type: {0}")]
    UnsupportedType(String),

    #[error("liquidity parameter must be positive, got {0}")]
    InvalidLiquidity(rust_decimal::Decimal),

    #[error("trade would move price outside allowed bounds")]
    PriceBoundExceeded,

    #[error("per-cell position limit exceeded: |{new_exposure}| > {limit}")]
    PerCellLimit {
        new_exposure: rust_decimal::Decimal,
        limit: rust_decimal::Decimal,
    },

    #[error("correlated position limit exceeded: {total} > {limit}")]
    CorrelatedLimit {
        total: rust_decimal::Decimal,
        limit: rust_decimal::Decimal,
    },

    #[error("{0} not found")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("internal error")]
    Internal(#[source] anyhow::Error),

    #[error("operation cancelled")]
    Cancelled,
}

impl EngineError {
    pub fn internal<E: Into<anyhow::Error>>(err: E) -> Self {
        EngineError::Internal(err.into())
    }

    /// Stable machine-readable tag, used in structured trade logs.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineError::InvalidTicker(_) => "invalid_ticker",
            EngineError::UnsupportedType(_) => "unsupported_type",
            EngineError::InvalidLiquidity(_) => "invalid_liquidity",
            EngineError::PriceBoundExceeded => "price_bound_exceeded",
            EngineError::PerCellLimit { .. } => "per_cell_limit_exceeded",
            EngineError::CorrelatedLimit { .. } => "correlated_limit_exceeded",
            EngineError::NotFound(_) => "not_found",
            EngineError::Conflict(_) => "conflict",
            EngineError::BadRequest(_) => "bad_request",
            EngineError::Internal(_) => "internal_error",
            EngineError::Cancelled => "cancelled",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            EngineError::InvalidTicker(_)
            | EngineError::UnsupportedType(_)
            | EngineError::InvalidLiquidity(_)
            | EngineError::BadRequest(_) => StatusCode::BAD_REQUEST,
            EngineError::NotFound(_) => StatusCode::NOT_FOUND,
            EngineError::PriceBoundExceeded
            | EngineError::PerCellLimit { .. }
            | EngineError::CorrelatedLimit { .. }
            | EngineError::Conflict(_) => StatusCode::CONFLICT,
            EngineError::Internal(_) | EngineError::Cancelled => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let status = self.status();
        // Store failures never leak their raw cause to the client.
        let message = match &self {
            EngineError::Internal(cause) => {
                tracing::error!(error = %cause, "internal error");
                "internal server error".to_string()
            }
            other => other.to_string(),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;
