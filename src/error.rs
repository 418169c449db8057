//! # error
//!
//! Centralised application error type.
//!
//! Every engine operation and every handler returns `Result<_, AppError>`.
//! Axum's `IntoResponse` impl converts these into structured JSON error bodies
//! so the UI always gets a machine-readable response even on failure. Exchange
//! rejections are the exception: their raw body and status are forwarded
//! unmodified.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::exchange::ExchangeError;
use crate::models::TradeStatus;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum AppError {
    /// Malformed or missing input (empty symbol, bad enum value, negative percent).
    #[error("Validation error: {0}")]
    Validation(String),

    /// The operation is not valid for the trade's current status.
    #[error("Invalid state: cannot {op} a trade in status {status}")]
    InvalidState {
        op:     &'static str,
        status: TradeStatus,
    },

    /// Lookup by id found nothing.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The exchange rejected or failed an order action.
    #[error("Exchange error: {0}")]
    Exchange(#[from] ExchangeError),

    /// The persistence collaborator failed.
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    /// Catch-all for unexpected failures.
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    pub fn trade_not_found(id: impl std::fmt::Display) -> Self {
        AppError::NotFound(format!("trade {id} not found"))
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            AppError::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::InvalidState { .. } => (StatusCode::BAD_REQUEST, self.to_string()),
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::Exchange(ExchangeError::Rejected { status, body }) => {
                // Forward the exchange's own answer untouched.
                let status = StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY);
                return (
                    status,
                    [(header::CONTENT_TYPE, "application/json")],
                    body.clone(),
                )
                    .into_response();
            }
            AppError::Exchange(err) => (StatusCode::BAD_GATEWAY, err.to_string()),
            AppError::Store(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Storage error: {err}"),
            ),
            AppError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Internal error: {err}"),
            ),
        };

        let body = Json(json!({
            "ok":    false,
            "error": message,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (AppError::Validation("symbol required".into()), StatusCode::BAD_REQUEST),
            (
                AppError::InvalidState { op: "cancel sell", status: TradeStatus::Open },
                StatusCode::BAD_REQUEST,
            ),
            (AppError::trade_not_found("abc"), StatusCode::NOT_FOUND),
            (
                AppError::Exchange(ExchangeError::Transport("timeout".into())),
                StatusCode::BAD_GATEWAY,
            ),
            (AppError::Internal(anyhow::anyhow!("boom")), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[tokio::test]
    async fn test_exchange_rejection_is_forwarded_verbatim() {
        let raw = r#"{"code":-2010,"msg":"Account has insufficient balance."}"#;
        let err = AppError::Exchange(ExchangeError::Rejected {
            status: 400,
            body:   raw.to_string(),
        });
        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], raw.as_bytes());
    }
}
