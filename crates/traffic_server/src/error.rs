//! HTTP mapping of [`TrafficError`].

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use traffic_core::TrafficError;

/// Handler error. Wraps the domain error so it can be returned with `?`.
#[derive(Debug)]
pub struct AppError(pub TrafficError);

impl From<TrafficError> for AppError {
    fn from(e: TrafficError) -> Self {
        Self(e)
    }
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.0.http_status()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match &self.0 {
            TrafficError::Infrastructure(e) => {
                tracing::error!(error = %format!("{e:#}"), "request failed");
            }
            TrafficError::DuplicateRequest { .. } | TrafficError::StateConflict { .. } => {
                tracing::warn!(error = %self.0, "request conflict");
            }
            _ => {}
        }
        let body = json!({
            "error": self.0.kind(),
            "message": self.0.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use traffic_core::Disposition;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            AppError(TrafficError::NotFound("x".into())).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError(TrafficError::validation("x")).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError(TrafficError::DuplicateRequest {
                key: "k".into(),
                disposition: Disposition::Completed,
            })
            .status_code(),
            StatusCode::ALREADY_REPORTED
        );
        assert_eq!(
            AppError(TrafficError::DuplicateRequest {
                key: "k".into(),
                disposition: Disposition::InFlight,
            })
            .status_code(),
            StatusCode::CONFLICT
        );
        assert_eq!(
            AppError(TrafficError::Infrastructure(anyhow::anyhow!("down"))).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
