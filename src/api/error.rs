use crate::admission::ServerBusy;
use crate::fetcher::FetchError;
use crate::range::RangeError;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Seconds a busy client is asked to wait before retrying.
const RETRY_AFTER_SECS: u64 = 5;

/// Request failures decided before any body byte is written.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Invalid or expired link")]
    InvalidToken,

    #[error("Range not satisfiable")]
    RangeNotSatisfiable { size: u64 },

    #[error("Server busy, try again")]
    ServerBusy,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    BadRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::InvalidToken => StatusCode::FORBIDDEN,
            GatewayError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            GatewayError::ServerBusy => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<RangeError> for GatewayError {
    fn from(error: RangeError) -> Self {
        match error {
            RangeError::NotSatisfiable { size } => GatewayError::RangeNotSatisfiable { size },
        }
    }
}

impl From<ServerBusy> for GatewayError {
    fn from(_: ServerBusy) -> Self {
        GatewayError::ServerBusy
    }
}

impl From<FetchError> for GatewayError {
    fn from(error: FetchError) -> Self {
        match error {
            FetchError::NotFound(resource_id) => {
                GatewayError::NotFound(format!("Resource not found: {resource_id}"))
            }
            FetchError::InvalidResource(_) => GatewayError::BadRequest(error.to_string()),
            FetchError::Misaligned { .. } | FetchError::Backend(_) => {
                GatewayError::Internal(error.to_string())
            }
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = json!({
            "error": self.to_string(),
            "status": status.as_u16()
        });

        let mut response = (status, axum::Json(body)).into_response();
        match self {
            GatewayError::RangeNotSatisfiable { size } => {
                if let Ok(value) = HeaderValue::from_str(&format!("bytes */{size}")) {
                    response.headers_mut().insert(header::CONTENT_RANGE, value);
                }
            }
            GatewayError::ServerBusy => {
                response
                    .headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
            }
            _ => {}
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(GatewayError::InvalidToken.status(), StatusCode::FORBIDDEN);
        assert_eq!(
            GatewayError::from(RangeError::NotSatisfiable { size: 9 }).status(),
            StatusCode::RANGE_NOT_SATISFIABLE
        );
        assert_eq!(
            GatewayError::from(ServerBusy { capacity: 1 }).status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            GatewayError::from(FetchError::NotFound("a".into())).status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            GatewayError::from(FetchError::Backend("down".into())).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_framing_headers() {
        let response = GatewayError::RangeNotSatisfiable { size: 1000 }.into_response();
        assert_eq!(response.headers()[header::CONTENT_RANGE], "bytes */1000");

        let response = GatewayError::ServerBusy.into_response();
        assert_eq!(response.headers()[header::RETRY_AFTER], "5");

        let response = GatewayError::InvalidToken.into_response();
        assert!(response.headers().get(header::CONTENT_RANGE).is_none());
    }
}
