//! Error responses.
//!
//! Every failure is rendered as `{"code": .., "reason": ..}` with
//! `X-Content-Type-Options: nosniff`.

use axum::{
    extract::rejection::JsonRejection,
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use threshold_types::Error as SignerError;

pub type ApiResult<T> = Result<T, ApiError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: u16,
    pub reason: String,
}

#[derive(Debug, thiserror::Error)]
#[error("{reason}")]
pub struct ApiError {
    status: StatusCode,
    reason: String,
}

impl ApiError {
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            reason: reason.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.status
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(ErrorBody {
            code: self.status.as_u16(),
            reason: self.reason,
        });
        let mut response = (self.status, body).into_response();
        response.headers_mut().insert(
            header::X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        );
        response
    }
}

impl From<SignerError> for ApiError {
    fn from(err: SignerError) -> Self {
        let status = match err {
            SignerError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            SignerError::NotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            reason: err.to_string(),
        }
    }
}

impl From<JsonRejection> for ApiError {
    fn from(rejection: JsonRejection) -> Self {
        Self::bad_request(rejection.body_text())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        let cases = [
            (SignerError::chain_not_supported(999), StatusCode::BAD_REQUEST),
            (SignerError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (SignerError::policy("fill deadline passed"), StatusCode::INTERNAL_SERVER_ERROR),
            (SignerError::Timeout, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, status) in cases {
            assert_eq!(ApiError::from(err).status_code(), status);
        }
    }

    #[test]
    fn test_response_headers() {
        let response = ApiError::from(SignerError::Timeout).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            response.headers().get(header::X_CONTENT_TYPE_OPTIONS).unwrap(),
            "nosniff"
        );
    }
}
