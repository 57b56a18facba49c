//! API error handling.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

use gantry_core::Error;

/// HTTP status used for client-cancelled requests.
fn client_closed_request() -> StatusCode {
    StatusCode::from_u16(499).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// API error type.
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub message: String,
    /// When set, the response body is blanked and the status forced to 500.
    pub opaque: bool,
}

impl ApiError {
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: msg.into(),
            opaque: false,
        }
    }

    pub fn unauthorized() -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: "unauthorized".into(),
            opaque: false,
        }
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
            opaque: false,
        }
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: msg.into(),
            opaque: false,
        }
    }

    pub fn from_core(err: Error, opaque: bool) -> Self {
        let status = match &err {
            Error::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Error::Unauthorized => StatusCode::UNAUTHORIZED,
            Error::ConfigNotFound(_) | Error::GalleryModelNotFound(_) => StatusCode::NOT_FOUND,
            Error::Cancelled => client_closed_request(),
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
            opaque,
        }
    }

    pub fn opaque(mut self, opaque: bool) -> Self {
        self.opaque = opaque;
        self
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.opaque {
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
        let body = Json(json!({
            "error": {
                "message": self.message,
                "type": match self.status {
                    StatusCode::BAD_REQUEST => "invalid_request_error",
                    StatusCode::UNAUTHORIZED => "authentication_error",
                    StatusCode::NOT_FOUND => "not_found_error",
                    _ => "server_error",
                },
                "param": null,
                "code": self.status.as_str()
            }
        }));
        (self.status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn taxonomy_maps_to_expected_statuses() {
        let cases = [
            (Error::InvalidRequest("x".into()), 400),
            (Error::Unauthorized, 401),
            (Error::ConfigNotFound("m".into()), 404),
            (Error::Cancelled, 499),
            (Error::BackendCrashed("w".into()), 500),
            (Error::BackendEvicted, 500),
        ];
        for (err, expected) in cases {
            let api = ApiError::from_core(err, false);
            assert_eq!(api.status.as_u16(), expected);
        }
    }

    #[test]
    fn opaque_errors_become_blank_500s() {
        let api = ApiError::from_core(Error::ConfigNotFound("m".into()), true);
        let response = api.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
