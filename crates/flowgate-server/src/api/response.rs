use axum::{
    Json,
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use flowgate_core::FlowError;
use flowgate_core::error::correlation_id;
use serde::Serialize;
use serde_json::json;
use std::sync::OnceLock;
use tracing::{debug, error};

#[derive(Serialize, Debug)]
pub struct ApiResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
        }
    }

    pub fn ok_with_message(data: T, message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: Some(message.into()),
        }
    }
}

impl ApiResponse<()> {
    pub fn message(message: impl Into<String>) -> Self {
        Self {
            success: true,
            data: Some(()),
            message: Some(message.into()),
        }
    }
}

static DEBUG_ERRORS: OnceLock<bool> = OnceLock::new();

/// Switch error bodies from the stable tenant-safe text to the raw internal
/// detail. Set once at startup from config.
pub fn set_debug_errors(enabled: bool) {
    let _ = DEBUG_ERRORS.set(enabled);
}

fn debug_errors() -> bool {
    DEBUG_ERRORS.get().copied().unwrap_or(false)
}

/// Boundary wrapper turning a [`FlowError`] into the error envelope
/// `{error: {id, code, message}}`. The correlation id links the response to
/// the log line carrying the full detail.
#[derive(Debug)]
pub struct ApiError(pub FlowError);

impl From<FlowError> for ApiError {
    fn from(err: FlowError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let err = self.0;
        let id = correlation_id();
        let status =
            StatusCode::from_u16(err.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

        if status.is_server_error() {
            error!(correlation = %id, error = %err, "request failed");
        } else {
            debug!(correlation = %id, error = %err, "request rejected");
        }

        let message = if debug_errors() {
            err.to_string()
        } else {
            err.public_message().to_string()
        };
        let body = json!({
            "error": {
                "id": id,
                "code": err.code(),
                "message": message,
            }
        });

        let mut response = (status, Json(body)).into_response();
        if let Some(secs) = err.retry_after_secs() {
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), 64 * 1024).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[test]
    fn success_envelope_skips_empty_fields() {
        let value = serde_json::to_value(ApiResponse::ok(5)).unwrap();
        assert_eq!(value, json!({"success": true, "data": 5}));

        let value = serde_json::to_value(ApiResponse::message("done")).unwrap();
        assert_eq!(
            value,
            json!({"success": true, "data": null, "message": "done"})
        );
    }

    #[tokio::test]
    async fn error_envelope_carries_code_and_correlation_id() {
        let response =
            ApiError(FlowError::NotFound("file 'x.txt' is gone".into())).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let body = body_json(response).await;
        assert_eq!(body["error"]["code"], "not_found");
        assert_eq!(body["error"]["message"], "Resource not found");
        assert!(
            body["error"]["id"]
                .as_str()
                .unwrap()
                .starts_with("err_")
        );
    }

    #[tokio::test]
    async fn rate_limited_responses_set_retry_after() {
        let response = ApiError(FlowError::RateLimited {
            retry_after_secs: 17,
        })
        .into_response();
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(
            response.headers().get(header::RETRY_AFTER).unwrap(),
            "17"
        );
    }
}
