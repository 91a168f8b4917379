//! 统一的 API 错误类型与响应转换。

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::error;

#[derive(Debug)]
pub enum ApiError {
    NoRootConfigured,
    Traversal,
    BadRequest(String),
    NotFound,
    MethodNotAllowed,
    Internal(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NoRootConfigured | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::Traversal | ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
        }
    }

    fn message(&self) -> Option<&str> {
        match self {
            ApiError::NoRootConfigured => Some("no root configured"),
            ApiError::Traversal => Some("directory backoff not allowed"),
            ApiError::BadRequest(msg) | ApiError::Internal(msg) => Some(msg),
            ApiError::NotFound | ApiError::MethodNotAllowed => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = match self.message() {
            Some(msg) => format!("Error: {msg}"),
            None => format!("Error: {}", status.canonical_reason().unwrap_or("Unknown")),
        };
        // 仅记录服务端错误，客户端错误静默处理。
        if status.is_server_error() {
            error!(status = status.as_u16(), error = body, "request failed");
        }
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::ApiError;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use http_body_util::BodyExt;

    async fn body_text(error: ApiError) -> (StatusCode, String) {
        let response = error.into_response();
        let status = response.status();
        let bytes = response
            .into_body()
            .collect()
            .await
            .expect("collect body")
            .to_bytes();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[tokio::test]
    async fn message_is_prefixed() {
        let (status, body) = body_text(ApiError::BadRequest("missing ?path=".into())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Error: missing ?path=");
    }

    #[tokio::test]
    async fn status_text_used_without_message() {
        let (status, body) = body_text(ApiError::NotFound).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body, "Error: Not Found");

        let (status, body) = body_text(ApiError::MethodNotAllowed).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(body, "Error: Method Not Allowed");
    }

    #[tokio::test]
    async fn traversal_is_client_error() {
        let (status, body) = body_text(ApiError::Traversal).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body, "Error: directory backoff not allowed");
    }
}
