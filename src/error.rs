use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("database error: {0}")]
    Db(sqlx::Error),
    #[error("fast store error: {0}")]
    FastStore(#[from] redis::RedisError),
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("bad request: {0}")]
    BadRequest(String),
    #[error("daily request quota exceeded")]
    QuotaExhausted { limit: i64, reset_at: String },
    #[error("bad gateway: {0}")]
    BadGateway(String),
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),
    #[error("{0}")]
    Message(String),
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => AppError::NotFound,
            other => AppError::Db(other),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::QuotaExhausted { limit, reset_at } => {
                let mut response = (
                    StatusCode::TOO_MANY_REQUESTS,
                    Json(json!({ "error": "daily request quota exceeded" })),
                )
                    .into_response();
                let headers = response.headers_mut();
                if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
                    headers.insert("x-ratelimit-limit", value);
                }
                headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
                if let Ok(value) = HeaderValue::from_str(&reset_at) {
                    headers.insert("x-ratelimit-reset", value);
                }
                response
            }
            other => {
                let status = match &other {
                    AppError::NotFound => StatusCode::NOT_FOUND,
                    AppError::Unauthorized => StatusCode::UNAUTHORIZED,
                    AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
                    AppError::BadGateway(_) => StatusCode::BAD_GATEWAY,
                    AppError::ServiceUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
                    // A saturated pool is a liveness signal, not an internal bug.
                    AppError::Db(sqlx::Error::PoolTimedOut) => StatusCode::SERVICE_UNAVAILABLE,
                    AppError::Db(_) | AppError::FastStore(_) | AppError::Message(_) => {
                        StatusCode::INTERNAL_SERVER_ERROR
                    }
                    AppError::QuotaExhausted { .. } => unreachable!(),
                };
                if status.is_server_error() {
                    tracing::error!(error = ?other);
                }
                (status, other.to_string()).into_response()
            }
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
