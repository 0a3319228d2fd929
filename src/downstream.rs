use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;

use crate::error::{AppError, AppResult};

/// Forward one request to a trusted internal service and pass its status and
/// body back verbatim. Transport failures surface as 503; the gateway never
/// retries.
pub async fn relay(
    client: &reqwest::Client,
    method: Method,
    url: String,
    query: &[(String, String)],
    body: Option<&Value>,
) -> AppResult<Response> {
    let mut request = client.request(method, &url).query(query);
    if let Some(body) = body {
        request = request.json(body);
    }

    let response = request.send().await.map_err(|err| {
        tracing::warn!(?err, %url, "downstream service unreachable");
        AppError::ServiceUnavailable("downstream service unreachable".into())
    })?;

    let status = response.status();
    let content_type = response.headers().get("content-type").cloned();
    let payload = response.bytes().await.map_err(|err| {
        tracing::warn!(?err, %url, "downstream response truncated");
        AppError::ServiceUnavailable("downstream service unreachable".into())
    })?;

    let mut headers = HeaderMap::new();
    if let Some(content_type) = content_type {
        headers.insert("content-type", content_type);
    }
    Ok((
        StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY),
        headers,
        payload,
    )
        .into_response())
}
