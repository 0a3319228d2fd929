use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Bytes,
    extract::{Extension, Path, RawQuery},
    http::{header::HeaderName, HeaderMap, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Response},
};
use chrono::Utc;
use sqlx::PgPool;

use crate::config;
use crate::error::{AppError, AppResult};
use crate::fast_store::FastStore;
use crate::rate_limit::{window_stamp, RateLimiter, RateOutcome};
use crate::resolver::{AuthContext, KeyResolver};
use crate::usage::{BufferedUsage, UsageBuffer};

/// Hop-by-hop and gateway-internal request headers never forwarded upstream.
const STRIPPED_HEADERS: [&str; 7] = [
    "host",
    "x-api-key",
    "x-forwarded-for",
    "x-real-ip",
    "connection",
    "content-length",
    "content-type",
];

/// `ALL /api/*` — authenticate, admit against the daily quota, forward to the
/// resolved developer upstream, and queue a usage record.
pub async fn proxy_request(
    Extension(pool): Extension<PgPool>,
    Extension(store): Extension<Arc<dyn FastStore>>,
    Extension(client): Extension<reqwest::Client>,
    method: Method,
    headers: HeaderMap,
    path: Option<Path<String>>,
    RawQuery(query): RawQuery,
    body: Bytes,
) -> AppResult<Response> {
    let secret = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .ok_or(AppError::Unauthorized)?;

    let resolver = KeyResolver::new(pool, store.clone());
    let context = resolver
        .resolve(secret)
        .await?
        .ok_or(AppError::Unauthorized)?;

    let limiter = RateLimiter::new(store.clone());
    let outcome = limiter
        .check_and_increment(context.customer.id, context.customer.daily_quota)
        .await?;
    if let RateOutcome::Limited(decision) = &outcome {
        if !decision.allowed {
            return Err(AppError::QuotaExhausted {
                limit: decision.limit,
                reset_at: window_stamp(decision.reset_at),
            });
        }
    }

    let stripped_path = strip_path(path.as_ref().map(|rest| rest.0.as_str()));
    let target = build_target_url(&context, &stripped_path, query.as_deref())?;

    let started = Instant::now();
    let upstream = client
        .request(method.clone(), &target)
        .headers(sanitize_headers(&headers))
        .body(body.to_vec())
        .send()
        .await;

    let (status, content_type, payload) = match upstream {
        Ok(response) => {
            let status = response.status();
            let content_type = response.headers().get("content-type").cloned();
            match response.bytes().await {
                Ok(payload) => (status, content_type, payload),
                Err(err) => {
                    tracing::warn!(?err, %target, "failed reading upstream body");
                    gateway_error_payload()
                }
            }
        }
        Err(err) => {
            tracing::warn!(?err, %target, "upstream call failed");
            gateway_error_payload()
        }
    };
    let elapsed_ms = started.elapsed().as_millis() as i64;

    UsageBuffer::new(store).record(BufferedUsage {
        customer_id: context.customer.id,
        api_key_id: Some(context.key.id),
        endpoint: stripped_path,
        method: method.to_string(),
        status_code: status.as_u16() as i32,
        response_time_ms: elapsed_ms,
        recorded_at: Utc::now(),
    });

    let mut response_headers = HeaderMap::new();
    if let Some(value) = content_type {
        response_headers.insert("content-type", value);
    }
    apply_rate_headers(&mut response_headers, &outcome);

    Ok((status, response_headers, payload).into_response())
}

fn gateway_error_payload() -> (StatusCode, Option<HeaderValue>, Bytes) {
    (
        StatusCode::BAD_GATEWAY,
        Some(HeaderValue::from_static("application/json")),
        Bytes::from_static(br#"{"error":"upstream unreachable"}"#),
    )
}

/// `/api` prefix is already consumed by the route; an empty remainder targets
/// the upstream root.
pub fn strip_path(rest: Option<&str>) -> String {
    match rest {
        None | Some("") => "/".to_string(),
        Some(rest) => format!("/{}", rest.trim_start_matches('/')),
    }
}

pub fn build_target_url(
    context: &AuthContext,
    stripped_path: &str,
    query: Option<&str>,
) -> AppResult<String> {
    let base = context
        .developer
        .upstream_base_url
        .clone()
        .or_else(|| config::DEFAULT_UPSTREAM_URL.clone())
        .ok_or_else(|| {
            AppError::BadGateway(format!(
                "developer {} has no upstream base URL",
                context.developer.id
            ))
        })?;
    let mut target = format!("{}{}", base.trim_end_matches('/'), stripped_path);
    if let Some(query) = query {
        if !query.is_empty() {
            target.push('?');
            target.push_str(query);
        }
    }
    Ok(target)
}

pub fn sanitize_headers(headers: &HeaderMap) -> HeaderMap {
    let mut sanitized = HeaderMap::new();
    for (name, value) in headers {
        if STRIPPED_HEADERS.contains(&name.as_str()) {
            continue;
        }
        sanitized.append(name, value.clone());
    }
    sanitized
}

fn apply_rate_headers(headers: &mut HeaderMap, outcome: &RateOutcome) {
    match outcome {
        RateOutcome::Unlimited => {
            headers.insert("x-ratelimit-limit", HeaderValue::from_static("unlimited"));
            headers.insert(
                "x-ratelimit-remaining",
                HeaderValue::from_static("unlimited"),
            );
        }
        RateOutcome::Limited(decision) => {
            insert_numeric(headers, "x-ratelimit-limit", decision.limit);
            insert_numeric(headers, "x-ratelimit-remaining", decision.remaining);
            if let Ok(value) = HeaderValue::from_str(&window_stamp(decision.reset_at)) {
                headers.insert("x-ratelimit-reset", value);
            }
        }
    }
}

fn insert_numeric(headers: &mut HeaderMap, name: &'static str, value: i64) {
    if let Ok(value) = HeaderValue::from_str(&value.to_string()) {
        headers.insert(HeaderName::from_static(name), value);
    }
}
