use std::collections::HashMap;

use axum::{
    extract::{Extension, Path, Query},
    http::Method,
    response::Response,
    routing::{get, post, put},
    Json, Router,
};
use serde_json::Value;
use uuid::Uuid;

use crate::config;
use crate::downstream::relay;
use crate::error::{AppError, AppResult};
use crate::extractor::AuthedCustomer;

/// Customer-facing billing and analytics mounts. Each handler authenticates
/// the caller by API key, forces the resolved customer id, and forwards to
/// the billing process.
pub fn routes() -> Router {
    Router::new()
        .route("/billing/current-period", get(current_period))
        .route("/billing/current-usage", get(current_usage))
        .route("/billing/history", get(history))
        .route("/billing/tiers", get(tiers))
        .route("/billing/preview-upgrade", post(preview_upgrade))
        .route("/billing/invoices", get(list_invoices))
        .route("/billing/invoices/summary", get(invoice_summary))
        .route("/billing/invoices/:id", get(invoice_by_id))
        .route("/billing/invoices/:id/status", put(update_invoice_status))
        .route("/billing/invoices/:id/mark-paid", put(mark_invoice_paid))
        .route("/analytics/usage-count", get(analytics_passthrough))
        .route("/analytics/trends", get(analytics_passthrough))
        .route("/analytics/top-endpoints", get(analytics_passthrough))
        .route("/analytics/error-rate", get(analytics_passthrough))
        .route("/analytics/growth", get(analytics_passthrough))
}

/// Caller-supplied params minus any customer override, plus the authenticated
/// customer id.
fn scoped_params(raw: HashMap<String, String>, customer_id: Uuid) -> Vec<(String, String)> {
    let mut params: Vec<(String, String)> = raw
        .into_iter()
        .filter(|(key, _)| key != "customerId")
        .collect();
    params.push(("customerId".to_string(), customer_id.to_string()));
    params
}

async fn forward_billing(
    client: &reqwest::Client,
    method: Method,
    path: &str,
    params: Vec<(String, String)>,
    body: Option<&Value>,
) -> AppResult<Response> {
    let url = format!("{}{}", config::BILLING_SERVICE_URL.as_str(), path);
    relay(client, method, url, &params, body).await
}

pub async fn current_period(
    AuthedCustomer(context): AuthedCustomer,
    Extension(client): Extension<reqwest::Client>,
    Query(raw): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    forward_billing(
        &client,
        Method::GET,
        "/billing/current-period",
        scoped_params(raw, context.customer.id),
        None,
    )
    .await
}

pub async fn current_usage(
    AuthedCustomer(context): AuthedCustomer,
    Extension(client): Extension<reqwest::Client>,
    Query(raw): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    forward_billing(
        &client,
        Method::GET,
        "/billing/current-usage",
        scoped_params(raw, context.customer.id),
        None,
    )
    .await
}

pub async fn history(
    AuthedCustomer(context): AuthedCustomer,
    Extension(client): Extension<reqwest::Client>,
    Query(raw): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    forward_billing(
        &client,
        Method::GET,
        "/billing/history",
        scoped_params(raw, context.customer.id),
        None,
    )
    .await
}

pub async fn tiers(
    AuthedCustomer(context): AuthedCustomer,
    Extension(client): Extension<reqwest::Client>,
    Query(raw): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    forward_billing(
        &client,
        Method::GET,
        "/billing/tiers",
        scoped_params(raw, context.customer.id),
        None,
    )
    .await
}

pub async fn preview_upgrade(
    AuthedCustomer(context): AuthedCustomer,
    Extension(client): Extension<reqwest::Client>,
    Json(payload): Json<Value>,
) -> AppResult<Response> {
    let Value::Object(mut body) = payload else {
        return Err(AppError::BadRequest("expected a JSON object body".into()));
    };
    body.insert(
        "customerId".to_string(),
        Value::String(context.customer.id.to_string()),
    );
    forward_billing(
        &client,
        Method::POST,
        "/billing/preview-upgrade",
        Vec::new(),
        Some(&Value::Object(body)),
    )
    .await
}

pub async fn list_invoices(
    AuthedCustomer(context): AuthedCustomer,
    Extension(client): Extension<reqwest::Client>,
    Query(raw): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    forward_billing(
        &client,
        Method::GET,
        "/billing/invoices",
        scoped_params(raw, context.customer.id),
        None,
    )
    .await
}

pub async fn invoice_summary(
    AuthedCustomer(context): AuthedCustomer,
    Extension(client): Extension<reqwest::Client>,
    Query(raw): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    forward_billing(
        &client,
        Method::GET,
        "/billing/invoices/summary",
        scoped_params(raw, context.customer.id),
        None,
    )
    .await
}

pub async fn invoice_by_id(
    AuthedCustomer(context): AuthedCustomer,
    Extension(client): Extension<reqwest::Client>,
    Path(id): Path<Uuid>,
    Query(raw): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    forward_billing(
        &client,
        Method::GET,
        &format!("/billing/invoices/{id}"),
        scoped_params(raw, context.customer.id),
        None,
    )
    .await
}

pub async fn update_invoice_status(
    AuthedCustomer(context): AuthedCustomer,
    Extension(client): Extension<reqwest::Client>,
    Path(id): Path<Uuid>,
    Json(payload): Json<Value>,
) -> AppResult<Response> {
    forward_billing(
        &client,
        Method::PUT,
        &format!("/billing/invoices/{id}/status"),
        scoped_params(HashMap::new(), context.customer.id),
        Some(&payload),
    )
    .await
}

pub async fn mark_invoice_paid(
    AuthedCustomer(context): AuthedCustomer,
    Extension(client): Extension<reqwest::Client>,
    Path(id): Path<Uuid>,
) -> AppResult<Response> {
    forward_billing(
        &client,
        Method::PUT,
        &format!("/billing/invoices/{id}/mark-paid"),
        scoped_params(HashMap::new(), context.customer.id),
        None,
    )
    .await
}

/// Analytics mounts share one shape: same path on the analytics service with
/// the customer id forced.
pub async fn analytics_passthrough(
    AuthedCustomer(context): AuthedCustomer,
    Extension(client): Extension<reqwest::Client>,
    axum::extract::OriginalUri(uri): axum::extract::OriginalUri,
    Query(raw): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    let url = format!("{}{}", config::ANALYTICS_SERVICE_URL.as_str(), uri.path());
    relay(
        &client,
        Method::GET,
        url,
        &scoped_params(raw, context.customer.id),
        None,
    )
    .await
}
