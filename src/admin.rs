use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::Method,
    response::Response,
    routing::{get, post, put},
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::billing::InvoiceService;
use crate::config;
use crate::downstream::relay;
use crate::error::{AppError, AppResult};
use crate::extractor::AdminAuth;
use crate::fast_store::FastStore;
use crate::rate_limit::counter_key;
use crate::usage::UsageBuffer;

/// Operator surface, shielded by the `x-admin-key` shared secret. Store-local
/// reads are answered here; invoice management relays to the billing process
/// without a customer override.
pub fn routes() -> Router {
    Router::new()
        .route("/admin/stats", get(all_stats))
        .route("/admin/usage", get(system_usage))
        .route("/admin/customers/:id/usage", get(customer_usage))
        .route("/admin/customers/:id/rate-limit", get(customer_rate_limit))
        .route("/admin/keys/:secret/customer", get(customer_by_key))
        .route("/admin/invoices", get(relay_invoices))
        .route("/admin/invoices/summary", get(relay_invoice_summary))
        .route("/admin/invoices/generate", post(relay_generate))
        .route("/admin/invoices/generate-monthly", post(relay_generate_monthly))
        .route("/admin/invoices/:id", get(relay_invoice_by_id))
        .route("/admin/invoices/:id/status", put(relay_invoice_status))
        .route("/admin/invoices/:id/mark-paid", put(relay_mark_paid))
}

#[derive(Debug, Deserialize)]
pub struct LimitQuery {
    #[serde(default)]
    pub limit: Option<i64>,
}

pub async fn all_stats(
    _admin: AdminAuth,
    Extension(pool): Extension<PgPool>,
) -> AppResult<Json<Value>> {
    let customers = sqlx::query(
        "SELECT COUNT(*) AS total, COUNT(*) FILTER (WHERE active) AS active FROM customers",
    )
    .fetch_one(&pool)
    .await?;
    let keys = sqlx::query(
        "SELECT COUNT(*) AS total, COUNT(*) FILTER (WHERE active) AS active FROM api_keys",
    )
    .fetch_one(&pool)
    .await?;
    let usage = sqlx::query(
        "SELECT COUNT(*) AS total, \
                COUNT(*) FILTER (WHERE recorded_at >= date_trunc('day', NOW())) AS today \
         FROM usage_records",
    )
    .fetch_one(&pool)
    .await?;
    let invoices = InvoiceService::new(pool).invoice_summary(None).await?;

    Ok(Json(json!({
        "customers": {
            "total": customers.get::<i64, _>("total"),
            "active": customers.get::<i64, _>("active"),
        },
        "apiKeys": {
            "total": keys.get::<i64, _>("total"),
            "active": keys.get::<i64, _>("active"),
        },
        "usage": {
            "total": usage.get::<i64, _>("total"),
            "today": usage.get::<i64, _>("today"),
        },
        "invoices": invoices,
    })))
}

pub async fn system_usage(
    _admin: AdminAuth,
    Extension(pool): Extension<PgPool>,
    Query(query): Query<LimitQuery>,
) -> AppResult<Json<Value>> {
    let records = sqlx::query_as::<_, crate::models::UsageRecord>(
        "SELECT * FROM usage_records ORDER BY recorded_at DESC LIMIT $1",
    )
    .bind(query.limit.unwrap_or(100).clamp(1, 1000))
    .fetch_all(&pool)
    .await?;
    Ok(Json(json!({ "records": records })))
}

/// Recent history from the per-customer fast-store buffer, plus the durable
/// today-count.
pub async fn customer_usage(
    _admin: AdminAuth,
    Extension(pool): Extension<PgPool>,
    Extension(store): Extension<Arc<dyn FastStore>>,
    Path(customer_id): Path<Uuid>,
    Query(query): Query<LimitQuery>,
) -> AppResult<Json<Value>> {
    let recent = UsageBuffer::new(store)
        .recent_for_customer(customer_id, query.limit.unwrap_or(50).clamp(1, 1000))
        .await?;
    let today: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM usage_records \
         WHERE customer_id = $1 AND recorded_at >= date_trunc('day', NOW())",
    )
    .bind(customer_id)
    .fetch_one(&pool)
    .await?;
    Ok(Json(json!({
        "customerId": customer_id,
        "todayCount": today,
        "recent": recent,
    })))
}

pub async fn customer_rate_limit(
    _admin: AdminAuth,
    Extension(store): Extension<Arc<dyn FastStore>>,
    Path(customer_id): Path<Uuid>,
) -> AppResult<Json<Value>> {
    let state = store.hash_get_all(&counter_key(customer_id)).await?;
    let count = state
        .get("count")
        .and_then(|raw| raw.parse::<i64>().ok());
    Ok(Json(json!({
        "customerId": customer_id,
        "count": count,
        "resetAt": state.get("resetAt"),
    })))
}

pub async fn customer_by_key(
    _admin: AdminAuth,
    Extension(pool): Extension<PgPool>,
    Path(secret): Path<String>,
) -> AppResult<Json<Value>> {
    let row = sqlx::query(
        r#"
        SELECT
            c.id AS customer_id, c.email, c.active AS customer_active, c.created_at,
            t.id AS tier_id, t.name AS tier_name, t.daily_quota, t.price_cents,
            d.id AS developer_id, d.name AS developer_name,
            k.id AS key_id, k.name AS key_name, k.active AS key_active,
            k.last_used_at, k.expires_at
        FROM api_keys k
        JOIN customers c ON c.id = k.customer_id
        JOIN tiers t ON t.id = c.tier_id
        JOIN developers d ON d.id = c.developer_id
        WHERE k.secret = $1
        "#,
    )
    .bind(&secret)
    .fetch_optional(&pool)
    .await?;
    let Some(row) = row else {
        return Err(AppError::NotFound);
    };

    Ok(Json(json!({
        "customer": {
            "id": row.get::<Uuid, _>("customer_id"),
            "email": row.get::<String, _>("email"),
            "active": row.get::<bool, _>("customer_active"),
            "createdAt": row.get::<chrono::DateTime<chrono::Utc>, _>("created_at"),
        },
        "tier": {
            "id": row.get::<Uuid, _>("tier_id"),
            "name": row.get::<String, _>("tier_name"),
            "dailyQuota": row.get::<i64, _>("daily_quota"),
            "priceCents": row.get::<i64, _>("price_cents"),
        },
        "developer": {
            "id": row.get::<Uuid, _>("developer_id"),
            "name": row.get::<String, _>("developer_name"),
        },
        "key": {
            "id": row.get::<Uuid, _>("key_id"),
            "name": row.get::<Option<String>, _>("key_name"),
            "active": row.get::<bool, _>("key_active"),
            "lastUsedAt": row.get::<Option<chrono::DateTime<chrono::Utc>>, _>("last_used_at"),
            "expiresAt": row.get::<Option<chrono::DateTime<chrono::Utc>>, _>("expires_at"),
        },
    })))
}

async fn forward_billing(
    client: &reqwest::Client,
    method: Method,
    path: &str,
    params: HashMap<String, String>,
    body: Option<&Value>,
) -> AppResult<Response> {
    let url = format!("{}{}", config::BILLING_SERVICE_URL.as_str(), path);
    let params: Vec<(String, String)> = params.into_iter().collect();
    relay(client, method, url, &params, body).await
}

pub async fn relay_invoices(
    _admin: AdminAuth,
    Extension(client): Extension<reqwest::Client>,
    Query(params): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    forward_billing(&client, Method::GET, "/billing/invoices", params, None).await
}

pub async fn relay_invoice_summary(
    _admin: AdminAuth,
    Extension(client): Extension<reqwest::Client>,
    Query(params): Query<HashMap<String, String>>,
) -> AppResult<Response> {
    forward_billing(&client, Method::GET, "/billing/invoices/summary", params, None).await
}

pub async fn relay_invoice_by_id(
    _admin: AdminAuth,
    Extension(client): Extension<reqwest::Client>,
    Path(id): Path<Uuid>,
) -> AppResult<Response> {
    forward_billing(
        &client,
        Method::GET,
        &format!("/billing/invoices/{id}"),
        HashMap::new(),
        None,
    )
    .await
}

pub async fn relay_invoice_status(
    _admin: AdminAuth,
    Extension(client): Extension<reqwest::Client>,
    Path(id): Path<Uuid>,
    Json(payload): Json<Value>,
) -> AppResult<Response> {
    forward_billing(
        &client,
        Method::PUT,
        &format!("/billing/invoices/{id}/status"),
        HashMap::new(),
        Some(&payload),
    )
    .await
}

pub async fn relay_mark_paid(
    _admin: AdminAuth,
    Extension(client): Extension<reqwest::Client>,
    Path(id): Path<Uuid>,
) -> AppResult<Response> {
    forward_billing(
        &client,
        Method::PUT,
        &format!("/billing/invoices/{id}/mark-paid"),
        HashMap::new(),
        None,
    )
    .await
}

pub async fn relay_generate(
    _admin: AdminAuth,
    Extension(client): Extension<reqwest::Client>,
    Json(payload): Json<Value>,
) -> AppResult<Response> {
    forward_billing(
        &client,
        Method::POST,
        "/billing/invoices/generate",
        HashMap::new(),
        Some(&payload),
    )
    .await
}

pub async fn relay_generate_monthly(
    _admin: AdminAuth,
    Extension(client): Extension<reqwest::Client>,
    Json(payload): Json<Value>,
) -> AppResult<Response> {
    forward_billing(
        &client,
        Method::POST,
        "/billing/invoices/generate-monthly",
        HashMap::new(),
        Some(&payload),
    )
    .await
}
