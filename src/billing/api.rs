use axum::{
    extract::{Extension, Path, Query},
    routing::{get, post, put},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use super::models::{BulkGenerationReport, HydratedInvoice, Invoice, InvoiceStatus};
use super::period::current_billing_period;
use super::pricing::{PricingService, UpgradePreview};
use super::service::{InvoiceFilter, InvoiceService};
use crate::error::{AppError, AppResult};
use crate::models::Tier;

/// key: billing-api -> internal rest endpoints
///
/// Trusted-network surface consumed by the gateway; customer identity arrives
/// as an explicit `customerId` parameter.
pub fn routes() -> Router {
    Router::new()
        .route("/billing/current-period", get(current_period))
        .route("/billing/current-usage", get(current_usage))
        .route("/billing/history", get(history))
        .route("/billing/tiers", get(tier_catalog))
        .route("/billing/preview-upgrade", post(preview_upgrade))
        .route("/billing/estimate", get(estimate))
        .route(
            "/billing/invoices",
            get(list_invoices),
        )
        .route("/billing/invoices/summary", get(invoice_summary))
        .route("/billing/invoices/generate", post(generate_invoice))
        .route(
            "/billing/invoices/generate-monthly",
            post(generate_monthly),
        )
        .route("/billing/invoices/:id", get(get_invoice))
        .route("/billing/invoices/:id/status", put(update_status))
        .route("/billing/invoices/:id/mark-paid", put(mark_paid))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerQuery {
    pub customer_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryQuery {
    pub customer_id: Uuid,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EstimateQuery {
    pub customer_id: Uuid,
    #[serde(default)]
    pub tier_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreviewUpgradeRequest {
    pub customer_id: Uuid,
    pub new_tier_id: Uuid,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateInvoiceRequest {
    pub customer_id: Uuid,
    pub period_start: DateTime<Utc>,
    pub period_end: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateMonthlyRequest {
    #[serde(default)]
    pub customer_ids: Option<Vec<Uuid>>,
}

/// Optional owner scope forwarded by customer-facing mounts; admin and
/// trusted callers omit it.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerQuery {
    #[serde(default)]
    pub customer_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateStatusRequest {
    pub status: String,
    #[serde(default)]
    pub paid_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub external_payment_ref: Option<String>,
}

pub async fn current_period(
    Extension(pool): Extension<PgPool>,
    Query(query): Query<CustomerQuery>,
) -> AppResult<Json<Value>> {
    let period = current_billing_period(&pool, query.customer_id, Utc::now()).await?;
    Ok(Json(serde_json::to_value(period).map_err(|err| {
        AppError::Message(err.to_string())
    })?))
}

pub async fn current_usage(
    Extension(pool): Extension<PgPool>,
    Query(query): Query<CustomerQuery>,
) -> AppResult<Json<Value>> {
    let now = Utc::now();
    let period = current_billing_period(&pool, query.customer_id, now).await?;
    let pricing = PricingService::new(pool.clone());
    let usage = pricing
        .calculate_usage_for_period(query.customer_id, period.period_start, period.period_end)
        .await?;

    let tier = sqlx::query_as::<_, Tier>(
        "SELECT t.* FROM customers c JOIN tiers t ON t.id = c.tier_id WHERE c.id = $1",
    )
    .bind(query.customer_id)
    .fetch_optional(&pool)
    .await?
    .ok_or(AppError::NotFound)?;

    let (limit, percentage) = if tier.daily_quota == 0 {
        (json!("unlimited"), 0.0)
    } else {
        let pct = (usage.usage as f64) * 100.0 / (tier.daily_quota as f64);
        (json!(tier.daily_quota), (pct * 10.0).round() / 10.0)
    };

    Ok(Json(json!({
        "period": period,
        "usage": {
            "count": usage.usage,
            "limit": limit,
            "percentage": percentage,
        },
        "tier": {
            "name": tier.name,
            "priceCents": tier.price_cents,
        },
    })))
}

pub async fn history(
    Extension(pool): Extension<PgPool>,
    Query(query): Query<HistoryQuery>,
) -> AppResult<Json<Value>> {
    let (invoices, paid_total) = InvoiceService::new(pool)
        .history(query.customer_id, query.limit.unwrap_or(12))
        .await?;
    Ok(Json(json!({
        "invoices": invoices,
        "lifetimePaidCents": paid_total,
    })))
}

pub async fn tier_catalog(
    Extension(pool): Extension<PgPool>,
    Query(query): Query<CustomerQuery>,
) -> AppResult<Json<Value>> {
    let current_tier_id: Option<Uuid> =
        sqlx::query_scalar("SELECT tier_id FROM customers WHERE id = $1")
            .bind(query.customer_id)
            .fetch_optional(&pool)
            .await?;
    let Some(current_tier_id) = current_tier_id else {
        return Err(AppError::NotFound);
    };

    let tiers = sqlx::query_as::<_, Tier>("SELECT * FROM tiers ORDER BY price_cents ASC")
        .fetch_all(&pool)
        .await?;
    let catalog: Vec<Value> = tiers
        .iter()
        .map(|tier| {
            json!({
                "id": tier.id,
                "name": tier.name,
                "priceCents": tier.price_cents,
                "dailyQuota": tier.daily_quota,
                "features": tier.features,
                "isCurrent": tier.id == current_tier_id,
            })
        })
        .collect();
    Ok(Json(json!(catalog)))
}

pub async fn preview_upgrade(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<PreviewUpgradeRequest>,
) -> AppResult<Json<UpgradePreview>> {
    let preview = PricingService::new(pool)
        .preview_tier_upgrade(payload.customer_id, payload.new_tier_id, Utc::now())
        .await?;
    Ok(Json(preview))
}

pub async fn estimate(
    Extension(pool): Extension<PgPool>,
    Query(query): Query<EstimateQuery>,
) -> AppResult<Json<Value>> {
    let estimate = PricingService::new(pool)
        .estimate_monthly_cost(query.customer_id, query.tier_id)
        .await?;
    Ok(Json(estimate))
}

pub async fn list_invoices(
    Extension(pool): Extension<PgPool>,
    Query(filter): Query<InvoiceFilter>,
) -> AppResult<Json<Vec<Invoice>>> {
    let invoices = InvoiceService::new(pool).list_invoices(&filter).await?;
    Ok(Json(invoices))
}

pub async fn invoice_summary(
    Extension(pool): Extension<PgPool>,
    Query(owner): Query<OwnerQuery>,
) -> AppResult<Json<Value>> {
    let summary = InvoiceService::new(pool)
        .invoice_summary(owner.customer_id)
        .await?;
    Ok(Json(summary))
}

pub async fn get_invoice(
    Extension(pool): Extension<PgPool>,
    Path(id): Path<Uuid>,
    Query(owner): Query<OwnerQuery>,
) -> AppResult<Json<HydratedInvoice>> {
    let invoice = InvoiceService::new(pool)
        .get_invoice(id, owner.customer_id)
        .await?;
    Ok(Json(invoice))
}

pub async fn update_status(
    Extension(pool): Extension<PgPool>,
    Path(id): Path<Uuid>,
    Query(owner): Query<OwnerQuery>,
    Json(payload): Json<UpdateStatusRequest>,
) -> AppResult<Json<Invoice>> {
    let status = InvoiceStatus::parse(&payload.status)
        .ok_or_else(|| AppError::BadRequest(format!("unknown invoice status {}", payload.status)))?;
    let invoice = InvoiceService::new(pool)
        .update_status(
            id,
            status,
            payload.paid_at,
            payload.external_payment_ref,
            owner.customer_id,
        )
        .await?;
    Ok(Json(invoice))
}

pub async fn mark_paid(
    Extension(pool): Extension<PgPool>,
    Path(id): Path<Uuid>,
    Query(owner): Query<OwnerQuery>,
) -> AppResult<Json<Invoice>> {
    let invoice = InvoiceService::new(pool)
        .mark_paid(id, owner.customer_id)
        .await?;
    Ok(Json(invoice))
}

pub async fn generate_invoice(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<GenerateInvoiceRequest>,
) -> AppResult<Json<HydratedInvoice>> {
    let invoice = InvoiceService::new(pool)
        .generate_invoice(payload.customer_id, payload.period_start, payload.period_end)
        .await?;
    Ok(Json(invoice))
}

pub async fn generate_monthly(
    Extension(pool): Extension<PgPool>,
    Json(payload): Json<GenerateMonthlyRequest>,
) -> AppResult<Json<BulkGenerationReport>> {
    let report = InvoiceService::new(pool)
        .generate_monthly_invoices(payload.customer_ids, Utc::now())
        .await?;
    Ok(Json(report))
}
