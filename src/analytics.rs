use axum::{
    extract::{Extension, Query},
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Duration, Utc};
use serde::Deserialize;
use serde_json::{json, Value};
use sqlx::{PgPool, QueryBuilder, Row};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Read-only aggregation over `usage_records`. Hosted by the billing process;
/// the gateway forwards the customer-facing mounts here.
pub fn routes() -> Router {
    Router::new()
        .route("/analytics/usage-count", get(usage_count))
        .route("/analytics/trends", get(trends))
        .route("/analytics/top-endpoints", get(top_endpoints))
        .route("/analytics/error-rate", get(error_rate))
        .route("/analytics/growth", get(growth))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageCountQuery {
    pub customer_id: Uuid,
    #[serde(default)]
    pub start_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub end_date: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrendsQuery {
    pub customer_id: Uuid,
    #[serde(default)]
    pub interval: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopEndpointsQuery {
    pub customer_id: Uuid,
    #[serde(default)]
    pub window: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerQuery {
    pub customer_id: Uuid,
}

pub async fn usage_count(
    Extension(pool): Extension<PgPool>,
    Query(query): Query<UsageCountQuery>,
) -> AppResult<Json<Value>> {
    let mut builder =
        QueryBuilder::new("SELECT COUNT(*) AS count FROM usage_records WHERE customer_id = ");
    builder.push_bind(query.customer_id);
    if let Some(start) = query.start_date {
        builder.push(" AND recorded_at >= ");
        builder.push_bind(start);
    }
    if let Some(end) = query.end_date {
        builder.push(" AND recorded_at < ");
        builder.push_bind(end);
    }
    let row = builder.build().fetch_one(&pool).await?;
    let count: i64 = row.get("count");
    Ok(Json(json!({
        "customerId": query.customer_id,
        "count": count,
        "startDate": query.start_date,
        "endDate": query.end_date,
    })))
}

pub async fn trends(
    Extension(pool): Extension<PgPool>,
    Query(query): Query<TrendsQuery>,
) -> AppResult<Json<Value>> {
    let interval = query.interval.as_deref().unwrap_or("day");
    let (bucket, lookback) = match interval {
        "hour" => ("hour", Duration::hours(24)),
        "day" => ("day", Duration::days(30)),
        other => {
            return Err(AppError::BadRequest(format!(
                "unknown trend interval {other}"
            )))
        }
    };
    let since = Utc::now() - lookback;

    let rows = sqlx::query(&format!(
        "SELECT date_trunc('{bucket}', recorded_at) AS bucket, COUNT(*) AS count \
         FROM usage_records WHERE customer_id = $1 AND recorded_at >= $2 \
         GROUP BY bucket ORDER BY bucket"
    ))
    .bind(query.customer_id)
    .bind(since)
    .fetch_all(&pool)
    .await?;

    let buckets: Vec<Value> = rows
        .iter()
        .map(|row| {
            let bucket: DateTime<Utc> = row.get("bucket");
            let count: i64 = row.get("count");
            json!({ "bucket": bucket, "count": count })
        })
        .collect();
    Ok(Json(json!({
        "customerId": query.customer_id,
        "interval": interval,
        "buckets": buckets,
    })))
}

pub async fn top_endpoints(
    Extension(pool): Extension<PgPool>,
    Query(query): Query<TopEndpointsQuery>,
) -> AppResult<Json<Value>> {
    let window = query.window.as_deref().unwrap_or("day");
    let since = match window {
        "day" => Some(Utc::now() - Duration::days(1)),
        "week" => Some(Utc::now() - Duration::days(7)),
        "month" => Some(Utc::now() - Duration::days(30)),
        "all" => None,
        other => {
            return Err(AppError::BadRequest(format!(
                "unknown endpoint window {other}"
            )))
        }
    };

    let mut builder = QueryBuilder::new(
        "SELECT endpoint, method, COUNT(*) AS count FROM usage_records WHERE customer_id = ",
    );
    builder.push_bind(query.customer_id);
    if let Some(since) = since {
        builder.push(" AND recorded_at >= ");
        builder.push_bind(since);
    }
    builder.push(" GROUP BY endpoint, method ORDER BY count DESC LIMIT 10");

    let rows = builder.build().fetch_all(&pool).await?;
    let endpoints: Vec<Value> = rows
        .iter()
        .map(|row| {
            let endpoint: String = row.get("endpoint");
            let method: String = row.get("method");
            let count: i64 = row.get("count");
            json!({ "endpoint": endpoint, "method": method, "count": count })
        })
        .collect();
    Ok(Json(json!({
        "customerId": query.customer_id,
        "window": window,
        "endpoints": endpoints,
    })))
}

pub async fn error_rate(
    Extension(pool): Extension<PgPool>,
    Query(query): Query<CustomerQuery>,
) -> AppResult<Json<Value>> {
    let since = Utc::now() - Duration::hours(24);
    let row = sqlx::query(
        "SELECT COUNT(*) AS total, \
                COUNT(*) FILTER (WHERE status_code >= 400) AS errors \
         FROM usage_records WHERE customer_id = $1 AND recorded_at >= $2",
    )
    .bind(query.customer_id)
    .bind(since)
    .fetch_one(&pool)
    .await?;

    let total: i64 = row.get("total");
    let errors: i64 = row.get("errors");
    let rate = if total == 0 {
        0.0
    } else {
        (errors as f64) / (total as f64)
    };
    Ok(Json(json!({
        "customerId": query.customer_id,
        "total": total,
        "errors": errors,
        "errorRate": (rate * 1000.0).round() / 1000.0,
        "healthy": rate < 0.05,
    })))
}

pub async fn growth(
    Extension(pool): Extension<PgPool>,
    Query(query): Query<CustomerQuery>,
) -> AppResult<Json<Value>> {
    let now = Utc::now();
    let week_ago = now - Duration::days(7);
    let two_weeks_ago = now - Duration::days(14);

    let row = sqlx::query(
        "SELECT COUNT(*) FILTER (WHERE recorded_at >= $2) AS this_week, \
                COUNT(*) FILTER (WHERE recorded_at >= $3 AND recorded_at < $2) AS last_week \
         FROM usage_records WHERE customer_id = $1 AND recorded_at >= $3",
    )
    .bind(query.customer_id)
    .bind(week_ago)
    .bind(two_weeks_ago)
    .fetch_one(&pool)
    .await?;

    let this_week: i64 = row.get("this_week");
    let last_week: i64 = row.get("last_week");
    let growth_percent = if last_week == 0 {
        None
    } else {
        let pct = ((this_week - last_week) as f64) * 100.0 / (last_week as f64);
        Some((pct * 10.0).round() / 10.0)
    };
    Ok(Json(json!({
        "customerId": query.customer_id,
        "thisWeek": this_week,
        "lastWeek": last_week,
        "growthPercent": growth_percent,
    })))
}
