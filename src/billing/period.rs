use chrono::{DateTime, Datelike, Duration, Months, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::models::BillingPeriod;
use crate::error::{AppError, AppResult};

/// Upper bound on month-by-month advancement; exceeding it means the anchor
/// data is corrupt.
const MAX_PERIOD_ITERATIONS: u32 = 120;

/// Billing window covering `now`, anchored on the customer's creation day or
/// the most recent invoiced boundary.
pub async fn current_billing_period(
    pool: &PgPool,
    customer_id: Uuid,
    now: DateTime<Utc>,
) -> AppResult<BillingPeriod> {
    let created_at: Option<DateTime<Utc>> =
        sqlx::query_scalar("SELECT created_at FROM customers WHERE id = $1")
            .bind(customer_id)
            .fetch_optional(pool)
            .await?;
    let Some(created_at) = created_at else {
        return Err(AppError::NotFound);
    };

    let last_period_end: Option<DateTime<Utc>> = sqlx::query_scalar(
        "SELECT period_end FROM invoices WHERE customer_id = $1 ORDER BY period_end DESC LIMIT 1",
    )
    .bind(customer_id)
    .fetch_optional(pool)
    .await?;

    if let Some(end) = last_period_end {
        if end > now {
            tracing::warn!(
                %customer_id,
                last_period_end = %end,
                "newest invoice ends in the future; re-anchoring on customer creation"
            );
        }
    }

    compute_period(created_at, last_period_end, now)
}

/// Pure period computation. A future-dated newest invoice is not treated as
/// authoritative: the window re-anchors on `created_at`.
pub fn compute_period(
    created_at: DateTime<Utc>,
    last_period_end: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> AppResult<BillingPeriod> {
    let (anchor, cycle_day) = match last_period_end {
        Some(end) if end <= now => (end + Duration::days(1), end.day()),
        _ => (created_at, created_at.day()),
    };

    let mut period_start = anchor;
    let mut period_end = add_month(period_start)?;
    let mut iterations = 0u32;
    while period_end <= now {
        iterations += 1;
        if iterations > MAX_PERIOD_ITERATIONS {
            return Err(AppError::Message(format!(
                "billing period advancement exceeded {MAX_PERIOD_ITERATIONS} months for anchor {anchor}"
            )));
        }
        period_start = period_end;
        period_end = add_month(period_start)?;
    }

    let days_remaining = ((period_end - now).num_seconds() + 86_399) / 86_400;
    Ok(BillingPeriod {
        period_start,
        period_end,
        days_remaining: days_remaining.max(0),
        cycle_day,
    })
}

/// Calendar-month addition; the day-of-month clamps to the end of shorter
/// target months.
fn add_month(instant: DateTime<Utc>) -> AppResult<DateTime<Utc>> {
    instant
        .checked_add_months(Months::new(1))
        .ok_or_else(|| AppError::Message(format!("month addition overflow at {instant}")))
}
