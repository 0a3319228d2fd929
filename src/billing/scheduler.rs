use chrono::{DateTime, Datelike, Days, Local, LocalResult, Months, NaiveDate, NaiveDateTime, TimeZone, Utc};
use sqlx::PgPool;
use tokio::time;
use uuid::Uuid;

use super::models::BulkGenerationReport;
use super::period::current_billing_period;
use super::service::InvoiceService;
use crate::error::AppResult;

/// key: billing-schedulers -> close pass, overdue sweep, monthly bulk
pub fn spawn(pool: PgPool) {
    let close_pool = pool.clone();
    tokio::spawn(async move {
        loop {
            sleep_until_daily(2, 0).await;
            match process_invoice_close_tick(&close_pool, Utc::now()).await {
                Ok(generated) => tracing::info!(generated, "invoice close pass finished"),
                Err(err) => tracing::warn!(?err, "invoice close pass failed"),
            }
        }
    });

    let overdue_pool = pool.clone();
    tokio::spawn(async move {
        loop {
            sleep_until_daily(3, 0).await;
            match process_overdue_tick(&overdue_pool, Utc::now()).await {
                Ok(marked) => tracing::info!(marked, "overdue sweep finished"),
                Err(err) => tracing::warn!(?err, "overdue sweep failed"),
            }
        }
    });

    tokio::spawn(async move {
        loop {
            sleep_until_month_start().await;
            match process_monthly_tick(&pool, Utc::now()).await {
                Ok(report) => tracing::info!(
                    successful = report.successful,
                    failed = report.failed,
                    "monthly invoice generation finished"
                ),
                Err(err) => tracing::warn!(?err, "monthly invoice generation failed"),
            }
        }
    });
}

/// Close-of-period pass: generate an invoice for every active customer whose
/// window ends within the day and has none yet.
pub async fn process_invoice_close_tick(pool: &PgPool, now: DateTime<Utc>) -> AppResult<usize> {
    let service = InvoiceService::new(pool.clone());
    let customers: Vec<Uuid> =
        sqlx::query_scalar("SELECT id FROM customers WHERE active = TRUE ORDER BY created_at")
            .fetch_all(pool)
            .await?;

    let mut generated = 0usize;
    for customer_id in customers {
        let period = match current_billing_period(pool, customer_id, now).await {
            Ok(period) => period,
            Err(err) => {
                tracing::warn!(?err, %customer_id, "skipping customer with unresolvable period");
                continue;
            }
        };
        if period.days_remaining > 1 {
            continue;
        }

        let already_invoiced: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM invoices \
             WHERE customer_id = $1 AND period_start = $2 AND period_end = $3)",
        )
        .bind(customer_id)
        .bind(period.period_start)
        .bind(period.period_end)
        .fetch_one(pool)
        .await?;
        if already_invoiced {
            continue;
        }

        match service
            .generate_invoice(customer_id, period.period_start, period.period_end)
            .await
        {
            Ok(hydrated) => {
                generated += 1;
                tracing::info!(
                    number = %hydrated.invoice.number,
                    %customer_id,
                    "generated close-of-period invoice"
                );
            }
            Err(err) => {
                tracing::warn!(?err, %customer_id, "close-of-period generation failed")
            }
        }
    }
    Ok(generated)
}

pub async fn process_overdue_tick(pool: &PgPool, now: DateTime<Utc>) -> AppResult<u64> {
    InvoiceService::new(pool.clone())
        .mark_overdue_invoices(now)
        .await
}

pub async fn process_monthly_tick(
    pool: &PgPool,
    now: DateTime<Utc>,
) -> AppResult<BulkGenerationReport> {
    InvoiceService::new(pool.clone())
        .generate_monthly_invoices(None, now)
        .await
}

async fn sleep_until_daily(hour: u32, minute: u32) {
    time::sleep(until_next_daily(Local::now(), hour, minute)).await;
}

async fn sleep_until_month_start() {
    time::sleep(until_next_month_start(Local::now())).await;
}

fn until_next_daily<Tz: TimeZone>(now: DateTime<Tz>, hour: u32, minute: u32) -> std::time::Duration {
    let at_time = now
        .date_naive()
        .and_hms_opt(hour, minute, 0)
        .expect("valid wall-clock time");
    let today = resolve_local(&now.timezone(), at_time);
    let target = if today > now {
        today
    } else {
        let tomorrow = now
            .date_naive()
            .checked_add_days(Days::new(1))
            .expect("date overflow")
            .and_hms_opt(hour, minute, 0)
            .expect("valid wall-clock time");
        resolve_local(&now.timezone(), tomorrow)
    };
    (target - now).to_std().unwrap_or_default()
}

fn until_next_month_start<Tz: TimeZone>(now: DateTime<Tz>) -> std::time::Duration {
    let first_of_next = NaiveDate::from_ymd_opt(now.year(), now.month(), 1)
        .expect("valid month start")
        .checked_add_months(Months::new(1))
        .expect("month overflow")
        .and_hms_opt(0, 0, 0)
        .expect("valid midnight");
    let target = resolve_local(&now.timezone(), first_of_next);
    (target - now).to_std().unwrap_or_default()
}

fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> DateTime<Tz> {
    match tz.from_local_datetime(&naive) {
        LocalResult::Single(instant) => instant,
        LocalResult::Ambiguous(earliest, _) => earliest,
        // Wall-clock time erased by a DST gap; shift one hour forward.
        LocalResult::None => {
            let shifted = naive + chrono::Duration::hours(1);
            match tz.from_local_datetime(&shifted) {
                LocalResult::Single(instant) | LocalResult::Ambiguous(instant, _) => instant,
                LocalResult::None => tz.from_utc_datetime(&naive),
            }
        }
    }
}
