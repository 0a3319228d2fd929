use chrono::{DateTime, Datelike, Duration, Utc};
use serde::Deserialize;
use sqlx::{PgPool, QueryBuilder, Row};
use uuid::Uuid;

use super::models::{
    BulkGenerationError, BulkGenerationReport, HydratedInvoice, Invoice, InvoiceLineItem,
    InvoiceStatus,
};
use super::period::current_billing_period;
use crate::error::{AppError, AppResult};

const DUE_DAYS: i64 = 7;
const SEQUENCER_RETRIES: u32 = 3;
/// Bulk generation only invoices customers whose period closes within this
/// many days.
const CLOSE_WINDOW_DAYS: i64 = 7;

/// key: invoice-engine -> generation, sequencing, lifecycle
#[derive(Clone)]
pub struct InvoiceService {
    pool: PgPool,
}

/// Filter envelope for invoice listings.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceFilter {
    pub customer_id: Option<Uuid>,
    pub status: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl InvoiceService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Next number in the `INV-YYYY-MM-NNN` sequence for the generation
    /// month. Racy by itself; `generate_invoice` retries on the uniqueness
    /// constraint.
    pub async fn next_invoice_number(&self, now: DateTime<Utc>) -> AppResult<String> {
        let prefix = format!("INV-{:04}-{:02}-", now.year(), now.month());
        let newest: Option<String> = sqlx::query_scalar(
            "SELECT number FROM invoices WHERE number LIKE $1 || '%' ORDER BY number DESC LIMIT 1",
        )
        .bind(&prefix)
        .fetch_optional(&self.pool)
        .await?;

        let next = newest
            .as_deref()
            .and_then(parse_sequence)
            .unwrap_or(0)
            + 1;
        Ok(format!("{prefix}{next:03}"))
    }

    pub async fn generate_invoice(
        &self,
        customer_id: Uuid,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
    ) -> AppResult<HydratedInvoice> {
        if period_start >= period_end {
            return Err(AppError::BadRequest(
                "period start must precede period end".into(),
            ));
        }

        let already_invoiced: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM invoices \
             WHERE customer_id = $1 AND period_start = $2 AND period_end = $3)",
        )
        .bind(customer_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_one(&self.pool)
        .await?;
        if already_invoiced {
            return Err(duplicate_period_error());
        }

        let customer = sqlx::query(
            "SELECT t.name AS tier_name, t.price_cents \
             FROM customers c JOIN tiers t ON t.id = c.tier_id WHERE c.id = $1",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        let Some(customer) = customer else {
            return Err(AppError::NotFound);
        };
        let tier_name: String = customer.get("tier_name");
        let price_cents: i64 = customer.get("price_cents");

        let total_usage: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM usage_records \
             WHERE customer_id = $1 AND recorded_at >= $2 AND recorded_at < $3",
        )
        .bind(customer_id)
        .bind(period_start)
        .bind(period_end)
        .fetch_one(&self.pool)
        .await?;

        let now = Utc::now();
        let due_date = now + Duration::days(DUE_DAYS);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let number = self.next_invoice_number(now).await?;
            match self
                .insert_invoice(
                    customer_id,
                    &number,
                    period_start,
                    period_end,
                    total_usage,
                    price_cents,
                    &tier_name,
                    due_date,
                )
                .await
            {
                Ok(invoice) => return Ok(invoice),
                Err(AppError::Db(err)) if constraint_is(&err, "invoices_number_key") => {
                    if attempt >= SEQUENCER_RETRIES {
                        return Err(AppError::Message(format!(
                            "invoice number allocation lost {attempt} races for {number}"
                        )));
                    }
                    tracing::warn!(%number, attempt, "invoice number collision; re-reading sequence");
                }
                Err(AppError::Db(err))
                    if constraint_is(&err, "invoices_customer_id_period_start_period_end_key") =>
                {
                    return Err(duplicate_period_error());
                }
                Err(other) => return Err(other),
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn insert_invoice(
        &self,
        customer_id: Uuid,
        number: &str,
        period_start: DateTime<Utc>,
        period_end: DateTime<Utc>,
        total_usage: i64,
        price_cents: i64,
        tier_name: &str,
        due_date: DateTime<Utc>,
    ) -> AppResult<HydratedInvoice> {
        let mut tx = self.pool.begin().await.map_err(AppError::from)?;

        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            INSERT INTO invoices (
                id, number, customer_id, period_start, period_end,
                total_usage, amount_cents, status, due_date
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(number)
        .bind(customer_id)
        .bind(period_start)
        .bind(period_end)
        .bind(total_usage)
        .bind(price_cents)
        .bind(InvoiceStatus::Pending.as_str())
        .bind(due_date)
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::Db)?;

        let plan_item = sqlx::query_as::<_, InvoiceLineItem>(
            "INSERT INTO invoice_line_items \
             (id, invoice_id, description, quantity, unit_price_cents, amount_cents) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(invoice.id)
        .bind(format!(
            "{tier_name} Plan - {}",
            period_start.format("%B %Y")
        ))
        .bind(1_i64)
        .bind(price_cents)
        .bind(price_cents)
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::Db)?;

        // Informational only; charging is base-tier.
        let usage_item = sqlx::query_as::<_, InvoiceLineItem>(
            "INSERT INTO invoice_line_items \
             (id, invoice_id, description, quantity, unit_price_cents, amount_cents) \
             VALUES ($1, $2, $3, $4, 0, 0) RETURNING *",
        )
        .bind(Uuid::new_v4())
        .bind(invoice.id)
        .bind(format!("API Calls: {total_usage} requests"))
        .bind(total_usage)
        .fetch_one(&mut *tx)
        .await
        .map_err(AppError::Db)?;

        tx.commit().await.map_err(AppError::from)?;

        Ok(HydratedInvoice {
            invoice,
            line_items: vec![plan_item, usage_item],
        })
    }

    /// Invoice by id. With `owner` set, invoices of other customers read as
    /// absent.
    pub async fn get_invoice(&self, id: Uuid, owner: Option<Uuid>) -> AppResult<HydratedInvoice> {
        let invoice = sqlx::query_as::<_, Invoice>(
            "SELECT * FROM invoices WHERE id = $1 AND ($2::uuid IS NULL OR customer_id = $2)",
        )
        .bind(id)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;
        let Some(invoice) = invoice else {
            return Err(AppError::NotFound);
        };
        let line_items = sqlx::query_as::<_, InvoiceLineItem>(
            "SELECT * FROM invoice_line_items WHERE invoice_id = $1 ORDER BY amount_cents DESC, description",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        Ok(HydratedInvoice {
            invoice,
            line_items,
        })
    }

    pub async fn list_invoices(&self, filter: &InvoiceFilter) -> AppResult<Vec<Invoice>> {
        let status = filter
            .status
            .as_deref()
            .map(|raw| {
                InvoiceStatus::parse(raw)
                    .ok_or_else(|| AppError::BadRequest(format!("unknown invoice status {raw}")))
            })
            .transpose()?;

        let mut builder = QueryBuilder::new("SELECT * FROM invoices WHERE TRUE ");
        if let Some(customer_id) = filter.customer_id {
            builder.push(" AND customer_id = ");
            builder.push_bind(customer_id);
        }
        if let Some(status) = status {
            builder.push(" AND status = ");
            builder.push_bind(status.as_str());
        }
        if let Some(start) = filter.start_date {
            builder.push(" AND created_at >= ");
            builder.push_bind(start);
        }
        if let Some(end) = filter.end_date {
            builder.push(" AND created_at <= ");
            builder.push_bind(end);
        }
        builder.push(" ORDER BY created_at DESC");
        builder.push(" LIMIT ");
        builder.push_bind(filter.limit.unwrap_or(50).clamp(1, 500));
        builder.push(" OFFSET ");
        builder.push_bind(filter.offset.unwrap_or(0).max(0));

        let invoices = builder
            .build_query_as::<Invoice>()
            .fetch_all(&self.pool)
            .await?;
        Ok(invoices)
    }

    /// Per-status counts and amounts, optionally scoped to one customer.
    pub async fn invoice_summary(&self, customer_id: Option<Uuid>) -> AppResult<serde_json::Value> {
        let rows = sqlx::query(
            "SELECT status, COUNT(*) AS count, COALESCE(SUM(amount_cents), 0) AS amount_cents \
             FROM invoices WHERE ($1::uuid IS NULL OR customer_id = $1) GROUP BY status",
        )
        .bind(customer_id)
        .fetch_all(&self.pool)
        .await?;

        let mut by_status = serde_json::Map::new();
        let mut total_count = 0_i64;
        let mut total_cents = 0_i64;
        for row in rows {
            let status: String = row.get("status");
            let count: i64 = row.get("count");
            let amount_cents: i64 = row.get("amount_cents");
            total_count += count;
            total_cents += amount_cents;
            by_status.insert(
                status,
                serde_json::json!({ "count": count, "amountCents": amount_cents }),
            );
        }
        Ok(serde_json::json!({
            "total": total_count,
            "totalAmountCents": total_cents,
            "byStatus": by_status,
        }))
    }

    /// Direct status assignment, preserving `paid_at non-null ⇔ PAID`.
    /// Repeated PAID transitions keep the original `paid_at`.
    pub async fn update_status(
        &self,
        id: Uuid,
        status: InvoiceStatus,
        paid_at: Option<DateTime<Utc>>,
        external_payment_ref: Option<String>,
        owner: Option<Uuid>,
    ) -> AppResult<Invoice> {
        let invoice = sqlx::query_as::<_, Invoice>(
            r#"
            UPDATE invoices SET
                status = $2,
                paid_at = CASE WHEN $2 = 'PAID' THEN COALESCE(paid_at, $3, NOW()) ELSE NULL END,
                external_payment_ref = COALESCE($4, external_payment_ref)
            WHERE id = $1 AND ($5::uuid IS NULL OR customer_id = $5)
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(status.as_str())
        .bind(paid_at)
        .bind(external_payment_ref)
        .bind(owner)
        .fetch_optional(&self.pool)
        .await?;
        invoice.ok_or(AppError::NotFound)
    }

    pub async fn mark_paid(&self, id: Uuid, owner: Option<Uuid>) -> AppResult<Invoice> {
        self.update_status(id, InvoiceStatus::Paid, Some(Utc::now()), None, owner)
            .await
    }

    /// Bulk PENDING → OVERDUE transition for invoices past due. Returns the
    /// number changed.
    pub async fn mark_overdue_invoices(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query(
            "UPDATE invoices SET status = 'OVERDUE' WHERE status = 'PENDING' AND due_date < $1",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Generate for every active customer whose period closes within the
    /// window; per-customer failures are captured, not fatal.
    pub async fn generate_monthly_invoices(
        &self,
        customer_ids: Option<Vec<Uuid>>,
        now: DateTime<Utc>,
    ) -> AppResult<BulkGenerationReport> {
        let candidates: Vec<Uuid> = match customer_ids {
            Some(ids) => {
                sqlx::query_scalar(
                    "SELECT id FROM customers WHERE active = TRUE AND id = ANY($1) ORDER BY created_at",
                )
                .bind(&ids)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_scalar("SELECT id FROM customers WHERE active = TRUE ORDER BY created_at")
                    .fetch_all(&self.pool)
                    .await?
            }
        };

        let mut report = BulkGenerationReport {
            successful: 0,
            failed: 0,
            errors: Vec::new(),
            invoices: Vec::new(),
        };
        for customer_id in candidates {
            match self.generate_for_current_period(customer_id, now).await {
                Ok(Some(hydrated)) => {
                    report.successful += 1;
                    report.invoices.push(hydrated.invoice);
                }
                Ok(None) => {}
                Err(err) => {
                    report.failed += 1;
                    report.errors.push(BulkGenerationError {
                        customer_id,
                        error: err.to_string(),
                    });
                }
            }
        }
        Ok(report)
    }

    async fn generate_for_current_period(
        &self,
        customer_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<Option<HydratedInvoice>> {
        let period = current_billing_period(&self.pool, customer_id, now).await?;
        if period.days_remaining > CLOSE_WINDOW_DAYS {
            return Ok(None);
        }
        self.generate_invoice(customer_id, period.period_start, period.period_end)
            .await
            .map(Some)
    }

    /// Recent invoices plus the lifetime paid total.
    pub async fn history(&self, customer_id: Uuid, limit: i64) -> AppResult<(Vec<Invoice>, i64)> {
        let invoices = sqlx::query_as::<_, Invoice>(
            "SELECT * FROM invoices WHERE customer_id = $1 ORDER BY created_at DESC LIMIT $2",
        )
        .bind(customer_id)
        .bind(limit.clamp(1, 100))
        .fetch_all(&self.pool)
        .await?;

        let paid_total: i64 = sqlx::query_scalar(
            "SELECT COALESCE(SUM(amount_cents), 0) FROM invoices \
             WHERE customer_id = $1 AND status = 'PAID'",
        )
        .bind(customer_id)
        .fetch_one(&self.pool)
        .await?;

        Ok((invoices, paid_total))
    }
}

fn duplicate_period_error() -> AppError {
    AppError::BadRequest("invoice already exists for this billing period".into())
}

fn constraint_is(err: &sqlx::Error, name: &str) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.constraint() == Some(name),
        _ => false,
    }
}

/// Trailing `NNN` of an `INV-YYYY-MM-NNN` number.
pub fn parse_sequence(number: &str) -> Option<i64> {
    number.rsplit('-').next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_suffix_parses() {
        assert_eq!(parse_sequence("INV-2024-02-001"), Some(1));
        assert_eq!(parse_sequence("INV-2024-02-042"), Some(42));
        assert_eq!(parse_sequence("INV-2024-12-999"), Some(999));
        assert_eq!(parse_sequence("garbage"), None);
    }
}
