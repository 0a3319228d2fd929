use chrono::{Datelike, Duration, TimeZone, Utc};
use metergate::billing::{InvoiceFilter, InvoiceService, InvoiceStatus};
use metergate::error::AppError;
use sqlx::PgPool;
use uuid::Uuid;

// key: invoice-tests -> generation, sequencing, lifecycle
async fn seed_customer(pool: &PgPool, price_cents: i64) -> Uuid {
    let tier_id = Uuid::new_v4();
    sqlx::query("INSERT INTO tiers (id, name, price_cents, daily_quota) VALUES ($1, $2, $3, 100)")
        .bind(tier_id)
        .bind(format!("Growth-{tier_id}"))
        .bind(price_cents)
        .execute(pool)
        .await
        .unwrap();

    let developer_id = Uuid::new_v4();
    sqlx::query("INSERT INTO developers (id, name) VALUES ($1, $2)")
        .bind(developer_id)
        .bind("Origin Co")
        .execute(pool)
        .await
        .unwrap();

    let customer_id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO customers (id, email, tier_id, developer_id, active, created_at) \
         VALUES ($1, $2, $3, $4, TRUE, $5)",
    )
    .bind(customer_id)
    .bind(format!("{customer_id}@example.com"))
    .bind(tier_id)
    .bind(developer_id)
    .bind(Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap())
    .execute(pool)
    .await
    .unwrap();

    customer_id
}

async fn seed_usage(pool: &PgPool, customer_id: Uuid, count: usize, at: chrono::DateTime<Utc>) {
    for i in 0..count {
        sqlx::query(
            "INSERT INTO usage_records \
             (customer_id, endpoint, method, status_code, response_time_ms, recorded_at) \
             VALUES ($1, $2, 'GET', 200, 10, $3)",
        )
        .bind(customer_id)
        .bind(format!("/items/{i}"))
        .bind(at)
        .execute(pool)
        .await
        .unwrap();
    }
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn generation_hydrates_amount_usage_and_line_items(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let customer_id = seed_customer(&pool, 2900).await;

    let period_start = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
    let period_end = Utc.with_ymd_and_hms(2024, 2, 15, 0, 0, 0).unwrap();
    seed_usage(&pool, customer_id, 7, period_start + Duration::days(3)).await;
    // Outside the window, must not count.
    seed_usage(&pool, customer_id, 2, period_end + Duration::hours(1)).await;

    let service = InvoiceService::new(pool.clone());
    let hydrated = service
        .generate_invoice(customer_id, period_start, period_end)
        .await
        .unwrap();

    let now = Utc::now();
    assert_eq!(
        hydrated.invoice.number,
        format!("INV-{:04}-{:02}-001", now.year(), now.month())
    );
    assert_eq!(hydrated.invoice.amount_cents, 2900);
    assert_eq!(hydrated.invoice.total_usage, 7);
    assert_eq!(hydrated.invoice.status, "PENDING");
    assert!(hydrated.invoice.paid_at.is_none());

    assert_eq!(hydrated.line_items.len(), 2);
    let plan_item = &hydrated.line_items[0];
    assert!(plan_item.description.contains("Plan - January 2024"));
    assert_eq!(plan_item.quantity, 1);
    assert_eq!(plan_item.unit_price_cents, 2900);
    assert_eq!(plan_item.amount_cents, 2900);
    let usage_item = &hydrated.line_items[1];
    assert_eq!(usage_item.description, "API Calls: 7 requests");
    assert_eq!(usage_item.quantity, 7);
    assert_eq!(usage_item.unit_price_cents, 0);
    assert_eq!(usage_item.amount_cents, 0);

    let fetched = service.get_invoice(hydrated.invoice.id, None).await.unwrap();
    assert_eq!(fetched.invoice.number, hydrated.invoice.number);
    assert_eq!(fetched.line_items.len(), 2);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn numbers_sequence_within_the_generation_month(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let first_customer = seed_customer(&pool, 900).await;
    let second_customer = seed_customer(&pool, 900).await;

    let service = InvoiceService::new(pool.clone());
    let start = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2024, 2, 15, 0, 0, 0).unwrap();

    let first = service
        .generate_invoice(first_customer, start, end)
        .await
        .unwrap();
    let second = service
        .generate_invoice(second_customer, start, end)
        .await
        .unwrap();

    assert!(first.invoice.number.ends_with("-001"));
    assert!(second.invoice.number.ends_with("-002"));
    assert_ne!(first.invoice.number, second.invoice.number);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn duplicate_period_is_rejected(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let customer_id = seed_customer(&pool, 2900).await;

    let service = InvoiceService::new(pool.clone());
    let start = Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap();
    let end = Utc.with_ymd_and_hms(2024, 2, 15, 0, 0, 0).unwrap();

    service
        .generate_invoice(customer_id, start, end)
        .await
        .unwrap();
    let duplicate = service.generate_invoice(customer_id, start, end).await;
    assert!(matches!(duplicate, Err(AppError::BadRequest(_))));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn mark_paid_is_idempotent(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let customer_id = seed_customer(&pool, 2900).await;

    let service = InvoiceService::new(pool.clone());
    let invoice = service
        .generate_invoice(
            customer_id,
            Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 15, 0, 0, 0).unwrap(),
        )
        .await
        .unwrap()
        .invoice;

    let paid = service.mark_paid(invoice.id, None).await.unwrap();
    assert_eq!(paid.status, "PAID");
    let first_paid_at = paid.paid_at.expect("PAID implies paid_at");

    let paid_again = service.mark_paid(invoice.id, None).await.unwrap();
    assert_eq!(paid_again.status, "PAID");
    assert_eq!(paid_again.paid_at, Some(first_paid_at));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn status_updates_keep_paid_at_invariant(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let customer_id = seed_customer(&pool, 2900).await;

    let service = InvoiceService::new(pool.clone());
    let invoice = service
        .generate_invoice(
            customer_id,
            Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 15, 0, 0, 0).unwrap(),
        )
        .await
        .unwrap()
        .invoice;

    let paid = service
        .update_status(invoice.id, InvoiceStatus::Paid, None, Some("pay_123".into()), None)
        .await
        .unwrap();
    assert!(paid.paid_at.is_some());
    assert_eq!(paid.external_payment_ref.as_deref(), Some("pay_123"));

    let cancelled = service
        .update_status(invoice.id, InvoiceStatus::Cancelled, None, None, None)
        .await
        .unwrap();
    assert_eq!(cancelled.status, "CANCELLED");
    assert!(cancelled.paid_at.is_none());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn overdue_sweep_marks_only_past_due_pending(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let customer_id = seed_customer(&pool, 2900).await;
    let service = InvoiceService::new(pool.clone());
    let now = Utc::now();

    for month in 1..=5u32 {
        let start = Utc.with_ymd_and_hms(2023, month, 1, 0, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2023, month + 1, 1, 0, 0, 0).unwrap();
        let invoice = service
            .generate_invoice(customer_id, start, end)
            .await
            .unwrap()
            .invoice;
        // Three past due, two due tomorrow.
        let due = if month <= 3 {
            now - Duration::days(1)
        } else {
            now + Duration::days(1)
        };
        sqlx::query("UPDATE invoices SET due_date = $2 WHERE id = $1")
            .bind(invoice.id)
            .bind(due)
            .execute(&pool)
            .await
            .unwrap();
    }

    assert_eq!(service.mark_overdue_invoices(now).await.unwrap(), 3);

    let overdue = service
        .list_invoices(&InvoiceFilter {
            customer_id: Some(customer_id),
            status: Some("OVERDUE".into()),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(overdue.len(), 3);

    // Second sweep finds nothing new.
    assert_eq!(service.mark_overdue_invoices(now).await.unwrap(), 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn owner_scope_hides_foreign_invoices(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let owner = seed_customer(&pool, 2900).await;
    let stranger = seed_customer(&pool, 2900).await;

    let service = InvoiceService::new(pool.clone());
    let invoice = service
        .generate_invoice(
            owner,
            Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 15, 0, 0, 0).unwrap(),
        )
        .await
        .unwrap()
        .invoice;

    assert!(service.get_invoice(invoice.id, Some(owner)).await.is_ok());
    assert!(matches!(
        service.get_invoice(invoice.id, Some(stranger)).await,
        Err(AppError::NotFound)
    ));
}
