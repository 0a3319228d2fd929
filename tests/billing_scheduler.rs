use chrono::{DateTime, Duration, TimeZone, Utc};
use metergate::billing::scheduler;
use sqlx::PgPool;
use uuid::Uuid;

// key: scheduler-tests -> close pass, overdue sweep, monthly bulk
async fn seed_customer(pool: &PgPool, created_at: DateTime<Utc>) -> Uuid {
    let tier_id = Uuid::new_v4();
    sqlx::query("INSERT INTO tiers (id, name, price_cents, daily_quota) VALUES ($1, $2, 1900, 50)")
        .bind(tier_id)
        .bind(format!("Starter-{tier_id}"))
        .execute(pool)
        .await
        .unwrap();

    let developer_id = Uuid::new_v4();
    sqlx::query("INSERT INTO developers (id, name) VALUES ($1, 'Origin Co')")
        .bind(developer_id)
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
    .bind(created_at)
    .execute(pool)
    .await
    .unwrap();

    customer_id
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn close_pass_generates_for_windows_ending_today(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    // Period [Jan 15, Feb 15) with two hours left on the clock.
    let closing = seed_customer(&pool, Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()).await;
    // Freshly started period, nowhere near close.
    let fresh = seed_customer(&pool, Utc.with_ymd_and_hms(2024, 2, 10, 0, 0, 0).unwrap()).await;

    let now = Utc.with_ymd_and_hms(2024, 2, 14, 22, 0, 0).unwrap();
    let generated = scheduler::process_invoice_close_tick(&pool, now).await.unwrap();
    assert_eq!(generated, 1);

    let closing_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM invoices WHERE customer_id = $1")
            .bind(closing)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(closing_count, 1);

    let fresh_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM invoices WHERE customer_id = $1")
            .bind(fresh)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(fresh_count, 0);

    // The same tick re-run does not double-invoice the period.
    let repeat = scheduler::process_invoice_close_tick(&pool, now).await.unwrap();
    assert_eq!(repeat, 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn overdue_tick_transitions_past_due_invoices(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let customer_id = seed_customer(&pool, Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap()).await;

    let now = Utc::now();
    sqlx::query(
        "INSERT INTO invoices (id, number, customer_id, period_start, period_end, amount_cents, status, due_date) \
         VALUES ($1, 'INV-2023-07-001', $2, $3, $4, 1900, 'PENDING', $5)",
    )
    .bind(Uuid::new_v4())
    .bind(customer_id)
    .bind(Utc.with_ymd_and_hms(2023, 6, 1, 0, 0, 0).unwrap())
    .bind(Utc.with_ymd_and_hms(2023, 7, 1, 0, 0, 0).unwrap())
    .bind(now - Duration::days(2))
    .execute(&pool)
    .await
    .unwrap();

    let marked = scheduler::process_overdue_tick(&pool, now).await.unwrap();
    assert_eq!(marked, 1);

    let status: String = sqlx::query_scalar("SELECT status FROM invoices WHERE customer_id = $1")
        .bind(customer_id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(status, "OVERDUE");
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn monthly_tick_only_invoices_customers_near_close(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();

    // Five days left in the window: inside the 7-day close window.
    let near_close =
        seed_customer(&pool, Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()).await;
    // Twenty days left: skipped.
    let mid_cycle =
        seed_customer(&pool, Utc.with_ymd_and_hms(2024, 1, 30, 0, 0, 0).unwrap()).await;
    // Inactive customers are never selected.
    let inactive =
        seed_customer(&pool, Utc.with_ymd_and_hms(2024, 1, 15, 0, 0, 0).unwrap()).await;
    sqlx::query("UPDATE customers SET active = FALSE WHERE id = $1")
        .bind(inactive)
        .execute(&pool)
        .await
        .unwrap();

    let now = Utc.with_ymd_and_hms(2024, 2, 10, 0, 0, 0).unwrap();
    let report = scheduler::process_monthly_tick(&pool, now).await.unwrap();
    assert_eq!(report.successful, 1);
    assert_eq!(report.failed, 0);
    assert_eq!(report.invoices.len(), 1);
    assert_eq!(report.invoices[0].customer_id, near_close);

    let mid_cycle_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM invoices WHERE customer_id = $1")
            .bind(mid_cycle)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(mid_cycle_count, 0);
}
