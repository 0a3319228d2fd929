use std::sync::Arc;

use chrono::Utc;
use metergate::fast_store::{FastStore, MemoryStore};
use metergate::usage::{self, BufferedUsage, UsageBuffer, GLOBAL_BUFFER_KEY};
use sqlx::PgPool;
use uuid::Uuid;

// key: drain-tests -> batched flush, malformed entries, retry slice
async fn seed_customer(pool: &PgPool) -> Uuid {
    let tier_id = Uuid::new_v4();
    sqlx::query("INSERT INTO tiers (id, name, price_cents, daily_quota) VALUES ($1, $2, 0, 0)")
        .bind(tier_id)
        .bind(format!("Free-{tier_id}"))
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
        "INSERT INTO customers (id, email, tier_id, developer_id) VALUES ($1, $2, $3, $4)",
    )
    .bind(customer_id)
    .bind(format!("{customer_id}@example.com"))
    .bind(tier_id)
    .bind(developer_id)
    .execute(pool)
    .await
    .unwrap();
    customer_id
}

fn record(customer_id: Uuid, endpoint: &str) -> BufferedUsage {
    BufferedUsage {
        customer_id,
        api_key_id: None,
        endpoint: endpoint.to_string(),
        method: "GET".to_string(),
        status_code: 200,
        response_time_ms: 25,
        recorded_at: Utc::now(),
    }
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn drain_persists_batch_and_trims_buffer(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let customer_id = seed_customer(&pool).await;

    let store = Arc::new(MemoryStore::new());
    let buffer = UsageBuffer::new(store.clone());
    for i in 0..5 {
        buffer
            .push(&record(customer_id, &format!("/e/{i}")))
            .await
            .unwrap();
    }

    let flushed = usage::drain_once(&pool, store.as_ref()).await.unwrap();
    assert_eq!(flushed, 5);

    let persisted: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM usage_records WHERE customer_id = $1")
            .bind(customer_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(persisted, 5);

    assert!(store.head(GLOBAL_BUFFER_KEY, 10).await.unwrap().is_empty());
    assert_eq!(usage::drain_once(&pool, store.as_ref()).await.unwrap(), 0);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn malformed_entries_are_skipped_but_trimmed(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let customer_id = seed_customer(&pool).await;

    let store = Arc::new(MemoryStore::new());
    let buffer = UsageBuffer::new(store.clone());
    store
        .push_capped(GLOBAL_BUFFER_KEY, "{not json", 5_000)
        .await
        .unwrap();
    buffer.push(&record(customer_id, "/ok")).await.unwrap();

    let flushed = usage::drain_once(&pool, store.as_ref()).await.unwrap();
    assert_eq!(flushed, 1);

    let persisted: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM usage_records")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(persisted, 1);
    assert!(store.head(GLOBAL_BUFFER_KEY, 10).await.unwrap().is_empty());
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn drain_flushes_in_bounded_batches(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let customer_id = seed_customer(&pool).await;

    let store = Arc::new(MemoryStore::new());
    let buffer = UsageBuffer::new(store.clone());
    for i in 0..120 {
        buffer
            .push(&record(customer_id, &format!("/e/{i}")))
            .await
            .unwrap();
    }

    let first = usage::drain_once(&pool, store.as_ref()).await.unwrap();
    assert_eq!(first, 100);
    assert_eq!(store.head(GLOBAL_BUFFER_KEY, 200).await.unwrap().len(), 20);

    let second = usage::drain_once(&pool, store.as_ref()).await.unwrap();
    assert_eq!(second, 20);

    let persisted: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM usage_records WHERE customer_id = $1")
            .bind(customer_id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(persisted, 120);
}
