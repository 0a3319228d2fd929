use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, QueryBuilder};
use tokio::time::{self, Duration as TokioDuration};
use uuid::Uuid;

use crate::config;
use crate::error::AppResult;
use crate::fast_store::FastStore;

pub const GLOBAL_BUFFER_KEY: &str = "usage:buffer:global";

pub fn customer_buffer_key(customer_id: Uuid) -> String {
    format!("usage:buffer:customer:{customer_id}")
}

/// One proxied call, serialized into the fast-store buffers until the drain
/// task lands it in `usage_records`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferedUsage {
    pub customer_id: Uuid,
    pub api_key_id: Option<Uuid>,
    pub endpoint: String,
    pub method: String,
    pub status_code: i32,
    pub response_time_ms: i64,
    pub recorded_at: DateTime<Utc>,
}

/// Write-behind capture: one push per admitted request, bounded lists,
/// best-effort. Billing truth lives in the durable table after drain.
#[derive(Clone)]
pub struct UsageBuffer {
    store: Arc<dyn FastStore>,
}

impl UsageBuffer {
    pub fn new(store: Arc<dyn FastStore>) -> Self {
        Self { store }
    }

    /// Queue the record off the request path. Push failures are logged and
    /// dropped.
    pub fn record(&self, record: BufferedUsage) {
        let buffer = self.clone();
        tokio::spawn(async move {
            if let Err(err) = buffer.push(&record).await {
                tracing::warn!(?err, customer_id = %record.customer_id, "usage buffer push failed");
            }
        });
    }

    pub async fn push(&self, record: &BufferedUsage) -> AppResult<()> {
        let raw = serde_json::to_string(record)
            .map_err(|err| crate::error::AppError::Message(err.to_string()))?;
        self.store
            .push_capped(
                &customer_buffer_key(record.customer_id),
                &raw,
                config::CUSTOMER_BUFFER_CAP,
            )
            .await?;
        self.store
            .push_capped(GLOBAL_BUFFER_KEY, &raw, config::GLOBAL_BUFFER_CAP)
            .await?;
        Ok(())
    }

    /// Newest-first slice of a customer's buffered history.
    pub async fn recent_for_customer(
        &self,
        customer_id: Uuid,
        limit: i64,
    ) -> AppResult<Vec<BufferedUsage>> {
        let entries = self
            .store
            .head(&customer_buffer_key(customer_id), limit)
            .await?;
        Ok(parse_entries(&entries))
    }
}

fn parse_entries(entries: &[String]) -> Vec<BufferedUsage> {
    let mut records = Vec::with_capacity(entries.len());
    let mut malformed = 0usize;
    for raw in entries {
        match serde_json::from_str::<BufferedUsage>(raw) {
            Ok(record) => records.push(record),
            Err(_) => malformed += 1,
        }
    }
    if malformed > 0 {
        tracing::warn!(malformed, "skipping malformed buffered usage entries");
    }
    records
}

/// Periodic flush of the global buffer into the durable store.
pub fn spawn_drain(pool: PgPool, store: Arc<dyn FastStore>) {
    let interval = TokioDuration::from_secs(*config::USAGE_DRAIN_INTERVAL_SECS);
    tokio::spawn(async move {
        let mut ticker = time::interval(interval);
        loop {
            ticker.tick().await;
            match drain_once(&pool, store.as_ref()).await {
                Ok(0) => {}
                Ok(flushed) => tracing::debug!(flushed, "usage drain tick"),
                // Batch stays in the buffer for the next tick.
                Err(err) => tracing::warn!(?err, "usage drain tick failed"),
            }
        }
    });
}

/// Flush one batch of the oldest buffered records. Returns the number of rows
/// handed to the durable store; malformed entries are skipped but still
/// trimmed.
pub async fn drain_once(pool: &PgPool, store: &dyn FastStore) -> AppResult<usize> {
    let batch = store.tail(GLOBAL_BUFFER_KEY, *config::USAGE_DRAIN_BATCH).await?;
    if batch.is_empty() {
        return Ok(0);
    }

    let records = parse_entries(&batch);
    if !records.is_empty() {
        let mut builder = QueryBuilder::new(
            "INSERT INTO usage_records \
             (customer_id, api_key_id, endpoint, method, status_code, response_time_ms, recorded_at) ",
        );
        builder.push_values(records.iter(), |mut row, record| {
            row.push_bind(record.customer_id)
                .push_bind(record.api_key_id)
                .push_bind(&record.endpoint)
                .push_bind(&record.method)
                .push_bind(record.status_code)
                .push_bind(record.response_time_ms)
                .push_bind(record.recorded_at);
        });
        builder.push(" ON CONFLICT DO NOTHING");
        builder.build().execute(pool).await?;
    }

    store.drop_tail(GLOBAL_BUFFER_KEY, batch.len() as i64).await?;
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fast_store::MemoryStore;

    fn sample(customer_id: Uuid, endpoint: &str) -> BufferedUsage {
        BufferedUsage {
            customer_id,
            api_key_id: Some(Uuid::new_v4()),
            endpoint: endpoint.to_string(),
            method: "GET".to_string(),
            status_code: 200,
            response_time_ms: 12,
            recorded_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn push_feeds_both_buffers() {
        let store = Arc::new(MemoryStore::new());
        let buffer = UsageBuffer::new(store.clone());
        let customer = Uuid::new_v4();

        buffer.push(&sample(customer, "/a")).await.unwrap();
        buffer.push(&sample(customer, "/b")).await.unwrap();

        let global = store.head(GLOBAL_BUFFER_KEY, 10).await.unwrap();
        assert_eq!(global.len(), 2);

        let recent = buffer.recent_for_customer(customer, 10).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].endpoint, "/b");
        assert_eq!(recent[1].endpoint, "/a");
    }

    #[tokio::test]
    async fn malformed_entries_are_skipped() {
        let store = Arc::new(MemoryStore::new());
        let buffer = UsageBuffer::new(store.clone());
        let customer = Uuid::new_v4();

        buffer.push(&sample(customer, "/ok")).await.unwrap();
        store
            .push_capped(&customer_buffer_key(customer), "not-json", 10)
            .await
            .unwrap();

        let recent = buffer.recent_for_customer(customer, 10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].endpoint, "/ok");
    }
}
