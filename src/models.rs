use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Catalog entry a customer subscribes to. `daily_quota` of 0 denotes an
/// unlimited tier; `price_cents` is the monthly base price.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Tier {
    pub id: Uuid,
    pub name: String,
    pub price_cents: i64,
    pub daily_quota: i64,
    pub features: serde_json::Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Owner of an upstream origin. Customer traffic targets the owning
/// developer's `upstream_base_url`.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Developer {
    pub id: Uuid,
    pub name: String,
    pub upstream_base_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct Customer {
    pub id: Uuid,
    pub email: String,
    pub tier_id: Uuid,
    pub developer_id: Uuid,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: Uuid,
    pub secret: String,
    pub name: Option<String>,
    pub customer_id: Uuid,
    pub active: bool,
    pub last_used_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ApiKey {
    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        if !self.active {
            return false;
        }
        match self.expires_at {
            Some(expiry) => expiry > now,
            None => true,
        }
    }
}

/// Append-only record of one proxied call. Never updated after insert;
/// `recorded_at` is authoritative for any later aggregation.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct UsageRecord {
    pub id: i64,
    pub customer_id: Uuid,
    pub api_key_id: Option<Uuid>,
    pub endpoint: String,
    pub method: String,
    pub status_code: i32,
    pub response_time_ms: i64,
    pub recorded_at: DateTime<Utc>,
}
