use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::config;
use crate::error::AppResult;
use crate::fast_store::FastStore;

/// Resolved `(customer, developer, key)` triple; the unit cached in the fast
/// store under `key-context:{secret}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthContext {
    pub customer: CustomerContext,
    pub developer: DeveloperContext,
    pub key: KeyContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomerContext {
    pub id: Uuid,
    pub email: String,
    pub daily_quota: i64,
    pub tier: TierContext,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierContext {
    pub id: Uuid,
    pub name: String,
    pub daily_quota: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeveloperContext {
    pub id: Uuid,
    pub name: String,
    pub upstream_base_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyContext {
    pub id: Uuid,
    pub active: bool,
    pub expires_at: Option<DateTime<Utc>>,
}

/// Tiered secret lookup: fast-store cache first, catalog on miss. Fast-store
/// failures never mask a valid key.
#[derive(Clone)]
pub struct KeyResolver {
    pool: PgPool,
    store: Arc<dyn FastStore>,
}

impl KeyResolver {
    pub fn new(pool: PgPool, store: Arc<dyn FastStore>) -> Self {
        Self { pool, store }
    }

    /// Returns `None` for absent, inactive, or expired keys and for inactive
    /// owning customers. Rejections are never cached.
    pub async fn resolve(&self, secret: &str) -> AppResult<Option<AuthContext>> {
        let cache_key = format!("key-context:{secret}");
        if let Some(context) = self.cache_get(&cache_key).await {
            return Ok(Some(context));
        }

        let row = sqlx::query(
            r#"
            SELECT
                k.id AS key_id,
                k.active AS key_active,
                k.expires_at,
                c.id AS customer_id,
                c.email,
                c.active AS customer_active,
                t.id AS tier_id,
                t.name AS tier_name,
                t.daily_quota,
                d.id AS developer_id,
                d.name AS developer_name,
                d.upstream_base_url
            FROM api_keys k
            JOIN customers c ON c.id = k.customer_id
            JOIN tiers t ON t.id = c.tier_id
            JOIN developers d ON d.id = c.developer_id
            WHERE k.secret = $1
            "#,
        )
        .bind(secret)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let now = Utc::now();
        let key = KeyContext {
            id: row.get("key_id"),
            active: row.get("key_active"),
            expires_at: row.get("expires_at"),
        };
        let customer_active: bool = row.get("customer_active");
        let expired = key.expires_at.map(|expiry| expiry <= now).unwrap_or(false);
        if !key.active || expired || !customer_active {
            return Ok(None);
        }

        let daily_quota: i64 = row.get("daily_quota");
        let context = AuthContext {
            customer: CustomerContext {
                id: row.get("customer_id"),
                email: row.get("email"),
                daily_quota,
                tier: TierContext {
                    id: row.get("tier_id"),
                    name: row.get("tier_name"),
                    daily_quota,
                },
            },
            developer: DeveloperContext {
                id: row.get("developer_id"),
                name: row.get("developer_name"),
                upstream_base_url: row.get("upstream_base_url"),
            },
            key,
        };

        self.stamp_last_used(context.key.id);
        self.cache_put(&cache_key, &context).await;

        Ok(Some(context))
    }

    async fn cache_get(&self, cache_key: &str) -> Option<AuthContext> {
        let deadline = Duration::from_millis(*config::FAST_STORE_OP_TIMEOUT_MS);
        match tokio::time::timeout(deadline, self.store.get(cache_key)).await {
            Ok(Ok(Some(raw))) => match serde_json::from_str::<AuthContext>(&raw) {
                Ok(context) => Some(context),
                Err(err) => {
                    tracing::warn!(?err, "discarding undecodable cached auth context");
                    None
                }
            },
            Ok(Ok(None)) => None,
            Ok(Err(err)) => {
                tracing::warn!(?err, "auth context cache read failed; using catalog");
                None
            }
            Err(_) => {
                tracing::warn!("auth context cache read timed out; using catalog");
                None
            }
        }
    }

    async fn cache_put(&self, cache_key: &str, context: &AuthContext) {
        let raw = match serde_json::to_string(context) {
            Ok(raw) => raw,
            Err(err) => {
                tracing::warn!(?err, "failed to serialize auth context");
                return;
            }
        };
        let ttl = Duration::from_secs(*config::KEY_CACHE_TTL_SECS);
        let deadline = Duration::from_millis(*config::FAST_STORE_OP_TIMEOUT_MS);
        match tokio::time::timeout(deadline, self.store.set_with_ttl(cache_key, &raw, ttl)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::warn!(?err, "auth context cache write failed"),
            Err(_) => tracing::warn!("auth context cache write timed out"),
        }
    }

    // Runs off the request path; at most one write per key per cache window.
    fn stamp_last_used(&self, key_id: Uuid) {
        let pool = self.pool.clone();
        tokio::spawn(async move {
            if let Err(err) = sqlx::query("UPDATE api_keys SET last_used_at = NOW() WHERE id = $1")
                .bind(key_id)
                .execute(&pool)
                .await
            {
                tracing::warn!(?err, %key_id, "failed to stamp key last_used_at");
            }
        });
    }
}
