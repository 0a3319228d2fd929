use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use super::models::BillingPeriod;
use super::period::current_billing_period;
use crate::error::{AppError, AppResult};
use crate::models::Tier;

/// key: pricing -> derived usage and cost views
#[derive(Clone)]
pub struct PricingService {
    pool: PgPool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageSummary {
    pub customer_id: Uuid,
    pub usage: i64,
    pub period: PeriodBounds,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodBounds {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradePreview {
    pub current_tier: TierQuote,
    pub new_tier: TierQuote,
    pub period: BillingPeriod,
    pub days_in_period: i64,
    pub prorated_amount_cents: i64,
    pub is_upgrade: bool,
    pub features_added: Vec<String>,
    pub features_removed: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TierQuote {
    pub id: Uuid,
    pub name: String,
    pub price_cents: i64,
}

impl From<&Tier> for TierQuote {
    fn from(tier: &Tier) -> Self {
        Self {
            id: tier.id,
            name: tier.name.clone(),
            price_cents: tier.price_cents,
        }
    }
}

impl PricingService {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn calculate_usage_for_period(
        &self,
        customer_id: Uuid,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> AppResult<UsageSummary> {
        let usage: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM usage_records \
             WHERE customer_id = $1 AND recorded_at >= $2 AND recorded_at < $3",
        )
        .bind(customer_id)
        .bind(start)
        .bind(end)
        .fetch_one(&self.pool)
        .await?;
        Ok(UsageSummary {
            customer_id,
            usage,
            period: PeriodBounds { start, end },
        })
    }

    pub async fn get_tier_pricing(&self, tier_id: Uuid) -> AppResult<Tier> {
        let tier = sqlx::query_as::<_, Tier>("SELECT * FROM tiers WHERE id = $1")
            .bind(tier_id)
            .fetch_optional(&self.pool)
            .await?;
        tier.ok_or(AppError::NotFound)
    }

    async fn current_tier(&self, customer_id: Uuid) -> AppResult<Tier> {
        let tier = sqlx::query_as::<_, Tier>(
            "SELECT t.* FROM customers c JOIN tiers t ON t.id = c.tier_id WHERE c.id = $1",
        )
        .bind(customer_id)
        .fetch_optional(&self.pool)
        .await?;
        tier.ok_or(AppError::NotFound)
    }

    /// Current tier cost, optionally compared against a target tier.
    pub async fn estimate_monthly_cost(
        &self,
        customer_id: Uuid,
        target_tier_id: Option<Uuid>,
    ) -> AppResult<Value> {
        let current = self.current_tier(customer_id).await?;
        let target = match target_tier_id {
            Some(id) if id != current.id => Some(self.get_tier_pricing(id).await?),
            _ => None,
        };

        let Some(target) = target else {
            return Ok(json!({
                "customerId": customer_id,
                "currentTier": TierQuote::from(&current),
            }));
        };

        Ok(json!({
            "customerId": customer_id,
            "currentTier": TierQuote::from(&current),
            "newTier": TierQuote::from(&target),
            "savingsCents": (current.price_cents - target.price_cents).max(0),
            "additionalCostCents": (target.price_cents - current.price_cents).max(0),
        }))
    }

    /// Current period plus the tier diff, prorated over the remaining days.
    pub async fn preview_tier_upgrade(
        &self,
        customer_id: Uuid,
        new_tier_id: Uuid,
        now: DateTime<Utc>,
    ) -> AppResult<UpgradePreview> {
        let current = self.current_tier(customer_id).await?;
        let target = self.get_tier_pricing(new_tier_id).await?;
        let period = current_billing_period(&self.pool, customer_id, now).await?;

        let days_in_period = (period.period_end - period.period_start).num_days().max(1);
        let prorated = prorate_cents(
            target.price_cents - current.price_cents,
            period.days_remaining,
            days_in_period,
        );
        let (features_added, features_removed) = feature_diff(&current.features, &target.features);

        Ok(UpgradePreview {
            current_tier: TierQuote::from(&current),
            new_tier: TierQuote::from(&target),
            days_in_period,
            prorated_amount_cents: prorated,
            is_upgrade: prorated > 0,
            features_added,
            features_removed,
            period,
        })
    }
}

/// Price difference scaled to the remaining share of the period, rounded to
/// the nearest cent.
pub fn prorate_cents(diff_cents: i64, days_remaining: i64, days_in_period: i64) -> i64 {
    if days_in_period <= 0 {
        return 0;
    }
    ((diff_cents as f64) * (days_remaining as f64) / (days_in_period as f64)).round() as i64
}

/// Key set-difference between two feature maps: (added, removed).
pub fn feature_diff(current: &Value, target: &Value) -> (Vec<String>, Vec<String>) {
    let current_keys: Vec<&String> = current
        .as_object()
        .map(|map| map.keys().collect())
        .unwrap_or_default();
    let target_keys: Vec<&String> = target
        .as_object()
        .map(|map| map.keys().collect())
        .unwrap_or_default();

    let mut added: Vec<String> = target_keys
        .iter()
        .filter(|key| !current_keys.contains(key))
        .map(|key| key.to_string())
        .collect();
    let mut removed: Vec<String> = current_keys
        .iter()
        .filter(|key| !target_keys.contains(key))
        .map(|key| key.to_string())
        .collect();
    added.sort();
    removed.sort();
    (added, removed)
}
