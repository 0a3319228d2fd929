use std::sync::Arc;

use chrono::{DateTime, Days, Local, LocalResult, SecondsFormat, TimeZone, Utc};
use uuid::Uuid;

use crate::error::AppResult;
use crate::fast_store::{CounterState, FastStore};

/// Admission decision for one request against a daily quota.
#[derive(Debug, Clone)]
pub enum RateOutcome {
    /// Tier quota of 0: no counter is touched.
    Unlimited,
    Limited(RateDecision),
}

#[derive(Debug, Clone)]
pub struct RateDecision {
    pub allowed: bool,
    pub limit: i64,
    pub remaining: i64,
    pub reset_at: DateTime<Utc>,
}

impl RateOutcome {
    pub fn is_allowed(&self) -> bool {
        match self {
            RateOutcome::Unlimited => true,
            RateOutcome::Limited(decision) => decision.allowed,
        }
    }
}

/// Midnight-reset counter engine over the fast store. The per-customer
/// check-then-write runs as a single atomic store round trip, so concurrent
/// admission can over-issue by at most one request.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn FastStore>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn FastStore>) -> Self {
        Self { store }
    }

    pub async fn check_and_increment(
        &self,
        customer_id: Uuid,
        quota: i64,
    ) -> AppResult<RateOutcome> {
        let fresh_reset = next_midnight(Local::now()).with_timezone(&Utc);
        self.check_at(customer_id, quota, Utc::now(), fresh_reset)
            .await
    }

    pub async fn check_at(
        &self,
        customer_id: Uuid,
        quota: i64,
        now: DateTime<Utc>,
        fresh_reset: DateTime<Utc>,
    ) -> AppResult<RateOutcome> {
        if quota <= 0 {
            return Ok(RateOutcome::Unlimited);
        }

        let probe = self
            .store
            .counter_probe(
                &counter_key(customer_id),
                quota,
                &window_stamp(now),
                &window_stamp(fresh_reset),
            )
            .await?;

        let reset_at = match DateTime::parse_from_rfc3339(&probe.reset_at) {
            Ok(parsed) => parsed.with_timezone(&Utc),
            Err(err) => {
                tracing::warn!(?err, %customer_id, raw = %probe.reset_at, "unparseable counter resetAt");
                fresh_reset
            }
        };

        let decision = match probe.state {
            CounterState::Fresh => RateDecision {
                allowed: true,
                limit: quota,
                remaining: quota - 1,
                reset_at,
            },
            CounterState::Counting => RateDecision {
                allowed: true,
                limit: quota,
                // Pre-increment count: the request that just took slot c
                // reports quota - c remaining.
                remaining: quota - (probe.count - 1),
                reset_at,
            },
            CounterState::Exhausted => RateDecision {
                allowed: false,
                limit: quota,
                remaining: 0,
                reset_at,
            },
        };
        Ok(RateOutcome::Limited(decision))
    }
}

pub fn counter_key(customer_id: Uuid) -> String {
    format!("rate:{customer_id}")
}

/// Fixed-width RFC 3339 UTC stamp; lexicographic order matches chronological
/// order, which the counter script relies on.
pub fn window_stamp(instant: DateTime<Utc>) -> String {
    instant.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Upcoming midnight (today 24:00) in the given timezone.
pub fn next_midnight<Tz: TimeZone>(now: DateTime<Tz>) -> DateTime<Tz> {
    let tomorrow = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .expect("date overflow");
    let midnight = tomorrow.and_hms_opt(0, 0, 0).expect("valid midnight");
    match now.timezone().from_local_datetime(&midnight) {
        LocalResult::Single(instant) => instant,
        LocalResult::Ambiguous(earliest, _) => earliest,
        // Midnight erased by a DST gap: first representable hour that day.
        LocalResult::None => {
            let one_am = tomorrow.and_hms_opt(1, 0, 0).expect("valid 01:00");
            match now.timezone().from_local_datetime(&one_am) {
                LocalResult::Single(instant) | LocalResult::Ambiguous(instant, _) => instant,
                LocalResult::None => now.timezone().from_utc_datetime(&midnight),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fast_store::MemoryStore;
    use chrono::TimeZone;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[tokio::test]
    async fn counts_down_remaining_within_window() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        let customer = Uuid::new_v4();
        let reset = utc("2024-01-02T00:00:00Z");

        let first = limiter
            .check_at(customer, 100, utc("2024-01-01T08:00:00Z"), reset)
            .await
            .unwrap();
        let RateOutcome::Limited(first) = first else {
            panic!("expected limited outcome")
        };
        assert!(first.allowed);
        assert_eq!(first.remaining, 99);

        // Seed the counter up to 50, then take the 51st slot.
        for _ in 0..49 {
            limiter
                .check_at(customer, 100, utc("2024-01-01T09:00:00Z"), reset)
                .await
                .unwrap();
        }
        let RateOutcome::Limited(fifty_first) = limiter
            .check_at(customer, 100, utc("2024-01-01T10:00:00Z"), reset)
            .await
            .unwrap()
        else {
            panic!("expected limited outcome")
        };
        assert!(fifty_first.allowed);
        assert_eq!(fifty_first.remaining, 50);
        assert_eq!(fifty_first.reset_at, reset);
    }

    #[tokio::test]
    async fn denies_at_quota_and_leaves_counter_untouched() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store.clone());
        let customer = Uuid::new_v4();
        let reset = utc("2024-01-02T00:00:00Z");

        for _ in 0..3 {
            limiter
                .check_at(customer, 3, utc("2024-01-01T08:00:00Z"), reset)
                .await
                .unwrap();
        }
        let RateOutcome::Limited(denied) = limiter
            .check_at(customer, 3, utc("2024-01-01T09:00:00Z"), reset)
            .await
            .unwrap()
        else {
            panic!("expected limited outcome")
        };
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);

        let hash = store.hash_get_all(&counter_key(customer)).await.unwrap();
        assert_eq!(hash.get("count").map(String::as_str), Some("3"));
    }

    #[tokio::test]
    async fn window_expiry_resets_to_fresh() {
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()));
        let customer = Uuid::new_v4();

        for _ in 0..100 {
            limiter
                .check_at(
                    customer,
                    100,
                    utc("2024-01-01T08:00:00Z"),
                    utc("2024-01-02T00:00:00Z"),
                )
                .await
                .unwrap();
        }

        let RateOutcome::Limited(after_reset) = limiter
            .check_at(
                customer,
                100,
                utc("2024-01-02T00:01:00Z"),
                utc("2024-01-03T00:00:00Z"),
            )
            .await
            .unwrap()
        else {
            panic!("expected limited outcome")
        };
        assert!(after_reset.allowed);
        assert_eq!(after_reset.remaining, 99);
        assert_eq!(after_reset.reset_at, utc("2024-01-03T00:00:00Z"));
    }

    #[tokio::test]
    async fn zero_quota_is_unlimited() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(store.clone());
        let customer = Uuid::new_v4();

        let outcome = limiter.check_and_increment(customer, 0).await.unwrap();
        assert!(matches!(outcome, RateOutcome::Unlimited));

        let hash = store.hash_get_all(&counter_key(customer)).await.unwrap();
        assert!(hash.is_empty());
    }

    #[test]
    fn next_midnight_rolls_days_and_months() {
        let now = Utc.with_ymd_and_hms(2024, 1, 31, 23, 59, 59).unwrap();
        assert_eq!(
            next_midnight(now),
            Utc.with_ymd_and_hms(2024, 2, 1, 0, 0, 0).unwrap()
        );

        let offset = chrono::FixedOffset::east_opt(5 * 3600).unwrap();
        let local = offset.with_ymd_and_hms(2024, 6, 15, 1, 0, 0).unwrap();
        assert_eq!(
            next_midnight(local),
            offset.with_ymd_and_hms(2024, 6, 16, 0, 0, 0).unwrap()
        );
    }
}
