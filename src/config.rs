use once_cell::sync::Lazy;

/// Shared secret protecting the admin endpoints. Must be set via the
/// `ADMIN_API_KEY` env variable.
pub static ADMIN_API_KEY: Lazy<String> =
    Lazy::new(|| std::env::var("ADMIN_API_KEY").expect("ADMIN_API_KEY must be set"));

/// Address the HTTP servers should bind to. Defaults to `0.0.0.0`.
pub static BIND_ADDRESS: Lazy<String> =
    Lazy::new(|| std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0".to_string()));

/// Port the gateway process listens on. Defaults to `3000`.
pub static PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3000)
});

/// Port the billing process listens on. Defaults to `3001`.
pub static BILLING_PORT: Lazy<u16> = Lazy::new(|| {
    std::env::var("BILLING_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(3001)
});

/// Connection URL for the fast store. Defaults to a local Redis.
pub static REDIS_URL: Lazy<String> = Lazy::new(|| {
    std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string())
});

/// Base URL of the billing process, used by the gateway to forward
/// customer-facing billing requests.
pub static BILLING_SERVICE_URL: Lazy<String> = Lazy::new(|| {
    std::env::var("BILLING_SERVICE_URL").unwrap_or_else(|_| "http://127.0.0.1:3001".to_string())
});

/// Base URL of the analytics surface. Defaults to the billing process, which
/// hosts the analytics aggregations.
pub static ANALYTICS_SERVICE_URL: Lazy<String> = Lazy::new(|| {
    std::env::var("ANALYTICS_SERVICE_URL").unwrap_or_else(|_| BILLING_SERVICE_URL.clone())
});

/// Fallback upstream base URL applied only when the resolved developer record
/// carries none.
pub static DEFAULT_UPSTREAM_URL: Lazy<Option<String>> =
    Lazy::new(|| read_optional_env("DEFAULT_UPSTREAM_URL"));

/// Hard deadline for a forwarded upstream call, in seconds.
pub static UPSTREAM_TIMEOUT_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("UPSTREAM_TIMEOUT_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(30)
});

/// TTL for cached auth contexts, in seconds. This is the staleness budget for
/// key and tier mutations.
pub static KEY_CACHE_TTL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("KEY_CACHE_TTL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(300)
});

/// Per-operation deadline for fast-store calls on the resolver path, in
/// milliseconds. Expiry falls through to the durable store.
pub static FAST_STORE_OP_TIMEOUT_MS: Lazy<u64> = Lazy::new(|| {
    std::env::var("FAST_STORE_OP_TIMEOUT_MS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(100)
});

/// Cadence of the usage drain task, in seconds.
pub static USAGE_DRAIN_INTERVAL_SECS: Lazy<u64> = Lazy::new(|| {
    std::env::var("USAGE_DRAIN_INTERVAL_SECS")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(30)
});

/// Number of buffered usage records flushed per drain tick.
pub static USAGE_DRAIN_BATCH: Lazy<i64> = Lazy::new(|| {
    std::env::var("USAGE_DRAIN_BATCH")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .filter(|value| *value > 0)
        .unwrap_or(100)
});

/// When set to a truthy value, allows the process to continue running even if
/// database migrations fail. Defaults to `false`.
pub static ALLOW_MIGRATION_FAILURE: Lazy<bool> = Lazy::new(|| {
    std::env::var("ALLOW_MIGRATION_FAILURE")
        .ok()
        .map(|value| {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "1" | "true" | "yes")
        })
        .unwrap_or(false)
});

/// Cap on the global usage buffer list.
pub const GLOBAL_BUFFER_CAP: i64 = 5_000;

/// Cap on each per-customer usage buffer list.
pub const CUSTOMER_BUFFER_CAP: i64 = 1_000;

fn read_optional_env(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
