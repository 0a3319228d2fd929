use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use redis::{aio::ConnectionManager, Client, Script};

use crate::error::AppResult;

/// Counter lifecycle within one daily window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterState {
    /// Window was absent or expired; counter re-initialized to 1.
    Fresh,
    /// Counter incremented inside an open window.
    Counting,
    /// Quota boundary reached; counter left unchanged.
    Exhausted,
}

/// Result of one atomic counter round trip.
#[derive(Debug, Clone)]
pub struct CounterProbe {
    pub count: i64,
    pub reset_at: String,
    pub state: CounterState,
}

/// Key-value store with expiry, hash and bounded-list operations. Backed by
/// Redis in production and by an in-process map in tests.
///
/// Instants handed to `counter_probe` must be RFC 3339 UTC with whole seconds
/// and a `Z` suffix so that string comparison matches chronological order.
#[async_trait]
pub trait FastStore: Send + Sync {
    async fn get(&self, key: &str) -> AppResult<Option<String>>;
    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()>;
    async fn hash_get_all(&self, key: &str) -> AppResult<HashMap<String, String>>;

    /// Single-round-trip window counter: initialize when absent or expired,
    /// increment while under `quota`, refuse at the boundary.
    async fn counter_probe(
        &self,
        key: &str,
        quota: i64,
        now: &str,
        fresh_reset: &str,
    ) -> AppResult<CounterProbe>;

    /// Push to the head of a list and trim it to `cap` entries.
    async fn push_capped(&self, key: &str, value: &str, cap: i64) -> AppResult<()>;
    /// Oldest `n` entries still present (list tail).
    async fn tail(&self, key: &str, n: i64) -> AppResult<Vec<String>>;
    /// Remove the oldest `n` entries.
    async fn drop_tail(&self, key: &str, n: i64) -> AppResult<()>;
    /// Newest `n` entries (list head), newest first.
    async fn head(&self, key: &str, n: i64) -> AppResult<Vec<String>>;

    async fn ping(&self) -> AppResult<()>;
}

const COUNTER_SCRIPT: &str = r#"
local reset = redis.call('HGET', KEYS[1], 'resetAt')
if (not reset) or (reset <= ARGV[1]) then
  redis.call('HSET', KEYS[1], 'count', 1, 'resetAt', ARGV[2])
  return {1, ARGV[2], 2}
end
local count = tonumber(redis.call('HGET', KEYS[1], 'count') or '0')
local quota = tonumber(ARGV[3])
if quota > 0 and count >= quota then
  return {count, reset, 0}
end
redis.call('HSET', KEYS[1], 'count', count + 1)
return {count + 1, reset, 1}
"#;

#[derive(Clone)]
pub struct RedisStore {
    manager: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> AppResult<Self> {
        tracing::info!(%url, "connecting to fast store");
        let client = Client::open(url)?;
        // ConnectionManager reconnects on its own after connection loss.
        let manager = client.get_connection_manager().await?;
        Ok(Self { manager })
    }
}

#[async_trait]
impl FastStore for RedisStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl.as_secs().max(1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> AppResult<HashMap<String, String>> {
        let mut conn = self.manager.clone();
        let map: HashMap<String, String> = redis::cmd("HGETALL")
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(map)
    }

    async fn counter_probe(
        &self,
        key: &str,
        quota: i64,
        now: &str,
        fresh_reset: &str,
    ) -> AppResult<CounterProbe> {
        let mut conn = self.manager.clone();
        let (count, reset_at, state): (i64, String, i64) = Script::new(COUNTER_SCRIPT)
            .key(key)
            .arg(now)
            .arg(fresh_reset)
            .arg(quota)
            .invoke_async(&mut conn)
            .await?;
        Ok(CounterProbe {
            count,
            reset_at,
            state: match state {
                2 => CounterState::Fresh,
                1 => CounterState::Counting,
                _ => CounterState::Exhausted,
            },
        })
    }

    async fn push_capped(&self, key: &str, value: &str, cap: i64) -> AppResult<()> {
        let mut conn = self.manager.clone();
        redis::pipe()
            .atomic()
            .cmd("LPUSH")
            .arg(key)
            .arg(value)
            .ignore()
            .cmd("LTRIM")
            .arg(key)
            .arg(0)
            .arg(cap - 1)
            .ignore()
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn tail(&self, key: &str, n: i64) -> AppResult<Vec<String>> {
        let mut conn = self.manager.clone();
        let entries: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(-n)
            .arg(-1)
            .query_async(&mut conn)
            .await?;
        Ok(entries)
    }

    async fn drop_tail(&self, key: &str, n: i64) -> AppResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("LTRIM")
            .arg(key)
            .arg(0)
            .arg(-(n + 1))
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn head(&self, key: &str, n: i64) -> AppResult<Vec<String>> {
        let mut conn = self.manager.clone();
        let entries: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(n - 1)
            .query_async(&mut conn)
            .await?;
        Ok(entries)
    }

    async fn ping(&self) -> AppResult<()> {
        let mut conn = self.manager.clone();
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

/// In-process store with the same observable semantics, for tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

#[derive(Default)]
struct MemoryInner {
    values: HashMap<String, (String, Option<Instant>)>,
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FastStore for MemoryStore {
    async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut inner = self.inner.lock().unwrap();
        match inner.values.get(key) {
            Some((_, Some(deadline))) if *deadline <= Instant::now() => {
                inner.values.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> AppResult<()> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .values
            .insert(key.to_string(), (value.to_string(), Some(Instant::now() + ttl)));
        Ok(())
    }

    async fn hash_get_all(&self, key: &str) -> AppResult<HashMap<String, String>> {
        let inner = self.inner.lock().unwrap();
        Ok(inner.hashes.get(key).cloned().unwrap_or_default())
    }

    async fn counter_probe(
        &self,
        key: &str,
        quota: i64,
        now: &str,
        fresh_reset: &str,
    ) -> AppResult<CounterProbe> {
        let mut inner = self.inner.lock().unwrap();
        let hash = inner.hashes.entry(key.to_string()).or_default();
        let reset = hash.get("resetAt").cloned();
        let expired = match &reset {
            None => true,
            Some(stored) => stored.as_str() <= now,
        };
        if expired {
            hash.insert("count".into(), "1".into());
            hash.insert("resetAt".into(), fresh_reset.to_string());
            return Ok(CounterProbe {
                count: 1,
                reset_at: fresh_reset.to_string(),
                state: CounterState::Fresh,
            });
        }
        let reset = reset.unwrap_or_default();
        let count: i64 = hash
            .get("count")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        if quota > 0 && count >= quota {
            return Ok(CounterProbe {
                count,
                reset_at: reset,
                state: CounterState::Exhausted,
            });
        }
        hash.insert("count".into(), (count + 1).to_string());
        Ok(CounterProbe {
            count: count + 1,
            reset_at: reset,
            state: CounterState::Counting,
        })
    }

    async fn push_capped(&self, key: &str, value: &str, cap: i64) -> AppResult<()> {
        let mut inner = self.inner.lock().unwrap();
        let list = inner.lists.entry(key.to_string()).or_default();
        list.push_front(value.to_string());
        while list.len() as i64 > cap {
            list.pop_back();
        }
        Ok(())
    }

    async fn tail(&self, key: &str, n: i64) -> AppResult<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };
        let take = (n.max(0) as usize).min(list.len());
        let skip = list.len() - take;
        Ok(list.iter().skip(skip).cloned().collect())
    }

    async fn drop_tail(&self, key: &str, n: i64) -> AppResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(list) = inner.lists.get_mut(key) {
            for _ in 0..n.max(0) {
                if list.pop_back().is_none() {
                    break;
                }
            }
        }
        Ok(())
    }

    async fn head(&self, key: &str, n: i64) -> AppResult<Vec<String>> {
        let inner = self.inner.lock().unwrap();
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };
        Ok(list.iter().take(n.max(0) as usize).cloned().collect())
    }

    async fn ping(&self) -> AppResult<()> {
        Ok(())
    }
}
