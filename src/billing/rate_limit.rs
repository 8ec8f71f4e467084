use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use dashmap::DashMap;
use redis::aio::MultiplexedConnection;
use redis::Script;
use thiserror::Error;
use tracing::{debug, error};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CounterStoreError {
    #[error("counter store error: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("counter store did not answer within {0:?}")]
    Timeout(Duration),
}

/// key: rate-limit-counter-store -> shared windowed counters
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increments `key`, starting it at 1 with the given expiry when
    /// it does not exist, and returns the new count.
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CounterStoreError>;
}

/// Counters shared by every serving process, kept in Redis.
#[derive(Clone)]
pub struct RedisCounterStore {
    connection: MultiplexedConnection,
    increment_script: Arc<Script>,
    timeout: Duration,
}

impl RedisCounterStore {
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self, CounterStoreError> {
        let client = redis::Client::open(url)?;
        let connection = tokio::time::timeout(timeout, client.get_multiplexed_async_connection())
            .await
            .map_err(|_| CounterStoreError::Timeout(timeout))??;

        Ok(Self {
            connection,
            increment_script: Arc::new(Script::new(
                r#"
                local current = redis.call('INCR', KEYS[1])
                if current == 1 then
                    redis.call('PEXPIRE', KEYS[1], ARGV[1])
                end
                return current
                "#,
            )),
            timeout,
        })
    }
}

#[async_trait]
impl CounterStore for RedisCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CounterStoreError> {
        let mut connection = self.connection.clone();
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX);
        let mut invocation = self.increment_script.key(key);
        invocation.arg(ttl_ms);

        tokio::time::timeout(self.timeout, invocation.invoke_async(&mut connection))
            .await
            .map_err(|_| CounterStoreError::Timeout(self.timeout))?
            .map_err(CounterStoreError::from)
    }
}

/// Windows left behind are swept once every this many increments.
const SWEEP_EVERY: u64 = 4096;

/// Process-local counters. Only meaningful with a single serving process.
#[derive(Default)]
pub struct MemoryCounterStore {
    counters: DashMap<String, (u64, Instant)>,
    increments: AtomicU64,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str, ttl: Duration) -> Result<u64, CounterStoreError> {
        let now = Instant::now();
        if self.increments.fetch_add(1, Ordering::Relaxed) % SWEEP_EVERY == SWEEP_EVERY - 1 {
            self.counters.retain(|_, (_, expires_at)| *expires_at > now);
        }

        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert((0, now + ttl));
        if entry.1 <= now {
            *entry = (0, now + ttl);
        }
        entry.0 += 1;
        Ok(entry.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateDecision {
    pub allowed: bool,
    pub remaining: u64,
    pub limit: u64,
    pub reset_at: DateTime<Utc>,
    /// Set when the counter store could not be reached and the request was
    /// denied without being counted.
    pub store_unavailable: bool,
}

/// key: rate-limit-fixed-window -> free-tier quota
///
/// Fixed calendar windows aligned to the Unix epoch (a one-day window resets at
/// 00:00 UTC). Counting is exact within a window, but a burst straddling a
/// boundary can admit up to `2 * limit` requests inside one window-length span.
///
/// Counter store failures fail closed: the request is denied rather than let
/// through unmetered.
#[derive(Clone)]
pub struct RateLimiter {
    store: Arc<dyn CounterStore>,
    limit: u64,
    window: Duration,
    prefix: String,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CounterStore>, limit: u64, window: Duration, prefix: &str) -> Self {
        Self {
            store,
            limit,
            window: window.max(Duration::from_secs(1)),
            prefix: prefix.to_string(),
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub async fn consume(&self, account_id: Uuid) -> RateDecision {
        self.consume_at(account_id, Utc::now()).await
    }

    pub async fn consume_at(&self, account_id: Uuid, now: DateTime<Utc>) -> RateDecision {
        let window_secs = self.window.as_secs() as i64;
        let window_index = now.timestamp().div_euclid(window_secs);
        let reset_at = Utc
            .timestamp_opt((window_index + 1) * window_secs, 0)
            .single()
            .unwrap_or(now);
        let key = format!("{}:{}:{}", self.prefix, account_id, window_index);

        match self.store.increment(&key, self.window).await {
            Ok(count) => {
                let allowed = count <= self.limit;
                debug!(%account_id, count, limit = self.limit, allowed, "free-tier window consumed");
                RateDecision {
                    allowed,
                    remaining: self.limit.saturating_sub(count),
                    limit: self.limit,
                    reset_at,
                    store_unavailable: false,
                }
            }
            Err(err) => {
                error!(?err, %account_id, "rate limit counter store unavailable; denying");
                RateDecision {
                    allowed: false,
                    remaining: 0,
                    limit: self.limit,
                    reset_at,
                    store_unavailable: true,
                }
            }
        }
    }
}
