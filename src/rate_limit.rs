//! Token-bucket rate limiting and connection admission control.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum RateLimitResult {
    Allowed,
    Limited(String),
    Blocked(String),
}

#[derive(Debug, Clone)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
    last_touched: Instant,
}

impl Bucket {
    fn new(capacity: f64, now: Instant) -> Self {
        Self {
            tokens: capacity,
            last_refill: now,
            last_touched: now,
        }
    }

    fn refill(&mut self, capacity: f64, refill_per_sec: f64, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(capacity);
        self.last_refill = now;
        self.last_touched = now;
    }

    fn try_consume(&mut self, cost: f64, capacity: f64, refill_per_sec: f64, now: Instant) -> bool {
        self.refill(capacity, refill_per_sec, now);
        if self.tokens >= cost {
            self.tokens -= cost;
            true
        } else {
            false
        }
    }
}

struct Inner {
    source_buckets: HashMap<String, Bucket>,
    author_buckets: HashMap<String, Bucket>,
    active_connections: HashMap<String, usize>,
    allow_list: std::collections::HashSet<String>,
    deny_list: std::collections::HashSet<String>,
    last_cleanup: Instant,
}

const MAX_TRACKED_ENTRIES: usize = 100_000;
const CLEANUP_INTERVAL: Duration = Duration::from_secs(3600);

/// Dual token-bucket rate limiter, serialized behind a single mutex per the
/// single-writer component discipline.
pub struct RateLimiter {
    inner: Mutex<Inner>,
    source_capacity: f64,
    source_refill: f64,
    author_capacity: f64,
    author_refill: f64,
    subscription_cost: f64,
    max_connections_per_source: usize,
}

impl RateLimiter {
    pub fn new(
        source_capacity: f64,
        source_refill: f64,
        author_capacity: f64,
        author_refill: f64,
        subscription_cost: f64,
        max_connections_per_source: usize,
    ) -> Self {
        Self {
            inner: Mutex::new(Inner {
                source_buckets: HashMap::new(),
                author_buckets: HashMap::new(),
                active_connections: HashMap::new(),
                allow_list: std::collections::HashSet::new(),
                deny_list: std::collections::HashSet::new(),
                last_cleanup: Instant::now(),
            }),
            source_capacity,
            source_refill,
            author_capacity,
            author_refill,
            subscription_cost,
            max_connections_per_source,
        }
    }

    pub async fn allow_source(&self, source: &str) {
        let mut inner = self.inner.lock().await;
        inner.allow_list.insert(source.to_owned());
        inner.deny_list.remove(source);
    }

    pub async fn deny_source(&self, source: &str) {
        let mut inner = self.inner.lock().await;
        inner.deny_list.insert(source.to_owned());
        inner.allow_list.remove(source);
    }

    /// Register a new connection from `source`; rejects once the per-source
    /// connection cap is reached.
    pub async fn register_connection(&self, source: &str) -> RateLimitResult {
        let mut inner = self.inner.lock().await;
        if inner.deny_list.contains(source) {
            return RateLimitResult::Blocked("source is on the deny list".to_owned());
        }
        if inner.allow_list.contains(source) {
            *inner.active_connections.entry(source.to_owned()).or_insert(0) += 1;
            return RateLimitResult::Allowed;
        }
        let count = inner.active_connections.entry(source.to_owned()).or_insert(0);
        if *count >= self.max_connections_per_source {
            return RateLimitResult::Blocked("too many connections from this source".to_owned());
        }
        *count += 1;
        RateLimitResult::Allowed
    }

    pub async fn unregister_connection(&self, source: &str) {
        let mut inner = self.inner.lock().await;
        if let Some(count) = inner.active_connections.get_mut(source) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                inner.active_connections.remove(source);
            }
        }
    }

    /// Admit a submitted event: consumes one token from both the source and
    /// author buckets, unless the source is allow/deny listed.
    pub async fn admit_event(&self, source: &str, author: &str, event_bytes: usize, max_event_bytes: usize) -> RateLimitResult {
        if event_bytes > max_event_bytes {
            return RateLimitResult::Limited(format!(
                "event too large: maximum size is {max_event_bytes} bytes"
            ));
        }

        let mut inner = self.inner.lock().await;
        if inner.deny_list.contains(source) {
            return RateLimitResult::Blocked("source is on the deny list".to_owned());
        }
        if inner.allow_list.contains(source) {
            self.maybe_cleanup(&mut inner);
            return RateLimitResult::Allowed;
        }

        let now = Instant::now();
        let source_capacity = self.source_capacity;
        let source_refill = self.source_refill;
        let author_capacity = self.author_capacity;
        let author_refill = self.author_refill;

        let source_bucket = inner
            .source_buckets
            .entry(source.to_owned())
            .or_insert_with(|| Bucket::new(source_capacity, now));
        if !source_bucket.try_consume(1.0, source_capacity, source_refill, now) {
            self.maybe_cleanup(&mut inner);
            return RateLimitResult::Limited("source rate limit exceeded".to_owned());
        }

        let author_bucket = inner
            .author_buckets
            .entry(author.to_owned())
            .or_insert_with(|| Bucket::new(author_capacity, now));
        if !author_bucket.try_consume(1.0, author_capacity, author_refill, now) {
            self.maybe_cleanup(&mut inner);
            return RateLimitResult::Limited("author rate limit exceeded".to_owned());
        }

        self.maybe_cleanup(&mut inner);
        RateLimitResult::Allowed
    }

    /// Admit a subscription request: consumes `subscription_cost` tokens
    /// from the source bucket only.
    pub async fn admit_subscription(&self, source: &str) -> RateLimitResult {
        let mut inner = self.inner.lock().await;
        if inner.deny_list.contains(source) {
            return RateLimitResult::Blocked("source is on the deny list".to_owned());
        }
        if inner.allow_list.contains(source) {
            return RateLimitResult::Allowed;
        }

        let now = Instant::now();
        let capacity = self.source_capacity;
        let refill = self.source_refill;
        let cost = self.subscription_cost;
        let bucket = inner
            .source_buckets
            .entry(source.to_owned())
            .or_insert_with(|| Bucket::new(capacity, now));
        if bucket.try_consume(cost, capacity, refill, now) {
            RateLimitResult::Allowed
        } else {
            RateLimitResult::Limited("subscription rate limit exceeded".to_owned())
        }
    }

    fn maybe_cleanup(&self, inner: &mut Inner) {
        let now = Instant::now();
        if now.saturating_duration_since(inner.last_cleanup) < CLEANUP_INTERVAL {
            return;
        }
        inner.last_cleanup = now;

        let source_capacity = self.source_capacity;
        let source_refill = self.source_refill;
        let refill_period = if source_refill > 0.0 {
            Duration::from_secs_f64(source_capacity / source_refill)
        } else {
            CLEANUP_INTERVAL
        };
        inner.source_buckets.retain(|_, b| {
            b.tokens < source_capacity || now.saturating_duration_since(b.last_touched) < refill_period
        });

        let author_capacity = self.author_capacity;
        let author_refill = self.author_refill;
        let author_refill_period = if author_refill > 0.0 {
            Duration::from_secs_f64(author_capacity / author_refill)
        } else {
            CLEANUP_INTERVAL
        };
        inner.author_buckets.retain(|_, b| {
            b.tokens < author_capacity || now.saturating_duration_since(b.last_touched) < author_refill_period
        });

        if inner.source_buckets.len() > MAX_TRACKED_ENTRIES {
            evict_least_recently_touched(&mut inner.source_buckets, MAX_TRACKED_ENTRIES);
        }
        if inner.author_buckets.len() > MAX_TRACKED_ENTRIES {
            evict_least_recently_touched(&mut inner.author_buckets, MAX_TRACKED_ENTRIES);
        }
    }
}

fn evict_least_recently_touched(map: &mut HashMap<String, Bucket>, keep: usize) {
    let mut entries: Vec<(String, Instant)> = map.iter().map(|(k, v)| (k.clone(), v.last_touched)).collect();
    entries.sort_by_key(|(_, t)| *t);
    for (key, _) in entries.into_iter().take(entries_to_remove(map.len(), keep)) {
        map.remove(&key);
    }
}

fn entries_to_remove(len: usize, keep: usize) -> usize {
    len.saturating_sub(keep)
}
