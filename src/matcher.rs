//! In-memory subscription index and fan-out engine.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use relay_protocol::{Event, Filter, RelayMessage};
use tokio::sync::{mpsc, Mutex};

use crate::metrics;

const DEDUP_WINDOW: Duration = Duration::from_secs(60);
const DEDUP_CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

pub type OutboundSink = mpsc::UnboundedSender<RelayMessage>;

struct Connection {
    #[allow(dead_code)]
    source: String,
    sink: OutboundSink,
    subscription_ids: HashSet<String>,
}

struct Subscription {
    conn_id: String,
    filters: Vec<Filter>,
    #[allow(dead_code)]
    created_at: Instant,
    matched_count: u64,
}

struct Inner {
    connections: HashMap<String, Connection>,
    subscriptions: HashMap<String, Subscription>,
    by_author: HashMap<String, HashSet<String>>,
    by_kind: HashMap<i64, HashSet<String>>,
    by_e_tag: HashMap<String, HashSet<String>>,
    by_p_tag: HashMap<String, HashSet<String>>,
    catch_all: HashSet<String>,
    recent_events: HashMap<String, Instant>,
    duplicates_dropped: u64,
    last_dedup_cleanup: Instant,
}

/// Connection registry, subscription index, and fan-out broadcaster.
///
/// All operations are serialized behind one mutex, matching the core's
/// single-writer requirement for stateful components.
pub struct SubscriptionManager {
    inner: Mutex<Inner>,
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                connections: HashMap::new(),
                subscriptions: HashMap::new(),
                by_author: HashMap::new(),
                by_kind: HashMap::new(),
                by_e_tag: HashMap::new(),
                by_p_tag: HashMap::new(),
                catch_all: HashSet::new(),
                recent_events: HashMap::new(),
                duplicates_dropped: 0,
                last_dedup_cleanup: Instant::now(),
            }),
        }
    }

    pub async fn register_connection(&self, conn_id: &str, source: &str, sink: OutboundSink) {
        let mut inner = self.inner.lock().await;
        inner.connections.entry(conn_id.to_owned()).or_insert_with(|| Connection {
            source: source.to_owned(),
            sink,
            subscription_ids: HashSet::new(),
        });
    }

    pub async fn unregister_connection(&self, conn_id: &str) {
        let mut inner = self.inner.lock().await;
        let Some(conn) = inner.connections.remove(conn_id) else {
            return;
        };
        for sub_id in conn.subscription_ids {
            remove_subscription_locked(&mut inner, &sub_id);
        }
    }

    pub async fn add_subscription(&self, conn_id: &str, sub_id: &str, filters: Vec<Filter>) {
        let mut inner = self.inner.lock().await;
        if inner.subscriptions.contains_key(sub_id) {
            remove_subscription_locked(&mut inner, sub_id);
        }

        for filter in &filters {
            if let Some(authors) = &filter.authors {
                for a in authors {
                    inner.by_author.entry(a.clone()).or_default().insert(sub_id.to_owned());
                }
            }
            if let Some(kinds) = &filter.kinds {
                for k in kinds {
                    inner.by_kind.entry(*k).or_default().insert(sub_id.to_owned());
                }
            }
            if let Some(e) = &filter.e {
                for id in e {
                    inner.by_e_tag.entry(id.clone()).or_default().insert(sub_id.to_owned());
                }
            }
            if let Some(p) = &filter.p {
                for id in p {
                    inner.by_p_tag.entry(id.clone()).or_default().insert(sub_id.to_owned());
                }
            }
            if filter.is_catch_all() {
                inner.catch_all.insert(sub_id.to_owned());
            }
        }

        inner.subscriptions.insert(
            sub_id.to_owned(),
            Subscription {
                conn_id: conn_id.to_owned(),
                filters,
                created_at: Instant::now(),
                matched_count: 0,
            },
        );
        if let Some(conn) = inner.connections.get_mut(conn_id) {
            conn.subscription_ids.insert(sub_id.to_owned());
        }
    }

    pub async fn remove_subscription(&self, sub_id: &str) {
        let mut inner = self.inner.lock().await;
        remove_subscription_locked(&mut inner, sub_id);
    }

    pub async fn subscription_count(&self, conn_id: &str) -> usize {
        let inner = self.inner.lock().await;
        inner
            .connections
            .get(conn_id)
            .map(|c| c.subscription_ids.len())
            .unwrap_or(0)
    }

    /// Run the match algorithm and return `(conn_id, sub_id)` pairs, one per
    /// connection that has at least one matching subscription.
    pub async fn match_event(&self, event: &Event) -> Vec<(String, String)> {
        let mut inner = self.inner.lock().await;
        match_event_locked(&mut inner, event)
    }

    /// Match and broadcast `event` to every connection with a matching
    /// subscription, exactly once per connection.
    pub async fn broadcast_event(&self, event: &Event) {
        let mut inner = self.inner.lock().await;
        let matches = match_event_locked(&mut inner, event);
        for (conn_id, sub_id) in matches {
            if let Some(conn) = inner.connections.get(&conn_id) {
                let _ = conn.sink.send(RelayMessage::Event {
                    sub_id,
                    event: event.clone(),
                });
            }
        }
    }

    pub async fn duplicates_dropped(&self) -> u64 {
        self.inner.lock().await.duplicates_dropped
    }
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

fn remove_subscription_locked(inner: &mut Inner, sub_id: &str) {
    let Some(sub) = inner.subscriptions.remove(sub_id) else {
        return;
    };
    if let Some(conn) = inner.connections.get_mut(&sub.conn_id) {
        conn.subscription_ids.remove(sub_id);
    }
    for filter in &sub.filters {
        if let Some(authors) = &filter.authors {
            for a in authors {
                prune(&mut inner.by_author, a, sub_id);
            }
        }
        if let Some(kinds) = &filter.kinds {
            for k in kinds {
                if let Some(set) = inner.by_kind.get_mut(k) {
                    set.remove(sub_id);
                    if set.is_empty() {
                        inner.by_kind.remove(k);
                    }
                }
            }
        }
        if let Some(e) = &filter.e {
            for id in e {
                prune(&mut inner.by_e_tag, id, sub_id);
            }
        }
        if let Some(p) = &filter.p {
            for id in p {
                prune(&mut inner.by_p_tag, id, sub_id);
            }
        }
    }
    inner.catch_all.remove(sub_id);
}

fn prune(map: &mut HashMap<String, HashSet<String>>, key: &str, sub_id: &str) {
    if let Some(set) = map.get_mut(key) {
        set.remove(sub_id);
        if set.is_empty() {
            map.remove(key);
        }
    }
}

fn match_event_locked(inner: &mut Inner, event: &Event) -> Vec<(String, String)> {
    let now = Instant::now();
    if let Some(seen_at) = inner.recent_events.get(&event.id) {
        if now.saturating_duration_since(*seen_at) < DEDUP_WINDOW {
            inner.duplicates_dropped += 1;
            metrics::MATCHER_DEDUP_DROPS_TOTAL.inc();
            return Vec::new();
        }
    }
    inner.recent_events.insert(event.id.clone(), now);

    let mut candidates: HashSet<String> = HashSet::new();
    if let Some(set) = inner.by_author.get(&event.pubkey) {
        candidates.extend(set.iter().cloned());
    }
    if let Some(set) = inner.by_kind.get(&event.kind) {
        candidates.extend(set.iter().cloned());
    }
    for tag in event.tags_named("e") {
        if let Some(value) = tag.get(1) {
            if let Some(set) = inner.by_e_tag.get(value) {
                candidates.extend(set.iter().cloned());
            }
        }
    }
    for tag in event.tags_named("p") {
        if let Some(value) = tag.get(1) {
            if let Some(set) = inner.by_p_tag.get(value) {
                candidates.extend(set.iter().cloned());
            }
        }
    }
    candidates.extend(inner.catch_all.iter().cloned());

    let mut seen_connections: HashSet<String> = HashSet::new();
    let mut results = Vec::new();
    for sub_id in candidates {
        let Some(sub) = inner.subscriptions.get_mut(&sub_id) else {
            continue;
        };
        if sub.filters.iter().any(|f| f.matches(event)) {
            sub.matched_count += 1;
            if seen_connections.insert(sub.conn_id.clone()) {
                results.push((sub.conn_id.clone(), sub_id));
            }
        }
    }

    maybe_cleanup_dedup(inner, now);
    results
}

fn maybe_cleanup_dedup(inner: &mut Inner, now: Instant) {
    if now.saturating_duration_since(inner.last_dedup_cleanup) < DEDUP_CLEANUP_INTERVAL {
        return;
    }
    inner.last_dedup_cleanup = now;
    inner.recent_events.retain(|_, seen_at| now.saturating_duration_since(*seen_at) < DEDUP_WINDOW);
}
