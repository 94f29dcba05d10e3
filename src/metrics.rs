//! Process-wide Prometheus metrics registry.

use once_cell::sync::Lazy;
use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

pub static EVENTS_ADMITTED_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("relayd_events_admitted_total", "Events processed by admission outcome"),
        &["outcome"],
    )
    .expect("metric registration is infallible for a well-formed descriptor");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registration is infallible for a unique name");
    counter
});

pub static ACTIVE_CONNECTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("relayd_active_connections", "Currently open WebSocket connections")
        .expect("metric registration is infallible for a well-formed descriptor");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("metric registration is infallible for a unique name");
    gauge
});

pub static ACTIVE_SUBSCRIPTIONS: Lazy<IntGauge> = Lazy::new(|| {
    let gauge = IntGauge::new("relayd_active_subscriptions", "Currently open subscriptions")
        .expect("metric registration is infallible for a well-formed descriptor");
    REGISTRY
        .register(Box::new(gauge.clone()))
        .expect("metric registration is infallible for a unique name");
    gauge
});

pub static MATCHER_DEDUP_DROPS_TOTAL: Lazy<prometheus::IntCounter> = Lazy::new(|| {
    let counter = prometheus::IntCounter::new(
        "relayd_matcher_dedup_drops_total",
        "Events dropped by the subscription matcher's dedup window",
    )
    .expect("metric registration is infallible for a well-formed descriptor");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registration is infallible for a unique name");
    counter
});

pub static RATE_LIMIT_REJECTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("relayd_rate_limit_rejections_total", "Rate limiter rejections by kind"),
        &["kind"],
    )
    .expect("metric registration is infallible for a well-formed descriptor");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registration is infallible for a unique name");
    counter
});

pub static SPAM_REJECTIONS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("relayd_spam_rejections_total", "Spam filter rejections by verdict"),
        &["verdict"],
    )
    .expect("metric registration is infallible for a well-formed descriptor");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registration is infallible for a unique name");
    counter
});

pub static SECURITY_BANS_TOTAL: Lazy<prometheus::IntCounter> = Lazy::new(|| {
    let counter = prometheus::IntCounter::new("relayd_security_bans_total", "Connections banned by the security policy")
        .expect("metric registration is infallible for a well-formed descriptor");
    REGISTRY
        .register(Box::new(counter.clone()))
        .expect("metric registration is infallible for a unique name");
    counter
});

/// Force every metric to register with [`REGISTRY`] before the first scrape.
pub fn init() {
    Lazy::force(&EVENTS_ADMITTED_TOTAL);
    Lazy::force(&ACTIVE_CONNECTIONS);
    Lazy::force(&ACTIVE_SUBSCRIPTIONS);
    Lazy::force(&MATCHER_DEDUP_DROPS_TOTAL);
    Lazy::force(&RATE_LIMIT_REJECTIONS_TOTAL);
    Lazy::force(&SPAM_REJECTIONS_TOTAL);
    Lazy::force(&SECURITY_BANS_TOTAL);
}
