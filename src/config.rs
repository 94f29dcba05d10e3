use std::env;

/// Relay configuration, loaded once from the environment at startup and
/// treated as immutable for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub database_url: String,
    pub database_pool_size: u32,

    pub relay_url: String,
    pub relay_name: String,
    pub relay_description: String,
    pub relay_pubkey: Option<String>,
    pub relay_contact: Option<String>,

    pub max_event_bytes: usize,
    pub max_subscriptions: usize,
    pub max_filters: usize,
    pub max_limit: u32,
    pub max_subid_length: usize,
    pub max_event_tags: usize,
    pub max_content_length: usize,

    pub source_bucket_capacity: f64,
    pub source_bucket_refill_per_sec: f64,
    pub author_bucket_capacity: f64,
    pub author_bucket_refill_per_sec: f64,
    pub subscription_cost: f64,
    pub max_connections_per_source: usize,

    pub min_pow_difficulty: u32,

    pub auth_required: bool,
    pub auth_pubkey_allowlist: Vec<String>,

    pub cors_allowed_origins: Vec<String>,

    pub duplicate_window_seconds: i64,
    pub max_events_per_minute: usize,
    pub spam_keywords: Vec<String>,
    pub min_content_length: usize,
    pub max_mentions_per_event: usize,
    pub max_urls_per_event: usize,
    pub shortener_domains: Vec<String>,
    pub max_tags_per_event: usize,
    pub max_hashtags_per_event: usize,
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_owned())
}

fn env_parse<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_list(name: &str) -> Vec<String> {
    env::var(name)
        .map(|v| {
            v.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect()
        })
        .unwrap_or_default()
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            bind_addr: env_or("BIND_ADDR", "0.0.0.0:8080"),
            database_url: env::var("DATABASE_URL").expect("DATABASE_URL must be set"),
            database_pool_size: env_parse("DATABASE_POOL_SIZE", 10),

            relay_url: env_or("RELAY_URL", "wss://localhost:8080"),
            relay_name: env_or("RELAY_NAME", "relayd"),
            relay_description: env_or("RELAY_DESCRIPTION", "a relay"),
            relay_pubkey: env::var("RELAY_PUBKEY").ok(),
            relay_contact: env::var("RELAY_CONTACT").ok(),

            max_event_bytes: env_parse("MAX_EVENT_BYTES", 65_536),
            max_subscriptions: env_parse("MAX_SUBSCRIPTIONS", 20),
            max_filters: env_parse("MAX_FILTERS", 10),
            max_limit: env_parse("MAX_LIMIT", 500),
            max_subid_length: env_parse("MAX_SUBID_LENGTH", 64),
            max_event_tags: env_parse("MAX_EVENT_TAGS", 2_000),
            max_content_length: env_parse("MAX_CONTENT_LENGTH", 65_536),

            source_bucket_capacity: env_parse("RATE_LIMIT_SOURCE_CAPACITY", 20.0),
            source_bucket_refill_per_sec: env_parse("RATE_LIMIT_SOURCE_REFILL", 2.0),
            author_bucket_capacity: env_parse("RATE_LIMIT_AUTHOR_CAPACITY", 20.0),
            author_bucket_refill_per_sec: env_parse("RATE_LIMIT_AUTHOR_REFILL", 2.0),
            subscription_cost: env_parse("SUBSCRIPTION_COST", 2.0),
            max_connections_per_source: env_parse("MAX_CONNECTIONS_PER_SOURCE", 50),

            min_pow_difficulty: env_parse("MIN_POW_DIFFICULTY", 0),

            auth_required: env_parse("AUTH_REQUIRED", false),
            auth_pubkey_allowlist: env_list("AUTH_PUBKEY_ALLOWLIST"),

            cors_allowed_origins: env_list("CORS_ALLOWED_ORIGINS"),

            duplicate_window_seconds: env_parse("SPAM_DUPLICATE_WINDOW_SECONDS", 300),
            max_events_per_minute: env_parse("SPAM_MAX_EVENTS_PER_MINUTE", 100),
            spam_keywords: env_list("SPAM_KEYWORDS"),
            min_content_length: env_parse("SPAM_MIN_CONTENT_LENGTH", 1),
            max_mentions_per_event: env_parse("SPAM_MAX_MENTIONS_PER_EVENT", 50),
            max_urls_per_event: env_parse("SPAM_MAX_URLS_PER_EVENT", 10),
            shortener_domains: env_list("SPAM_SHORTENER_DOMAINS"),
            max_tags_per_event: env_parse("SPAM_MAX_TAGS_PER_EVENT", 200),
            max_hashtags_per_event: env_parse("SPAM_MAX_HASHTAGS_PER_EVENT", 10),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_parse_falls_back_to_default_on_missing_or_bad_value() {
        assert_eq!(env_parse::<u32>("RELAYD_TEST_DOES_NOT_EXIST", 7), 7);
    }

    #[test]
    fn env_list_splits_and_trims_commas() {
        env::set_var("RELAYD_TEST_LIST", "a, b ,c");
        assert_eq!(env_list("RELAYD_TEST_LIST"), vec!["a", "b", "c"]);
        env::remove_var("RELAYD_TEST_LIST");
    }
}
