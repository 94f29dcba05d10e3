//! Stateful heuristic spam gate.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use regex::Regex;
use relay_protocol::Event;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::Config;

static URL_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"https?://\S+").expect("static URL regex is valid"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpamResult {
    Pass,
    Reject(String),
    Suspicious(String),
}

struct Inner {
    seen_hashes: HashMap<[u8; 32], Instant>,
    recent_admissions: Vec<Instant>,
    last_cleanup: Instant,
}

const CLEANUP_INTERVAL: Duration = Duration::from_secs(300);

/// Heuristic spam filter, serialized behind a single mutex.
pub struct SpamFilter {
    inner: Mutex<Inner>,
    config_duplicate_window: Duration,
    max_events_per_minute: usize,
}

impl SpamFilter {
    pub fn new(duplicate_window_seconds: i64, max_events_per_minute: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                seen_hashes: HashMap::new(),
                recent_admissions: Vec::new(),
                last_cleanup: Instant::now(),
            }),
            config_duplicate_window: Duration::from_secs(duplicate_window_seconds.max(0) as u64),
            max_events_per_minute,
        }
    }

    pub async fn check(&self, event: &Event, config: &Config) -> SpamResult {
        let mut inner = self.inner.lock().await;
        let now = Instant::now();

        let hash: [u8; 32] = Sha256::digest(event.content.as_bytes()).into();
        if let Some(seen_at) = inner.seen_hashes.get(&hash) {
            if now.saturating_duration_since(*seen_at) < self.config_duplicate_window {
                return SpamResult::Reject("duplicate content".to_owned());
            }
        }

        inner.recent_admissions.retain(|t| now.saturating_duration_since(*t) < Duration::from_secs(60));
        if inner.recent_admissions.len() > self.max_events_per_minute {
            return SpamResult::Reject("too many events in the last minute".to_owned());
        }

        if let Some(result) = check_keywords(&event.content, &config.spam_keywords) {
            return result;
        }

        let mut suspicious_reason = None;

        if let Some(r) = check_capitalization(&event.content) {
            suspicious_reason.get_or_insert(r);
        }
        if let Some(r) = check_repetition(&event.content) {
            suspicious_reason.get_or_insert(r);
        }
        if event.kind == 1 && event.content.len() < config.min_content_length {
            suspicious_reason.get_or_insert("content below minimum length".to_owned());
        }

        match check_mentions(event, config.max_mentions_per_event) {
            Some(SpamResult::Reject(r)) => return SpamResult::Reject(r),
            Some(SpamResult::Suspicious(r)) => {
                suspicious_reason.get_or_insert(r);
            }
            _ => {}
        }

        match check_urls(&event.content, config.max_urls_per_event, &config.shortener_domains) {
            Some(SpamResult::Reject(r)) => return SpamResult::Reject(r),
            Some(SpamResult::Suspicious(r)) => {
                suspicious_reason.get_or_insert(r);
            }
            _ => {}
        }

        match check_tags(event, config.max_tags_per_event, config.max_hashtags_per_event) {
            Some(SpamResult::Reject(r)) => return SpamResult::Reject(r),
            Some(SpamResult::Suspicious(r)) => {
                suspicious_reason.get_or_insert(r);
            }
            _ => {}
        }

        inner.seen_hashes.insert(hash, now);
        inner.recent_admissions.push(now);
        self.maybe_cleanup(&mut inner, now);

        match suspicious_reason {
            Some(r) => SpamResult::Suspicious(r),
            None => SpamResult::Pass,
        }
    }

    fn maybe_cleanup(&self, inner: &mut Inner, now: Instant) {
        if now.saturating_duration_since(inner.last_cleanup) < CLEANUP_INTERVAL {
            return;
        }
        inner.last_cleanup = now;
        let window = self.config_duplicate_window;
        inner.seen_hashes.retain(|_, seen_at| now.saturating_duration_since(*seen_at) < window);
    }
}

fn check_keywords(content: &str, keywords: &[String]) -> Option<SpamResult> {
    let lowered = content.to_lowercase();
    keywords
        .iter()
        .find(|kw| lowered.contains(kw.to_lowercase().as_str()))
        .map(|kw| SpamResult::Reject(format!("matched spam keyword: {kw}")))
}

fn check_capitalization(content: &str) -> Option<String> {
    if content.len() <= 10 {
        return None;
    }
    let letters: Vec<char> = content.chars().filter(|c| c.is_alphabetic()).collect();
    if letters.is_empty() {
        return None;
    }
    let upper = letters.iter().filter(|c| c.is_uppercase()).count();
    let ratio = upper as f64 / letters.len() as f64;
    (ratio > 0.7).then(|| "excessive capitalization".to_owned())
}

fn check_repetition(content: &str) -> Option<String> {
    let mut last = None;
    let mut run = 0usize;
    for ch in content.chars() {
        if Some(ch) == last {
            run += 1;
            if run > 10 {
                return Some("repeated character run".to_owned());
            }
        } else {
            last = Some(ch);
            run = 1;
        }
    }

    let words: Vec<&str> = content.split_whitespace().collect();
    if words.len() > 5 {
        let unique: std::collections::HashSet<&str> = words.iter().copied().collect();
        let ratio = (words.len() - unique.len()) as f64 / words.len() as f64;
        if ratio > 0.5 {
            return Some("repeated word ratio too high".to_owned());
        }
    }
    None
}

fn check_mentions(event: &Event, max_mentions: usize) -> Option<SpamResult> {
    let count = event.tags_named("p").count();
    if count > max_mentions {
        return Some(SpamResult::Reject(format!("too many mentions: {count} > {max_mentions}")));
    }
    if count > 5 {
        return Some(SpamResult::Suspicious(format!("elevated mention count: {count}")));
    }
    None
}

fn check_urls(content: &str, max_urls: usize, shortener_domains: &[String]) -> Option<SpamResult> {
    let matches: Vec<&str> = URL_PATTERN.find_iter(content).map(|m| m.as_str()).collect();
    if matches.len() > max_urls {
        return Some(SpamResult::Reject(format!(
            "too many urls: {} > {max_urls}",
            matches.len()
        )));
    }
    let shortener_hit = matches
        .iter()
        .any(|url| shortener_domains.iter().any(|domain| url.contains(domain.as_str())));
    if shortener_hit {
        return Some(SpamResult::Suspicious("url shortener domain present".to_owned()));
    }
    None
}

fn check_tags(event: &Event, max_tags: usize, max_hashtags: usize) -> Option<SpamResult> {
    if event.tags.len() > max_tags {
        return Some(SpamResult::Reject(format!(
            "too many tags: {} > {max_tags}",
            event.tags.len()
        )));
    }
    let hashtags = event.tags_named("t").count();
    if hashtags > max_hashtags {
        return Some(SpamResult::Suspicious(format!("elevated hashtag count: {hashtags}")));
    }
    None
}
