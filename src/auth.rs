//! Challenge/response authentication boundary.

use std::collections::{HashMap, HashSet};
use std::time::{Duration, Instant};

use rand::RngCore;
use tokio::sync::Mutex;

use crate::config::Config;
use crate::validator::{self, ValidationResult};

const AUTH_KIND: i64 = relay_protocol::AUTH_KIND;
const CHALLENGE_TTL: Duration = Duration::from_secs(300);
const SESSION_TTL: Duration = Duration::from_secs(24 * 3600);
const MAX_AUTH_EVENT_AGE_SECS: i64 = 600;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Permission {
    Read,
    Write,
    Delete,
    Admin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Accepted,
    Rejected(String),
}

struct Challenge {
    value: String,
    issued_at: Instant,
}

struct Session {
    permissions: HashSet<Permission>,
    expires_at: Instant,
}

struct Inner {
    challenges: HashMap<String, Challenge>,
    sessions: HashMap<String, Session>,
}

/// Tracks outstanding challenges and granted permission sets per connection.
pub struct AuthManager {
    inner: Mutex<Inner>,
}

impl AuthManager {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                challenges: HashMap::new(),
                sessions: HashMap::new(),
            }),
        }
    }

    /// Generate and record a fresh 32-byte challenge rendered as hex.
    pub async fn issue_challenge(&self, conn_id: &str) -> String {
        let mut bytes = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut bytes);
        let challenge = hex::encode(bytes);
        let mut inner = self.inner.lock().await;
        inner.challenges.insert(
            conn_id.to_owned(),
            Challenge {
                value: challenge.clone(),
                issued_at: Instant::now(),
            },
        );
        challenge
    }

    /// Verify a client `AUTH` response against the active challenge.
    pub async fn verify(
        &self,
        conn_id: &str,
        raw_event: &serde_json::Value,
        config: &Config,
        now: i64,
    ) -> AuthResult {
        let event = match validator::validate(raw_event, config, now) {
            ValidationResult::Valid(event) => event,
            ValidationResult::Invalid(reason) => return AuthResult::Rejected(reason),
        };

        if event.kind != AUTH_KIND {
            return AuthResult::Rejected(format!("expected kind {AUTH_KIND}"));
        }
        if (now - event.created_at).abs() > MAX_AUTH_EVENT_AGE_SECS {
            return AuthResult::Rejected("authentication event outside allowed time window".to_owned());
        }
        let Some(relay_tag) = event.tag_value("relay") else {
            return AuthResult::Rejected("missing relay tag".to_owned());
        };
        if relay_tag != config.relay_url {
            return AuthResult::Rejected("relay tag does not match this relay".to_owned());
        }

        let mut inner = self.inner.lock().await;
        let challenge = match inner.challenges.get(conn_id) {
            Some(c) => c,
            None => return AuthResult::Rejected("no active challenge for this connection".to_owned()),
        };
        if challenge.issued_at.elapsed() > CHALLENGE_TTL {
            inner.challenges.remove(conn_id);
            return AuthResult::Rejected("challenge expired".to_owned());
        }
        let expected = challenge.value.clone();
        match event.tag_value("challenge") {
            Some(v) if v == expected => {}
            _ => return AuthResult::Rejected("challenge tag does not match".to_owned()),
        }

        inner.challenges.remove(conn_id);
        inner.sessions.insert(
            conn_id.to_owned(),
            Session {
                permissions: HashSet::from([Permission::Read, Permission::Write, Permission::Delete]),
                expires_at: Instant::now() + SESSION_TTL,
            },
        );
        AuthResult::Accepted
    }

    pub async fn is_authenticated(&self, conn_id: &str) -> bool {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .get(conn_id)
            .map(|s| s.expires_at > Instant::now())
            .unwrap_or(false)
    }

    pub async fn has_permission(&self, conn_id: &str, permission: Permission) -> bool {
        let inner = self.inner.lock().await;
        inner
            .sessions
            .get(conn_id)
            .filter(|s| s.expires_at > Instant::now())
            .map(|s| s.permissions.contains(&permission))
            .unwrap_or(false)
    }

    pub async fn revoke(&self, conn_id: &str) {
        let mut inner = self.inner.lock().await;
        inner.sessions.remove(conn_id);
        inner.challenges.remove(conn_id);
    }
}

impl Default for AuthManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_protocol::Event;
    use secp256k1::{rand as secp_rand, Keypair, Message, Secp256k1};
    use sha2::{Digest, Sha256};

    fn test_config() -> Config {
        Config {
            bind_addr: String::new(),
            database_url: String::new(),
            database_pool_size: 1,
            relay_url: "wss://relay.example".to_owned(),
            relay_name: String::new(),
            relay_description: String::new(),
            relay_pubkey: None,
            relay_contact: None,
            max_event_bytes: 65_536,
            max_subscriptions: 20,
            max_filters: 10,
            max_limit: 500,
            max_subid_length: 64,
            max_event_tags: 2_000,
            max_content_length: 65_536,
            source_bucket_capacity: 20.0,
            source_bucket_refill_per_sec: 2.0,
            author_bucket_capacity: 20.0,
            author_bucket_refill_per_sec: 2.0,
            subscription_cost: 2.0,
            max_connections_per_source: 50,
            min_pow_difficulty: 0,
            auth_required: true,
            auth_pubkey_allowlist: Vec::new(),
            cors_allowed_origins: Vec::new(),
            duplicate_window_seconds: 300,
            max_events_per_minute: 100,
            spam_keywords: Vec::new(),
            min_content_length: 1,
            max_mentions_per_event: 50,
            max_urls_per_event: 10,
            shortener_domains: Vec::new(),
            max_tags_per_event: 200,
            max_hashtags_per_event: 10,
        }
    }

    fn signed_auth_event(challenge: &str, relay: &str, created_at: i64) -> serde_json::Value {
        let secp = Secp256k1::new();
        let keypair = Keypair::new(&secp, &mut secp_rand::thread_rng());
        let (xonly, _parity) = keypair.x_only_public_key();
        let pubkey = hex::encode(xonly.serialize());
        let tags = vec![
            vec!["challenge".to_owned(), challenge.to_owned()],
            vec!["relay".to_owned(), relay.to_owned()],
        ];
        let canonical = Event::canonical_serialization(&pubkey, created_at, AUTH_KIND, &tags, "");
        let id_bytes = Sha256::digest(&canonical);
        let id = hex::encode(id_bytes);
        let message = Message::from_digest(id_bytes.into());
        let sig = secp.sign_schnorr(&message, &keypair);

        serde_json::json!({
            "id": id,
            "pubkey": pubkey,
            "created_at": created_at,
            "kind": AUTH_KIND,
            "tags": tags,
            "content": "",
            "sig": hex::encode(sig.as_ref()),
        })
    }

    #[tokio::test]
    async fn valid_challenge_response_grants_permissions() {
        let manager = AuthManager::new();
        let config = test_config();
        let challenge = manager.issue_challenge("c1").await;
        let now = 1_700_000_000;
        let event = signed_auth_event(&challenge, &config.relay_url, now);

        let result = manager.verify("c1", &event, &config, now).await;
        assert_eq!(result, AuthResult::Accepted);
        assert!(manager.is_authenticated("c1").await);
        assert!(manager.has_permission("c1", Permission::Write).await);
    }

    #[tokio::test]
    async fn mismatched_challenge_is_rejected() {
        let manager = AuthManager::new();
        let config = test_config();
        manager.issue_challenge("c1").await;
        let now = 1_700_000_000;
        let event = signed_auth_event("not-the-challenge", &config.relay_url, now);

        let result = manager.verify("c1", &event, &config, now).await;
        assert!(matches!(result, AuthResult::Rejected(_)));
        assert!(!manager.is_authenticated("c1").await);
    }

    #[tokio::test]
    async fn revoke_clears_session() {
        let manager = AuthManager::new();
        let config = test_config();
        let challenge = manager.issue_challenge("c1").await;
        let now = 1_700_000_000;
        let event = signed_auth_event(&challenge, &config.relay_url, now);
        manager.verify("c1", &event, &config, now).await;
        manager.revoke("c1").await;
        assert!(!manager.is_authenticated("c1").await);
    }
}
