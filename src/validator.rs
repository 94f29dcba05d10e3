//! Structural, cryptographic, temporal, and per-kind validation of inbound
//! events.

use relay_protocol::Event;
use secp256k1::schnorr::Signature as SchnorrSignature;
use secp256k1::{Message, Secp256k1, XOnlyPublicKey};
use sha2::{Digest, Sha256};

use crate::config::Config;

const SECONDS_PER_YEAR: i64 = 365 * 24 * 3600;
const MAX_PAST_SECONDS: i64 = 2 * SECONDS_PER_YEAR;
const MAX_FUTURE_SECONDS: i64 = 15 * 60;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationResult {
    Valid(Event),
    Invalid(String),
}

fn is_lowercase_hex(s: &str, expected_len: usize) -> bool {
    s.len() == expected_len && s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn invalid(reason: impl Into<String>) -> ValidationResult {
    ValidationResult::Invalid(reason.into())
}

/// Validate a raw inbound event payload against every rule in spec order.
pub fn validate(raw_json: &serde_json::Value, config: &Config, now: i64) -> ValidationResult {
    if !raw_json.is_object() {
        return invalid("malformed: event is not a JSON object");
    }

    let serialized_len = match serde_json::to_vec(raw_json) {
        Ok(bytes) => bytes.len(),
        Err(_) => return invalid("malformed: event could not be serialized"),
    };
    if serialized_len > config.max_event_bytes {
        return invalid(format!(
            "event too large: maximum size is {} bytes",
            config.max_event_bytes
        ));
    }

    let event: Event = match serde_json::from_value(raw_json.clone()) {
        Ok(e) => e,
        Err(e) => return invalid(format!("malformed: {e}")),
    };

    if !is_lowercase_hex(&event.id, 64) {
        return invalid("malformed: id must be 64 lowercase hex characters");
    }
    if !is_lowercase_hex(&event.pubkey, 64) {
        return invalid("malformed: pubkey must be 64 lowercase hex characters");
    }
    if !is_lowercase_hex(&event.sig, 128) {
        return invalid("malformed: sig must be 128 lowercase hex characters");
    }

    let canonical = Event::canonical_serialization(
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    );
    let computed_id = hex::encode(Sha256::digest(&canonical));
    if computed_id != event.id {
        return invalid("event id does not match");
    }

    if let Err(reason) = verify_signature(&event) {
        return invalid(reason);
    }

    if event.created_at < now - MAX_PAST_SECONDS {
        return invalid("too old");
    }
    if event.created_at > now + MAX_FUTURE_SECONDS {
        return invalid("too future");
    }

    if let Err(reason) = check_kind_policy(&event) {
        return invalid(reason);
    }

    if event.tags.len() > config.max_event_tags {
        return invalid(format!(
            "too many tags: maximum is {}",
            config.max_event_tags
        ));
    }
    if event.content.len() > config.max_content_length {
        return invalid(format!(
            "content too long: maximum is {} bytes",
            config.max_content_length
        ));
    }

    ValidationResult::Valid(event)
}

fn verify_signature(event: &Event) -> Result<(), &'static str> {
    let id_bytes = match hex::decode(&event.id) {
        Ok(b) if b.len() == 32 => b,
        _ => return Err("bad-signature: malformed id"),
    };
    let pubkey_bytes = match hex::decode(&event.pubkey) {
        Ok(b) if b.len() == 32 => b,
        _ => return Err("bad-signature: malformed pubkey"),
    };
    let sig_bytes = match hex::decode(&event.sig) {
        Ok(b) if b.len() == 64 => b,
        _ => return Err("bad-signature: malformed sig"),
    };

    let digest: [u8; 32] = id_bytes.try_into().map_err(|_| "bad-signature")?;
    let message = Message::from_digest(digest);
    let pubkey = XOnlyPublicKey::from_slice(&pubkey_bytes).map_err(|_| "bad-signature: invalid pubkey")?;
    let signature =
        SchnorrSignature::from_slice(&sig_bytes).map_err(|_| "bad-signature: invalid signature encoding")?;

    let secp = Secp256k1::verification_only();
    secp.verify_schnorr(&signature, &message, &pubkey)
        .map_err(|_| "bad-signature")
}

fn check_kind_policy(event: &Event) -> Result<(), &'static str> {
    match event.kind {
        0 => {
            if serde_json::from_str::<serde_json::Value>(&event.content).is_err() {
                return Err("invalid metadata: content must be valid JSON");
            }
        }
        3 => {
            if event.tags_named("p").any(|t| t.len() < 2) {
                return Err("invalid contact list: p tags require a value");
            }
        }
        4 => {
            if event.content.is_empty() {
                return Err("invalid direct message: content must not be empty");
            }
        }
        5 => {
            if !event.tags_named("e").any(|t| t.len() >= 2) {
                return Err("invalid deletion: at least one e tag is required");
            }
        }
        7 => {
            if event.content.is_empty() {
                return Err("invalid reaction: content must not be empty");
            }
        }
        _ => {}
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{rand, Keypair};

    fn config() -> Config {
        Config {
            bind_addr: String::new(),
            database_url: String::new(),
            database_pool_size: 1,
            relay_url: String::new(),
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
            auth_required: false,
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

    fn signed_event(kind: i64, content: &str, tags: Vec<Vec<String>>, created_at: i64) -> serde_json::Value {
        let secp = Secp256k1::new();
        let keypair = Keypair::new(&secp, &mut rand::thread_rng());
        let (xonly, _parity) = keypair.x_only_public_key();
        let pubkey = hex::encode(xonly.serialize());

        let canonical = Event::canonical_serialization(&pubkey, created_at, kind, &tags, content);
        let id_bytes = Sha256::digest(&canonical);
        let id = hex::encode(id_bytes);

        let message = Message::from_digest(id_bytes.into());
        let sig = secp.sign_schnorr(&message, &keypair);

        serde_json::json!({
            "id": id,
            "pubkey": pubkey,
            "created_at": created_at,
            "kind": kind,
            "tags": tags,
            "content": content,
            "sig": hex::encode(sig.as_ref()),
        })
    }

    #[test]
    fn valid_event_round_trips() {
        let now = 1_700_000_000;
        let raw = signed_event(1, "hello", vec![], now);
        match validate(&raw, &config(), now) {
            ValidationResult::Valid(e) => assert_eq!(e.content, "hello"),
            ValidationResult::Invalid(reason) => panic!("expected valid, got: {reason}"),
        }
    }

    #[test]
    fn id_mismatch_is_rejected() {
        let now = 1_700_000_000;
        let mut raw = signed_event(1, "hello", vec![], now);
        raw["id"] = serde_json::Value::String("0".repeat(64));
        match validate(&raw, &config(), now) {
            ValidationResult::Invalid(reason) => assert!(reason.contains("id does not match")),
            ValidationResult::Valid(_) => panic!("expected rejection"),
        }
    }

    #[test]
    fn tampered_content_breaks_signature() {
        let now = 1_700_000_000;
        let mut raw = signed_event(1, "hello", vec![], now);
        raw["content"] = serde_json::Value::String("goodbye".to_owned());
        // content changed -> id no longer matches (checked before signature).
        match validate(&raw, &config(), now) {
            ValidationResult::Invalid(reason) => assert!(reason.contains("id does not match")),
            ValidationResult::Valid(_) => panic!("expected rejection"),
        }
    }

    #[test]
    fn too_old_event_is_rejected() {
        let now = 1_700_000_000;
        let raw = signed_event(1, "hello", vec![], now - MAX_PAST_SECONDS - 10);
        match validate(&raw, &config(), now) {
            ValidationResult::Invalid(reason) => assert_eq!(reason, "too old"),
            ValidationResult::Valid(_) => panic!("expected rejection"),
        }
    }

    #[test]
    fn too_future_event_is_rejected() {
        let now = 1_700_000_000;
        let raw = signed_event(1, "hello", vec![], now + MAX_FUTURE_SECONDS + 10);
        match validate(&raw, &config(), now) {
            ValidationResult::Invalid(reason) => assert_eq!(reason, "too future"),
            ValidationResult::Valid(_) => panic!("expected rejection"),
        }
    }

    #[test]
    fn kind_0_requires_json_content() {
        let now = 1_700_000_000;
        let raw = signed_event(0, "not json", vec![], now);
        match validate(&raw, &config(), now) {
            ValidationResult::Invalid(reason) => assert!(reason.contains("metadata")),
            ValidationResult::Valid(_) => panic!("expected rejection"),
        }
    }

    #[test]
    fn kind_5_requires_an_e_tag() {
        let now = 1_700_000_000;
        let raw = signed_event(5, "", vec![], now);
        match validate(&raw, &config(), now) {
            ValidationResult::Invalid(reason) => assert!(reason.contains("deletion")),
            ValidationResult::Valid(_) => panic!("expected rejection"),
        }
    }

    #[test]
    fn oversized_event_is_rejected_on_byte_length() {
        let now = 1_700_000_000;
        let big_content = "x".repeat(200_000);
        let raw = signed_event(1, &big_content, vec![], now);
        let mut cfg = config();
        cfg.max_event_bytes = 65_536;
        match validate(&raw, &cfg, now) {
            ValidationResult::Invalid(reason) => assert!(reason.contains("maximum size is 65536 bytes")),
            ValidationResult::Valid(_) => panic!("expected rejection"),
        }
    }
}
