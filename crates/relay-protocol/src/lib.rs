//! Shared wire types for the relay: the canonical event/filter model and the
//! client/relay message frames that travel over the WebSocket connection.
//!
//! Frames are JSON arrays (`["EVENT", ...]`, not tagged objects), so the
//! client -> relay direction is parsed by hand in [`parse_client_frame`]
//! rather than via a derived `Deserialize` on an enum.

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Event model
// ---------------------------------------------------------------------------

/// An immutable, signed event record.
///
/// Field order mirrors the wire JSON shape; `tags` is an ordered sequence of
/// ordered sequences of strings (every tag has at least its name as the
/// first element).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: i64,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// First value of the first tag named `name`, if any.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.first().map(String::as_str) == Some(name))
            .and_then(|t| t.get(1))
            .map(String::as_str)
    }

    /// All tags named `name`.
    pub fn tags_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Vec<String>> {
        self.tags
            .iter()
            .filter(move |t| t.first().map(String::as_str) == Some(name))
    }

    /// The canonical `[0, pubkey, created_at, kind, tags, content]` array
    /// used to compute `id`, serialized as compact JSON.
    pub fn canonical_serialization(
        pubkey: &str,
        created_at: i64,
        kind: i64,
        tags: &[Vec<String>],
        content: &str,
    ) -> Vec<u8> {
        let value = serde_json::json!([0, pubkey, created_at, kind, tags, content]);
        // `to_vec` on a `Value` built from already-owned data never fails.
        serde_json::to_vec(&value).expect("canonical event serialization is infallible")
    }
}

/// The five replacement/persistence categories a `kind` integer can fall
/// into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindCategory {
    Regular,
    Replaceable,
    Ephemeral,
    ParameterizedReplaceable,
    Deletion,
}

pub const DELETION_KIND: i64 = 5;
pub const AUTH_KIND: i64 = 22242;

pub fn kind_category(kind: i64) -> KindCategory {
    if kind == DELETION_KIND {
        return KindCategory::Deletion;
    }
    if kind == 0 || kind == 3 || (10_000..20_000).contains(&kind) {
        return KindCategory::Replaceable;
    }
    if (20_000..30_000).contains(&kind) {
        return KindCategory::Ephemeral;
    }
    if (30_000..40_000).contains(&kind) {
        return KindCategory::ParameterizedReplaceable;
    }
    KindCategory::Regular
}

/// The `d` tag value used as part of the parameterized-replaceable
/// replacement key (empty string if absent).
pub fn d_tag_value(event: &Event) -> String {
    event.tag_value("d").unwrap_or("").to_owned()
}

// ---------------------------------------------------------------------------
// Filter model
// ---------------------------------------------------------------------------

/// A selection predicate over events. All fields are optional; an empty
/// filter matches every event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ids: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<i64>>,
    #[serde(rename = "#e", alias = "e", default, skip_serializing_if = "Option::is_none")]
    pub e: Option<Vec<String>>,
    #[serde(rename = "#p", alias = "p", default, skip_serializing_if = "Option::is_none")]
    pub p: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub until: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

impl Filter {
    /// True iff every present field of this filter is satisfied by `event`.
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ids) = &self.ids {
            if !ids.iter().any(|id| id == &event.id) {
                return false;
            }
        }
        if let Some(authors) = &self.authors {
            if !authors.iter().any(|a| a == &event.pubkey) {
                return false;
            }
        }
        if let Some(kinds) = &self.kinds {
            if !kinds.contains(&event.kind) {
                return false;
            }
        }
        if let Some(e_ids) = &self.e {
            if !tag_values_match(event, "e", e_ids) {
                return false;
            }
        }
        if let Some(p_ids) = &self.p {
            if !tag_values_match(event, "p", p_ids) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.created_at < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.created_at > until {
                return false;
            }
        }
        true
    }

    /// A filter with no selector fields (selectors only; `limit` does not
    /// count, since it constrains result size, not matching).
    pub fn is_catch_all(&self) -> bool {
        self.ids.is_none()
            && self.authors.is_none()
            && self.kinds.is_none()
            && self.e.is_none()
            && self.p.is_none()
            && self.since.is_none()
            && self.until.is_none()
    }
}

fn tag_values_match(event: &Event, tag_name: &str, wanted: &[String]) -> bool {
    event
        .tags_named(tag_name)
        .any(|t| t.get(1).is_some_and(|v| wanted.contains(v)))
}

// ---------------------------------------------------------------------------
// Client -> relay frames
// ---------------------------------------------------------------------------

/// A parsed client -> relay frame. `Event`/`Auth` payloads are kept as raw
/// [`serde_json::Value`] because malformed events are a *validation*
/// outcome (see the `validator` module), not a frame-parse failure.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Event(serde_json::Value),
    Req { sub_id: String, filters: Vec<Filter> },
    Close { sub_id: String },
    Auth(serde_json::Value),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameError {
    NotAnArray,
    UnknownCommand(String),
    Malformed(String),
}

impl std::fmt::Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameError::NotAnArray => write!(f, "frame is not a JSON array"),
            FrameError::UnknownCommand(c) => write!(f, "unknown command: {c}"),
            FrameError::Malformed(m) => write!(f, "malformed frame: {m}"),
        }
    }
}

/// Parse an inbound text frame into a [`ClientMessage`].
pub fn parse_client_frame(text: &str) -> Result<ClientMessage, FrameError> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|e| FrameError::Malformed(e.to_string()))?;
    let arr = value.as_array().ok_or(FrameError::NotAnArray)?;
    let command = arr
        .first()
        .and_then(|v| v.as_str())
        .ok_or_else(|| FrameError::Malformed("missing command element".to_owned()))?;

    match command {
        "EVENT" => {
            let payload = arr
                .get(1)
                .cloned()
                .ok_or_else(|| FrameError::Malformed("EVENT missing event object".to_owned()))?;
            Ok(ClientMessage::Event(payload))
        }
        "REQ" => {
            if arr.len() < 2 {
                return Err(FrameError::Malformed("REQ missing subscription id".to_owned()));
            }
            let sub_id = arr[1]
                .as_str()
                .ok_or_else(|| FrameError::Malformed("REQ subscription id must be a string".to_owned()))?
                .to_owned();
            let mut filters = Vec::with_capacity(arr.len().saturating_sub(2));
            for raw in &arr[2..] {
                let filter: Filter = serde_json::from_value(raw.clone())
                    .map_err(|e| FrameError::Malformed(format!("bad filter: {e}")))?;
                filters.push(filter);
            }
            Ok(ClientMessage::Req { sub_id, filters })
        }
        "CLOSE" => {
            let sub_id = arr
                .get(1)
                .and_then(|v| v.as_str())
                .ok_or_else(|| FrameError::Malformed("CLOSE missing subscription id".to_owned()))?
                .to_owned();
            Ok(ClientMessage::Close { sub_id })
        }
        "AUTH" => {
            let payload = arr
                .get(1)
                .cloned()
                .ok_or_else(|| FrameError::Malformed("AUTH missing event object".to_owned()))?;
            Ok(ClientMessage::Auth(payload))
        }
        other => Err(FrameError::UnknownCommand(other.to_owned())),
    }
}

// ---------------------------------------------------------------------------
// Relay -> client frames
// ---------------------------------------------------------------------------

/// A relay -> client frame, along with its JSON-array wire encoding.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    Event { sub_id: String, event: Event },
    Ok { event_id: String, accepted: bool, message: String },
    Eose { sub_id: String },
    Notice { message: String },
    AuthChallenge { challenge: String },
}

impl RelayMessage {
    pub fn to_frame_text(&self) -> String {
        let value = match self {
            RelayMessage::Event { sub_id, event } => {
                serde_json::json!(["EVENT", sub_id, event])
            }
            RelayMessage::Ok { event_id, accepted, message } => {
                serde_json::json!(["OK", event_id, accepted, message])
            }
            RelayMessage::Eose { sub_id } => serde_json::json!(["EOSE", sub_id]),
            RelayMessage::Notice { message } => serde_json::json!(["NOTICE", message]),
            RelayMessage::AuthChallenge { challenge } => serde_json::json!(["AUTH", challenge]),
        };
        value.to_string()
    }
}

// ---------------------------------------------------------------------------
// Rejection-reason taxonomy (prefixes are user-visible on `OK`/`NOTICE`)
// ---------------------------------------------------------------------------

pub mod reason_prefix {
    pub const INVALID: &str = "invalid";
    pub const DUPLICATE: &str = "duplicate";
    pub const POW: &str = "pow";
    pub const SPAM: &str = "spam";
    pub const RATE_LIMITED: &str = "rate-limited";
    pub const BLOCKED: &str = "blocked";
    pub const ERROR: &str = "error";
}

/// HTTP JSON error envelope shared by every administrative endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HttpErrorEnvelope {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}
